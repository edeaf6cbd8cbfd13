//! Wire messages: one JSON object per line, byte fields in base64.
//!
//! A connection carries calls (`Request`). Unary calls answer a single
//! `SettingChange`. `run_interactive` switches the connection to a run stream:
//! the client sends `RunInput` lines, the server sends `RunOutput` lines and
//! finishes with exactly one `EXIT`.
use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::host::{ExecutionArgs, ExecutionLimit, ExecutionResult, HostError};

#[derive(Debug, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Request {
    Configure {
        limits: ExecutionLimit,
        params: ExecutionArgs,
        /// Relay flush interval (ms); 0 keeps the server default
        #[serde(default)]
        output_throttle: u32,
    },
    UploadFile {
        file_name: String,
        #[serde(with = "b64")]
        data: Vec<u8>,
    },
    Reset,
    Stop,
    RunInteractive,
}

/// Client → server line while a run stream is open.
#[derive(Debug, Deserialize)]
pub struct RunInput {
    #[serde(with = "b64")]
    pub input: Vec<u8>,
}

/// Reply to every unary call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingChange {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl SettingChange {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for SettingChange {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Exit,
}

/// Server → client line while a run stream is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

impl RunOutput {
    pub fn exit(result: &ExecutionResult) -> Self {
        Self {
            kind: OutputKind::Exit,
            data: exit_report(result),
        }
    }
}

#[derive(Serialize)]
struct ExitReport<'a> {
    app_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Payload<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Payload<'a> {
    Json(&'a RawValue),
    Text(Cow<'a, str>),
}

/// JSON body of the terminal `EXIT` message.
///
/// A result file holding JSON is embedded verbatim; anything else is carried
/// as a string so the report itself always stays valid JSON.
pub fn exit_report(result: &ExecutionResult) -> Vec<u8> {
    let report = match result {
        ExecutionResult::Success(bytes) => ExitReport {
            app_error: false,
            error: None,
            location: None,
            result: Some(match serde_json::from_slice::<&RawValue>(bytes) {
                Ok(raw) => Payload::Json(raw),
                Err(_) => Payload::Text(String::from_utf8_lossy(bytes)),
            }),
        },
        ExecutionResult::Failure(e) => failure_report(e),
    };
    serde_json::to_vec(&report).unwrap_or_else(|_| br#"{"app_error":true}"#.to_vec())
}

fn failure_report(error: &HostError) -> ExitReport<'static> {
    ExitReport {
        app_error: true,
        error: Some(error.to_string()),
        location: error.location(),
        result: None,
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn report_json(result: &ExecutionResult) -> Value {
        serde_json::from_slice(&exit_report(result)).unwrap()
    }

    #[test]
    fn test_parse_configure() {
        let line = r#"{"call":"configure","limits":{"real_time":1000,"process_count":1,"file_write":0,"memory":131072,"seccomp":"basic","stream":64},"params":{"command":"echo","args":["hello"]},"output_throttle":50}"#;
        match serde_json::from_str::<Request>(line).unwrap() {
            Request::Configure {
                limits,
                params,
                output_throttle,
            } => {
                assert_eq!(limits.memory, 131072);
                assert_eq!(limits.stream, 64);
                assert_eq!(params.command, "echo");
                assert_eq!(params.args, vec!["hello"]);
                assert_eq!(output_throttle, 50);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_upload_decodes_base64() {
        let line = r#"{"call":"upload_file","file_name":"input.txt","data":"MSAyCg=="}"#;
        match serde_json::from_str::<Request>(line).unwrap() {
            Request::UploadFile { file_name, data } => {
                assert_eq!(file_name, "input.txt");
                assert_eq!(data, b"1 2\n");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unit_calls() {
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"call":"reset"}"#).unwrap(),
            Request::Reset
        ));
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"call":"stop"}"#).unwrap(),
            Request::Stop
        ));
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"call":"run_interactive"}"#).unwrap(),
            Request::RunInteractive
        ));
    }

    #[test]
    fn test_rejects_unknown_call_and_bad_base64() {
        assert!(serde_json::from_str::<Request>(r#"{"call":"format_disk"}"#).is_err());
        assert!(serde_json::from_str::<RunInput>(r#"{"input":"***"}"#).is_err());
    }

    #[test]
    fn test_output_line_shape() {
        let line = serde_json::to_string(&RunOutput {
            kind: OutputKind::Stdout,
            data: b"hello\n".to_vec(),
        })
        .unwrap();
        assert_eq!(line, r#"{"type":"STDOUT","data":"aGVsbG8K"}"#);
    }

    #[test]
    fn test_exit_report_success_embeds_json() {
        let result = ExecutionResult::Success(br#"{"time":12,"verdict":"ok"}"#.to_vec());
        assert_eq!(
            report_json(&result),
            json!({"app_error": false, "result": {"time": 12, "verdict": "ok"}})
        );
        // Key order of the payload is preserved verbatim
        let raw = String::from_utf8(exit_report(&result)).unwrap();
        assert!(raw.contains(r#"{"time":12,"verdict":"ok"}"#));
    }

    #[test]
    fn test_exit_report_success_non_json_payload() {
        let result = ExecutionResult::Success(b"not json".to_vec());
        assert_eq!(
            report_json(&result),
            json!({"app_error": false, "result": "not json"})
        );
    }

    #[test]
    fn test_exit_report_unlocated_error() {
        let result = ExecutionResult::Failure(HostError::Intended(0));
        assert_eq!(
            report_json(&result),
            json!({"app_error": true, "error": "INTENDED: 0"})
        );
    }

    #[test]
    fn test_exit_report_located_error() {
        let result = ExecutionResult::internal(
            "read-result",
            std::io::Error::new(std::io::ErrorKind::NotFound, "result missing"),
        );
        assert_eq!(
            report_json(&result),
            json!({"app_error": true, "error": "result missing", "location": "read-result"})
        );
    }

    #[test]
    fn test_setting_change_from_result() {
        let ok: Result<(), HostError> = Ok(());
        assert_eq!(SettingChange::from(ok), SettingChange::ok());
        let err: Result<(), HostError> = Err(HostError::StateInvalid);
        assert_eq!(
            SettingChange::from(err),
            SettingChange::failed("STATE_INVALID")
        );
    }
}
