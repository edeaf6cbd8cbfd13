use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable overriding `[sandbox] root`.
pub const ROOT_ENV: &str = "SANDBOX_ROOT";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Longest request line accepted from a client, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Base filesystem root; session work dirs live in `{root}/tmp/{key}`
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Sandbox executable [default: {root}/bin/core]
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default = "default_input_file")]
    pub input_file: String,
    #[serde(default = "default_result_file")]
    pub result_file: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Flush interval used when a client configures `output_throttle = 0`
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u32,
    /// Output is dropped once the client leaves a frame unread this long
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8010
}

fn default_max_message_size() -> usize {
    100 * 1024 * 1024
}

fn default_root() -> PathBuf {
    PathBuf::from("/sandbox")
}

fn default_input_file() -> String {
    "input.txt".to_string()
}

fn default_result_file() -> String {
    "result.json".to_string()
}

fn default_log_file() -> String {
    "runner.log".to_string()
}

fn default_flush_interval_ms() -> u32 {
    100
}

fn default_stall_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            executable: None,
            input_file: default_input_file(),
            result_file: default_result_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl SandboxConfig {
    pub fn executable(&self) -> PathBuf {
        self.executable
            .clone()
            .unwrap_or_else(|| self.root.join("bin").join("core"))
    }

    /// Applies the root override; empty values are ignored.
    fn apply_root_override(&mut self, value: Option<String>) {
        if let Some(root) = value.filter(|v| !v.is_empty()) {
            self.root = PathBuf::from(root);
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults when `optional` is set and the
    /// file does not exist. `SANDBOX_ROOT` is applied last in both cases.
    pub fn load(path: &Path, optional: bool) -> anyhow::Result<Self> {
        let mut config = if optional && !path.exists() {
            Config::default()
        } else {
            Self::parse(&std::fs::read_to_string(path)?)?
        };
        config
            .sandbox
            .apply_root_override(std::env::var(ROOT_ENV).ok());
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${SANDBOX_HOME}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.addr(), "0.0.0.0:8010");
        assert_eq!(config.server.max_message_size, 104_857_600);
        assert_eq!(config.sandbox.root, PathBuf::from("/sandbox"));
        assert_eq!(config.sandbox.executable(), PathBuf::from("/sandbox/bin/core"));
        assert_eq!(config.sandbox.result_file, "result.json");
        assert_eq!(config.relay.flush_interval_ms, 100);
        assert_eq!(config.relay.stall_timeout_ms, 10_000);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
[server]
host = "127.0.0.1"
port = 9000
max_message_size = 4096

[sandbox]
root = "/srv/judge"
executable = "/usr/local/bin/core"
input_file = "stdin.txt"
result_file = "verdict.json"
log_file = "core.log"

[relay]
flush_interval_ms = 250
stall_timeout_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(config.server.addr(), "127.0.0.1:9000");
        assert_eq!(config.server.max_message_size, 4096);
        assert_eq!(config.sandbox.executable(), PathBuf::from("/usr/local/bin/core"));
        assert_eq!(config.sandbox.input_file, "stdin.txt");
        assert_eq!(config.sandbox.result_file, "verdict.json");
        assert_eq!(config.sandbox.log_file, "core.log");
        assert_eq!(config.relay.flush_interval_ms, 250);
        assert_eq!(config.relay.stall_timeout_ms, 500);
    }

    #[test]
    fn test_executable_follows_root() {
        let config = Config::parse("[sandbox]\nroot = \"/opt/box\"\n").unwrap();
        assert_eq!(config.sandbox.executable(), PathBuf::from("/opt/box/bin/core"));
    }

    #[test]
    fn test_root_override() {
        let mut sandbox = SandboxConfig::default();
        sandbox.apply_root_override(Some(String::new()));
        assert_eq!(sandbox.root, PathBuf::from("/sandbox"));

        sandbox.apply_root_override(None);
        assert_eq!(sandbox.root, PathBuf::from("/sandbox"));

        sandbox.apply_root_override(Some("/data/box".to_string()));
        assert_eq!(sandbox.root, PathBuf::from("/data/box"));
        assert_eq!(sandbox.executable(), PathBuf::from("/data/box/bin/core"));
    }

    #[test]
    fn test_missing_optional_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml"), true).unwrap();
        assert_eq!(config.server.port, 8010);
    }

    #[test]
    fn test_missing_required_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("absent.toml"), false).is_err());
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(Config::parse("[server\nport = ").is_err());
    }
}
