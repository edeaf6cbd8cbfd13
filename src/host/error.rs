use std::io;

/// Errors raised by a `SessionHost` and the runs it launches.
///
/// Internal faults carry a location tag naming the step of the launch that
/// failed; every other kind is a lifecycle or validation problem and has none.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("STATE_INVALID")]
    StateInvalid,

    #[error("FILENAME_INVALID")]
    FilenameInvalid,

    #[error("COMMAND_EMPTY")]
    CommandEmpty,

    /// The sandbox was ended by a signal nobody asked for.
    #[error("TERMINATED")]
    Terminated,

    /// The sandbox was ended by `kill`; carries the caller's reason code.
    #[error("INTENDED: {0}")]
    Intended(i32),

    #[error("{source}")]
    Internal {
        location: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HostError {
    pub fn location(&self) -> Option<&'static str> {
        match self {
            HostError::Internal { location, .. } => Some(*location),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_messages() {
        assert_eq!(HostError::StateInvalid.to_string(), "STATE_INVALID");
        assert_eq!(HostError::FilenameInvalid.to_string(), "FILENAME_INVALID");
        assert_eq!(HostError::CommandEmpty.to_string(), "COMMAND_EMPTY");
        assert_eq!(HostError::Terminated.to_string(), "TERMINATED");
        assert_eq!(HostError::Intended(-5).to_string(), "INTENDED: -5");
    }

    #[test]
    fn test_only_internal_faults_are_located() {
        let internal = HostError::Internal {
            location: "wait",
            source: io::Error::other("boom"),
        };
        assert_eq!(internal.location(), Some("wait"));
        assert_eq!(internal.to_string(), "boom");

        assert_eq!(HostError::Terminated.location(), None);
        assert_eq!(HostError::Io(io::Error::other("disk")).location(), None);
    }
}
