use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // transport
    #[error("channel is not connected")]
    NotConnected,

    #[error("authentication rejected by {0}")]
    AuthenticationFailed(String),

    #[error("host key for {host} does not match the recorded key")]
    HostKeyChanged { host: String },

    #[error("unsupported channel type: {0}")]
    UnsupportedChannel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("console reported an error: {0}")]
    Console(String),

    // protocol
    #[error("failed to pause autosave: {0}")]
    PauseFailed(String),

    #[error("world files were not ready to copy after {attempts} attempts")]
    SaveNotCompleted { attempts: u32 },

    #[error("failed to resume autosave: {0}")]
    ResumeFailed(String),

    #[error("server process is not running")]
    ProcessNotRunning,

    #[error("no hold marker present for container {0}")]
    NoHoldMarker(String),

    // partial failure
    #[error("backups failed: {}", .0.join(", "))]
    BackupsFailed(Vec<String>),

    // resources
    #[error("archive error: {0}")]
    Archive(String),

    #[error("date out of range: {0}")]
    DateOutOfRange(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Errors that can never be repaired by retrying or reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HostKeyChanged { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::CoreError;

    #[test]
    fn backups_failed_lists_every_name() {
        let err = CoreError::BackupsFailed(vec!["Survival".into(), "extras".into()]);
        assert_eq!(err.to_string(), "backups failed: Survival, extras");
    }

    #[test]
    fn only_host_key_changes_are_fatal() {
        assert!(CoreError::HostKeyChanged { host: "mc:22".into() }.is_fatal());
        assert!(!CoreError::NotConnected.is_fatal());
        assert!(!CoreError::SaveNotCompleted { attempts: 3 }.is_fatal());
    }
}
