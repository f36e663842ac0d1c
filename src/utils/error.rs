use thiserror::Error;

/// Failure to establish an authenticated connection.
///
/// Cloneable because one in-flight handshake reports the same result to
/// every caller that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid connection settings: {0}")]
    Config(String),

    #[error("Connection attempt aborted: {0}")]
    Aborted(String),
}

impl ConnectError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// A channel could not be opened or failed on an otherwise live connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Failed to open channel: {0}")]
    Open(String),

    #[error("Channel I/O failed: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Port {port} is already in use: {reason}")]
    Bind { port: u16, reason: String },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Script contains no executable lines")]
    EmptyScript,

    #[error("Executor was cancelled")]
    Cancelled,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("Session is not connected")]
    NotConnected,

    #[error("Log file does not exist: {0}")]
    FileNotFound(String),

    #[error("Timed out checking log file: {0}")]
    Timeout(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Application-level error used by the composition root, config store and CLI.
#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Tail(#[from] TailError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ConsoleError>;

impl ConsoleError {
    /// Returns a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::HostNotFound(id) => format!("No host is configured with id {}", id),
            Self::Connect(ConnectError::Authentication(reason)) => {
                format!("Authentication failed: {}", reason)
            }
            Self::Connect(ConnectError::Network(reason)) => {
                format!("Could not reach host: {}", reason)
            }
            Self::Tunnel(TunnelError::Bind { port, .. }) => {
                format!("Local port {} is already in use", port)
            }
            Self::Tunnel(TunnelError::NotConnected)
            | Self::Exec(ExecError::NotConnected)
            | Self::Tail(TailError::NotConnected) => "Host is not connected".to_string(),
            Self::Tail(TailError::FileNotFound(path)) => format!("Log file not found: {}", path),
            Self::ConfigError(reason) => format!("Configuration error: {}", reason),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_kind() {
        assert!(ConnectError::Authentication("bad password".into()).is_authentication());
        assert!(!ConnectError::Network("refused".into()).is_authentication());
    }

    #[test]
    fn test_user_message_for_bind_error() {
        let err: ConsoleError = TunnelError::Bind {
            port: 8080,
            reason: "address in use".into(),
        }
        .into();
        assert_eq!(err.user_message(), "Local port 8080 is already in use");
    }

    #[test]
    fn test_not_connected_messages_are_uniform() {
        let a: ConsoleError = TunnelError::NotConnected.into();
        let b: ConsoleError = ExecError::NotConnected.into();
        let c: ConsoleError = TailError::NotConnected.into();
        assert_eq!(a.user_message(), b.user_message());
        assert_eq!(b.user_message(), c.user_message());
    }
}
