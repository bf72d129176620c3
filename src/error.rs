use thiserror::Error;

use crate::{client::ObserverHandle, protocol::FrameError};

/// Broad category of a [`NotifyError`], used by error observers that only care
/// about what went wrong and not the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionFailure,
    ProtocolError,
    DecodeError,
    ObserverFailure,
    Config,
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("STOMP protocol error: {0}")]
    ProtocolError(String),

    #[error("decode error: {0}")]
    DecodeError(String),

    #[error("observer {handle} failed: {reason}")]
    ObserverFailure {
        handle: ObserverHandle,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NotifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NotifyError::ConnectionFailure(_) => ErrorKind::ConnectionFailure,
            NotifyError::ProtocolError(_) => ErrorKind::ProtocolError,
            NotifyError::DecodeError(_) => ErrorKind::DecodeError,
            NotifyError::ObserverFailure { .. } => ErrorKind::ObserverFailure,
            NotifyError::Config(_) => ErrorKind::Config,
        }
    }

    /// Errors that end a session and move the client into the error state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionFailure | ErrorKind::ProtocolError
        )
    }
}

impl From<FrameError> for NotifyError {
    fn from(error: FrameError) -> Self {
        NotifyError::DecodeError(error.to_string())
    }
}

impl From<serde_json::Error> for NotifyError {
    fn from(error: serde_json::Error) -> Self {
        NotifyError::DecodeError(format!("invalid JSON body: {}", error))
    }
}

impl From<config::ConfigError> for NotifyError {
    fn from(error: config::ConfigError) -> Self {
        NotifyError::Config(error.to_string())
    }
}

impl From<url::ParseError> for NotifyError {
    fn from(error: url::ParseError) -> Self {
        NotifyError::Config(format!("invalid URL: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_fatality() {
        let err = NotifyError::ConnectionFailure("refused".to_string());
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
        assert!(err.is_fatal());

        let err = NotifyError::DecodeError("missing field".to_string());
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_json_error_is_decode_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: NotifyError = json_err.into();
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        assert!(err.to_string().starts_with("decode error: invalid JSON body"));
    }
}
