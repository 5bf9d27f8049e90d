//! Error types for nodehost-core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for nodehost-core operations.
pub type Result<T> = std::result::Result<T, HostingError>;

/// Wire representation of an error, carried in every IPC reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    NotFound,
    InvalidState,
    InvalidArgument,
    AlreadyExists,
    OperationFailed,
    OperationCanceled,
    ObjectClosed,
    Timeout,
    CertificateNotFound,
    ApplicationPrincipalAbortableError,
    ApplicationPrincipalDoesNotExist,
    UpdateContextFailed,
    HostingCodePackageNotHosted,
    OperationNotSupported,
    EndpointProviderNotEnabled,
    FileNotFound,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors that can occur while hosting code packages on a node.
#[derive(Debug, Error)]
pub enum HostingError {
    /// The requested object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Caller supplied arguments that do not match the target
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Generic failure with a user-facing message
    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("operation canceled")]
    OperationCanceled,

    #[error("object closed")]
    ObjectClosed,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Certificate backing an account is not installed yet
    #[error("certificate not found: {0}")]
    CertificateNotFound(String),

    /// Principal setup failed; the owning application must be aborted
    #[error("application principals failed and must be aborted")]
    ApplicationPrincipalAbortable,

    #[error("application principal does not exist: {0}")]
    ApplicationPrincipalDoesNotExist(String),

    /// The sandbox no longer recognizes the code package
    #[error("code package context update failed: {0}")]
    UpdateContextFailed(String),

    #[error("code package is not hosted: {0}")]
    HostingCodePackageNotHosted(String),

    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("endpoint provider is not enabled")]
    EndpointProviderNotEnabled,

    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Error reply received over IPC
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// Error code from the remote side
        code: ErrorCode,
        /// Error message from the remote side
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostingError {
    /// Build an `InvalidState` error from two displayable states.
    pub fn invalid_state(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::OperationFailed(_) | Self::Json(_) => ErrorCode::OperationFailed,
            Self::OperationCanceled => ErrorCode::OperationCanceled,
            Self::ObjectClosed => ErrorCode::ObjectClosed,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::CertificateNotFound(_) => ErrorCode::CertificateNotFound,
            Self::ApplicationPrincipalAbortable => ErrorCode::ApplicationPrincipalAbortableError,
            Self::ApplicationPrincipalDoesNotExist(_) => ErrorCode::ApplicationPrincipalDoesNotExist,
            Self::UpdateContextFailed(_) => ErrorCode::UpdateContextFailed,
            Self::HostingCodePackageNotHosted(_) => ErrorCode::HostingCodePackageNotHosted,
            Self::OperationNotSupported(_) => ErrorCode::OperationNotSupported,
            Self::EndpointProviderNotEnabled => ErrorCode::EndpointProviderNotEnabled,
            Self::FileNotFound(_) => ErrorCode::FileNotFound,
            Self::Rpc { code, .. } => *code,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            Self::Io(_) => ErrorCode::OperationFailed,
        }
    }

    /// Detail text carried in an IPC reply next to the code.
    pub fn reply_message(&self) -> String {
        match self {
            Self::NotFound(m)
            | Self::InvalidArgument(m)
            | Self::AlreadyExists(m)
            | Self::OperationFailed(m)
            | Self::CertificateNotFound(m)
            | Self::ApplicationPrincipalDoesNotExist(m)
            | Self::UpdateContextFailed(m)
            | Self::HostingCodePackageNotHosted(m)
            | Self::OperationNotSupported(m)
            | Self::FileNotFound(m)
            | Self::Rpc { message: m, .. } => m.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from an IPC reply. Returns `None` for `Success`.
    pub fn from_reply(code: ErrorCode, message: impl Into<String>) -> Option<Self> {
        let message = message.into();
        let error = match code {
            ErrorCode::Success => return None,
            ErrorCode::NotFound => Self::NotFound(message),
            ErrorCode::InvalidArgument => Self::InvalidArgument(message),
            ErrorCode::AlreadyExists => Self::AlreadyExists(message),
            ErrorCode::OperationFailed => Self::OperationFailed(message),
            ErrorCode::OperationCanceled => Self::OperationCanceled,
            ErrorCode::ObjectClosed => Self::ObjectClosed,
            ErrorCode::CertificateNotFound => Self::CertificateNotFound(message),
            ErrorCode::ApplicationPrincipalAbortableError => Self::ApplicationPrincipalAbortable,
            ErrorCode::ApplicationPrincipalDoesNotExist => {
                Self::ApplicationPrincipalDoesNotExist(message)
            }
            ErrorCode::UpdateContextFailed => Self::UpdateContextFailed(message),
            ErrorCode::HostingCodePackageNotHosted => Self::HostingCodePackageNotHosted(message),
            ErrorCode::OperationNotSupported => Self::OperationNotSupported(message),
            ErrorCode::EndpointProviderNotEnabled => Self::EndpointProviderNotEnabled,
            ErrorCode::FileNotFound => Self::FileNotFound(message),
            code => Self::Rpc { code, message },
        };
        Some(error)
    }

    /// Whether a background operation may retry after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.code(), ErrorCode::OperationCanceled | ErrorCode::ObjectClosed)
    }

    /// True when this error carries `code`, locally or from a remote reply.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_round_trip_keeps_code() {
        let original = HostingError::CertificateNotFound("CN=primary".into());
        let rebuilt = HostingError::from_reply(original.code(), original.to_string()).unwrap();
        assert!(rebuilt.is(ErrorCode::CertificateNotFound));
    }

    #[test]
    fn test_reply_message_does_not_nest() {
        let original = HostingError::NotFound("sf-gone".into());
        let rebuilt = HostingError::from_reply(original.code(), original.reply_message()).unwrap();
        assert!(matches!(rebuilt, HostingError::NotFound(ref name) if name == "sf-gone"));
    }

    #[test]
    fn test_success_reply_is_not_an_error() {
        assert!(HostingError::from_reply(ErrorCode::Success, "").is_none());
    }

    #[test]
    fn test_timeout_reply_becomes_rpc_error() {
        let error = HostingError::from_reply(ErrorCode::Timeout, "slow").unwrap();
        assert!(matches!(error, HostingError::Rpc { code: ErrorCode::Timeout, .. }));
    }

    #[test]
    fn test_retryable() {
        assert!(HostingError::OperationFailed("x".into()).is_retryable());
        assert!(!HostingError::OperationCanceled.is_retryable());
        assert!(!HostingError::ObjectClosed.is_retryable());
        let remote_closed = HostingError::from_reply(ErrorCode::ObjectClosed, "").unwrap();
        assert!(!remote_closed.is_retryable());
    }

    #[test]
    fn test_io_not_found_maps_to_file_not_found() {
        let e: HostingError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(e.code(), ErrorCode::FileNotFound);
    }
}
