//! Errors raised by the client before a request reaches the workflow.

use ripple_protocol::ErrorInfo;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Options failed validation.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// API key is not of the form `appId.keyId:secret`.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Channel name failed validation.
    #[error("Invalid channel name: {0}")]
    InvalidChannelName(&'static str),

    /// The client was created outside a tokio runtime.
    #[error("No tokio runtime available")]
    NoRuntime,

    /// The workflow has shut down.
    #[error("Client closed")]
    Disposed,

    /// A protocol-level failure.
    #[error(transparent)]
    Protocol(#[from] ErrorInfo),
}

impl RealtimeError {
    /// Describe this error as it is delivered to callbacks and events.
    #[must_use]
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            RealtimeError::InvalidKey(msg) => ErrorInfo::invalid_key(msg.clone()),
            RealtimeError::InvalidOptions(msg) => {
                ErrorInfo::new(ErrorInfo::BAD_REQUEST, 400, msg.clone())
            }
            RealtimeError::InvalidChannelName(msg) => {
                ErrorInfo::new(ErrorInfo::BAD_REQUEST, 400, *msg)
            }
            RealtimeError::Protocol(info) => info.clone(),
            other => ErrorInfo::internal(other.to_string()),
        }
    }
}

impl From<RealtimeError> for ErrorInfo {
    fn from(err: RealtimeError) -> Self {
        err.to_error_info()
    }
}
