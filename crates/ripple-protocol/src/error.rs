//! Protocol-level error information.
//!
//! Every failure that reaches a caller, whether through an operation callback
//! or a state-change event, is described by an [`ErrorInfo`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error details as carried on the wire and surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{message} (code {code}, status {status_code})")]
pub struct ErrorInfo {
    /// Service error code.
    pub code: u32,
    /// HTTP-equivalent status code.
    #[serde(default)]
    pub status_code: u16,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Underlying cause, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    pub const BAD_REQUEST: u32 = 40000;
    pub const INVALID_KEY: u32 = 40005;
    pub const DELTA_DECODE_FAILED: u32 = 40018;
    pub const TOKEN_ERROR_MIN: u32 = 40140;
    pub const TOKEN_ERROR_MAX: u32 = 40149;
    pub const TOKEN_EXPIRED: u32 = 40142;
    pub const FORBIDDEN: u32 = 40300;
    pub const INTERNAL: u32 = 50000;
    pub const TIMEOUT: u32 = 50003;
    pub const CONNECTION_FAILED: u32 = 80000;
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    pub const DISCONNECTED: u32 = 80003;
    pub const UNABLE_TO_RECOVER: u32 = 80008;
    pub const CONNECTION_CLOSED: u32 = 80017;
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
    pub const CHANNEL_INVALID_STATE: u32 = 90001;
    pub const CHANNEL_TIMEOUT: u32 = 90007;
    pub const PRESENCE_REENTER_FAILED: u32 = 91004;

    /// Create a new error.
    #[must_use]
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Whether the code lies in the token error range.
    #[must_use]
    pub fn is_token_error(&self) -> bool {
        (Self::TOKEN_ERROR_MIN..=Self::TOKEN_ERROR_MAX).contains(&self.code)
    }

    /// Whether retrying can succeed. A 403 is never retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        self.status_code != 403
    }

    /// Whether the status indicates a server-side failure worth trying a
    /// fallback host for.
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        (500..=504).contains(&self.status_code)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, 500, message)
    }

    #[must_use]
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_KEY, 401, message)
    }

    #[must_use]
    pub fn connection_timeout() -> Self {
        Self::new(
            Self::TIMEOUT,
            504,
            "Timed out waiting for the connection to be established",
        )
    }

    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(Self::DISCONNECTED, 400, "Connection to server lost")
    }

    #[must_use]
    pub fn connection_suspended() -> Self {
        Self::new(
            Self::CONNECTION_SUSPENDED,
            400,
            "Connection unavailable for longer than the connection state ttl",
        )
    }

    #[must_use]
    pub fn connection_closed() -> Self {
        Self::new(Self::CONNECTION_CLOSED, 400, "Connection closed")
    }

    #[must_use]
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(Self::CONNECTION_FAILED, 400, message)
    }

    #[must_use]
    pub fn unable_to_recover() -> Self {
        Self::new(
            Self::UNABLE_TO_RECOVER,
            400,
            "Unable to recover connection; pending messages discarded",
        )
    }

    #[must_use]
    pub fn channel_attach_timeout(channel: &str) -> Self {
        Self::new(
            Self::CHANNEL_TIMEOUT,
            408,
            format!("Channel {channel} did not attach within the request timeout"),
        )
    }

    #[must_use]
    pub fn channel_detach_timeout(channel: &str) -> Self {
        Self::new(
            Self::CHANNEL_TIMEOUT,
            408,
            format!("Channel {channel} did not detach within the request timeout"),
        )
    }

    #[must_use]
    pub fn channel_invalid_state(channel: &str, state: impl std::fmt::Debug) -> Self {
        Self::new(
            Self::CHANNEL_INVALID_STATE,
            400,
            format!("Channel {channel} cannot perform the operation in state {state:?}"),
        )
    }

    #[must_use]
    pub fn channel_operation_failed(message: impl Into<String>) -> Self {
        Self::new(Self::CHANNEL_OPERATION_FAILED, 400, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_error_range() {
        assert!(ErrorInfo::new(40140, 401, "").is_token_error());
        assert!(ErrorInfo::new(ErrorInfo::TOKEN_EXPIRED, 401, "").is_token_error());
        assert!(ErrorInfo::new(40149, 401, "").is_token_error());
        assert!(!ErrorInfo::new(40150, 401, "").is_token_error());
        assert!(!ErrorInfo::new(40100, 401, "").is_token_error());
    }

    #[test]
    fn test_retriable() {
        assert!(ErrorInfo::new(40142, 401, "").is_retriable());
        assert!(!ErrorInfo::new(40300, 403, "").is_retriable());
    }

    #[test]
    fn test_display_and_json_shape() {
        let err = ErrorInfo::new(80000, 400, "boom").with_cause(ErrorInfo::internal("inner"));
        assert_eq!(err.to_string(), "boom (code 80000, status 400)");

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["statusCode"], 400);
        assert_eq!(json["cause"]["code"], 50000);

        let parsed: ErrorInfo =
            serde_json::from_str(r#"{"code":40142,"statusCode":401,"message":"expired"}"#)
                .unwrap();
        assert!(parsed.is_token_error());
        assert!(parsed.cause.is_none());
    }
}
