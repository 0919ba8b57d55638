//! Codec for encoding and decoding protocol envelopes.
//!
//! Each transport frame carries exactly one envelope, either as named-field
//! MessagePack (binary frames) or as JSON (text frames).

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::ProtocolMessage;

/// Maximum encoded envelope size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wire format negotiated with the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    MsgPack,
    Json,
}

impl Format {
    /// Value of the `format` connection parameter.
    #[must_use]
    pub fn as_param(self) -> &'static str {
        match self {
            Format::MsgPack => "msgpack",
            Format::Json => "json",
        }
    }
}

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(message: &ProtocolMessage, format: Format) -> Result<Bytes, ProtocolError> {
    let payload = match format {
        Format::MsgPack => rmp_serde::to_vec_named(message)?,
        Format::Json => serde_json::to_vec(message)?,
    };

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Decode an envelope.
///
/// # Errors
///
/// Returns an error if the data is too large or invalid.
pub fn decode(data: &[u8], format: Format) -> Result<ProtocolMessage, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let message = match format {
        Format::MsgPack => rmp_serde::from_slice(data)?,
        Format::Json => serde_json::from_slice(data)?,
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::flags::Flags;
    use crate::message::{PresenceAction, PresenceMessage};

    #[test]
    fn test_msgpack_preserves_presence_and_flags() {
        let msg = ProtocolMessage::presence(
            "room",
            vec![PresenceMessage::new(PresenceAction::Enter, "alice").with_id("c1:0:0")],
        )
        .with_flag(Flags::HAS_PRESENCE);

        let encoded = encode(&msg, Format::MsgPack).unwrap();
        let decoded = decode(&encoded, Format::MsgPack).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_json_decode_from_service_shape() {
        let raw = br#"{"action":4,"connectionId":"abc","connectionDetails":{"connectionKey":"k","maxIdleInterval":15000}}"#;
        let decoded = decode(raw, Format::Json).unwrap();
        assert_eq!(decoded.action, Action::Connected);
        let details = decoded.connection_details.unwrap();
        assert_eq!(details.max_idle_interval, Some(15_000));
    }

    #[test]
    fn test_invalid_action_rejected() {
        assert!(decode(br#"{"action":99}"#, Format::Json).is_err());
    }
}
