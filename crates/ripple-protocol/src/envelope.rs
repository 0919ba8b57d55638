//! The protocol envelope exchanged with the service.

use crate::action::Action;
use crate::error::ErrorInfo;
use crate::flags::Flags;
use crate::message::{Message, PresenceMessage};
use serde::{Deserialize, Serialize};

/// Connection parameters sent by the service on `Connected`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<u64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// Credentials sent with an `Auth` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthDetails {
    pub access_token: String,
}

/// One wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Flags::is_empty")]
    pub flags: Flags,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presence: Vec<PresenceMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthDetails>,
}

impl ProtocolMessage {
    /// Create an empty envelope with the given action.
    #[must_use]
    pub fn new(action: Action) -> Self {
        Self {
            action,
            id: None,
            channel: None,
            channel_serial: None,
            connection_id: None,
            connection_serial: None,
            msg_serial: None,
            count: None,
            error: None,
            flags: Flags::NONE,
            messages: Vec::new(),
            presence: Vec::new(),
            timestamp: None,
            connection_details: None,
            auth: None,
        }
    }

    fn for_channel(action: Action, channel: impl Into<String>) -> Self {
        let mut msg = Self::new(action);
        msg.channel = Some(channel.into());
        msg
    }

    #[must_use]
    pub fn attach(channel: impl Into<String>) -> Self {
        Self::for_channel(Action::Attach, channel)
    }

    #[must_use]
    pub fn detach(channel: impl Into<String>) -> Self {
        Self::for_channel(Action::Detach, channel)
    }

    #[must_use]
    pub fn message(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        let mut msg = Self::for_channel(Action::Message, channel);
        msg.messages = messages;
        msg
    }

    #[must_use]
    pub fn presence(channel: impl Into<String>, presence: Vec<PresenceMessage>) -> Self {
        let mut msg = Self::for_channel(Action::Presence, channel);
        msg.presence = presence;
        msg
    }

    #[must_use]
    pub fn ack(msg_serial: i64, count: i64) -> Self {
        let mut msg = Self::new(Action::Ack);
        msg.msg_serial = Some(msg_serial);
        msg.count = Some(count);
        msg
    }

    #[must_use]
    pub fn nack(msg_serial: i64, count: i64, error: ErrorInfo) -> Self {
        let mut msg = Self::new(Action::Nack);
        msg.msg_serial = Some(msg_serial);
        msg.count = Some(count);
        msg.error = Some(error);
        msg
    }

    #[must_use]
    pub fn heartbeat(id: Option<String>) -> Self {
        let mut msg = Self::new(Action::Heartbeat);
        msg.id = id;
        msg
    }

    #[must_use]
    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    #[must_use]
    pub fn auth(access_token: impl Into<String>) -> Self {
        let mut msg = Self::new(Action::Auth);
        msg.auth = Some(AuthDetails {
            access_token: access_token.into(),
        });
        msg
    }

    #[must_use]
    pub fn error(error: ErrorInfo) -> Self {
        let mut msg = Self::new(Action::Error);
        msg.error = Some(error);
        msg
    }

    /// A `Connected` envelope as the service would send it.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        connection_key: impl Into<String>,
        details: ConnectionDetails,
    ) -> Self {
        let mut msg = Self::new(Action::Connected);
        msg.connection_id = Some(connection_id.into());
        msg.connection_details = Some(ConnectionDetails {
            connection_key: Some(connection_key.into()),
            ..details
        });
        msg
    }

    /// Set a flag, builder style.
    #[must_use]
    pub fn with_flag(mut self, flag: Flags) -> Self {
        self.flags.insert(flag);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn with_channel_serial(mut self, serial: impl Into<String>) -> Self {
        self.channel_serial = Some(serial.into());
        self
    }

    #[must_use]
    pub fn has_flag(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    /// Whether this envelope needs an Ack/Nack from the service.
    #[must_use]
    pub fn requires_ack(&self) -> bool {
        self.action.requires_ack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PresenceAction;

    #[test]
    fn test_builders() {
        let attach = ProtocolMessage::attach("room");
        assert_eq!(attach.action, Action::Attach);
        assert_eq!(attach.channel.as_deref(), Some("room"));
        assert!(!attach.requires_ack());

        let presence = ProtocolMessage::presence(
            "room",
            vec![PresenceMessage::new(PresenceAction::Enter, "alice")],
        );
        assert!(presence.requires_ack());

        let connected = ProtocolMessage::connected("c1", "k1", ConnectionDetails::default())
            .with_flag(Flags::RESUMED);
        assert!(connected.has_flag(Flags::RESUMED));
        assert_eq!(
            connected
                .connection_details
                .and_then(|d| d.connection_key)
                .as_deref(),
            Some("k1")
        );
    }

    #[test]
    fn test_json_field_names() {
        let msg = ProtocolMessage::ack(3, 2).with_flag(Flags::HAS_PRESENCE);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["action"], 1);
        assert_eq!(json["msgSerial"], 3);
        assert_eq!(json["count"], 2);
        assert_eq!(json["flags"], 1);
        assert!(json.get("messages").is_none());

        let parsed: ProtocolMessage =
            serde_json::from_str(r#"{"action":11,"channel":"room","flags":5}"#).unwrap();
        assert_eq!(parsed.action, Action::Attached);
        assert!(parsed.has_flag(Flags::RESUMED));
        assert!(parsed.has_flag(Flags::HAS_PRESENCE));
    }

    #[test]
    fn test_empty_flags_omitted() {
        let json = serde_json::to_value(ProtocolMessage::attach("room")).unwrap();
        assert!(json.get("flags").is_none());

        let parsed: ProtocolMessage = serde_json::from_value(json).unwrap();
        assert!(parsed.flags.is_empty());
    }
}
