//! Application payload units carried inside a protocol message.

use crate::error::ErrorInfo;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A published channel message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Encoding chain still applied to `data`, e.g. `"vcdiff/base64"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    /// Create a message with an event name and payload.
    #[must_use]
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// Whether `encoding` marks the payload as a delta against a previous
    /// message.
    #[must_use]
    pub fn is_delta(&self) -> bool {
        self.encoding
            .as_deref()
            .is_some_and(|enc| enc.split('/').any(|step| step == "vcdiff"))
    }
}

/// Presence action, sent as its wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PresenceAction {
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

impl PresenceAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceAction::Absent => "absent",
            PresenceAction::Present => "present",
            PresenceAction::Enter => "enter",
            PresenceAction::Leave => "leave",
            PresenceAction::Update => "update",
        }
    }
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for PresenceAction {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            _ => Err("Invalid presence action"),
        }
    }
}

/// The parsed form of a canonical presence id, `connectionId:msgSerial:index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceId {
    pub msg_serial: i64,
    pub index: i64,
}

impl PartialOrd for PresenceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PresenceId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.msg_serial, self.index).cmp(&(other.msg_serial, other.index))
    }
}

/// A presence event for one member of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub action: PresenceAction,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    /// Create a presence message for a client.
    #[must_use]
    pub fn new(action: PresenceAction, client_id: impl Into<String>) -> Self {
        Self {
            id: None,
            action,
            client_id: client_id.into(),
            connection_id: String::new(),
            data: None,
            encoding: None,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The unique slot key: `clientId:connectionId`.
    #[must_use]
    pub fn member_key(&self) -> String {
        format!("{}:{}", self.client_id, self.connection_id)
    }

    /// A message is synthesized when its id is missing or does not start
    /// with its own connection id.
    #[must_use]
    pub fn is_synthesized(&self) -> bool {
        match self.id.as_deref() {
            None => true,
            Some(id) => match id.strip_prefix(self.connection_id.as_str()) {
                Some(rest) => self.connection_id.is_empty() || !rest.starts_with(':'),
                None => true,
            },
        }
    }

    /// Parse the id as `connectionId:msgSerial:index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is absent or does not have exactly three
    /// segments with integer serial and index.
    pub fn parse_id(&self) -> Result<PresenceId, ErrorInfo> {
        let id = self
            .id
            .as_deref()
            .ok_or_else(|| malformed_id("<none>"))?;

        let parts: Vec<&str> = id.split(':').collect();
        if parts.len() != 3 {
            return Err(malformed_id(id));
        }

        let msg_serial = parts[1].parse::<i64>().map_err(|_| malformed_id(id))?;
        let index = parts[2].parse::<i64>().map_err(|_| malformed_id(id))?;
        Ok(PresenceId { msg_serial, index })
    }

    /// Newness comparison against the entry currently stored for the same
    /// member key.
    ///
    /// If either message is synthesized only timestamps are compared and the
    /// incoming message wins ties. Otherwise `(msgSerial, index)` must be
    /// strictly greater.
    ///
    /// # Errors
    ///
    /// Returns an error if a non-synthesized id cannot be parsed.
    pub fn is_newer_than(&self, existing: &PresenceMessage) -> Result<bool, ErrorInfo> {
        if self.is_synthesized() || existing.is_synthesized() {
            return Ok(self.timestamp.unwrap_or(0) >= existing.timestamp.unwrap_or(0));
        }

        let incoming = self.parse_id()?;
        let stored = existing.parse_id()?;
        Ok(incoming > stored)
    }

    /// Build the synthesized `Leave` emitted when a member disappears
    /// without an explicit leave.
    #[must_use]
    pub fn synthesized_leave(&self, now: i64) -> Self {
        Self {
            id: None,
            action: PresenceAction::Leave,
            client_id: self.client_id.clone(),
            connection_id: self.connection_id.clone(),
            data: self.data.clone(),
            encoding: self.encoding.clone(),
            timestamp: Some(now),
        }
    }
}

fn malformed_id(id: &str) -> ErrorInfo {
    ErrorInfo::new(
        ErrorInfo::BAD_REQUEST,
        400,
        format!("Presence message id {id} is not of the form connectionId:msgSerial:index"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, timestamp: i64) -> PresenceMessage {
        PresenceMessage::new(PresenceAction::Enter, "client")
            .with_connection_id("2")
            .with_id(id)
            .with_timestamp(timestamp)
    }

    #[test]
    fn test_member_key() {
        let msg = PresenceMessage::new(PresenceAction::Enter, "alice").with_connection_id("c1");
        assert_eq!(msg.member_key(), "alice:c1");
    }

    #[test]
    fn test_synthesized_detection() {
        assert!(!member("2:1:0", 0).is_synthesized());
        assert!(member("other:1:0", 0).is_synthesized());
        assert!(member("20:1:0", 0).is_synthesized());
        assert!(PresenceMessage::new(PresenceAction::Leave, "c").is_synthesized());
    }

    #[test]
    fn test_newness_by_serial_and_index() {
        let first = member("2:1:0", 10);
        let second = member("2:2:1", 5);
        let stale = member("2:1:1", 100);

        assert!(second.is_newer_than(&first).unwrap());
        assert!(!stale.is_newer_than(&second).unwrap());
        assert!(member("2:1:1", 0).is_newer_than(&first).unwrap());
        assert!(!first.is_newer_than(&first).unwrap());
    }

    #[test]
    fn test_newness_synthesized_uses_timestamp() {
        let stored = member("2:2:1", 1_000);
        assert!(!member("synthetic", 999).is_newer_than(&stored).unwrap());
        assert!(member("synthetic", 1_001).is_newer_than(&stored).unwrap());
    }

    #[test]
    fn test_malformed_id_is_an_error() {
        let stored = member("2:1:0", 0);
        assert!(member("2:1", 0).is_newer_than(&stored).is_err());
        assert!(member("2:x:0", 0).is_newer_than(&stored).is_err());
        assert!(member("2:1:0:9", 0).is_newer_than(&stored).is_err());
    }

    #[test]
    fn test_delta_detection() {
        let mut msg = Message::new("event", serde_json::json!("payload"));
        assert!(!msg.is_delta());
        msg.encoding = Some("utf-8/vcdiff/base64".into());
        assert!(msg.is_delta());
    }
}
