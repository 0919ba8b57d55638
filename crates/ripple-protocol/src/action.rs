//! Protocol message actions.
//!
//! Actions travel as their integer ordinal, never by name, so the numbering
//! here must stay in lockstep with the service.

use serde::{Deserialize, Serialize};

/// Action carried by every [`ProtocolMessage`](crate::ProtocolMessage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Action {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
    Auth = 17,
}

impl Action {
    /// Lowercase name, used for logs and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Heartbeat => "heartbeat",
            Action::Ack => "ack",
            Action::Nack => "nack",
            Action::Connect => "connect",
            Action::Connected => "connected",
            Action::Disconnect => "disconnect",
            Action::Disconnected => "disconnected",
            Action::Close => "close",
            Action::Closed => "closed",
            Action::Error => "error",
            Action::Attach => "attach",
            Action::Attached => "attached",
            Action::Detach => "detach",
            Action::Detached => "detached",
            Action::Presence => "presence",
            Action::Message => "message",
            Action::Sync => "sync",
            Action::Auth => "auth",
        }
    }

    /// Whether an outbound message with this action consumes a `msgSerial`
    /// and waits for an Ack/Nack.
    #[must_use]
    pub fn requires_ack(self) -> bool {
        matches!(self, Action::Message | Action::Presence)
    }

    /// Whether this action is addressed to a single channel.
    #[must_use]
    pub fn is_channel_action(self) -> bool {
        matches!(
            self,
            Action::Attach
                | Action::Attached
                | Action::Detach
                | Action::Detached
                | Action::Presence
                | Action::Message
                | Action::Sync
        )
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for Action {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(Action::Heartbeat),
            1 => Ok(Action::Ack),
            2 => Ok(Action::Nack),
            3 => Ok(Action::Connect),
            4 => Ok(Action::Connected),
            5 => Ok(Action::Disconnect),
            6 => Ok(Action::Disconnected),
            7 => Ok(Action::Close),
            8 => Ok(Action::Closed),
            9 => Ok(Action::Error),
            10 => Ok(Action::Attach),
            11 => Ok(Action::Attached),
            12 => Ok(Action::Detach),
            13 => Ok(Action::Detached),
            14 => Ok(Action::Presence),
            15 => Ok(Action::Message),
            16 => Ok(Action::Sync),
            17 => Ok(Action::Auth),
            _ => Err("Invalid protocol action"),
        }
    }
}
