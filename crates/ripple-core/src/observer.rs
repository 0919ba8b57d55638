//! State-change observers.
//!
//! The workflow is the only writer; public handles subscribe. Every change
//! is broadcast as an immutable value, and the latest snapshot is kept in a
//! `watch` channel for synchronous reads.

use crate::channel::{ChannelState, ChannelStateChange};
use crate::connection::{ConnectionState, ConnectionStateChange};
use ripple_protocol::{ErrorInfo, Message, PresenceMessage};
use tokio::sync::{broadcast, watch};

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Latest connection state as seen by public handles.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub id: Option<String>,
    pub key: Option<String>,
    pub client_id: Option<String>,
    pub error_reason: Option<ErrorInfo>,
}

impl Default for ConnectionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Initialized,
            id: None,
            key: None,
            client_id: None,
            error_reason: None,
        }
    }
}

/// Connection observers.
#[derive(Debug)]
pub struct ConnectionObservers {
    snapshot: watch::Sender<ConnectionSnapshot>,
    changes: broadcast::Sender<ConnectionStateChange>,
}

impl Default for ConnectionObservers {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionObservers {
    #[must_use]
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(ConnectionSnapshot::default());
        let (changes, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self { snapshot, changes }
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.changes.subscribe()
    }

    pub(crate) fn publish(&self, snapshot: ConnectionSnapshot) {
        self.snapshot.send_replace(snapshot);
    }

    pub(crate) fn emit(&self, change: ConnectionStateChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

/// Latest channel state as seen by public handles.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub error_reason: Option<ErrorInfo>,
}

/// Observers of one channel: state, messages and presence.
#[derive(Debug)]
pub struct ChannelObservers {
    name: String,
    snapshot: watch::Sender<ChannelSnapshot>,
    changes: broadcast::Sender<ChannelStateChange>,
    messages: broadcast::Sender<Message>,
    presence: broadcast::Sender<PresenceMessage>,
}

impl ChannelObservers {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (snapshot, _) = watch::channel(ChannelSnapshot {
            state: ChannelState::Initialized,
            error_reason: None,
        });
        let (changes, _) = broadcast::channel(DEFAULT_CAPACITY);
        let (messages, _) = broadcast::channel(DEFAULT_CAPACITY);
        let (presence, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self {
            name: name.into(),
            snapshot,
            changes,
            messages,
            presence,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.changes.subscribe()
    }

    #[must_use]
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    #[must_use]
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceMessage> {
        self.presence.subscribe()
    }

    pub(crate) fn emit_state(&self, change: ChannelStateChange) {
        self.snapshot.send_replace(ChannelSnapshot {
            state: change.current,
            error_reason: change.reason.clone(),
        });
        let _ = self.changes.send(change);
    }

    pub(crate) fn emit_message(&self, message: Message) {
        let _ = self.messages.send(message);
    }

    pub(crate) fn emit_presence(&self, message: PresenceMessage) {
        let _ = self.presence.send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEvent;

    #[test]
    fn test_channel_snapshot_follows_changes() {
        let observers = ChannelObservers::new("room");
        let mut changes = observers.subscribe_state();

        observers.emit_state(ChannelStateChange {
            previous: ChannelState::Initialized,
            current: ChannelState::Attaching,
            event: ChannelEvent::State(ChannelState::Attaching),
            reason: None,
            resumed: false,
        });

        assert_eq!(observers.snapshot().state, ChannelState::Attaching);
        assert_eq!(changes.try_recv().unwrap().current, ChannelState::Attaching);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let observers = ConnectionObservers::new();
        observers.publish(ConnectionSnapshot {
            state: ConnectionState::Connecting,
            ..ConnectionSnapshot::default()
        });
        assert_eq!(observers.snapshot().state, ConnectionState::Connecting);
    }
}
