//! Workflow commands.
//!
//! Public API calls, transport events, timer expiries and environment
//! notifications all become a [`Command`] on the workflow queue. Each
//! command is consumed exactly once, in order.

use crate::ack::{complete, CompletionCallback};
use crate::channel::PresenceCallback;
use crate::connection::Retry;
use crate::timers::TimerKey;
use ripple_protocol::{ErrorInfo, Message, PresenceMessage, ProtocolMessage};
use std::fmt;
use std::time::Duration;

/// Completion of a ping: the round-trip time.
pub type PingCallback = Box<dyn FnOnce(Result<Duration, ErrorInfo>) + Send>;

/// Receives a recovery key, or `None` if there is no connection to recover.
pub type RecoveryKeyCallback = Box<dyn FnOnce(Option<String>) + Send>;

/// Why a token renewal was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPurpose {
    /// Reconnect once the new token is available.
    Reconnect,
    /// The service asked for new credentials on a live connection.
    ServerRequest,
}

/// One unit of work for the workflow.
pub enum Command {
    Connect,
    Close,
    SendMessage {
        message: ProtocolMessage,
        callback: Option<CompletionCallback>,
    },
    Ping(PingCallback),
    CreateRecoveryKey(RecoveryKeyCallback),

    Attach {
        channel: String,
        callback: Option<CompletionCallback>,
    },
    Detach {
        channel: String,
        callback: Option<CompletionCallback>,
    },
    Publish {
        channel: String,
        messages: Vec<Message>,
        callback: Option<CompletionCallback>,
    },
    UpdatePresence {
        channel: String,
        message: PresenceMessage,
        callback: Option<CompletionCallback>,
    },
    GetPresence {
        channel: String,
        wait_for_sync: bool,
        callback: PresenceCallback,
    },
    ReleaseChannel {
        channel: String,
    },
    PresenceReenterFailed {
        channel: String,
        error: ErrorInfo,
    },

    TransportConnected {
        transport_id: u64,
    },
    TransportDisconnected {
        transport_id: u64,
        error: Option<ErrorInfo>,
    },
    ProcessMessage {
        transport_id: u64,
        message: ProtocolMessage,
    },

    SetConnectingState,
    SetConnectedState {
        message: ProtocolMessage,
    },
    SetDisconnectedState {
        reason: ErrorInfo,
        retry: Retry,
    },
    SetSuspendedState {
        reason: ErrorInfo,
    },
    SetClosingState,
    SetClosedState,
    SetFailedState {
        reason: ErrorInfo,
    },

    TimerFired {
        key: TimerKey,
        generation: u64,
    },
    NetworkAvailable,
    NetworkUnavailable,
    TokenRenewed {
        result: Result<String, ErrorInfo>,
        purpose: RenewalPurpose,
    },

    /// Stop the workflow loop.
    Dispose,
}

impl Command {
    /// Command name for logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Close => "close",
            Command::SendMessage { .. } => "send_message",
            Command::Ping(_) => "ping",
            Command::CreateRecoveryKey(_) => "create_recovery_key",
            Command::Attach { .. } => "attach",
            Command::Detach { .. } => "detach",
            Command::Publish { .. } => "publish",
            Command::UpdatePresence { .. } => "update_presence",
            Command::GetPresence { .. } => "get_presence",
            Command::ReleaseChannel { .. } => "release_channel",
            Command::PresenceReenterFailed { .. } => "presence_reenter_failed",
            Command::TransportConnected { .. } => "transport_connected",
            Command::TransportDisconnected { .. } => "transport_disconnected",
            Command::ProcessMessage { .. } => "process_message",
            Command::SetConnectingState => "set_connecting_state",
            Command::SetConnectedState { .. } => "set_connected_state",
            Command::SetDisconnectedState { .. } => "set_disconnected_state",
            Command::SetSuspendedState { .. } => "set_suspended_state",
            Command::SetClosingState => "set_closing_state",
            Command::SetClosedState => "set_closed_state",
            Command::SetFailedState { .. } => "set_failed_state",
            Command::TimerFired { .. } => "timer_fired",
            Command::NetworkAvailable => "network_available",
            Command::NetworkUnavailable => "network_unavailable",
            Command::TokenRenewed { .. } => "token_renewed",
            Command::Dispose => "dispose",
        }
    }
}

impl Command {
    /// Fail whatever callback the command carries. Used when the command
    /// cannot be delivered to the workflow.
    pub(crate) fn reject(self, error: &ErrorInfo) {
        match self {
            Command::SendMessage { callback, .. }
            | Command::Attach { callback, .. }
            | Command::Detach { callback, .. }
            | Command::Publish { callback, .. }
            | Command::UpdatePresence { callback, .. } => complete(callback, Err(error.clone())),
            Command::GetPresence { callback, .. } => callback(Err(error.clone())),
            Command::Ping(callback) => callback(Err(error.clone())),
            Command::CreateRecoveryKey(callback) => callback(None),
            _ => {}
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ProcessMessage {
                transport_id,
                message,
            } => f
                .debug_struct("ProcessMessage")
                .field("transport_id", transport_id)
                .field("action", &message.action)
                .field("channel", &message.channel)
                .finish(),
            Command::TimerFired { key, generation } => f
                .debug_struct("TimerFired")
                .field("key", key)
                .field("generation", generation)
                .finish(),
            other => f.write_str(other.name()),
        }
    }
}
