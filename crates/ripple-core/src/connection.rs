//! Connection lifecycle.
//!
//! [`next_target`] decides, without side effects, where an input takes the
//! connection; [`target_effects`] and [`connected_effects`] list the work
//! entering that state requires. The workflow performs the effects.

use crate::channel::ChannelInput;
use ripple_protocol::ErrorInfo;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initialized => "initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Suspended => "suspended",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    /// Closed and Failed end the connection; only `connect` leaves them.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }

    /// Whether outbound messages may wait for the connection.
    #[must_use]
    pub fn queues_messages(self) -> bool {
        matches!(
            self,
            ConnectionState::Initialized | ConnectionState::Connecting | ConnectionState::Disconnected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a connection observer is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    /// Connection details changed while staying connected.
    Update,
}

/// An immutable connection state change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub event: ConnectionEvent,
    pub reason: Option<ErrorInfo>,
    /// When the next connection attempt is scheduled, if one is.
    pub retry_in: Option<Duration>,
}

/// Tracks how long the connection has been failing to (re)connect.
#[derive(Debug, Clone, Default)]
pub struct AttemptsInfo {
    first_failure_at: Option<i64>,
    attempts: u32,
}

impl AttemptsInfo {
    /// Record an unsuccessful attempt at `now` (ms).
    pub fn record_failure(&mut self, now: i64) {
        self.first_failure_at.get_or_insert(now);
        self.attempts += 1;
    }

    pub fn reset(&mut self) {
        self.first_failure_at = None;
        self.attempts = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the connection has been unavailable for at least `ttl_ms`.
    #[must_use]
    pub fn should_suspend(&self, now: i64, ttl_ms: u64) -> bool {
        self.first_failure_at
            .is_some_and(|first| now.saturating_sub(first) >= i64::try_from(ttl_ms).unwrap_or(i64::MAX))
    }
}

/// Something that happened to the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionInput {
    Connect,
    Close,
    TransportLost(Option<ErrorInfo>),
    DisconnectedReceived(Option<ErrorInfo>),
    ErrorReceived(ErrorInfo),
    ClosedReceived,
    ConnectTimeout,
    CloseTimeout,
    DisconnectedRetryTimeout,
    SuspendedRetryTimeout,
    HeartbeatTimeout,
    NetworkAvailable,
    NetworkUnavailable,
    TokenRenewalFailed(ErrorInfo),
}

/// Facts about the connection the transition rules depend on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransitionContext {
    pub transport_connected: bool,
    /// The connection state ttl has elapsed since the first failed attempt.
    pub suspend_due: bool,
    /// A token renewer is available.
    pub can_renew: bool,
}

/// When to try again after entering Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Immediately,
    AfterTimeout,
    AfterReauth,
}

/// Where an input takes the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionTarget {
    Connecting,
    Disconnected { reason: ErrorInfo, retry: Retry },
    Suspended { reason: ErrorInfo },
    Closing,
    Closed,
    Failed { reason: ErrorInfo },
    /// Renew the token while staying in Connecting.
    Reauthorize { reason: ErrorInfo },
}

impl ConnectionTarget {
    /// The state entered, or `None` if the state does not change.
    #[must_use]
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            ConnectionTarget::Connecting => Some(ConnectionState::Connecting),
            ConnectionTarget::Disconnected { .. } => Some(ConnectionState::Disconnected),
            ConnectionTarget::Suspended { .. } => Some(ConnectionState::Suspended),
            ConnectionTarget::Closing => Some(ConnectionState::Closing),
            ConnectionTarget::Closed => Some(ConnectionState::Closed),
            ConnectionTarget::Failed { .. } => Some(ConnectionState::Failed),
            ConnectionTarget::Reauthorize { .. } => None,
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<&ErrorInfo> {
        match self {
            ConnectionTarget::Disconnected { reason, .. }
            | ConnectionTarget::Suspended { reason }
            | ConnectionTarget::Failed { reason }
            | ConnectionTarget::Reauthorize { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Connection-level timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionTimer {
    ConnectRequest,
    CloseRequest,
    DisconnectedRetry,
    SuspendedRetry,
    Heartbeat,
}

/// Work the workflow performs on behalf of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEffect {
    OpenTransport,
    DestroyTransport,
    SendClose,
    StartTimer(ConnectionTimer),
    AbortTimer(ConnectionTimer),
    AbortAllTimers,
    RecordFailure,
    ResetAttempts,
    RetryImmediately,
    RequestTokenRenewal,
    FailPendingAcks(ErrorInfo),
    FailQueuedMessages(ErrorInfo),
    SendQueuedMessages,
    PropagateToChannels(ChannelInput),
    ClearConnectionKey,
}

fn on_failure(reason: ErrorInfo, retry: Retry, ctx: &TransitionContext) -> ConnectionTarget {
    if reason.is_token_error() && retry != Retry::AfterReauth {
        if !ctx.can_renew {
            return ConnectionTarget::Failed { reason };
        }
        return ConnectionTarget::Disconnected {
            reason,
            retry: Retry::AfterReauth,
        };
    }
    if ctx.suspend_due {
        return ConnectionTarget::Suspended {
            reason: ErrorInfo::connection_suspended().with_cause(reason),
        };
    }
    ConnectionTarget::Disconnected { reason, retry }
}

/// Decide where `input` takes a connection in `state`.
///
/// Returns `None` when the input does not apply to the state.
#[must_use]
pub fn next_target(
    state: ConnectionState,
    input: ConnectionInput,
    ctx: &TransitionContext,
) -> Option<ConnectionTarget> {
    use ConnectionState::*;

    let target = match (state, input) {
        (Connecting | Connected, ConnectionInput::Connect) => return None,
        (_, ConnectionInput::Connect) => ConnectionTarget::Connecting,

        (Closing | Closed | Failed, ConnectionInput::Close) => return None,
        (Connecting | Connected, ConnectionInput::Close) if ctx.transport_connected => {
            ConnectionTarget::Closing
        }
        (_, ConnectionInput::Close) => ConnectionTarget::Closed,

        (Closing, ConnectionInput::TransportLost(_)) => ConnectionTarget::Closed,
        (Connecting, ConnectionInput::TransportLost(reason)) => on_failure(
            reason.unwrap_or_else(ErrorInfo::disconnected),
            Retry::AfterTimeout,
            ctx,
        ),
        (Connected, ConnectionInput::TransportLost(reason)) => on_failure(
            reason.unwrap_or_else(ErrorInfo::disconnected),
            Retry::Immediately,
            ctx,
        ),

        (Connecting, ConnectionInput::DisconnectedReceived(reason)) => {
            let reason = reason.unwrap_or_else(ErrorInfo::disconnected);
            if reason.is_token_error() && ctx.can_renew {
                ConnectionTarget::Reauthorize { reason }
            } else {
                on_failure(reason, Retry::AfterTimeout, ctx)
            }
        }
        (Connected, ConnectionInput::DisconnectedReceived(reason)) => on_failure(
            reason.unwrap_or_else(ErrorInfo::disconnected),
            Retry::Immediately,
            ctx,
        ),

        (Connecting, ConnectionInput::ErrorReceived(reason))
            if reason.is_token_error() && ctx.can_renew =>
        {
            ConnectionTarget::Reauthorize { reason }
        }
        (Connected, ConnectionInput::ErrorReceived(reason))
            if reason.is_token_error() && ctx.can_renew =>
        {
            ConnectionTarget::Disconnected {
                reason,
                retry: Retry::AfterReauth,
            }
        }
        (Connecting | Connected | Closing, ConnectionInput::ErrorReceived(reason)) => {
            ConnectionTarget::Failed { reason }
        }

        (Connecting | Connected | Closing, ConnectionInput::ClosedReceived) => {
            ConnectionTarget::Closed
        }

        (Connecting, ConnectionInput::ConnectTimeout) => {
            on_failure(ErrorInfo::connection_timeout(), Retry::AfterTimeout, ctx)
        }
        (Closing, ConnectionInput::CloseTimeout) => ConnectionTarget::Closed,

        (Disconnected, ConnectionInput::DisconnectedRetryTimeout) if ctx.suspend_due => {
            ConnectionTarget::Suspended {
                reason: ErrorInfo::connection_suspended(),
            }
        }
        (Disconnected, ConnectionInput::DisconnectedRetryTimeout)
        | (Suspended, ConnectionInput::SuspendedRetryTimeout)
        | (Disconnected | Suspended, ConnectionInput::NetworkAvailable) => {
            ConnectionTarget::Connecting
        }

        (Connected, ConnectionInput::HeartbeatTimeout) => on_failure(
            ErrorInfo::new(
                ErrorInfo::DISCONNECTED,
                0,
                "No activity seen from the service within the idle interval",
            ),
            Retry::Immediately,
            ctx,
        ),
        (Connecting | Connected, ConnectionInput::NetworkUnavailable) => {
            on_failure(ErrorInfo::disconnected(), Retry::AfterTimeout, ctx)
        }

        (_, ConnectionInput::TokenRenewalFailed(reason)) if !reason.is_retriable() => {
            ConnectionTarget::Failed { reason }
        }
        (Connecting | Disconnected, ConnectionInput::TokenRenewalFailed(reason)) => {
            if ctx.suspend_due {
                ConnectionTarget::Suspended {
                    reason: ErrorInfo::connection_suspended().with_cause(reason),
                }
            } else {
                ConnectionTarget::Disconnected {
                    reason,
                    retry: Retry::AfterTimeout,
                }
            }
        }
        (Connected, ConnectionInput::TokenRenewalFailed(reason)) => on_failure(reason, Retry::AfterTimeout, ctx),

        _ => return None,
    };

    Some(target)
}

/// Effects of entering `target`.
#[must_use]
pub fn target_effects(target: &ConnectionTarget) -> Vec<ConnectionEffect> {
    use ConnectionEffect::*;
    use ConnectionTimer::*;

    match target {
        ConnectionTarget::Connecting => vec![
            AbortTimer(DisconnectedRetry),
            AbortTimer(SuspendedRetry),
            DestroyTransport,
            OpenTransport,
            StartTimer(ConnectRequest),
        ],
        ConnectionTarget::Disconnected { retry, .. } => {
            let mut effects = vec![
                AbortTimer(ConnectRequest),
                AbortTimer(Heartbeat),
                DestroyTransport,
                RecordFailure,
            ];
            effects.push(match retry {
                Retry::Immediately => RetryImmediately,
                Retry::AfterTimeout => StartTimer(DisconnectedRetry),
                Retry::AfterReauth => RequestTokenRenewal,
            });
            effects
        }
        ConnectionTarget::Suspended { reason } => vec![
            AbortTimer(ConnectRequest),
            AbortTimer(Heartbeat),
            AbortTimer(DisconnectedRetry),
            DestroyTransport,
            FailPendingAcks(reason.clone()),
            FailQueuedMessages(reason.clone()),
            PropagateToChannels(ChannelInput::ConnectionSuspended(reason.clone())),
            StartTimer(SuspendedRetry),
        ],
        ConnectionTarget::Closing => vec![
            AbortAllTimers,
            FailPendingAcks(ErrorInfo::connection_closed()),
            SendClose,
            StartTimer(CloseRequest),
        ],
        ConnectionTarget::Closed => {
            let reason = ErrorInfo::connection_closed();
            vec![
                AbortAllTimers,
                DestroyTransport,
                FailPendingAcks(reason.clone()),
                FailQueuedMessages(reason.clone()),
                PropagateToChannels(ChannelInput::ConnectionClosed(reason)),
                ClearConnectionKey,
                ResetAttempts,
            ]
        }
        ConnectionTarget::Failed { reason } => vec![
            AbortAllTimers,
            DestroyTransport,
            FailPendingAcks(reason.clone()),
            FailQueuedMessages(reason.clone()),
            PropagateToChannels(ChannelInput::ConnectionFailed(reason.clone())),
            ClearConnectionKey,
            ResetAttempts,
        ],
        ConnectionTarget::Reauthorize { .. } => vec![
            AbortTimer(Heartbeat),
            DestroyTransport,
            RequestTokenRenewal,
        ],
    }
}

/// Effects of entering Connected, after connection details are applied.
#[must_use]
pub fn connected_effects(resumed: bool, heartbeat: bool) -> Vec<ConnectionEffect> {
    use ConnectionEffect::*;
    use ConnectionTimer::*;

    let mut effects = vec![
        AbortTimer(ConnectRequest),
        AbortTimer(DisconnectedRetry),
        AbortTimer(SuspendedRetry),
        ResetAttempts,
    ];
    if heartbeat {
        effects.push(StartTimer(Heartbeat));
    }
    effects.push(PropagateToChannels(ChannelInput::ConnectionConnected {
        resumed,
    }));
    effects.push(SendQueuedMessages);
    effects
}
