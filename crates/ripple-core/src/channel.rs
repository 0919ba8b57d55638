//! Channel attach/detach lifecycle.
//!
//! Channel behaviour is split in two: [`transition`] is a pure function
//! from `(state, input)` to the next state plus the effects to perform, and
//! [`Channel`] holds the per-channel data the workflow applies those effects
//! to (presence, queued messages, pending callbacks).

use crate::ack::{complete, CompletionCallback, QueuedMessage};
use crate::observer::ChannelObservers;
use crate::presence::{LocalMembers, PresenceMap};
use ripple_protocol::{ErrorInfo, PresenceMessage};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains control characters");
    }
    Ok(())
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl ChannelState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Initialized => "initialized",
            ChannelState::Attaching => "attaching",
            ChannelState::Attached => "attached",
            ChannelState::Detaching => "detaching",
            ChannelState::Detached => "detached",
            ChannelState::Suspended => "suspended",
            ChannelState::Failed => "failed",
        }
    }

    /// Whether publishes are held back rather than sent or rejected.
    #[must_use]
    pub fn queues_messages(self) -> bool {
        matches!(self, ChannelState::Initialized | ChannelState::Attaching)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a channel observer is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    State(ChannelState),
    /// Something changed without a state change, e.g. a re-attach that lost
    /// message continuity.
    Update,
}

/// An immutable channel state change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    pub event: ChannelEvent,
    pub reason: Option<ErrorInfo>,
    /// Message continuity was preserved across the attach.
    pub resumed: bool,
}

/// Something that happened to a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelInput {
    Attach,
    Detach,
    Attached {
        resumed: bool,
        has_presence: bool,
        error: Option<ErrorInfo>,
    },
    Detached {
        error: Option<ErrorInfo>,
    },
    Error(ErrorInfo),
    AttachTimeout,
    DetachTimeout {
        previous: ChannelState,
    },
    RetryTimeout,
    ConnectionConnected {
        resumed: bool,
    },
    ConnectionSuspended(ErrorInfo),
    ConnectionFailed(ErrorInfo),
    ConnectionClosed(ErrorInfo),
    /// A delta-encoded message could not be decoded.
    DecodeFailure(ErrorInfo),
}

/// Work the workflow performs on behalf of a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEffect {
    /// Send `Attach` and arm the attach timer, once the connection is up.
    SendAttach,
    /// Send `Detach` and arm the detach timer, once the connection is up.
    SendDetach,
    AbortTimers,
    StartRetryTimer,
    CompleteAttach(Result<(), ErrorInfo>),
    CompleteDetach(Result<(), ErrorInfo>),
    /// Send every queued publish.
    FlushQueue,
    FailQueue(ErrorInfo),
    /// Start a presence sync, or clear membership if the channel has none.
    AttachedPresence { has_presence: bool, resumed: bool },
    /// Forget remote members but keep members entered by this connection.
    SuspendPresence,
    /// Forget all presence, including members entered by this connection.
    ClearPresence,
}

/// The result of applying a [`ChannelInput`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: ChannelState,
    /// Event to emit, if any.
    pub event: Option<ChannelEvent>,
    pub reason: Option<ErrorInfo>,
    pub resumed: bool,
    pub effects: Vec<ChannelEffect>,
}

impl Transition {
    fn stay(state: ChannelState) -> Self {
        Self {
            state,
            event: None,
            reason: None,
            resumed: false,
            effects: Vec::new(),
        }
    }

    fn to(state: ChannelState) -> Self {
        Self {
            state,
            event: Some(ChannelEvent::State(state)),
            reason: None,
            resumed: false,
            effects: Vec::new(),
        }
    }

    fn reason(mut self, reason: Option<ErrorInfo>) -> Self {
        self.reason = reason;
        self
    }

    fn effects(mut self, effects: Vec<ChannelEffect>) -> Self {
        self.effects = effects;
        self
    }
}

fn superseded(operation: &str, by: &str) -> ErrorInfo {
    ErrorInfo::channel_operation_failed(format!("{operation} superseded by {by}"))
}

/// Compute the next state of channel `name` for `input`.
///
/// # Errors
///
/// Returns an error if the input is an operation the state does not permit.
pub fn transition(
    name: &str,
    state: ChannelState,
    input: ChannelInput,
) -> Result<Transition, ErrorInfo> {
    use ChannelEffect::*;
    use ChannelState::*;

    let next = match (state, input) {
        (Attaching | Attached, ChannelInput::Attach) => Transition::stay(state),
        (Detaching, ChannelInput::Attach) => Transition::to(Attaching).effects(vec![
            AbortTimers,
            CompleteDetach(Err(superseded("Detach", "attach"))),
            SendAttach,
        ]),
        (_, ChannelInput::Attach) => Transition::to(Attaching).effects(vec![AbortTimers, SendAttach]),

        (Initialized | Detached | Detaching, ChannelInput::Detach) => Transition::stay(state),
        (Failed, ChannelInput::Detach) => return Err(ErrorInfo::channel_invalid_state(name, state)),
        (Attaching, ChannelInput::Detach) => Transition::to(Detaching).effects(vec![
            AbortTimers,
            CompleteAttach(Err(superseded("Attach", "detach"))),
            SendDetach,
        ]),
        (Attached, ChannelInput::Detach) => Transition::to(Detaching).effects(vec![SendDetach]),
        (Suspended, ChannelInput::Detach) => Transition::to(Detached).effects(vec![AbortTimers]),

        (
            Attaching,
            ChannelInput::Attached {
                resumed,
                has_presence,
                error,
            },
        ) => {
            let mut next = Transition::to(Attached).reason(error).effects(vec![
                AbortTimers,
                CompleteAttach(Ok(())),
                AttachedPresence {
                    has_presence,
                    resumed,
                },
                FlushQueue,
            ]);
            next.resumed = resumed;
            next
        }
        (
            Attached,
            ChannelInput::Attached {
                resumed,
                has_presence,
                error,
            },
        ) => {
            let mut next = Transition::stay(Attached).reason(error).effects(vec![AttachedPresence {
                has_presence,
                resumed,
            }]);
            if !resumed {
                next.event = Some(ChannelEvent::Update);
            }
            next.resumed = resumed;
            next
        }
        (Detaching | Detached, ChannelInput::Attached { .. }) => {
            Transition::stay(state).effects(vec![SendDetach])
        }

        (Detaching, ChannelInput::Detached { error }) => {
            let failure = error
                .clone()
                .unwrap_or_else(|| ErrorInfo::channel_operation_failed("Channel detached"));
            Transition::to(Detached).reason(error).effects(vec![
                AbortTimers,
                CompleteDetach(Ok(())),
                ClearPresence,
                FailQueue(failure),
            ])
        }
        (Attaching | Attached, ChannelInput::Detached { error }) => {
            let failure = error
                .clone()
                .unwrap_or_else(|| ErrorInfo::channel_operation_failed("Channel detached by server"));
            Transition::to(Detached).reason(Some(failure.clone())).effects(vec![
                AbortTimers,
                CompleteAttach(Err(failure.clone())),
                ClearPresence,
                FailQueue(failure),
            ])
        }

        (Attaching | Attached | Detaching, ChannelInput::Error(error)) => {
            Transition::to(Failed).reason(Some(error.clone())).effects(vec![
                AbortTimers,
                CompleteAttach(Err(error.clone())),
                CompleteDetach(Err(error.clone())),
                ClearPresence,
                FailQueue(error),
            ])
        }

        (Attaching, ChannelInput::AttachTimeout) => {
            let error = ErrorInfo::channel_attach_timeout(name);
            Transition::to(Suspended).reason(Some(error.clone())).effects(vec![
                CompleteAttach(Err(error.clone())),
                SuspendPresence,
                FailQueue(error),
                StartRetryTimer,
            ])
        }
        (Detaching, ChannelInput::DetachTimeout { previous }) => {
            let error = ErrorInfo::channel_detach_timeout(name);
            Transition::to(previous)
                .reason(Some(error.clone()))
                .effects(vec![CompleteDetach(Err(error))])
        }
        (Suspended, ChannelInput::RetryTimeout) => Transition::to(Attaching).effects(vec![SendAttach]),

        (Attaching, ChannelInput::ConnectionConnected { .. }) => {
            Transition::stay(state).effects(vec![SendAttach])
        }
        (Detaching, ChannelInput::ConnectionConnected { .. }) => {
            Transition::stay(state).effects(vec![SendDetach])
        }
        (Suspended, ChannelInput::ConnectionConnected { .. }) => {
            Transition::to(Attaching).effects(vec![AbortTimers, SendAttach])
        }
        (Attached, ChannelInput::ConnectionConnected { resumed: false }) => {
            Transition::to(Attaching).effects(vec![SendAttach])
        }

        (Attaching | Attached, ChannelInput::ConnectionSuspended(error)) => {
            Transition::to(Suspended).reason(Some(error.clone())).effects(vec![
                AbortTimers,
                CompleteAttach(Err(error.clone())),
                SuspendPresence,
                FailQueue(error),
            ])
        }

        (Attaching | Attached | Detaching | Suspended, ChannelInput::ConnectionFailed(error)) => {
            Transition::to(Failed).reason(Some(error.clone())).effects(vec![
                AbortTimers,
                CompleteAttach(Err(error.clone())),
                CompleteDetach(Err(error.clone())),
                ClearPresence,
                FailQueue(error),
            ])
        }

        (Attaching | Attached | Detaching | Suspended, ChannelInput::ConnectionClosed(error)) => {
            Transition::to(Detached).effects(vec![
                AbortTimers,
                CompleteAttach(Err(error.clone())),
                CompleteDetach(Ok(())),
                ClearPresence,
                FailQueue(error),
            ])
        }

        (Attached, ChannelInput::DecodeFailure(error)) => Transition::to(Attaching)
            .reason(Some(error))
            .effects(vec![SendAttach]),

        (state, _) => Transition::stay(state),
    };

    Ok(next)
}

/// Callback receiving a presence membership snapshot.
pub type PresenceCallback = Box<dyn FnOnce(Result<Vec<PresenceMessage>, ErrorInfo>) + Send>;

/// Per-channel data owned by the workflow.
pub struct Channel {
    pub name: String,
    pub state: ChannelState,
    pub error_reason: Option<ErrorInfo>,
    /// Last channel serial received, used for recovery.
    pub channel_serial: Option<String>,
    /// State to return to if a detach times out.
    pub state_before_detach: ChannelState,
    pub presence: PresenceMap,
    pub local_members: LocalMembers,
    pub queued: VecDeque<QueuedMessage>,
    pub attach_callbacks: Vec<CompletionCallback>,
    pub detach_callbacks: Vec<CompletionCallback>,
    /// `get` calls waiting for the running sync to finish.
    pub presence_waiters: Vec<PresenceCallback>,
    pub observers: Arc<ChannelObservers>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("queued", &self.queued.len())
            .field("members", &self.presence.len())
            .finish()
    }
}

impl Channel {
    #[must_use]
    pub fn new(name: impl Into<String>, observers: Arc<ChannelObservers>) -> Self {
        Self {
            name: name.into(),
            state: ChannelState::Initialized,
            error_reason: None,
            channel_serial: None,
            state_before_detach: ChannelState::Initialized,
            presence: PresenceMap::new(),
            local_members: LocalMembers::new(),
            queued: VecDeque::new(),
            attach_callbacks: Vec::new(),
            detach_callbacks: Vec::new(),
            presence_waiters: Vec::new(),
            observers,
        }
    }

    pub fn complete_attach(&mut self, result: &Result<(), ErrorInfo>) {
        for callback in self.attach_callbacks.drain(..) {
            complete(Some(callback), result.clone());
        }
    }

    pub fn complete_detach(&mut self, result: &Result<(), ErrorInfo>) {
        for callback in self.detach_callbacks.drain(..) {
            complete(Some(callback), result.clone());
        }
    }

    pub fn fail_queue(&mut self, error: &ErrorInfo) {
        for queued in self.queued.drain(..) {
            queued.fail(error);
        }
    }

    /// Answer every waiting presence `get` with the current membership.
    pub fn resolve_presence_waiters(&mut self) {
        let members = self.presence.values();
        for waiter in self.presence_waiters.drain(..) {
            waiter(Ok(members.clone()));
        }
    }

    pub fn fail_presence_waiters(&mut self, error: &ErrorInfo) {
        for waiter in self.presence_waiters.drain(..) {
            waiter(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(state: ChannelState, input: ChannelInput) -> Transition {
        transition("room", state, input).unwrap()
    }

    #[test]
    fn test_validate_channel_name() {
        assert!(validate_channel_name("chat:lobby").is_ok());
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name(&"x".repeat(MAX_CHANNEL_NAME_LENGTH + 1)).is_err());
        assert!(validate_channel_name("bad\nname").is_err());
    }

    #[test]
    fn test_attach_is_idempotent() {
        let first = apply(ChannelState::Initialized, ChannelInput::Attach);
        assert_eq!(first.state, ChannelState::Attaching);
        assert!(first.effects.contains(&ChannelEffect::SendAttach));

        let second = apply(ChannelState::Attaching, ChannelInput::Attach);
        assert_eq!(second.event, None);
        assert!(second.effects.is_empty());

        assert!(apply(ChannelState::Attached, ChannelInput::Attach).effects.is_empty());
    }

    #[test]
    fn test_attach_supersedes_detach() {
        let next = apply(ChannelState::Detaching, ChannelInput::Attach);
        assert_eq!(next.state, ChannelState::Attaching);
        assert!(next.effects.contains(&ChannelEffect::SendAttach));
        assert!(next
            .effects
            .iter()
            .any(|e| matches!(e, ChannelEffect::CompleteDetach(Err(_)))));
    }

    #[test]
    fn test_detach_rules() {
        for state in [
            ChannelState::Initialized,
            ChannelState::Detached,
            ChannelState::Detaching,
        ] {
            let next = apply(state, ChannelInput::Detach);
            assert_eq!(next.state, state);
            assert!(next.effects.is_empty());
        }

        let err = transition("room", ChannelState::Failed, ChannelInput::Detach).unwrap_err();
        assert_eq!(err.code, ErrorInfo::CHANNEL_INVALID_STATE);

        let next = apply(ChannelState::Attaching, ChannelInput::Detach);
        assert_eq!(next.state, ChannelState::Detaching);
        assert!(next.effects.contains(&ChannelEffect::SendDetach));
    }

    #[test]
    fn test_attached_resumed_flag_selects_event() {
        let attached = ChannelInput::Attached {
            resumed: false,
            has_presence: false,
            error: None,
        };
        let from_attaching = apply(ChannelState::Attaching, attached.clone());
        assert_eq!(
            from_attaching.event,
            Some(ChannelEvent::State(ChannelState::Attached))
        );
        assert!(from_attaching.effects.contains(&ChannelEffect::FlushQueue));

        let update = apply(ChannelState::Attached, attached);
        assert_eq!(update.event, Some(ChannelEvent::Update));

        let resumed = apply(
            ChannelState::Attached,
            ChannelInput::Attached {
                resumed: true,
                has_presence: true,
                error: None,
            },
        );
        assert_eq!(resumed.event, None);
    }

    #[test]
    fn test_attached_with_error_keeps_attach() {
        let error = ErrorInfo::new(91000, 400, "partial");
        let next = apply(
            ChannelState::Attaching,
            ChannelInput::Attached {
                resumed: false,
                has_presence: false,
                error: Some(error.clone()),
            },
        );
        assert_eq!(next.state, ChannelState::Attached);
        assert_eq!(next.reason, Some(error));
        assert!(next.effects.contains(&ChannelEffect::CompleteAttach(Ok(()))));
    }

    #[test]
    fn test_attached_while_detaching_resends_detach() {
        let next = apply(
            ChannelState::Detaching,
            ChannelInput::Attached {
                resumed: false,
                has_presence: false,
                error: None,
            },
        );
        assert_eq!(next.state, ChannelState::Detaching);
        assert_eq!(next.effects, vec![ChannelEffect::SendDetach]);
    }

    #[test]
    fn test_server_detach_and_error() {
        let error = ErrorInfo::new(90198, 400, "kicked");
        let detached = apply(
            ChannelState::Attached,
            ChannelInput::Detached {
                error: Some(error.clone()),
            },
        );
        assert_eq!(detached.state, ChannelState::Detached);
        assert_eq!(detached.reason, Some(error.clone()));

        let failed = apply(ChannelState::Attaching, ChannelInput::Error(error.clone()));
        assert_eq!(failed.state, ChannelState::Failed);
        assert!(failed
            .effects
            .contains(&ChannelEffect::CompleteAttach(Err(error.clone()))));
        assert!(failed.effects.contains(&ChannelEffect::FailQueue(error)));
    }

    #[test]
    fn test_timeouts() {
        let suspended = apply(ChannelState::Attaching, ChannelInput::AttachTimeout);
        assert_eq!(suspended.state, ChannelState::Suspended);
        assert_eq!(
            suspended.reason.as_ref().map(|e| e.code),
            Some(ErrorInfo::CHANNEL_TIMEOUT)
        );
        assert!(suspended.effects.contains(&ChannelEffect::StartRetryTimer));

        let reverted = apply(
            ChannelState::Detaching,
            ChannelInput::DetachTimeout {
                previous: ChannelState::Attached,
            },
        );
        assert_eq!(reverted.state, ChannelState::Attached);
        assert!(reverted
            .effects
            .iter()
            .any(|e| matches!(e, ChannelEffect::CompleteDetach(Err(_)))));

        // a stale timer after the channel moved on does nothing
        let stale = apply(ChannelState::Attached, ChannelInput::AttachTimeout);
        assert_eq!(stale.event, None);

        let retry = apply(ChannelState::Suspended, ChannelInput::RetryTimeout);
        assert_eq!(retry.state, ChannelState::Attaching);
    }

    #[test]
    fn test_connection_cascade() {
        let error = ErrorInfo::connection_failed("boom");
        for state in [ChannelState::Attaching, ChannelState::Attached] {
            let next = apply(state, ChannelInput::ConnectionFailed(error.clone()));
            assert_eq!(next.state, ChannelState::Failed);
            assert_eq!(next.reason, Some(error.clone()));
        }
        let untouched = apply(ChannelState::Detached, ChannelInput::ConnectionFailed(error));
        assert_eq!(untouched.event, None);

        let suspended = apply(
            ChannelState::Attached,
            ChannelInput::ConnectionSuspended(ErrorInfo::connection_suspended()),
        );
        assert_eq!(suspended.state, ChannelState::Suspended);
        assert!(suspended.effects.contains(&ChannelEffect::SuspendPresence));

        let reattach = apply(
            ChannelState::Attached,
            ChannelInput::ConnectionConnected { resumed: false },
        );
        assert_eq!(reattach.state, ChannelState::Attaching);
        let resumed = apply(
            ChannelState::Attached,
            ChannelInput::ConnectionConnected { resumed: true },
        );
        assert!(resumed.effects.is_empty());
    }

    #[test]
    fn test_decode_failure_reattaches() {
        let error = ErrorInfo::new(ErrorInfo::DELTA_DECODE_FAILED, 400, "bad delta");
        let next = apply(ChannelState::Attached, ChannelInput::DecodeFailure(error.clone()));
        assert_eq!(next.state, ChannelState::Attaching);
        assert_eq!(next.reason, Some(error));
        assert_eq!(next.effects, vec![ChannelEffect::SendAttach]);
    }
}
