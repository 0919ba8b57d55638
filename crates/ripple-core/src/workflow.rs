//! The single-consumer command processor.
//!
//! Every input to the engine, whether a public API call, a transport event,
//! a timer expiry or a network notification, is a [`Command`] on one FIFO
//! queue. The [`Workflow`] owns all mutable engine state (transport handle,
//! ack queue, channels, presence) and processes commands one at a time, so
//! the side effects of one command are complete before the next starts.

use crate::ack::{complete, AckQueue, CompletionCallback, QueuedMessage};
use crate::auth::{PayloadDecoder, TokenRenewer};
use crate::channel::{
    transition, Channel, ChannelEffect, ChannelEvent, ChannelInput, ChannelState,
    ChannelStateChange, PresenceCallback,
};
use crate::command::{Command, PingCallback, RecoveryKeyCallback, RenewalPurpose};
use crate::config::ClientOptions;
use crate::connection::{
    connected_effects, next_target, target_effects, AttemptsInfo, ConnectionEffect,
    ConnectionEvent, ConnectionInput, ConnectionState, ConnectionStateChange, ConnectionTarget,
    ConnectionTimer, Retry, TransitionContext,
};
use crate::environment::Environment;
use crate::error::RealtimeError;
use crate::metrics;
use crate::observer::{ChannelObservers, ConnectionObservers, ConnectionSnapshot};
use crate::presence::SyncCursor;
use crate::recovery::RecoveryKey;
use crate::timers::{TimerKey, Timers};
use dashmap::DashMap;
use ripple_protocol::{
    Action, ErrorInfo, Flags, Message, PresenceAction, PresenceMessage, ProtocolMessage,
};
use ripple_transport::{FallbackHosts, Transport, TransportFactory, TransportListener};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Shared channel observer registry, keyed by channel name.
pub type ChannelRegistry = Arc<DashMap<String, Arc<ChannelObservers>>>;

/// Forwards events of one transport instance to the workflow queue.
struct Listener {
    transport_id: u64,
    sender: mpsc::UnboundedSender<Command>,
}

impl TransportListener for Listener {
    fn on_connected(&self) {
        let _ = self.sender.send(Command::TransportConnected {
            transport_id: self.transport_id,
        });
    }

    fn on_disconnected(&self, error: Option<ErrorInfo>) {
        let _ = self.sender.send(Command::TransportDisconnected {
            transport_id: self.transport_id,
            error,
        });
    }

    fn on_message_received(&self, message: ProtocolMessage) {
        let _ = self.sender.send(Command::ProcessMessage {
            transport_id: self.transport_id,
            message,
        });
    }
}

struct PendingPing {
    started_at: i64,
    callback: PingCallback,
}

const PING_PREFIX: &str = "ping-";

/// The engine.
pub struct Workflow {
    options: ClientOptions,
    sender: mpsc::UnboundedSender<Command>,
    receiver: mpsc::UnboundedReceiver<Command>,
    environment: Environment,
    factory: Arc<dyn TransportFactory>,
    renewer: Option<Arc<dyn TokenRenewer>>,
    decoder: Option<Arc<dyn PayloadDecoder>>,
    hosts: FallbackHosts,
    timers: Timers,

    state: ConnectionState,
    error_reason: Option<ErrorInfo>,
    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: Option<i64>,
    client_id: Option<String>,
    connection_state_ttl: u64,
    heartbeat_interval: Option<Duration>,
    last_activity: i64,
    attempts: AttemptsInfo,
    renewal_in_progress: bool,

    transport: Option<Box<dyn Transport>>,
    transport_id: u64,
    transport_connected: bool,
    access_token: Option<String>,
    recover: Option<RecoveryKey>,
    recovered_serials: BTreeMap<String, String>,

    acks: AckQueue,
    queued: VecDeque<QueuedMessage>,
    pings: HashMap<u64, PendingPing>,
    next_ping: u64,

    channels: HashMap<String, Channel>,
    registry: ChannelRegistry,
    observers: Arc<ConnectionObservers>,
    disposed: bool,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("state", &self.state)
            .field("connection_id", &self.connection_id)
            .field("msg_serial", &self.acks.msg_serial())
            .field("pending_acks", &self.acks.len())
            .field("queued", &self.queued.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl Workflow {
    /// Create a workflow in the Initialized state.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn new(
        options: ClientOptions,
        factory: Arc<dyn TransportFactory>,
        environment: Environment,
    ) -> Result<Self, RealtimeError> {
        options.validate()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        environment.network.bind(sender.clone());

        let mut acks = AckQueue::new();
        let recover = match options.recover.as_deref() {
            None => None,
            Some(raw) => match RecoveryKey::decode(raw) {
                Some(key) => {
                    debug!(msg_serial = key.msg_serial, "Recovering previous connection");
                    acks.set_msg_serial(key.msg_serial);
                    Some(key)
                }
                None => {
                    warn!("Ignoring invalid recovery key");
                    None
                }
            },
        };
        let recovered_serials = recover
            .as_ref()
            .map(|key| key.channel_serials.clone())
            .unwrap_or_default();

        let now = environment.now_millis();
        Ok(Self {
            hosts: FallbackHosts::new(options.host.clone(), options.fallback_hosts.clone()),
            timers: Timers::new(sender.clone()),
            client_id: options.client_id.clone(),
            connection_state_ttl: options.connection_state_ttl_ms,
            access_token: options.token.clone(),
            options,
            sender,
            receiver,
            environment,
            factory,
            renewer: None,
            decoder: None,
            state: ConnectionState::Initialized,
            error_reason: None,
            connection_id: None,
            connection_key: None,
            connection_serial: None,
            heartbeat_interval: None,
            last_activity: now,
            attempts: AttemptsInfo::default(),
            renewal_in_progress: false,
            transport: None,
            transport_id: 0,
            transport_connected: false,
            recover,
            recovered_serials,
            acks,
            queued: VecDeque::new(),
            pings: HashMap::new(),
            next_ping: 0,
            channels: HashMap::new(),
            registry: Arc::new(DashMap::new()),
            observers: Arc::new(ConnectionObservers::new()),
            disposed: false,
        })
    }

    #[must_use]
    pub fn with_token_renewer(mut self, renewer: Arc<dyn TokenRenewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    #[must_use]
    pub fn with_payload_decoder(mut self, decoder: Arc<dyn PayloadDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// A handle for enqueuing commands from other tasks.
    #[must_use]
    pub fn sender(&self) -> mpsc::UnboundedSender<Command> {
        self.sender.clone()
    }

    #[must_use]
    pub fn observers(&self) -> Arc<ConnectionObservers> {
        self.observers.clone()
    }

    #[must_use]
    pub fn registry(&self) -> ChannelRegistry {
        self.registry.clone()
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn error_reason(&self) -> Option<&ErrorInfo> {
        self.error_reason.as_ref()
    }

    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    #[must_use]
    pub fn connection_key(&self) -> Option<&str> {
        self.connection_key.as_deref()
    }

    /// The serial the next acknowledged send will take.
    #[must_use]
    pub fn msg_serial(&self) -> i64 {
        self.acks.msg_serial()
    }

    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Messages waiting for the connection.
    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.queued.len()
    }

    /// Current host for connection attempts.
    #[must_use]
    pub fn current_host(&self) -> &str {
        self.hosts.current()
    }

    #[must_use]
    pub fn channel_state(&self, name: &str) -> Option<ChannelState> {
        self.channels.get(name).map(|c| c.state)
    }

    #[must_use]
    pub fn channel_error(&self, name: &str) -> Option<&ErrorInfo> {
        self.channels.get(name).and_then(|c| c.error_reason.as_ref())
    }

    /// Present members of a channel, sorted by member key.
    #[must_use]
    pub fn presence_members(&self, name: &str) -> Vec<PresenceMessage> {
        self.channels
            .get(name)
            .map(|c| c.presence.values())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn timer_active(&self, key: &TimerKey) -> bool {
        self.timers.is_active(key)
    }

    /// Fire a running timer now and process the resulting commands.
    ///
    /// Returns `false` if the timer is not running.
    pub fn expire_timer(&mut self, key: &TimerKey) -> bool {
        match self.timers.generation(key) {
            Some(generation) => {
                self.execute(Command::TimerFired {
                    key: key.clone(),
                    generation,
                });
                self.process_commands();
                true
            }
            None => false,
        }
    }

    /// Enqueue a command. Never blocks.
    pub fn execute(&self, command: Command) {
        // The receiver lives as long as `self`.
        let _ = self.sender.send(command);
    }

    /// Process queued commands, including any they enqueue, until the queue
    /// is empty. Returns the number processed.
    pub fn process_commands(&mut self) -> usize {
        let mut processed = 0;
        while !self.disposed {
            match self.receiver.try_recv() {
                Ok(command) => {
                    processed += 1;
                    self.dispatch(command);
                }
                Err(_) => break,
            }
        }
        processed
    }

    /// Process commands as they arrive until disposed.
    pub async fn run(mut self) {
        debug!("Workflow started");
        while !self.disposed {
            match self.receiver.recv().await {
                Some(command) => self.dispatch(command),
                None => break,
            }
        }
        debug!("Workflow stopped");
    }

    /// Handle one command. A panic raised while handling it, usually from a
    /// user callback, drops the command and processing continues. Builds
    /// with `panic = "abort"` cannot contain it, so callbacks must not
    /// panic.
    fn dispatch(&mut self, command: Command) {
        let name = command.name();
        trace!(command = name, "Processing command");
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.handle(command))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(command = name, error = %e, "Command failed");
                metrics::record_command_failure(name);
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(command = name, %reason, "Command panicked");
                metrics::record_command_failure(name);
            }
        }
    }

    fn handle(&mut self, command: Command) -> Result<(), RealtimeError> {
        match command {
            Command::Connect => self.connection_input(ConnectionInput::Connect),
            Command::Close => self.connection_input(ConnectionInput::Close),
            Command::SendMessage { message, callback } => self.send(message, callback),
            Command::Ping(callback) => self.ping(callback),
            Command::CreateRecoveryKey(callback) => self.create_recovery_key(callback),

            Command::Attach { channel, callback } => self.attach(&channel, callback),
            Command::Detach { channel, callback } => self.detach(&channel, callback),
            Command::Publish {
                channel,
                messages,
                callback,
            } => self.channel_send(&channel, ProtocolMessage::message(&channel, messages), callback),
            Command::UpdatePresence {
                channel,
                message,
                callback,
            } => self.update_presence(&channel, message, callback),
            Command::GetPresence {
                channel,
                wait_for_sync,
                callback,
            } => self.get_presence(&channel, wait_for_sync, callback),
            Command::ReleaseChannel { channel } => self.release(&channel),
            Command::PresenceReenterFailed { channel, error } => {
                self.presence_reenter_failed(&channel, error)
            }

            Command::TransportConnected { transport_id } => {
                if transport_id == self.transport_id && self.transport.is_some() {
                    debug!(transport_id, "Transport connected");
                    self.transport_connected = true;
                } else {
                    trace!(transport_id, "Ignoring event from a stale transport");
                }
            }
            Command::TransportDisconnected {
                transport_id,
                error,
            } => {
                if transport_id == self.transport_id && self.transport.is_some() {
                    self.on_transport_disconnected(error);
                } else {
                    trace!(transport_id, "Ignoring event from a stale transport");
                }
            }
            Command::ProcessMessage {
                transport_id,
                message,
            } => {
                if transport_id != self.transport_id || self.transport.is_none() {
                    trace!(transport_id, "Ignoring message from a stale transport");
                    return Ok(());
                }
                return self.process_message(message);
            }

            Command::SetConnectingState => {
                if matches!(
                    self.state,
                    ConnectionState::Initialized
                        | ConnectionState::Disconnected
                        | ConnectionState::Suspended
                ) {
                    self.enter(ConnectionTarget::Connecting);
                }
            }
            Command::SetConnectedState { message } => self.on_connected(message),
            Command::SetDisconnectedState { reason, retry } => {
                self.enter_unless_terminal(ConnectionTarget::Disconnected { reason, retry })
            }
            Command::SetSuspendedState { reason } => {
                self.enter_unless_terminal(ConnectionTarget::Suspended { reason })
            }
            Command::SetClosingState => self.enter_unless_terminal(ConnectionTarget::Closing),
            Command::SetClosedState => self.enter_unless_terminal(ConnectionTarget::Closed),
            Command::SetFailedState { reason } => {
                self.enter_unless_terminal(ConnectionTarget::Failed { reason })
            }

            Command::TimerFired { key, generation } => self.timer_fired(key, generation),
            Command::NetworkAvailable => {
                self.connection_input(ConnectionInput::NetworkAvailable)
            }
            Command::NetworkUnavailable => {
                self.connection_input(ConnectionInput::NetworkUnavailable)
            }
            Command::TokenRenewed { result, purpose } => self.token_renewed(result, purpose),
            Command::Dispose => self.dispose(),
        }
        Ok(())
    }

    // Connection

    fn transition_context(&self) -> TransitionContext {
        TransitionContext {
            transport_connected: self.transport_connected,
            suspend_due: self
                .attempts
                .should_suspend(self.environment.now_millis(), self.connection_state_ttl),
            can_renew: self.renewer.is_some(),
        }
    }

    fn connection_input(&mut self, input: ConnectionInput) {
        let ctx = self.transition_context();
        trace!(state = ?self.state, ?input, "Connection input");
        match next_target(self.state, input, &ctx) {
            Some(target) => self.enter(target),
            None => trace!(state = ?self.state, "Input ignored in this state"),
        }
    }

    fn enter_unless_terminal(&mut self, target: ConnectionTarget) {
        if self.state.is_terminal() {
            debug!(state = ?self.state, "Ignoring state change from a terminal state");
            return;
        }
        self.enter(target);
    }

    fn enter(&mut self, target: ConnectionTarget) {
        let retry_in = match &target {
            ConnectionTarget::Disconnected { retry, .. } => match retry {
                Retry::Immediately => Some(Duration::ZERO),
                Retry::AfterTimeout => Some(self.options.disconnected_retry_timeout()),
                Retry::AfterReauth => None,
            },
            ConnectionTarget::Suspended { .. } => Some(self.options.suspended_retry_timeout()),
            _ => None,
        };

        match target.state() {
            Some(state) => {
                if state == ConnectionState::Connecting {
                    self.hosts.reset();
                }
                self.set_state(state, target.reason().cloned(), retry_in);
            }
            None => debug!(reason = ?target.reason(), "Renewing token before reconnecting"),
        }

        let reason = target.reason().cloned();
        for effect in target_effects(&target) {
            self.apply_connection_effect(effect, reason.as_ref());
        }
    }

    fn set_state(
        &mut self,
        state: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state;
        self.state = state;
        self.error_reason = reason.clone();
        debug!(from = %previous, to = %state, reason = ?reason.as_ref().map(|r| r.code), "Connection state change");
        metrics::record_connection_state(state.as_str());

        if previous == ConnectionState::Connected && state != ConnectionState::Connected {
            self.fail_pings(&reason.clone().unwrap_or_else(ErrorInfo::disconnected));
        }

        self.publish_snapshot();
        self.observers.emit(ConnectionStateChange {
            previous,
            current: state,
            event: ConnectionEvent::State(state),
            reason,
            retry_in,
        });
    }

    fn publish_snapshot(&self) {
        self.observers.publish(ConnectionSnapshot {
            state: self.state,
            id: self.connection_id.clone(),
            key: self.connection_key.clone(),
            client_id: self.client_id.clone(),
            error_reason: self.error_reason.clone(),
        });
    }

    fn apply_connection_effect(&mut self, effect: ConnectionEffect, reason: Option<&ErrorInfo>) {
        match effect {
            ConnectionEffect::OpenTransport => self.open_transport(),
            ConnectionEffect::DestroyTransport => self.destroy_transport(),
            ConnectionEffect::SendClose => {
                self.transmit(ProtocolMessage::close());
            }
            ConnectionEffect::StartTimer(timer) => self.start_connection_timer(timer),
            ConnectionEffect::AbortTimer(timer) => {
                self.timers.abort(&TimerKey::Connection(timer));
            }
            ConnectionEffect::AbortAllTimers => {
                self.timers.abort_where(|key| key.channel().is_none());
            }
            ConnectionEffect::RecordFailure => {
                self.attempts.record_failure(self.environment.now_millis());
            }
            ConnectionEffect::ResetAttempts => self.attempts.reset(),
            ConnectionEffect::RetryImmediately => self.execute(Command::SetConnectingState),
            ConnectionEffect::RequestTokenRenewal => {
                self.request_renewal(reason.cloned(), RenewalPurpose::Reconnect)
            }
            ConnectionEffect::FailPendingAcks(error) => {
                let failed = self.acks.fail_all(&error);
                if failed > 0 {
                    debug!(failed, "Failed messages awaiting acknowledgement");
                }
                metrics::set_pending_acks(self.acks.len());
            }
            ConnectionEffect::FailQueuedMessages(error) => {
                for queued in self.queued.drain(..) {
                    queued.fail(&error);
                }
                metrics::set_queued_messages(0);
            }
            ConnectionEffect::SendQueuedMessages => self.send_queued_messages(),
            ConnectionEffect::PropagateToChannels(input) => {
                let mut names: Vec<String> = self.channels.keys().cloned().collect();
                names.sort();
                for name in names {
                    self.channel_input(&name, input.clone());
                }
            }
            ConnectionEffect::ClearConnectionKey => {
                self.connection_id = None;
                self.connection_key = None;
                self.connection_serial = None;
                self.publish_snapshot();
            }
        }
    }

    fn start_connection_timer(&mut self, timer: ConnectionTimer) {
        let duration = match timer {
            ConnectionTimer::ConnectRequest | ConnectionTimer::CloseRequest => {
                Some(self.options.realtime_request_timeout())
            }
            ConnectionTimer::DisconnectedRetry => Some(self.options.disconnected_retry_timeout()),
            ConnectionTimer::SuspendedRetry => Some(self.options.suspended_retry_timeout()),
            ConnectionTimer::Heartbeat => self.heartbeat_interval,
        };
        if let Some(duration) = duration {
            self.timers.start(TimerKey::Connection(timer), duration);
        }
    }

    fn open_transport(&mut self) {
        let mut params = self.options.transport_params(self.hosts.current());
        params.access_token = self.access_token.clone();
        if params.access_token.is_some() {
            params.key = None;
        }
        params.client_id = self.client_id.clone();
        match (&self.connection_key, &self.recover) {
            (Some(key), _) => {
                params.resume = Some(key.clone());
                params.connection_serial = self.connection_serial;
            }
            (None, Some(recover)) => params.recover = Some(recover.connection_key.clone()),
            (None, None) => {}
        }

        self.transport_id += 1;
        let listener = Arc::new(Listener {
            transport_id: self.transport_id,
            sender: self.sender.clone(),
        });
        info!(
            host = %params.host,
            transport_id = self.transport_id,
            resume = params.resume.is_some(),
            "Opening transport"
        );

        let mut transport = self.factory.create(params, listener);
        self.transport_connected = false;
        transport.connect();
        self.transport = Some(transport);
    }

    fn destroy_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!(transport_id = self.transport_id, "Closing transport");
            transport.close();
        }
        self.transport_connected = false;
    }

    fn on_transport_disconnected(&mut self, error: Option<ErrorInfo>) {
        self.transport = None;
        self.transport_connected = false;

        if self.state == ConnectionState::Connecting
            && FallbackHosts::should_use_fallback(error.as_ref())
        {
            if let Some(host) = self.hosts.advance() {
                info!(host, "Retrying connection on fallback host");
                self.open_transport();
                self.start_connection_timer(ConnectionTimer::ConnectRequest);
                return;
            }
        }
        self.connection_input(ConnectionInput::TransportLost(error));
    }

    fn on_connected(&mut self, message: ProtocolMessage) {
        if !matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(state = ?self.state, "Ignoring Connected outside Connecting");
            return;
        }

        let details = message.connection_details.clone().unwrap_or_default();
        let was_connected = self.state == ConnectionState::Connected;
        let resumed = self.connection_id.is_some()
            && self.connection_id == message.connection_id
            && message.has_flag(Flags::RESUMED);
        let recovering = self.connection_id.is_none() && self.recover.take().is_some();

        self.connection_id = message.connection_id.clone();
        if details.connection_key.is_some() {
            self.connection_key = details.connection_key.clone();
        }
        if details.client_id.is_some() {
            self.client_id = details.client_id.clone();
        }
        self.connection_serial = message.connection_serial;
        if let Some(ttl) = details.connection_state_ttl {
            self.connection_state_ttl = ttl;
        }
        self.heartbeat_interval = details
            .max_idle_interval
            .map(|ms| Duration::from_millis(ms) + self.options.realtime_request_timeout());
        self.last_activity = self.environment.now_millis();

        if was_connected {
            debug!(connection_id = ?self.connection_id, "Connection details updated");
            self.error_reason = message.error.clone();
            self.publish_snapshot();
            self.observers.emit(ConnectionStateChange {
                previous: ConnectionState::Connected,
                current: ConnectionState::Connected,
                event: ConnectionEvent::Update,
                reason: message.error,
                retry_in: None,
            });
            self.start_connection_timer(ConnectionTimer::Heartbeat);
            return;
        }

        if resumed {
            info!(connection_id = ?self.connection_id, "Connection resumed");
        } else if recovering && message.error.is_none() {
            info!(connection_id = ?self.connection_id, msg_serial = self.acks.msg_serial(), "Connection recovered");
        } else {
            let reason = message
                .error
                .clone()
                .unwrap_or_else(ErrorInfo::unable_to_recover);
            let discarded = self.acks.reset(&reason);
            info!(connection_id = ?self.connection_id, discarded, "New connection established");
            metrics::set_pending_acks(0);
        }

        self.set_state(ConnectionState::Connected, message.error, None);

        if resumed {
            for pending in self.acks.pending_messages() {
                self.transmit(pending);
            }
        }

        let heartbeat = self.heartbeat_interval.is_some();
        for effect in connected_effects(resumed, heartbeat) {
            self.apply_connection_effect(effect, None);
        }
    }

    fn check_heartbeat(&mut self) {
        let Some(interval) = self.heartbeat_interval else {
            return;
        };
        let idle = self.environment.now_millis().saturating_sub(self.last_activity);
        let idle = Duration::from_millis(u64::try_from(idle).unwrap_or(0));
        if idle < interval {
            self.timers.start(
                TimerKey::Connection(ConnectionTimer::Heartbeat),
                interval - idle,
            );
        } else {
            warn!(?idle, "No activity from the service");
            self.connection_input(ConnectionInput::HeartbeatTimeout);
        }
    }

    fn request_renewal(&mut self, reason: Option<ErrorInfo>, purpose: RenewalPurpose) {
        let Some(renewer) = self.renewer.clone() else {
            warn!("Token renewal requested without a token renewer");
            let error = reason.unwrap_or_else(|| {
                ErrorInfo::new(ErrorInfo::FORBIDDEN, 403, "No means to renew the token")
            });
            self.connection_input(ConnectionInput::TokenRenewalFailed(error));
            return;
        };
        if self.renewal_in_progress {
            trace!("Token renewal already in progress");
            return;
        }

        debug!(?purpose, "Renewing token");
        self.renewal_in_progress = true;
        let sender = self.sender.clone();
        renewer.renew(
            reason.as_ref(),
            Box::new(move |result| {
                let _ = sender.send(Command::TokenRenewed { result, purpose });
            }),
        );
    }

    fn token_renewed(&mut self, result: Result<String, ErrorInfo>, purpose: RenewalPurpose) {
        self.renewal_in_progress = false;
        match result {
            Ok(token) => {
                debug!(?purpose, "Token renewed");
                self.access_token = Some(token.clone());
                match (purpose, self.state) {
                    (RenewalPurpose::ServerRequest, ConnectionState::Connected) => {
                        self.transmit(ProtocolMessage::auth(token));
                    }
                    (_, ConnectionState::Connecting) => {
                        self.destroy_transport();
                        self.open_transport();
                        self.start_connection_timer(ConnectionTimer::ConnectRequest);
                    }
                    (_, ConnectionState::Disconnected) => self.execute(Command::SetConnectingState),
                    _ => trace!(state = ?self.state, "Renewed token kept for the next connect"),
                }
            }
            Err(error) => {
                warn!(code = error.code, status = error.status_code, "Token renewal failed");
                self.connection_input(ConnectionInput::TokenRenewalFailed(error));
            }
        }
    }

    fn dispose(&mut self) {
        debug!("Disposing workflow");
        self.disposed = true;
        self.timers.abort_all();
        self.destroy_transport();
    }

    // Timers

    fn timer_fired(&mut self, key: TimerKey, generation: u64) {
        if !self.timers.fire(&key, generation) {
            trace!(?key, generation, "Ignoring stale timer");
            return;
        }
        trace!(?key, "Timer fired");

        match key {
            TimerKey::Connection(ConnectionTimer::ConnectRequest) => {
                if self.state == ConnectionState::Connecting {
                    if let Some(host) = self.hosts.advance() {
                        info!(host, "Connect timed out, retrying on fallback host");
                        self.destroy_transport();
                        self.open_transport();
                        self.start_connection_timer(ConnectionTimer::ConnectRequest);
                        return;
                    }
                }
                self.connection_input(ConnectionInput::ConnectTimeout)
            }
            TimerKey::Connection(ConnectionTimer::CloseRequest) => {
                self.connection_input(ConnectionInput::CloseTimeout)
            }
            TimerKey::Connection(ConnectionTimer::DisconnectedRetry) => {
                self.connection_input(ConnectionInput::DisconnectedRetryTimeout)
            }
            TimerKey::Connection(ConnectionTimer::SuspendedRetry) => {
                self.connection_input(ConnectionInput::SuspendedRetryTimeout)
            }
            TimerKey::Connection(ConnectionTimer::Heartbeat) => self.check_heartbeat(),
            TimerKey::Ping(id) => {
                if let Some(ping) = self.pings.remove(&id) {
                    (ping.callback)(Err(ErrorInfo::new(
                        ErrorInfo::TIMEOUT,
                        504,
                        "Timed out waiting for the ping response",
                    )));
                }
            }
            TimerKey::ChannelAttach(name) => self.channel_input(&name, ChannelInput::AttachTimeout),
            TimerKey::ChannelDetach(name) => {
                let previous = self
                    .channels
                    .get(&name)
                    .map_or(ChannelState::Attached, |c| c.state_before_detach);
                self.channel_input(&name, ChannelInput::DetachTimeout { previous });
            }
            TimerKey::ChannelRetry(name) => {
                if self.state == ConnectionState::Connected {
                    self.channel_input(&name, ChannelInput::RetryTimeout);
                }
            }
        }
    }

    // Outbound

    /// Send, queue or reject an envelope according to the connection state.
    fn send(
        &mut self,
        message: ProtocolMessage,
        callback: Option<CompletionCallback>,
    ) {
        if self.state == ConnectionState::Connected {
            self.send_tracked(message, callback);
        } else if self.state.queues_messages() && self.options.queue_messages {
            trace!(action = ?message.action, state = ?self.state, "Queueing message");
            self.queued.push_back(QueuedMessage::new(message, callback));
            metrics::set_queued_messages(self.queued.len());
        } else {
            let error = self.error_reason.clone().unwrap_or_else(|| {
                ErrorInfo::connection_failed(format!(
                    "Cannot send while connection is {}",
                    self.state
                ))
            });
            complete(callback, Err(error));
        }
    }

    fn send_tracked(&mut self, message: ProtocolMessage, callback: Option<CompletionCallback>) {
        let message = self.acks.track(message, callback);
        metrics::set_pending_acks(self.acks.len());
        self.transmit(message);
    }

    fn send_queued_messages(&mut self) {
        let queued: Vec<QueuedMessage> = self.queued.drain(..).collect();
        if !queued.is_empty() {
            debug!(count = queued.len(), "Sending queued messages");
        }
        for entry in queued {
            self.send_tracked(entry.message, entry.callback);
        }
        metrics::set_queued_messages(0);
    }

    /// Put an envelope on the wire. Returns `false` if it could not be sent.
    fn transmit(&mut self, message: ProtocolMessage) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            debug!(action = ?message.action, "No transport to send on");
            return false;
        };
        let action = message.action;
        match transport.send(message) {
            Ok(()) => {
                metrics::record_sent(action.as_str());
                true
            }
            Err(e) => {
                warn!(?action, error = %e, "Transport send failed");
                false
            }
        }
    }

    fn ping(&mut self, callback: PingCallback) {
        if self.state != ConnectionState::Connected {
            callback(Err(ErrorInfo::connection_failed(format!(
                "Cannot ping while connection is {}",
                self.state
            ))));
            return;
        }

        let id = self.next_ping;
        self.next_ping += 1;
        self.transmit(ProtocolMessage::heartbeat(Some(format!("{PING_PREFIX}{id}"))));
        self.pings.insert(
            id,
            PendingPing {
                started_at: self.environment.now_millis(),
                callback,
            },
        );
        self.timers
            .start(TimerKey::Ping(id), self.options.realtime_request_timeout());
    }

    fn on_heartbeat(&mut self, message: &ProtocolMessage) {
        let Some(id) = message
            .id
            .as_deref()
            .and_then(|id| id.strip_prefix(PING_PREFIX))
            .and_then(|id| id.parse::<u64>().ok())
        else {
            return;
        };
        if let Some(ping) = self.pings.remove(&id) {
            self.timers.abort(&TimerKey::Ping(id));
            let elapsed = self.environment.now_millis().saturating_sub(ping.started_at);
            let rtt = Duration::from_millis(u64::try_from(elapsed).unwrap_or(0));
            metrics::record_ping(rtt.as_secs_f64());
            (ping.callback)(Ok(rtt));
        }
    }

    fn fail_pings(&mut self, error: &ErrorInfo) {
        for (id, ping) in self.pings.drain() {
            self.timers.abort(&TimerKey::Ping(id));
            (ping.callback)(Err(error.clone()));
        }
    }

    fn create_recovery_key(&mut self, callback: RecoveryKeyCallback) {
        let key = match (&self.connection_key, self.state) {
            (
                Some(connection_key),
                ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnected,
            ) => {
                let channel_serials = self
                    .channels
                    .values()
                    .filter_map(|c| c.channel_serial.clone().map(|s| (c.name.clone(), s)))
                    .collect();
                RecoveryKey {
                    connection_key: connection_key.clone(),
                    msg_serial: self.acks.msg_serial(),
                    channel_serials,
                }
                .encode()
                .map_err(|e| warn!(error = %e, "Failed to encode recovery key"))
                .ok()
            }
            _ => None,
        };
        callback(key);
    }

    // Channels

    fn ensure_channel(&mut self, name: &str) -> &mut Channel {
        self.channels.entry(name.to_string()).or_insert_with(|| {
            let observers = self
                .registry
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ChannelObservers::new(name)))
                .clone();
            let mut channel = Channel::new(name, observers);
            channel.channel_serial = self.recovered_serials.remove(name);
            debug!(channel = %name, "Channel created");
            channel
        })
    }

    fn channel_input(&mut self, name: &str, input: ChannelInput) {
        if let Err(e) = self.try_channel_input(name, input) {
            warn!(channel = %name, error = %e, "Channel input rejected");
        }
    }

    fn try_channel_input(&mut self, name: &str, input: ChannelInput) -> Result<(), ErrorInfo> {
        let Some(channel) = self.channels.get_mut(name) else {
            trace!(channel = %name, "Input for unknown channel");
            return Ok(());
        };

        let previous = channel.state;
        let next = transition(name, previous, input)?;
        if next.state == ChannelState::Detaching && previous != ChannelState::Detaching {
            channel.state_before_detach = previous;
        }
        channel.state = next.state;

        if let Some(event) = next.event {
            if next.reason.is_some() || matches!(event, ChannelEvent::State(_)) {
                channel.error_reason = next.reason.clone();
            }
            if matches!(event, ChannelEvent::State(_)) {
                debug!(channel = %name, from = %previous, to = %next.state, "Channel state change");
                metrics::record_channel_state(next.state.as_str());
            }
            channel.observers.emit_state(ChannelStateChange {
                previous,
                current: next.state,
                event,
                reason: next.reason,
                resumed: next.resumed,
            });
        }

        for effect in next.effects {
            self.apply_channel_effect(name, effect);
        }
        Ok(())
    }

    fn apply_channel_effect(&mut self, name: &str, effect: ChannelEffect) {
        let now = self.environment.now_millis();
        let connected = self.state == ConnectionState::Connected;
        let timeout = self.options.realtime_request_timeout();

        match effect {
            ChannelEffect::SendAttach => {
                if !connected {
                    return;
                }
                let serial = self.channels.get(name).and_then(|c| c.channel_serial.clone());
                let mut attach = ProtocolMessage::attach(name);
                attach.channel_serial = serial;
                self.transmit(attach);
                self.timers.start(TimerKey::ChannelAttach(name.to_string()), timeout);
            }
            ChannelEffect::SendDetach => {
                if !connected {
                    return;
                }
                self.transmit(ProtocolMessage::detach(name));
                self.timers.start(TimerKey::ChannelDetach(name.to_string()), timeout);
            }
            ChannelEffect::AbortTimers => {
                self.timers.abort_where(|key| key.channel() == Some(name));
            }
            ChannelEffect::StartRetryTimer => {
                self.timers.start(
                    TimerKey::ChannelRetry(name.to_string()),
                    self.options.channel_retry_timeout(),
                );
            }
            ChannelEffect::CompleteAttach(result) => {
                if let Some(channel) = self.channels.get_mut(name) {
                    channel.complete_attach(&result);
                }
            }
            ChannelEffect::CompleteDetach(result) => {
                if let Some(channel) = self.channels.get_mut(name) {
                    channel.complete_detach(&result);
                }
            }
            ChannelEffect::FlushQueue => {
                let queued: Vec<QueuedMessage> = self
                    .channels
                    .get_mut(name)
                    .map(|c| c.queued.drain(..).collect())
                    .unwrap_or_default();
                for entry in queued {
                    self.send(entry.message, entry.callback);
                }
            }
            ChannelEffect::FailQueue(error) => {
                if let Some(channel) = self.channels.get_mut(name) {
                    channel.fail_queue(&error);
                }
            }
            ChannelEffect::AttachedPresence {
                has_presence,
                resumed,
            } => {
                let Some(channel) = self.channels.get_mut(name) else {
                    return;
                };
                let mut leaves = Vec::new();
                if has_presence {
                    channel.presence.start_sync(None);
                } else if !resumed {
                    leaves = channel.presence.leave_all(now);
                } else if !channel.presence.sync_in_progress() {
                    channel.presence.end_sync(now);
                }
                if !channel.presence.sync_in_progress() {
                    channel.resolve_presence_waiters();
                }
                for leave in leaves {
                    metrics::record_presence_event(leave.action.as_str());
                    channel.observers.emit_presence(leave);
                }
                if !resumed {
                    self.reenter_local_members(name);
                }
            }
            ChannelEffect::SuspendPresence => {
                if let Some(channel) = self.channels.get_mut(name) {
                    let error = channel
                        .error_reason
                        .clone()
                        .unwrap_or_else(ErrorInfo::connection_suspended);
                    channel.presence.clear();
                    channel.fail_presence_waiters(&error);
                }
            }
            ChannelEffect::ClearPresence => {
                if let Some(channel) = self.channels.get_mut(name) {
                    let error = channel.error_reason.clone().unwrap_or_else(|| {
                        ErrorInfo::channel_operation_failed("Channel is no longer attached")
                    });
                    channel.presence.clear();
                    channel.local_members.clear();
                    channel.fail_presence_waiters(&error);
                }
            }
        }
    }

    fn attach(&mut self, name: &str, callback: Option<CompletionCallback>) {
        if matches!(
            self.state,
            ConnectionState::Closing
                | ConnectionState::Closed
                | ConnectionState::Failed
                | ConnectionState::Suspended
        ) {
            complete(
                callback,
                Err(ErrorInfo::channel_operation_failed(format!(
                    "Cannot attach channel {name} while connection is {}",
                    self.state
                ))),
            );
            return;
        }
        if self.state == ConnectionState::Initialized {
            self.connection_input(ConnectionInput::Connect);
        }

        let channel = self.ensure_channel(name);
        if channel.state == ChannelState::Attached {
            complete(callback, Ok(()));
            return;
        }
        if let Some(callback) = callback {
            channel.attach_callbacks.push(callback);
        }
        self.channel_input(name, ChannelInput::Attach);
    }

    fn detach(&mut self, name: &str, callback: Option<CompletionCallback>) {
        let Some(channel) = self.channels.get_mut(name) else {
            complete(callback, Ok(()));
            return;
        };
        if let Some(callback) = callback {
            channel.detach_callbacks.push(callback);
        }

        let state = channel.state;
        if let Err(e) = self.try_channel_input(name, ChannelInput::Detach) {
            if let Some(channel) = self.channels.get_mut(name) {
                channel.complete_detach(&Err(e));
            }
            return;
        }
        if let Some(channel) = self.channels.get_mut(name) {
            if matches!(
                channel.state,
                ChannelState::Initialized | ChannelState::Detached
            ) {
                trace!(channel = %name, from = %state, "Detach completed without a round trip");
                channel.complete_detach(&Ok(()));
            }
        }
    }

    /// Send a channel-scoped envelope following the channel's queueing rules.
    fn channel_send(
        &mut self,
        name: &str,
        message: ProtocolMessage,
        callback: Option<CompletionCallback>,
    ) {
        let channel = self.ensure_channel(name);
        match channel.state {
            ChannelState::Attached => self.send(message, callback),
            ChannelState::Attaching => {
                channel.queued.push_back(QueuedMessage::new(message, callback));
            }
            ChannelState::Initialized => {
                channel.queued.push_back(QueuedMessage::new(message, callback));
                trace!(channel = %name, "Implicit attach");
                self.attach(name, None);
            }
            state => complete(
                callback,
                Err(ErrorInfo::channel_invalid_state(name, state)),
            ),
        }
    }

    fn update_presence(
        &mut self,
        name: &str,
        mut message: PresenceMessage,
        callback: Option<CompletionCallback>,
    ) {
        if message.client_id.is_empty() {
            match &self.client_id {
                Some(client_id) => message.client_id = client_id.clone(),
                None => {
                    complete(
                        callback,
                        Err(ErrorInfo::new(
                            ErrorInfo::BAD_REQUEST,
                            400,
                            "Unable to update presence without a client id",
                        )),
                    );
                    return;
                }
            }
        }
        self.channel_send(name, ProtocolMessage::presence(name, vec![message]), callback);
    }

    fn reenter_local_members(&mut self, name: &str) {
        let members = match self.channels.get(name) {
            Some(channel) if !channel.local_members.is_empty() => channel.local_members.values(),
            _ => return,
        };

        debug!(channel = %name, count = members.len(), "Re-entering presence");
        for member in members {
            let mut enter = PresenceMessage::new(PresenceAction::Enter, member.client_id.clone());
            enter.data = member.data.clone();

            let sender = self.sender.clone();
            let channel = name.to_string();
            let callback: CompletionCallback = Box::new(move |result| {
                if let Err(error) = result {
                    let _ = sender.send(Command::PresenceReenterFailed { channel, error });
                }
            });
            self.send(ProtocolMessage::presence(name, vec![enter]), Some(callback));
        }
    }

    fn presence_reenter_failed(&mut self, name: &str, cause: ErrorInfo) {
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        warn!(channel = %name, code = cause.code, "Presence re-enter failed");
        let reason = ErrorInfo::new(
            ErrorInfo::PRESENCE_REENTER_FAILED,
            400,
            format!("Presence auto re-enter failed on channel {name}"),
        )
        .with_cause(cause);
        channel.error_reason = Some(reason.clone());
        channel.observers.emit_state(ChannelStateChange {
            previous: channel.state,
            current: channel.state,
            event: ChannelEvent::Update,
            reason: Some(reason),
            resumed: true,
        });
    }

    fn get_presence(&mut self, name: &str, wait_for_sync: bool, callback: PresenceCallback) {
        let state = self.ensure_channel(name).state;
        match state {
            ChannelState::Failed | ChannelState::Detached => {
                callback(Err(ErrorInfo::channel_invalid_state(name, state)));
            }
            ChannelState::Suspended if wait_for_sync => {
                callback(Err(ErrorInfo::channel_operation_failed(format!(
                    "Presence state of channel {name} is out of sync"
                ))));
            }
            _ => {
                if state == ChannelState::Initialized {
                    self.attach(name, None);
                }
                let Some(channel) = self.channels.get_mut(name) else {
                    return;
                };
                if wait_for_sync && !channel.presence.sync_complete() {
                    channel.presence_waiters.push(callback);
                } else {
                    callback(Ok(channel.presence.values()));
                }
            }
        }
    }

    fn release(&mut self, name: &str) {
        if matches!(
            self.channel_state(name),
            Some(ChannelState::Attaching | ChannelState::Attached)
        ) {
            self.channel_input(name, ChannelInput::Detach);
        }
        self.timers.abort_where(|key| key.channel() == Some(name));
        if let Some(mut channel) = self.channels.remove(name) {
            let error = ErrorInfo::channel_operation_failed(format!("Channel {name} released"));
            channel.complete_attach(&Err(error.clone()));
            channel.complete_detach(&Ok(()));
            channel.fail_queue(&error);
            channel.fail_presence_waiters(&error);
            // A handle fetched after the release owns a fresh entry.
            self.registry
                .remove_if(name, |_, observers| Arc::ptr_eq(observers, &channel.observers));
        }
        debug!(channel = %name, "Channel released");
    }

    // Inbound

    fn process_message(&mut self, message: ProtocolMessage) -> Result<(), RealtimeError> {
        self.last_activity = self.environment.now_millis();
        metrics::record_received(message.action.as_str());
        trace!(action = ?message.action, channel = ?message.channel, "Received");

        match message.action {
            Action::Heartbeat => self.on_heartbeat(&message),
            Action::Ack => {
                let acked = self.acks.on_ack(
                    message.msg_serial.unwrap_or(0),
                    message.count.unwrap_or(1),
                );
                metrics::record_acks(acked);
                metrics::set_pending_acks(self.acks.len());
            }
            Action::Nack => {
                let error = message
                    .error
                    .unwrap_or_else(|| ErrorInfo::internal("Message rejected by the service"));
                warn!(serial = ?message.msg_serial, code = error.code, "Nack received");
                let nacked = self.acks.on_nack(
                    message.msg_serial.unwrap_or(0),
                    message.count.unwrap_or(1),
                    error,
                );
                metrics::record_nacks(nacked);
                metrics::set_pending_acks(self.acks.len());
            }
            Action::Connected => self.execute(Command::SetConnectedState { message }),
            Action::Disconnected => {
                self.connection_input(ConnectionInput::DisconnectedReceived(message.error))
            }
            Action::Closed => self.connection_input(ConnectionInput::ClosedReceived),
            Action::Error => {
                let error = message
                    .error
                    .unwrap_or_else(|| ErrorInfo::internal("Error received without details"));
                match message.channel {
                    Some(name) => self.channel_input(&name, ChannelInput::Error(error)),
                    None => {
                        warn!(code = error.code, message = %error.message, "Connection error");
                        self.connection_input(ConnectionInput::ErrorReceived(error));
                    }
                }
            }
            Action::Attached => {
                let name = required_channel(&message)?;
                if let Some(channel) = self.channels.get_mut(&name) {
                    if message.channel_serial.is_some() {
                        channel.channel_serial = message.channel_serial.clone();
                    }
                }
                self.channel_input(
                    &name,
                    ChannelInput::Attached {
                        resumed: message.has_flag(Flags::RESUMED),
                        has_presence: message.has_flag(Flags::HAS_PRESENCE),
                        error: message.error,
                    },
                );
            }
            Action::Detached => {
                let name = required_channel(&message)?;
                self.channel_input(
                    &name,
                    ChannelInput::Detached {
                        error: message.error,
                    },
                );
            }
            Action::Message => self.on_channel_messages(message)?,
            Action::Presence => self.on_presence(message, false)?,
            Action::Sync => self.on_presence(message, true)?,
            Action::Auth => self.request_renewal(None, RenewalPurpose::ServerRequest),
            Action::Connect
            | Action::Disconnect
            | Action::Close
            | Action::Attach
            | Action::Detach => {
                warn!(action = ?message.action, "Unexpected action from the service");
            }
        }
        Ok(())
    }

    fn on_channel_messages(&mut self, message: ProtocolMessage) -> Result<(), RealtimeError> {
        let name = required_channel(&message)?;
        let Some(channel) = self.channels.get_mut(&name) else {
            debug!(channel = %name, "Message for unknown channel");
            return Ok(());
        };
        if channel.state != ChannelState::Attached {
            debug!(channel = %name, state = %channel.state, "Dropping message on unattached channel");
            return Ok(());
        }
        if message.channel_serial.is_some() {
            channel.channel_serial = message.channel_serial.clone();
        }

        let observers = channel.observers.clone();
        let decoder = self.decoder.clone();
        for (index, mut item) in message.messages.iter().cloned().enumerate() {
            enrich_message(&mut item, &message, index);

            if let Some(decoder) = &decoder {
                if let Err(e) = decoder.decode(&name, &mut item) {
                    if item.is_delta() {
                        warn!(channel = %name, error = %e, "Delta decode failed, re-attaching");
                        let reason = ErrorInfo::new(
                            ErrorInfo::DELTA_DECODE_FAILED,
                            400,
                            format!("Delta decode failed on channel {name}"),
                        )
                        .with_cause(e);
                        self.channel_input(&name, ChannelInput::DecodeFailure(reason));
                        return Ok(());
                    }
                    warn!(channel = %name, error = %e, "Payload decode failed, message dropped");
                    continue;
                }
            }
            observers.emit_message(item);
        }
        Ok(())
    }

    fn on_presence(&mut self, message: ProtocolMessage, sync: bool) -> Result<(), RealtimeError> {
        let name = required_channel(&message)?;
        let now = self.environment.now_millis();
        let connection_id = self.connection_id.clone();
        let Some(channel) = self.channels.get_mut(&name) else {
            debug!(channel = %name, "Presence for unknown channel");
            return Ok(());
        };

        let cursor = if sync {
            let cursor = SyncCursor::parse(message.channel_serial.as_deref());
            channel.presence.start_sync(Some(&cursor.sequence_id));
            Some(cursor)
        } else {
            if message.channel_serial.is_some() {
                channel.channel_serial = message.channel_serial.clone();
            }
            None
        };

        let mut events = Vec::new();
        for (index, mut item) in message.presence.iter().cloned().enumerate() {
            enrich_presence(&mut item, &message, index);

            let applied = match item.action {
                PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                    if sync {
                        channel.presence.sync_put(&item)
                    } else {
                        channel.presence.put(&item)
                    }
                }
                PresenceAction::Leave => channel.presence.remove(&item),
                PresenceAction::Absent => Ok(false),
            };
            let accepted = match applied {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(channel = %name, error = %e, "Discarding presence message");
                    continue;
                }
            };
            if accepted || item.action == PresenceAction::Leave {
                channel.local_members.apply(&item, connection_id.as_deref());
            }
            if accepted {
                events.push(item);
            }
        }

        if cursor.is_some_and(|c| !c.has_more) {
            events.extend(channel.presence.end_sync(now));
            channel.resolve_presence_waiters();
        }

        for event in events {
            metrics::record_presence_event(event.action.as_str());
            channel.observers.emit_presence(event);
        }
        Ok(())
    }
}

fn required_channel(message: &ProtocolMessage) -> Result<String, RealtimeError> {
    message.channel.clone().ok_or_else(|| {
        RealtimeError::Protocol(ErrorInfo::new(
            ErrorInfo::BAD_REQUEST,
            400,
            format!("{} received without a channel", message.action.as_str()),
        ))
    })
}

/// Fill fields a message inherits from its envelope.
fn enrich_message(item: &mut Message, envelope: &ProtocolMessage, index: usize) {
    if item.id.is_none() {
        item.id = envelope.id.as_ref().map(|id| format!("{id}:{index}"));
    }
    if item.connection_id.is_none() {
        item.connection_id = envelope.connection_id.clone();
    }
    if item.timestamp.is_none() {
        item.timestamp = envelope.timestamp;
    }
}

fn enrich_presence(item: &mut PresenceMessage, envelope: &ProtocolMessage, index: usize) {
    if item.id.is_none() {
        item.id = envelope.id.as_ref().map(|id| format!("{id}:{index}"));
    }
    if item.connection_id.is_empty() {
        if let Some(connection_id) = &envelope.connection_id {
            item.connection_id = connection_id.clone();
        }
    }
    if item.timestamp.is_none() {
        item.timestamp = envelope.timestamp;
    }
}
