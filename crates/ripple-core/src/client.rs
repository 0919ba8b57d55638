//! Public client API.
//!
//! [`Realtime`] and the handles it hands out ([`Connection`], [`Channels`],
//! [`RealtimeChannel`], [`RealtimePresence`]) never touch engine state. Every
//! operation becomes a [`Command`] for the workflow task; reads come from the
//! observer snapshots the workflow publishes.
//!
//! Operations come in two flavours: `*_with` takes an optional completion
//! callback and returns immediately, the plain name is `async` and resolves
//! with the same result.

use crate::ack::CompletionCallback;
use crate::auth::{PayloadDecoder, TokenRenewer};
use crate::channel::{validate_channel_name, ChannelState, ChannelStateChange};
use crate::command::Command;
use crate::config::ClientOptions;
use crate::connection::{ConnectionState, ConnectionStateChange};
use crate::environment::Environment;
use crate::error::RealtimeError;
use crate::observer::{ChannelObservers, ChannelSnapshot, ConnectionObservers, ConnectionSnapshot};
use crate::workflow::{ChannelRegistry, Workflow};
use ripple_protocol::{ErrorInfo, Message, PresenceAction, PresenceMessage, ProtocolMessage};
use ripple_transport::{TransportFactory, WebSocketConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info};

/// A one-shot callback paired with the receiver of its value.
fn reply<T: Send + 'static>() -> (Box<dyn FnOnce(T) + Send>, oneshot::Receiver<T>) {
    let (tx, rx) = oneshot::channel();
    let callback = Box::new(move |value: T| {
        let _ = tx.send(value);
    });
    (callback, rx)
}

fn disposed() -> ErrorInfo {
    RealtimeError::Disposed.to_error_info()
}

/// State shared by every handle of one client.
struct Shared {
    sender: mpsc::UnboundedSender<Command>,
    observers: Arc<ConnectionObservers>,
    registry: ChannelRegistry,
    client_id: Option<String>,
}

impl Shared {
    fn execute(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.sender.send(command) {
            debug!(command = command.name(), "Workflow stopped, rejecting command");
            command.reject(&disposed());
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Dispose);
    }
}

/// Builder for [`Realtime`].
pub struct RealtimeBuilder {
    options: ClientOptions,
    factory: Option<Arc<dyn TransportFactory>>,
    renewer: Option<Arc<dyn TokenRenewer>>,
    decoder: Option<Arc<dyn PayloadDecoder>>,
    environment: Environment,
}

impl RealtimeBuilder {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            factory: None,
            renewer: None,
            decoder: None,
            environment: Environment::default(),
        }
    }

    /// Use a custom transport. Defaults to WebSocket.
    #[must_use]
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    #[must_use]
    pub fn token_renewer(mut self, renewer: Arc<dyn TokenRenewer>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    #[must_use]
    pub fn payload_decoder(mut self, decoder: Arc<dyn PayloadDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    #[must_use]
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Build the client and spawn its workflow on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or no runtime is running.
    pub fn build(self) -> Result<Realtime, RealtimeError> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;
        let (realtime, workflow) = self.build_parts()?;
        handle.spawn(workflow.run());
        Ok(realtime)
    }

    /// Build the client without spawning anything. The caller drives the
    /// returned workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn build_parts(self) -> Result<(Realtime, Workflow), RealtimeError> {
        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(WebSocketConnector::default().into_factory()),
        };
        let auto_connect = self.options.auto_connect;

        let mut workflow = Workflow::new(self.options, factory, self.environment)?;
        if let Some(renewer) = self.renewer {
            workflow = workflow.with_token_renewer(renewer);
        }
        if let Some(decoder) = self.decoder {
            workflow = workflow.with_payload_decoder(decoder);
        }

        let shared = Arc::new(Shared {
            sender: workflow.sender(),
            observers: workflow.observers(),
            registry: workflow.registry(),
            client_id: workflow.options().client_id.clone(),
        });
        info!(host = %workflow.current_host(), "Realtime client created");

        if auto_connect {
            shared.execute(Command::Connect);
        }

        let realtime = Realtime {
            connection: Connection {
                shared: shared.clone(),
            },
            channels: Channels {
                shared: shared.clone(),
            },
            shared,
        };
        Ok((realtime, workflow))
    }
}

/// A realtime client.
///
/// Dropping the last handle stops the workflow.
pub struct Realtime {
    shared: Arc<Shared>,
    connection: Connection,
    channels: Channels,
}

impl std::fmt::Debug for Realtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realtime")
            .field("state", &self.connection.state())
            .field("client_id", &self.shared.client_id)
            .finish()
    }
}

impl Realtime {
    /// Create a client using WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or no runtime is running.
    pub fn new(options: ClientOptions) -> Result<Self, RealtimeError> {
        RealtimeBuilder::new(options).build()
    }

    #[must_use]
    pub fn builder(options: ClientOptions) -> RealtimeBuilder {
        RealtimeBuilder::new(options)
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    #[must_use]
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.shared.client_id.as_deref()
    }

    /// Send a raw envelope, following the connection's queueing rules.
    pub fn send_with(&self, message: ProtocolMessage, callback: Option<CompletionCallback>) {
        self.shared.execute(Command::SendMessage { message, callback });
    }

    /// Send a raw envelope and wait for it to be acknowledged.
    ///
    /// # Errors
    ///
    /// Returns the error the message failed with.
    pub async fn send(&self, message: ProtocolMessage) -> Result<(), ErrorInfo> {
        let (callback, rx) = reply();
        self.send_with(message, Some(callback));
        rx.await.unwrap_or_else(|_| Err(disposed()))
    }

    pub fn close(&self) {
        self.connection.close();
    }
}

/// The client's connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.observers.snapshot().state
    }

    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.shared.observers.snapshot().id
    }

    #[must_use]
    pub fn key(&self) -> Option<String> {
        self.shared.observers.snapshot().key
    }

    #[must_use]
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.shared.observers.snapshot().error_reason
    }

    /// Receive every state change and update from now on.
    #[must_use]
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.shared.observers.subscribe()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.shared.observers.watch()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> ConnectionSnapshot {
        let mut rx = self.watch();
        let reached = match rx.wait_for(|snapshot| snapshot.state == state).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.shared.observers.snapshot(),
        };
        reached
    }

    pub fn connect(&self) {
        self.shared.execute(Command::Connect);
    }

    pub fn close(&self) {
        self.shared.execute(Command::Close);
    }

    pub fn ping_with(&self, callback: Box<dyn FnOnce(Result<Duration, ErrorInfo>) + Send>) {
        self.shared.execute(Command::Ping(callback));
    }

    /// Measure the round trip to the service.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not Connected or the response
    /// times out.
    pub async fn ping(&self) -> Result<Duration, ErrorInfo> {
        let (callback, rx) = reply();
        self.ping_with(callback);
        rx.await.unwrap_or_else(|_| Err(disposed()))
    }

    pub fn create_recovery_key_with(&self, callback: Box<dyn FnOnce(Option<String>) + Send>) {
        self.shared.execute(Command::CreateRecoveryKey(callback));
    }

    /// A key another client can pass as `recover` to continue this
    /// connection, or `None` if there is nothing to recover.
    pub async fn recovery_key(&self) -> Option<String> {
        let (callback, rx) = reply();
        self.create_recovery_key_with(callback);
        rx.await.ok().flatten()
    }
}

/// The client's channels.
#[derive(Clone)]
pub struct Channels {
    shared: Arc<Shared>,
}

impl Channels {
    /// Get a channel handle, creating the channel if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid.
    pub fn get(&self, name: &str) -> Result<RealtimeChannel, RealtimeError> {
        validate_channel_name(name).map_err(RealtimeError::InvalidChannelName)?;
        let observers = self
            .shared
            .registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ChannelObservers::new(name)))
            .clone();
        Ok(RealtimeChannel {
            name: name.to_string(),
            observers,
            shared: self.shared.clone(),
        })
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.shared.registry.contains_key(name)
    }

    /// Names of all channels, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Detach if needed and forget the channel.
    pub fn release(&self, name: &str) {
        self.shared.registry.remove(name);
        self.shared.execute(Command::ReleaseChannel {
            channel: name.to_string(),
        });
    }
}

/// A handle to one channel.
#[derive(Clone)]
pub struct RealtimeChannel {
    name: String,
    observers: Arc<ChannelObservers>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl RealtimeChannel {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.observers.snapshot().state
    }

    #[must_use]
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.observers.snapshot().error_reason
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ChannelSnapshot> {
        self.observers.watch()
    }

    #[must_use]
    pub fn on_state_change(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.observers.subscribe_state()
    }

    /// Receive messages published on the channel.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.observers.subscribe_messages()
    }

    #[must_use]
    pub fn presence(&self) -> RealtimePresence {
        RealtimePresence {
            channel: self.name.clone(),
            observers: self.observers.clone(),
            shared: self.shared.clone(),
        }
    }

    pub fn attach_with(&self, callback: Option<CompletionCallback>) {
        self.shared.execute(Command::Attach {
            channel: self.name.clone(),
            callback,
        });
    }

    /// Attach and wait for the service to confirm.
    ///
    /// # Errors
    ///
    /// Returns the error the attach failed with.
    pub async fn attach(&self) -> Result<(), ErrorInfo> {
        let (callback, rx) = reply();
        self.attach_with(Some(callback));
        rx.await.unwrap_or_else(|_| Err(disposed()))
    }

    pub fn detach_with(&self, callback: Option<CompletionCallback>) {
        self.shared.execute(Command::Detach {
            channel: self.name.clone(),
            callback,
        });
    }

    /// Detach and wait for the service to confirm.
    ///
    /// # Errors
    ///
    /// Returns the error the detach failed with.
    pub async fn detach(&self) -> Result<(), ErrorInfo> {
        let (callback, rx) = reply();
        self.detach_with(Some(callback));
        rx.await.unwrap_or_else(|_| Err(disposed()))
    }

    pub fn publish_with(&self, messages: Vec<Message>, callback: Option<CompletionCallback>) {
        self.shared.execute(Command::Publish {
            channel: self.name.clone(),
            messages,
            callback,
        });
    }

    /// Publish and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the error the publish failed with.
    pub async fn publish(&self, messages: Vec<Message>) -> Result<(), ErrorInfo> {
        let (callback, rx) = reply();
        self.publish_with(messages, Some(callback));
        rx.await.unwrap_or_else(|_| Err(disposed()))
    }
}

/// Presence on one channel.
#[derive(Clone)]
pub struct RealtimePresence {
    channel: String,
    observers: Arc<ChannelObservers>,
    shared: Arc<Shared>,
}

impl RealtimePresence {
    /// Receive presence events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceMessage> {
        self.observers.subscribe_presence()
    }

    /// Send a presence action. An empty `client_id` is filled with the
    /// client's own.
    pub fn update_with(
        &self,
        action: PresenceAction,
        client_id: Option<&str>,
        data: Option<serde_json::Value>,
        callback: Option<CompletionCallback>,
    ) {
        let mut message = PresenceMessage::new(action, client_id.unwrap_or_default());
        message.data = data;
        self.shared.execute(Command::UpdatePresence {
            channel: self.channel.clone(),
            message,
            callback,
        });
    }

    async fn send(
        &self,
        action: PresenceAction,
        client_id: Option<&str>,
        data: Option<serde_json::Value>,
    ) -> Result<(), ErrorInfo> {
        let (callback, rx) = reply();
        self.update_with(action, client_id, data, Some(callback));
        rx.await.unwrap_or_else(|_| Err(disposed()))
    }

    /// Enter as this client.
    ///
    /// # Errors
    ///
    /// Returns the error the enter failed with.
    pub async fn enter(&self, data: Option<serde_json::Value>) -> Result<(), ErrorInfo> {
        self.send(PresenceAction::Enter, None, data).await
    }

    /// Update this client's data.
    ///
    /// # Errors
    ///
    /// Returns the error the update failed with.
    pub async fn update(&self, data: Option<serde_json::Value>) -> Result<(), ErrorInfo> {
        self.send(PresenceAction::Update, None, data).await
    }

    /// Leave as this client.
    ///
    /// # Errors
    ///
    /// Returns the error the leave failed with.
    pub async fn leave(&self, data: Option<serde_json::Value>) -> Result<(), ErrorInfo> {
        self.send(PresenceAction::Leave, None, data).await
    }

    /// Enter on behalf of another client id.
    ///
    /// # Errors
    ///
    /// Returns the error the enter failed with.
    pub async fn enter_client(
        &self,
        client_id: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ErrorInfo> {
        self.send(PresenceAction::Enter, Some(client_id), data).await
    }

    /// Leave on behalf of another client id.
    ///
    /// # Errors
    ///
    /// Returns the error the leave failed with.
    pub async fn leave_client(
        &self,
        client_id: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ErrorInfo> {
        self.send(PresenceAction::Leave, Some(client_id), data).await
    }

    pub fn get_with(
        &self,
        wait_for_sync: bool,
        callback: Box<dyn FnOnce(Result<Vec<PresenceMessage>, ErrorInfo>) + Send>,
    ) {
        self.shared.execute(Command::GetPresence {
            channel: self.channel.clone(),
            wait_for_sync,
            callback,
        });
    }

    /// Current members. With `wait_for_sync` the reply waits for a running
    /// sync to complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot provide presence.
    pub async fn get(&self, wait_for_sync: bool) -> Result<Vec<PresenceMessage>, ErrorInfo> {
        let (callback, rx) = reply();
        self.get_with(wait_for_sync, callback);
        rx.await.unwrap_or_else(|_| Err(disposed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Environment;
    use ripple_transport::MemoryTransportFactory;

    fn build(options: ClientOptions) -> (Realtime, Workflow, MemoryTransportFactory) {
        let factory = MemoryTransportFactory::new();
        let (environment, _clock) = Environment::manual(0);
        let (realtime, workflow) = Realtime::builder(options)
            .transport_factory(Arc::new(factory.clone()))
            .environment(environment)
            .build_parts()
            .unwrap();
        (realtime, workflow, factory)
    }

    #[test]
    fn test_build_without_runtime_fails() {
        let result = Realtime::builder(ClientOptions::with_key("app.key:secret"))
            .transport_factory(Arc::new(MemoryTransportFactory::new()))
            .build();
        assert!(matches!(result, Err(RealtimeError::NoRuntime)));
    }

    #[test]
    fn test_auto_connect_enqueues_connect() {
        let (realtime, mut workflow, factory) = build(ClientOptions::with_key("app.key:secret"));
        assert_eq!(realtime.connection().state(), ConnectionState::Initialized);

        workflow.process_commands();
        assert_eq!(realtime.connection().state(), ConnectionState::Connecting);
        assert_eq!(factory.created_count(), 1);
    }

    #[test]
    fn test_manual_connect() {
        let options = ClientOptions {
            auto_connect: false,
            ..ClientOptions::with_key("app.key:secret")
        };
        let (realtime, mut workflow, factory) = build(options);
        workflow.process_commands();
        assert_eq!(factory.created_count(), 0);

        realtime.connection().connect();
        workflow.process_commands();
        assert_eq!(factory.created_count(), 1);
    }

    #[test]
    fn test_channels_are_shared_by_name() {
        let (realtime, _workflow, _factory) = build(ClientOptions::with_key("app.key:secret"));
        let first = realtime.channels().get("room").unwrap();
        let second = realtime.channels().get("room").unwrap();
        assert_eq!(first.state(), ChannelState::Initialized);
        assert!(Arc::ptr_eq(&first.observers, &second.observers));
        assert_eq!(realtime.channels().names(), vec!["room".to_string()]);

        assert!(matches!(
            realtime.channels().get(""),
            Err(RealtimeError::InvalidChannelName(_))
        ));
    }

    #[test]
    fn test_attach_through_handle() {
        let (realtime, mut workflow, factory) = build(ClientOptions::with_key("app.key:secret"));
        let channel = realtime.channels().get("room").unwrap();
        channel.attach_with(None);
        workflow.process_commands();
        assert_eq!(channel.state(), ChannelState::Attaching);

        // Attach goes out once the connection is up.
        let transport = factory.last().unwrap();
        assert!(transport.sent().is_empty());
        transport.accept();
        transport.receive(ProtocolMessage::connected(
            "c1",
            "c1-key",
            ripple_protocol::ConnectionDetails::default(),
        ));
        workflow.process_commands();
        assert_eq!(realtime.connection().id().as_deref(), Some("c1"));
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_get_after_release_keeps_one_channel() {
        let (realtime, mut workflow, _factory) = build(ClientOptions::with_key("app.key:secret"));
        let old = realtime.channels().get("room").unwrap();
        old.attach_with(None);
        workflow.process_commands();

        realtime.channels().release("room");
        let fresh = realtime.channels().get("room").unwrap();
        fresh.attach_with(None);
        workflow.process_commands();

        assert!(!Arc::ptr_eq(&old.observers, &fresh.observers));
        assert!(realtime.channels().exists("room"));
        assert_eq!(workflow.channel_state("room"), Some(ChannelState::Attaching));
        assert_eq!(fresh.state(), ChannelState::Attaching);
        let registry = workflow.registry();
        let entry = registry.get("room").unwrap();
        assert!(Arc::ptr_eq(&fresh.observers, entry.value()));
    }

    #[test]
    fn test_commands_rejected_after_workflow_dropped() {
        let (realtime, workflow, _factory) = build(ClientOptions::with_key("app.key:secret"));
        drop(workflow);

        let result = Arc::new(std::sync::Mutex::new(None));
        let slot = result.clone();
        realtime
            .channels()
            .get("room")
            .unwrap()
            .attach_with(Some(Box::new(move |r| *slot.lock().unwrap() = Some(r))));
        assert_eq!(*result.lock().unwrap(), Some(Err(disposed())));
    }
}
