//! Fixtures shared by the Ripple benchmarks.

use ripple_core::{ClientOptions, Command, Environment, Workflow};
use ripple_protocol::{ConnectionDetails, PresenceAction, PresenceMessage, ProtocolMessage};
use ripple_transport::{MemoryTransportFactory, MemoryTransportHandle};
use std::sync::Arc;

/// `count` members on one connection, with ids at `msg_serial`.
#[must_use]
pub fn presence_members(count: usize, msg_serial: i64) -> Vec<PresenceMessage> {
    (0..count)
        .map(|i| {
            PresenceMessage::new(PresenceAction::Present, format!("client-{i}"))
                .with_connection_id("bench")
                .with_id(format!("bench:{msg_serial}:{i}"))
                .with_timestamp(msg_serial)
        })
        .collect()
}

/// A workflow connected over the in-memory transport with `channel`
/// attached.
pub struct Connected {
    pub workflow: Workflow,
    pub transport: MemoryTransportHandle,
}

impl Connected {
    /// Deliver an inbound envelope and process everything it causes.
    pub fn receive(&mut self, message: ProtocolMessage) {
        self.transport.receive(message);
        self.workflow.process_commands();
    }

    pub fn run(&mut self, command: Command) {
        self.workflow.execute(command);
        self.workflow.process_commands();
    }
}

/// Build a connected workflow with `channel` attached. Runs without a tokio
/// runtime, so no timer ever fires.
///
/// # Panics
///
/// Panics if the fixed options are rejected.
#[must_use]
pub fn connected_workflow(channel: &str) -> Connected {
    let factory = MemoryTransportFactory::auto_accept();
    let (environment, _clock) = Environment::manual(0);
    let options = ClientOptions {
        client_id: Some("bench".into()),
        ..ClientOptions::with_key("bench.key:secret")
    };
    let mut workflow = Workflow::new(options, Arc::new(factory.clone()), environment)
        .expect("bench options are valid");

    workflow.execute(Command::Connect);
    workflow.process_commands();
    let mut connected = Connected {
        workflow,
        transport: factory.last().expect("transport created on connect"),
    };
    connected.receive(ProtocolMessage::connected(
        "bench",
        "bench-key",
        ConnectionDetails::default(),
    ));

    connected.run(Command::Attach {
        channel: channel.to_string(),
        callback: None,
    });
    let mut attached = ProtocolMessage::new(ripple_protocol::Action::Attached);
    attached.channel = Some(channel.to_string());
    connected.receive(attached);
    connected
}
