//! # ripple-core
//!
//! The client engine for the Ripple realtime service.
//!
//! This crate turns a [`Transport`](ripple_transport::Transport) into a
//! connection with channels and presence:
//!
//! - **Workflow** - single-consumer command processor that owns all engine state
//! - **Connection** - connection state machine with retry, suspension and resume
//! - **Ack** - correlates `Ack`/`Nack` ranges with pending publishes
//! - **Channel** - attach/detach state machine and per-channel queues
//! - **Presence** - member map with newness comparison and multi-part sync
//! - **Client** - the public `Realtime` API
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  Command   ┌─────────────┐   envelopes   ┌─────────────┐
//! │  Realtime   │───────────▶│  Workflow   │◀─────────────▶│  Transport  │
//! └─────────────┘            └─────────────┘               └─────────────┘
//!        ▲                          │
//!        │   snapshots / events     ▼
//!        └──────────────── Connection, Channels, Presence
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use ripple_core::{ClientOptions, Realtime};
//! use ripple_protocol::Message;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Realtime::new(ClientOptions::with_key("app.key:secret"))?;
//! let channel = client.channels().get("chat:lobby")?;
//! channel.attach().await?;
//! channel
//!     .publish(vec![Message::new("greeting", serde_json::json!("hi"))])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod ack;
pub mod auth;
pub mod channel;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod environment;
pub mod error;
pub mod metrics;
pub mod observer;
pub mod presence;
pub mod recovery;
pub mod timers;
pub mod workflow;

pub use ack::{AckQueue, CompletionCallback};
pub use auth::{PayloadDecoder, RenewCallback, TokenRenewer};
pub use channel::{ChannelEvent, ChannelState, ChannelStateChange};
pub use client::{
    Channels, Connection, Realtime, RealtimeBuilder, RealtimeChannel, RealtimePresence,
};
pub use command::Command;
pub use config::ClientOptions;
pub use connection::{ConnectionEvent, ConnectionState, ConnectionStateChange};
pub use environment::{Clock, Environment, ManualClock, NetworkMonitor, SystemClock};
pub use error::RealtimeError;
pub use observer::{ChannelSnapshot, ConnectionSnapshot};
pub use presence::{PresenceMap, SyncCursor};
pub use recovery::RecoveryKey;
pub use workflow::Workflow;
