//! # ripple-protocol
//!
//! Wire envelope model for the Ripple realtime client.
//!
//! Everything above this crate speaks in [`ProtocolMessage`]s:
//!
//! - [`Action`] / [`Flags`] - envelope discriminant and bitset, bit-exact with the service
//! - [`Message`] / [`PresenceMessage`] - payload units, including presence newness
//! - [`ErrorInfo`] - the single error shape surfaced to callers
//! - [`codec`] - MessagePack and JSON encoding of envelopes
//!
//! ## Example
//!
//! ```rust
//! use ripple_protocol::{codec, Format, Message, ProtocolMessage};
//!
//! let msg = ProtocolMessage::message("chat:lobby", vec![Message::new("greeting", "hi".into())]);
//! let encoded = codec::encode(&msg, Format::MsgPack).unwrap();
//! let decoded = codec::decode(&encoded, Format::MsgPack).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod action;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod flags;
pub mod message;
pub mod version;

pub use action::Action;
pub use codec::{decode, encode, Format, ProtocolError};
pub use envelope::{AuthDetails, ConnectionDetails, ProtocolMessage};
pub use error::ErrorInfo;
pub use flags::Flags;
pub use message::{Message, PresenceAction, PresenceId, PresenceMessage};
pub use version::{Version, PROTOCOL_VERSION};
