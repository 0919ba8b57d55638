//! Connection recovery keys.
//!
//! A recovery key lets a new client instance take over the connection of a
//! previous one, continuing its message serials and channel positions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serialized as `{"connectionKey":..,"msgSerial":..,"channelSerials":{..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryKey {
    pub connection_key: String,
    pub msg_serial: i64,
    pub channel_serials: BTreeMap<String, String>,
}

impl RecoveryKey {
    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a key. Anything that is not a well-typed key yields `None`.
    #[must_use]
    pub fn decode(key: &str) -> Option<Self> {
        serde_json::from_str(key).ok()
    }
}
