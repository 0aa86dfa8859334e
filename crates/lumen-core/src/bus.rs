//! Gossip envelope carried by `BROADCAST` messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::random_hex;

/// A TTL-bounded message routed by bus address.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Application body.
    pub data: Value,
    /// Destination bus address or role address.
    pub receiver: String,
    /// Bus address of the originator; replies go here.
    pub recipient: String,
    /// Application-level message id.
    #[serde(default)]
    pub id: String,
    /// Origination time, ms since epoch.
    pub timestamp: u64,
    /// Hops travelled so far.
    #[serde(rename = "TTL", default)]
    pub ttl: u32,
    /// Sender's chain height at origination.
    #[serde(default)]
    pub index: u64,
    /// Deduplication key, unique per envelope.
    pub mutex: String,
}

impl BusMessage {
    /// New envelope with a fresh deduplication key and zero hops.
    pub fn new(
        data: Value,
        receiver: impl Into<String>,
        recipient: impl Into<String>,
        id: impl Into<String>,
        timestamp: u64,
        index: u64,
    ) -> Self {
        Self {
            data,
            receiver: receiver.into(),
            recipient: recipient.into(),
            id: id.into(),
            timestamp,
            ttl: 0,
            index,
            mutex: random_hex(16),
        }
    }
}
