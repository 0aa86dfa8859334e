//! Remote mining on behalf of a node without a trusted key.
//!
//! A requester broadcasts a [`MiningEnvelope::Request`] to the
//! `trusted_node` role address and parks a oneshot in a pending table keyed
//! by a random correlation id. A trusted node answers with
//! [`MiningEnvelope::Response`] under the same id. Whichever comes first,
//! the response or the timeout, resolves the request.

use std::time::Duration;

use hashbrown::HashMap;
use lumen_core::{now_ms, random_hex, Block, BusMessage, TRUSTED_NODE_ADDRESS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::ConsensusError;

/// How long a requester waits for a trusted node.
pub const REMOTE_MINING_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests older than this are not served, ms.
pub const REMOTE_REQUEST_MAX_AGE_MS: u64 = 60_000;

/// Bus bodies of the remote mining exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MiningEnvelope {
    /// Ask a trusted node to sign a block carrying `data`.
    #[serde(rename = "trusted_block_request")]
    Request {
        /// Block payload.
        data: String,
    },
    /// The block a trusted node appended for the requester.
    #[serde(rename = "trusted_block_add")]
    Response {
        /// Timestamp of the request being answered.
        timestamp: u64,
        /// Appended block.
        block: Block,
    },
}

impl MiningEnvelope {
    /// Decode a bus body, `None` if it is not part of this exchange.
    pub fn from_bus(msg: &BusMessage) -> Option<Self> {
        serde_json::from_value(msg.data.clone()).ok()
    }
}

/// Pending-request table for remote mining.
pub struct RemoteMining {
    pending: Mutex<HashMap<String, oneshot::Sender<Block>>>,
    outbound: mpsc::UnboundedSender<BusMessage>,
    bus_address: String,
    timeout: Duration,
}

impl RemoteMining {
    /// Table sending requests into `outbound` on behalf of `bus_address`.
    pub fn new(outbound: mpsc::UnboundedSender<BusMessage>, bus_address: impl Into<String>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            outbound,
            bus_address: bus_address.into(),
            timeout: REMOTE_MINING_TIMEOUT,
        }
    }

    /// Override the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Local bus address replies are routed to.
    pub fn bus_address(&self) -> &str {
        &self.bus_address
    }

    /// Requests still waiting.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Ask the trusted role to mine `data`; `None` on timeout.
    pub async fn request(&self, data: &str, index: u64) -> Result<Option<Block>, ConsensusError> {
        let id = random_hex(16);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let body = serde_json::to_value(MiningEnvelope::Request { data: data.to_string() })
            .map_err(|e| lumen_core::CoreError::Encoding(e.to_string()))?;
        let msg = BusMessage::new(
            body,
            TRUSTED_NODE_ADDRESS,
            self.bus_address.clone(),
            id.clone(),
            now_ms(),
            index,
        );
        info!("Trusted: sending block addition request");
        if self.outbound.send(msg).is_err() {
            self.pending.lock().remove(&id);
            return Err(ConsensusError::BusClosed);
        }

        let result = tokio::time::timeout(self.timeout, rx).await;
        self.pending.lock().remove(&id);
        match result {
            Ok(Ok(block)) => Ok(Some(block)),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                info!(id, "Trusted: block addition request timed out");
                Ok(None)
            }
        }
    }

    /// Resolve a pending request from a response envelope.
    ///
    /// Returns `true` if `msg` answered a pending request.
    pub fn resolve(&self, msg: &BusMessage) -> bool {
        if msg.receiver != self.bus_address {
            return false;
        }
        let Some(MiningEnvelope::Response { block, .. }) = MiningEnvelope::from_bus(msg) else {
            return false;
        };
        let Some(tx) = self.pending.lock().remove(&msg.id) else {
            debug!(id = %msg.id, "late or unknown mining response");
            return false;
        };
        tx.send(block).is_ok()
    }
}
