// Consensus-critical. Changes require a protocol version bump + tests.
//! Trusted-nodes validator.
//!
//! Blocks are valid when signed by a key from the network keyring. Once the
//! bootstrap heights are past, an unsigned block less than a day after its
//! parent is vetoed, so lower-priority hash validators cannot extend a
//! trusted chain. A node outside the keyring generates blocks by asking a
//! trusted node over the bus (see [`crate::remote`]).

use std::sync::Arc;

use async_trait::async_trait;
use lumen_core::{now_ms, Block, BusMessage, TRUSTED_NODE_ADDRESS};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::ConsensusError;
use crate::remote::{MiningEnvelope, RemoteMining, REMOTE_REQUEST_MAX_AGE_MS};
use crate::strategy::{
    CancelPredicate, ConsensusStrategy, EmptyBlockSwitch, GenerationContext, ValidationContext,
    Verdict,
};
use crate::validate::{check_hash, check_no_reward, check_signed_successor};

/// Silence after which the trusted chain is considered stalled, ms.
pub const TRUSTED_NODES_TIMEOUT_MS: u64 = 86_400 * 1000;

#[derive(Default)]
struct ServedRequest {
    timestamp: u64,
    recipient: String,
}

/// Keyring signature validator.
pub struct Trusted {
    remote: Option<Arc<RemoteMining>>,
    served: Mutex<ServedRequest>,
    empty_blocks: EmptyBlockSwitch,
}

impl Trusted {
    /// Validator; `remote` enables mining through a trusted peer.
    pub fn new(remote: Option<Arc<RemoteMining>>) -> Self {
        info!("Trusted Nodes validator loaded");
        Self {
            remote,
            served: Mutex::new(ServedRequest::default()),
            empty_blocks: EmptyBlockSwitch::new(true),
        }
    }

    /// Whether `msg` is a mining request this node should serve now.
    pub fn accepts_request(&self, gen: &GenerationContext, msg: &BusMessage, now: u64) -> bool {
        if msg.receiver != TRUSTED_NODE_ADDRESS || !gen.signer_in_keyring() {
            return false;
        }
        let served = self.served.lock();
        now.saturating_sub(msg.timestamp) < REMOTE_REQUEST_MAX_AGE_MS
            && served.timestamp < msg.timestamp
            && msg.recipient != served.recipient
    }

    /// Sign a block for a remote requester.
    ///
    /// Returns the block to append and broadcast plus the reply envelope, or
    /// `None` if the request is stale, repeated or not ours to serve.
    pub fn serve_request(
        &self,
        gen: &GenerationContext,
        msg: &BusMessage,
        bus_address: &str,
    ) -> Result<Option<(Block, BusMessage)>, ConsensusError> {
        if !self.accepts_request(gen, msg, now_ms()) {
            return Ok(None);
        }
        let Some(MiningEnvelope::Request { data }) = MiningEnvelope::from_bus(msg) else {
            return Ok(None);
        };
        {
            let mut served = self.served.lock();
            served.timestamp = msg.timestamp;
            served.recipient = msg.recipient.clone();
        }
        let block = gen.signed_block(&data, Some(msg.timestamp))?;
        info!(requester = %msg.recipient, index = block.index, "Block added for requester");
        let body = serde_json::to_value(MiningEnvelope::Response {
            timestamp: msg.timestamp,
            block: block.clone(),
        })
        .map_err(|e| lumen_core::CoreError::Encoding(e.to_string()))?;
        let reply = BusMessage::new(
            body,
            msg.recipient.clone(),
            bus_address,
            msg.id.clone(),
            now_ms(),
            block.index,
        );
        Ok(Some((block, reply)))
    }
}

#[async_trait]
impl ConsensusStrategy for Trusted {
    fn name(&self) -> &'static str {
        "Trusted Nodes"
    }

    fn is_valid_new_block(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> Verdict {
        if new.previous_hash != prev.hash || new.timestamp <= prev.timestamp {
            return Verdict::Pass;
        }
        if new.timestamp - prev.timestamp < TRUSTED_NODES_TIMEOUT_MS
            && !new.is_signed()
            && new.index > ctx.key_emission_max_block
        {
            error!(
                index = new.index,
                "Trusted Nodes: adding other consensus block disabled due security configuration"
            );
            return Verdict::Veto;
        }
        if let Err(reason) = check_signed_successor(new, prev)
            .and_then(|_| check_hash(ctx.crypto, new))
            .and_then(|_| check_no_reward(new))
        {
            error!(index = new.index, "Trusted Nodes: {reason}");
            return Verdict::Pass;
        }
        if !new.is_signed() {
            return Verdict::Pass;
        }
        if ctx.keyring.iter().any(|k| new.is_signed_by(ctx.crypto, k)) {
            return Verdict::Accept;
        }
        error!(index = new.index, "Fake signed block");
        Verdict::Pass
    }

    fn is_valid_hash(&self, _ctx: &ValidationContext<'_>, _hash: &str) -> bool {
        true
    }

    fn is_ready(&self, gen: &GenerationContext) -> bool {
        if gen.signer_in_keyring() {
            return true;
        }
        if gen.view.keyring().is_empty() || self.remote.is_none() {
            return false;
        }
        gen.head_age_ms()
            .map_or(false, |age| age <= TRUSTED_NODES_TIMEOUT_MS)
    }

    async fn generate_next_block(
        &self,
        gen: &GenerationContext,
        data: String,
        _cancel: CancelPredicate,
    ) -> Result<Option<Block>, ConsensusError> {
        if gen.signer_in_keyring() {
            return gen.signed_block(&data, None).map(Some);
        }
        let remote = self.remote.as_ref().ok_or(ConsensusError::NoSigner)?;
        let index = gen.view.max_block().unwrap_or(0);
        remote.request(&data, index).await
    }

    fn empty_block_due(&self, gen: &GenerationContext) -> bool {
        if !self.generates_empty_blocks() {
            return false;
        }
        if !gen.signer_in_keyring() {
            info!("Trusted Nodes: we can't generate empty blocks");
            self.set_generate_empty_blocks(false);
            return false;
        }
        gen.head_age_ms()
            .map_or(false, |age| age > gen.empty_block_delay_ms)
    }

    fn set_generate_empty_blocks(&self, generate: bool) {
        self.empty_blocks.set(generate);
    }

    fn generates_empty_blocks(&self) -> bool {
        self.empty_blocks.get()
    }

    fn suppresses_lower_empty_blocks(&self, gen: &GenerationContext) -> bool {
        gen.signer_in_keyring()
    }
}
