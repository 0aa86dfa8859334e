//! The consensus strategy contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lumen_core::{now_ms, Block, Cryptography, KeyPair, Payload, KEY_EMISSION_MAX_BLOCK};

use crate::error::ConsensusError;
use crate::mining::MiningStats;

/// Outcome of one validator's look at a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Valid under this strategy; stop looking.
    Accept,
    /// Not this strategy's block; ask the next one.
    Pass,
    /// Reject outright; lower-priority strategies are not consulted.
    Veto,
}

/// Read-only inputs shared by every validation call.
#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    /// Hash/verify service.
    pub crypto: &'a dyn Cryptography,
    /// Current network keyring.
    pub keyring: &'a [String],
    /// Hash of the local genesis block; always a valid hash.
    pub genesis_hash: &'a str,
    /// Local wall clock, ms.
    pub now_ms: u64,
    /// Keyring height; unsigned blocks above it are vetoed by signing validators.
    pub key_emission_max_block: u64,
}

impl<'a> ValidationContext<'a> {
    /// Context stamped with the current wall clock.
    pub fn new(crypto: &'a dyn Cryptography, keyring: &'a [String], genesis_hash: &'a str) -> Self {
        Self {
            crypto,
            keyring,
            genesis_hash,
            now_ms: now_ms(),
            key_emission_max_block: KEY_EMISSION_MAX_BLOCK,
        }
    }

    /// Whether `key` is in the keyring.
    pub fn is_key_from_keyring(&self, key: &str) -> bool {
        self.keyring.iter().any(|k| k == key)
    }
}

/// Snapshot access to the live chain for block generation.
pub trait ChainView: Send + Sync {
    /// Current head block.
    fn latest_block(&self) -> Option<Block>;
    /// Current head height.
    fn max_block(&self) -> Option<u64>;
    /// Current keyring.
    fn keyring(&self) -> Vec<String>;
    /// Connected peers.
    fn peer_count(&self) -> usize;
    /// Whether a replay is running.
    fn is_syncing(&self) -> bool;
    /// Local genesis hash.
    fn genesis_hash(&self) -> String;
}

/// Checked before every mining attempt; `true` aborts generation.
pub type CancelPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A predicate that never cancels.
pub fn never_cancel() -> CancelPredicate {
    Arc::new(|| false)
}

/// Everything a strategy needs to produce a block.
#[derive(Clone)]
pub struct GenerationContext {
    /// Live chain.
    pub view: Arc<dyn ChainView>,
    /// Hash/sign service.
    pub crypto: Arc<dyn Cryptography>,
    /// Node signing key, if any.
    pub signer: Option<KeyPair>,
    /// Shared mining counters.
    pub mining: Arc<MiningStats>,
    /// Head age after which empty heartbeat blocks are due, ms.
    pub empty_block_delay_ms: u64,
}

impl GenerationContext {
    /// Whether the node key is in the keyring.
    pub fn signer_in_keyring(&self) -> bool {
        match &self.signer {
            Some(keys) => self.view.keyring().iter().any(|k| *k == keys.public),
            None => false,
        }
    }

    /// Head age in ms, `None` for an empty chain.
    pub fn head_age_ms(&self) -> Option<u64> {
        self.view
            .latest_block()
            .map(|b| now_ms().saturating_sub(b.timestamp))
    }

    /// Build a block on the current head stamped at `timestamp` and sign it.
    pub fn signed_block(&self, data: &str, timestamp: Option<u64>) -> Result<Block, ConsensusError> {
        let keys = self.signer.as_ref().ok_or(ConsensusError::NoSigner)?;
        let prev = self.view.latest_block().ok_or(ConsensusError::EmptyChain)?;
        let ts = timestamp.unwrap_or_else(now_ms);
        let mut block = Block::new(
            self.crypto.as_ref(),
            prev.index + 1,
            prev.hash,
            ts,
            ts,
            data,
        );
        block.sign_with(self.crypto.as_ref(), &keys.private)?;
        Ok(block)
    }
}

/// Pluggable block acceptance and generation.
///
/// Validation must not panic or error: an internal failure is [`Verdict::Pass`].
#[async_trait]
pub trait ConsensusStrategy: Send + Sync {
    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// Judge `new` as the successor of `prev`.
    fn is_valid_new_block(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> Verdict;

    /// Whether `hash` alone satisfies this strategy.
    fn is_valid_hash(&self, ctx: &ValidationContext<'_>, hash: &str) -> bool;

    /// Whether this strategy can produce a block now.
    fn is_ready(&self, gen: &GenerationContext) -> bool;

    /// Produce a block carrying `data` on the current head.
    ///
    /// `Ok(None)` means generation was cancelled or timed out.
    async fn generate_next_block(
        &self,
        gen: &GenerationContext,
        data: String,
        cancel: CancelPredicate,
    ) -> Result<Option<Block>, ConsensusError>;

    /// Heartbeat block, if one is due.
    async fn generate_empty_block(
        &self,
        gen: &GenerationContext,
        cancel: CancelPredicate,
    ) -> Result<Option<Block>, ConsensusError> {
        if !self.empty_block_due(gen) {
            return Ok(None);
        }
        let data = Payload::Empty(Default::default()).encode()?;
        self.generate_next_block(gen, data, cancel).await
    }

    /// Whether the head is stale enough for a heartbeat and this strategy may emit one.
    fn empty_block_due(&self, gen: &GenerationContext) -> bool {
        self.generates_empty_blocks()
            && gen
                .head_age_ms()
                .map_or(false, |age| age > gen.empty_block_delay_ms)
    }

    /// Toggle heartbeat generation.
    fn set_generate_empty_blocks(&self, generate: bool);

    /// Whether heartbeat generation is on.
    fn generates_empty_blocks(&self) -> bool;

    /// Whether lower strategies must stop emitting heartbeats.
    fn suppresses_lower_empty_blocks(&self, _gen: &GenerationContext) -> bool {
        false
    }
}

/// Heartbeat toggle shared by the built-in strategies.
#[derive(Debug)]
pub struct EmptyBlockSwitch(AtomicBool);

impl EmptyBlockSwitch {
    /// Switch in the given state.
    pub fn new(on: bool) -> Self {
        Self(AtomicBool::new(on))
    }

    /// Current state.
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Change state.
    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::Relaxed);
    }
}
