// Consensus-critical. Changes require a protocol version bump + tests.
//! LCPoA: Limited Confidence Proof-of-Activity.
//!
//! A block is valid when its hash ends with one of the configured endings.
//! Blocks are unsigned; the time-lock rules in [`crate::validate`] bound how
//! far a miner can search ahead of the clock.

use async_trait::async_trait;
use lumen_core::Block;
use tracing::{error, info};

use crate::error::ConsensusError;
use crate::mining::mine;
use crate::strategy::{
    CancelPredicate, ConsensusStrategy, EmptyBlockSwitch, GenerationContext, ValidationContext,
    Verdict,
};
use crate::validate::{check_hash, check_link, check_no_reward, check_timestamps};

/// Default accepted hash endings.
pub const DEFAULT_BLOCK_ENDINGS: [&str; 4] = ["f3c8", "a000", "0000", "7027"];

/// Static-difficulty hash validator.
pub struct Lcpoa {
    endings: Vec<String>,
    disable_mining: bool,
    empty_blocks: EmptyBlockSwitch,
}

impl Lcpoa {
    /// Validator accepting hashes ending with any of `endings`.
    pub fn new(endings: Vec<String>, disable_mining: bool) -> Self {
        info!("LCPoA validator loaded");
        Self {
            endings,
            disable_mining,
            empty_blocks: EmptyBlockSwitch::new(true),
        }
    }

    fn hash_matches(&self, hash: &str) -> bool {
        self.endings.iter().any(|e| hash.ends_with(e.as_str()))
    }

    fn check(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> Result<(), &'static str> {
        check_link(new, prev)?;
        if !self.is_valid_hash(ctx, &new.hash) {
            return Err("invalid block previous hash or new hash");
        }
        if !prev.is_signed() && !self.is_valid_hash(ctx, &prev.hash) {
            return Err("invalid previous block hash");
        }
        check_hash(ctx.crypto, new)?;
        check_timestamps(new, prev, ctx.now_ms)?;
        check_no_reward(new)?;
        if new.is_signed() {
            return Err("signed block");
        }
        Ok(())
    }
}

impl Default for Lcpoa {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_ENDINGS.iter().map(|s| s.to_string()).collect(), false)
    }
}

#[async_trait]
impl ConsensusStrategy for Lcpoa {
    fn name(&self) -> &'static str {
        "LCPoA"
    }

    fn is_valid_new_block(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> Verdict {
        match self.check(ctx, new, prev) {
            Ok(()) => Verdict::Accept,
            Err(reason) => {
                error!(index = new.index, "LCPoA: {reason}");
                Verdict::Pass
            }
        }
    }

    fn is_valid_hash(&self, ctx: &ValidationContext<'_>, hash: &str) -> bool {
        hash == ctx.genesis_hash || self.hash_matches(hash)
    }

    fn is_ready(&self, _gen: &GenerationContext) -> bool {
        !self.disable_mining
    }

    async fn generate_next_block(
        &self,
        gen: &GenerationContext,
        data: String,
        cancel: CancelPredicate,
    ) -> Result<Option<Block>, ConsensusError> {
        Ok(mine(gen, &data, &cancel, self.name(), |candidate, _| {
            self.hash_matches(&candidate.hash)
        })
        .await)
    }

    fn empty_block_due(&self, gen: &GenerationContext) -> bool {
        let idle = gen.view.peer_count() > 2
            && gen.mining.in_progress() == 0
            && !gen.view.is_syncing();
        idle && self.generates_empty_blocks()
            && gen
                .head_age_ms()
                .map_or(false, |age| age > gen.empty_block_delay_ms)
    }

    fn set_generate_empty_blocks(&self, generate: bool) {
        self.empty_blocks.set(generate);
    }

    fn generates_empty_blocks(&self) -> bool {
        self.empty_blocks.get()
    }
}
