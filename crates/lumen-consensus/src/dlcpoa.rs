// Consensus-critical. Changes require a protocol version bump + tests.
//! DLCPoA: LCPoA with dynamic complexity.
//!
//! Complexity in `[0, 1]` grows as the gap to the previous block shrinks
//! below one second. A hash is valid when the integer value of its last
//! [`HASH_SIGMA_LENGTH`] hex digits does not exceed
//! `round(MAX_VARIANTS_THRESHOLD * (1 - complexity))`.

use async_trait::async_trait;
use lumen_core::Block;
use tracing::{error, info};

use crate::error::ConsensusError;
use crate::mining::mine;
use crate::strategy::{
    CancelPredicate, ConsensusStrategy, GenerationContext, ValidationContext, Verdict,
};
use crate::validate::{check_hash, check_link, check_no_reward, check_timestamps};

/// Target blocks per second.
pub const TARGET_NETWORK_SPEED: f64 = 100.0;

/// Floor of the computed complexity.
pub const MINIMAL_COMPLEXITY: f64 = 0.0;

/// Hex digits of the hash tail that are compared.
pub const HASH_SIGMA_LENGTH: usize = 6;

/// Accepted tail values at zero complexity.
pub const MAX_VARIANTS_THRESHOLD: f64 = 3000.0;

fn complexity_formula(distance: f64) -> f64 {
    ((1000.0 - distance) / (1000.0 / TARGET_NETWORK_SPEED)).log10().abs()
}

/// Complexity of a block stamped `current` after one stamped `previous`.
///
/// Rounded to four decimals. Gaps of a second or more yield zero.
pub fn complexity(current: u64, previous: u64) -> f64 {
    let distance = current as f64 - previous as f64;
    let internal = complexity_formula(distance);
    let c = if internal.is_finite() {
        internal / complexity_formula(0.0)
    } else {
        0.0
    };
    (c.max(MINIMAL_COMPLEXITY) * 10_000.0).round() / 10_000.0
}

/// Whether `hash` meets `complexity`.
pub fn is_valid_hash_at(hash: &str, complexity: f64) -> bool {
    let Some(tail) = hash.get(hash.len().saturating_sub(HASH_SIGMA_LENGTH)..) else {
        return false;
    };
    let Ok(sigma) = u32::from_str_radix(tail, 16) else {
        return false;
    };
    let threshold = (MAX_VARIANTS_THRESHOLD - MAX_VARIANTS_THRESHOLD * complexity).round();
    f64::from(sigma) <= threshold
}

/// Dynamic-difficulty hash validator. Never emits heartbeat blocks.
pub struct Dlcpoa {
    disable_mining: bool,
}

impl Dlcpoa {
    /// New validator.
    pub fn new(disable_mining: bool) -> Self {
        info!("DLCPoA validator loaded");
        Self { disable_mining }
    }

    fn check(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> Result<(), &'static str> {
        let c = complexity(new.timestamp, prev.timestamp);
        check_link(new, prev)?;
        if new.hash != ctx.genesis_hash && !is_valid_hash_at(&new.hash, c) {
            return Err("invalid block previous hash or new hash");
        }
        if !prev.is_signed() && prev.hash != ctx.genesis_hash && !is_valid_hash_at(&prev.hash, 0.0) {
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

impl Default for Dlcpoa {
    fn default() -> Self {
        Self::new(false)
    }
}

#[async_trait]
impl ConsensusStrategy for Dlcpoa {
    fn name(&self) -> &'static str {
        "DLCPoA"
    }

    fn is_valid_new_block(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> Verdict {
        match self.check(ctx, new, prev) {
            Ok(()) => Verdict::Accept,
            Err(reason) => {
                error!(index = new.index, "DLCPoA: {reason}");
                Verdict::Pass
            }
        }
    }

    fn is_valid_hash(&self, ctx: &ValidationContext<'_>, hash: &str) -> bool {
        hash == ctx.genesis_hash || is_valid_hash_at(hash, MINIMAL_COMPLEXITY)
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
        Ok(mine(gen, &data, &cancel, self.name(), |candidate, prev| {
            is_valid_hash_at(&candidate.hash, complexity(candidate.timestamp, prev.timestamp))
        })
        .await)
    }

    fn empty_block_due(&self, _gen: &GenerationContext) -> bool {
        false
    }

    fn set_generate_empty_blocks(&self, _generate: bool) {}

    fn generates_empty_blocks(&self) -> bool {
        false
    }
}
