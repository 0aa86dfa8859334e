// Consensus-critical. Changes require a protocol version bump + tests.
//! Priority-ordered validator set.
//!
//! Validators are configured in ascending trust priority. Acceptance and
//! generation both walk the list from the highest priority down: the first
//! [`Verdict::Accept`] wins, a [`Verdict::Veto`] ends the walk with a rejection.

use std::sync::Arc;

use lumen_core::Block;
use tracing::{debug, warn};

use crate::error::ConsensusError;
use crate::strategy::{
    CancelPredicate, ConsensusStrategy, GenerationContext, ValidationContext, Verdict,
};

/// Configured consensus strategies.
#[derive(Clone)]
pub struct ValidatorSet {
    ascending: Vec<Arc<dyn ConsensusStrategy>>,
}

impl ValidatorSet {
    /// Set from strategies in ascending priority.
    pub fn new(ascending: Vec<Arc<dyn ConsensusStrategy>>) -> Result<Self, ConsensusError> {
        if ascending.is_empty() {
            return Err(ConsensusError::NoValidators);
        }
        Ok(Self { ascending })
    }

    /// Strategies from highest to lowest priority.
    pub fn by_priority(&self) -> impl Iterator<Item = &Arc<dyn ConsensusStrategy>> {
        self.ascending.iter().rev()
    }

    /// Lowest-priority strategy (keyring bootstrap publishes through it).
    pub fn lowest(&self) -> &Arc<dyn ConsensusStrategy> {
        &self.ascending[0]
    }

    /// Names in configuration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.ascending.iter().map(|v| v.name()).collect()
    }

    /// Whether any strategy accepts `new` on top of `prev`.
    pub fn is_valid_new_block(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> bool {
        for v in self.by_priority() {
            match v.is_valid_new_block(ctx, new, prev) {
                Verdict::Accept => {
                    debug!(index = new.index, validator = v.name(), "block accepted");
                    return true;
                }
                Verdict::Veto => {
                    warn!(index = new.index, validator = v.name(), "block vetoed");
                    return false;
                }
                Verdict::Pass => {}
            }
        }
        false
    }

    /// Whether every adjacent pair of `blocks` (ascending) validates.
    pub fn is_valid_chain(&self, ctx: &ValidationContext<'_>, blocks: &[Block]) -> bool {
        blocks
            .windows(2)
            .all(|w| self.is_valid_new_block(ctx, &w[1], &w[0]))
    }

    /// Turn off heartbeats below the highest strategy that suppresses them.
    pub fn apply_empty_block_policy(&self, gen: &GenerationContext) {
        let Some(top) = self
            .by_priority()
            .find(|v| v.suppresses_lower_empty_blocks(gen))
        else {
            return;
        };
        for v in self.ascending.iter().filter(|v| v.name() != top.name()) {
            v.set_generate_empty_blocks(false);
        }
    }

    /// Highest-priority strategy that is ready.
    pub fn ready_generator(&self, gen: &GenerationContext) -> Option<Arc<dyn ConsensusStrategy>> {
        self.apply_empty_block_policy(gen);
        self.by_priority().find(|v| v.is_ready(gen)).cloned()
    }

    /// Generate through the highest-priority ready strategy.
    pub async fn generate_next_block_auto(
        &self,
        gen: &GenerationContext,
        data: String,
        cancel: CancelPredicate,
    ) -> Result<Option<Block>, ConsensusError> {
        let v = self.ready_generator(gen).ok_or(ConsensusError::NotReady)?;
        debug!(validator = v.name(), "generating block");
        v.generate_next_block(gen, data, cancel).await
    }
}
