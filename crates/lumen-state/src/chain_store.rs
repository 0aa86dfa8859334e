//! Chain store: the block store and block handler under one owner.
//!
//! Chain validity is decided by lumen-consensus before anything reaches this
//! module; this one persists blocks, link-checks them during replay and owns
//! the sync status.

use lumen_core::Block;
use tracing::{info, warn};

use crate::block_store::BlockStore;
use crate::error::{StateError, StoreError};
use crate::handler::{BlockHandler, HandleOutcome};
use crate::replay::{Replay, ReplayProgress, SyncStatus};

/// Default blocks per replay batch.
pub const REPLAY_BATCH: usize = 64;

/// Block store, block handler and sync status under one owner.
///
/// Live appends and replay both go through this type, so a replay in
/// progress excludes handled appends.
pub struct ChainStore {
    blocks: BlockStore,
    handler: BlockHandler,
    status: SyncStatus,
    autofix: bool,
    genesis: Block,
}

impl ChainStore {
    /// Open the chain, writing `genesis` into an empty store.
    ///
    /// A stored genesis that differs from `genesis` is an error.
    pub fn load_or_init(
        blocks: BlockStore,
        handler: BlockHandler,
        genesis: Block,
        autofix: bool,
    ) -> Result<Self, StateError> {
        let mut chain = Self {
            blocks,
            handler,
            status: SyncStatus::Idle,
            autofix,
            genesis,
        };
        match chain.blocks.get(0)? {
            None => {
                let genesis = chain.genesis.clone();
                chain.blocks.put(&genesis)?;
                chain.handler.handle_block(&genesis)?;
                info!(target: "lumen::init", hash = %genesis.hash, "Genesis block created");
            }
            Some(stored) if stored.hash != chain.genesis.hash => {
                return Err(StateError::GenesisMismatch);
            }
            Some(_) => {}
        }
        Ok(chain)
    }

    /// The configured genesis block.
    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Head block.
    pub fn latest_block(&self) -> Result<Option<Block>, StateError> {
        Ok(self.blocks.latest()?)
    }

    /// Head height.
    pub fn max_block(&self) -> Option<u64> {
        self.blocks.max_block()
    }

    /// Block at `height`.
    pub fn block(&self, height: u64) -> Result<Option<Block>, StateError> {
        Ok(self.blocks.get(height)?)
    }

    /// Blocks `from..=to` capped at the head.
    pub fn blocks_range(&self, from: u64, to: u64) -> Result<Vec<Block>, StateError> {
        Ok(self.blocks.range(from, to)?)
    }

    /// Payload handler and derived state.
    pub fn handler(&self) -> &BlockHandler {
        &self.handler
    }

    /// Mutable handler, for hook registration.
    pub fn handler_mut(&mut self) -> &mut BlockHandler {
        &mut self.handler
    }

    /// Current sync status.
    pub fn sync_status(&self) -> SyncStatus {
        self.status
    }

    /// Whether a replay is running.
    pub fn is_syncing(&self) -> bool {
        self.status == SyncStatus::SyncInProgress
    }

    /// Whether autofix truncation is enabled.
    pub fn autofix(&self) -> bool {
        self.autofix
    }

    /// Write `block` at its index; with `handle`, apply its payload.
    pub fn append(&mut self, block: &Block, handle: bool) -> Result<Option<HandleOutcome>, StateError> {
        if handle && self.is_syncing() {
            return Err(StateError::SyncInProgress);
        }
        self.blocks.put(block)?;
        if handle {
            return Ok(Some(self.handler.handle_block(block)?));
        }
        Ok(None)
    }

    /// Overwrite heights with `blocks` without applying payloads.
    pub fn write_blocks(&mut self, blocks: &[Block]) -> Result<(), StateError> {
        for b in blocks {
            self.blocks.put(b)?;
        }
        Ok(())
    }

    /// Step the head back by one height (autofix of an unreadable head).
    pub fn step_back_head(&mut self) -> Result<Option<u64>, StateError> {
        let Some(max) = self.blocks.max_block() else {
            return Ok(None);
        };
        if max == 0 {
            return Ok(Some(0));
        }
        self.blocks.set_max_block(Some(max - 1))?;
        warn!(target: "lumen::autofix", height = max - 1, "Reset blockchain height");
        Ok(Some(max - 1))
    }

    /// Start replaying from `from` over the current derived state.
    ///
    /// Returns `None` if a replay is already running.
    pub fn begin_replay(&mut self, from: u64) -> Result<Option<Replay>, StateError> {
        if self.is_syncing() {
            return Ok(None);
        }
        let prev_hash = match from.checked_sub(1) {
            Some(h) => self.blocks.get(h)?.map(|b| b.hash),
            None => None,
        };
        self.status = SyncStatus::SyncInProgress;
        Ok(Some(Replay::starting_at(from, prev_hash)))
    }

    /// Clear derived state and start replaying from genesis.
    ///
    /// Returns `None` (request coalesced) if a replay is already running.
    pub fn begin_resync(&mut self) -> Result<Option<Replay>, StateError> {
        if self.is_syncing() {
            return Ok(None);
        }
        self.handler.clear()?;
        info!("Resync: rebuilding derived state from genesis");
        self.begin_replay(0)
    }

    /// Handle up to `budget` blocks of `replay`.
    pub fn replay_step(
        &mut self,
        replay: &mut Replay,
        budget: usize,
    ) -> Result<ReplayProgress, StateError> {
        let result = self.replay_batch(replay, budget);
        if !matches!(result, Ok(ReplayProgress::Continue)) {
            self.status = SyncStatus::Idle;
        }
        result
    }

    fn replay_batch(
        &mut self,
        replay: &mut Replay,
        budget: usize,
    ) -> Result<ReplayProgress, StateError> {
        for _ in 0..budget.max(1) {
            let Some(max) = self.blocks.max_block() else {
                return Ok(ReplayProgress::Finished);
            };
            let height = replay.next;
            if height > max {
                info!(height = max, handled = replay.handled, "Blockchain replay finished");
                return Ok(ReplayProgress::Finished);
            }
            let block = match self.blocks.get(height) {
                Ok(Some(b)) if b.index == height => b,
                Ok(_) => return self.corrupted(height),
                Err(e) => {
                    warn!(height, "replay read failed: {e}");
                    return self.corrupted(height);
                }
            };
            if let Some(prev) = &replay.prev_hash {
                if &block.previous_hash != prev {
                    return self.corrupted(height);
                }
            }
            self.handler.handle_block(&block)?;
            replay.prev_hash = Some(block.hash);
            replay.next += 1;
            replay.handled += 1;
        }
        Ok(ReplayProgress::Continue)
    }

    fn corrupted(&mut self, height: u64) -> Result<ReplayProgress, StateError> {
        if !self.autofix || height == 0 {
            return Err(StateError::ChainCorrupted { height });
        }
        self.blocks.truncate_from(height)?;
        let head = self.blocks.max_block();
        warn!(target: "lumen::autofix", corrupted = height, height = ?head, "Set new blockchain height");
        Ok(ReplayProgress::Truncated { height: head })
    }

    /// Replay `from..=max` to completion.
    ///
    /// Derived state must not already cover `from..`; [`ChainStore::resync`]
    /// rebuilds everything.
    pub fn play_blockchain(&mut self, from: u64) -> Result<ReplayProgress, StateError> {
        let Some(mut replay) = self.begin_replay(from)? else {
            return Err(StateError::SyncInProgress);
        };
        self.run(&mut replay)
    }

    /// Clear derived state and replay everything.
    pub fn resync(&mut self) -> Result<ReplayProgress, StateError> {
        let Some(mut replay) = self.begin_resync()? else {
            return Err(StateError::SyncInProgress);
        };
        self.run(&mut replay)
    }

    fn run(&mut self, replay: &mut Replay) -> Result<ReplayProgress, StateError> {
        loop {
            let progress = self.replay_step(replay, REPLAY_BATCH)?;
            if progress.is_done() {
                return Ok(progress);
            }
        }
    }

    /// Flush the blocks and wallets backends.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.blocks.flush()?;
        self.handler.wallets().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerConfig;
    use crate::kv::{MemoryStore, SledStore};
    use crate::wallets::WalletStore;
    use lumen_core::{Cryptography, DefaultCryptography, Payload, DEFAULT_GENESIS_TIMESTAMP};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn genesis() -> Block {
        Block::genesis(&DefaultCryptography, DEFAULT_GENESIS_TIMESTAMP)
    }

    fn memory_chain(autofix: bool) -> ChainStore {
        let blocks = BlockStore::open(Box::new(MemoryStore::new())).unwrap();
        let handler = BlockHandler::new(
            WalletStore::new(Box::new(MemoryStore::new())),
            Arc::new(DefaultCryptography),
            HandlerConfig::default(),
        )
        .unwrap();
        ChainStore::load_or_init(blocks, handler, genesis(), autofix).unwrap()
    }

    fn extend(chain: &mut ChainStore, n: u64) {
        for _ in 0..n {
            let prev = chain.latest_block().unwrap().unwrap();
            let b = Block::new(
                &DefaultCryptography,
                prev.index + 1,
                prev.hash.clone(),
                prev.timestamp + 1_000,
                prev.timestamp + 1_000,
                Payload::Empty(Default::default()).encode().unwrap(),
            );
            chain.append(&b, true).unwrap();
        }
    }

    #[test]
    fn init_writes_genesis_once() {
        let chain = memory_chain(false);
        assert_eq!(chain.max_block(), Some(0));
        assert_eq!(chain.latest_block().unwrap().unwrap(), genesis());
    }

    #[test]
    fn foreign_genesis_is_refused() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("db")).unwrap();
        let open = |g: Block| {
            let blocks = BlockStore::open(Box::new(SledStore::from_db(&db, "blocks").unwrap())).unwrap();
            let handler = BlockHandler::new(
                WalletStore::new(Box::new(SledStore::from_db(&db, "wallets").unwrap())),
                Arc::new(DefaultCryptography),
                HandlerConfig::default(),
            )
            .unwrap();
            ChainStore::load_or_init(blocks, handler, g, false)
        };
        open(genesis()).unwrap();
        let other = Block::genesis(&DefaultCryptography, DEFAULT_GENESIS_TIMESTAMP + 1);
        assert!(matches!(open(other), Err(StateError::GenesisMismatch)));
    }

    #[test]
    fn replay_walks_to_head_in_batches() {
        let mut chain = memory_chain(false);
        extend(&mut chain, 10);
        let mut replay = chain.begin_resync().unwrap().unwrap();
        assert!(chain.is_syncing());
        assert!(chain.begin_resync().unwrap().is_none());
        assert_eq!(chain.replay_step(&mut replay, 4).unwrap(), ReplayProgress::Continue);
        assert_eq!(replay.next_height(), 4);
        while !chain.replay_step(&mut replay, 4).unwrap().is_done() {}
        assert_eq!(replay.handled(), 11);
        assert!(!chain.is_syncing());
    }

    #[test]
    fn handled_append_is_refused_while_syncing() {
        let mut chain = memory_chain(false);
        let _replay = chain.begin_replay(0).unwrap().unwrap();
        let g = genesis();
        assert!(matches!(chain.append(&g, true), Err(StateError::SyncInProgress)));
    }

    fn corrupt_height(chain: &mut ChainStore, height: u64) {
        let mut bad = chain.block(height).unwrap().unwrap();
        bad.previous_hash = DefaultCryptography.hash(b"elsewhere");
        chain.write_blocks(&[bad]).unwrap();
    }

    #[test]
    fn discontinuity_is_fatal_without_autofix() {
        let mut chain = memory_chain(false);
        extend(&mut chain, 6);
        corrupt_height(&mut chain, 4);
        match chain.play_blockchain(0) {
            Err(StateError::ChainCorrupted { height }) => assert_eq!(height, 4),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!chain.is_syncing());
    }

    #[test]
    fn autofix_truncates_at_last_good_block() {
        let mut chain = memory_chain(true);
        extend(&mut chain, 6);
        corrupt_height(&mut chain, 4);
        assert_eq!(
            chain.play_blockchain(0).unwrap(),
            ReplayProgress::Truncated { height: Some(3) }
        );
        assert_eq!(chain.max_block(), Some(3));
        assert!(chain.block(4).unwrap().is_none());
        assert_eq!(chain.play_blockchain(0).unwrap(), ReplayProgress::Finished);
    }

    #[test]
    fn step_back_head_keeps_genesis() {
        let mut chain = memory_chain(true);
        extend(&mut chain, 1);
        assert_eq!(chain.step_back_head().unwrap(), Some(0));
        assert_eq!(chain.step_back_head().unwrap(), Some(0));
    }
}
