//! Local commit watcher.
//!
//! Every locally generated block is tracked until it sits
//! `accept_count` blocks below the head. A block that disappears from its
//! height, or is replaced there by a fork, is generated again from the same
//! payload. The watcher holds no chain handle of its own; the node feeds it
//! generation results and periodic ticks and acts on the returned events.

use std::collections::BTreeMap;

use lumen_core::Block;
use lumen_state::{ChainStore, StateError};
use tracing::{debug, info, warn};

/// Watch entry id.
pub type EntryId = u64;

/// Which validator produces an entry's blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Generator {
    /// Highest-priority ready validator.
    Auto,
    /// Lowest-priority validator (keyring publication).
    Lowest,
}

/// Watcher settings.
#[derive(Clone, Copy, Debug)]
pub struct TransactorConfig {
    /// Blocks above a watched block before it counts as accepted.
    pub accept_count: u64,
    /// Generation attempts per payload, the first one included.
    pub max_attempts: u32,
    /// Delay before retrying a generation that produced no block, ms.
    pub retry_delay_ms: u64,
}

impl Default for TransactorConfig {
    fn default() -> Self {
        Self {
            accept_count: 20,
            max_attempts: 5,
            retry_delay_ms: 5_000,
        }
    }
}

/// What the node must do for an entry.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent {
    /// Generate a fresh block carrying `data`.
    Regenerate {
        /// Entry.
        id: EntryId,
        /// Original payload.
        data: String,
        /// Validator choice.
        generator: Generator,
    },
    /// The block is buried deep enough.
    Accepted {
        /// Entry.
        id: EntryId,
        /// Accepted block.
        block: Block,
    },
    /// Attempts are used up; the entry is gone.
    Failed {
        /// Entry.
        id: EntryId,
        /// Payload that never made it.
        data: String,
    },
}

#[derive(Debug)]
struct Entry {
    data: String,
    generator: Generator,
    block: Option<Block>,
    attempts: u32,
    retry_at: Option<u64>,
}

/// Tracks locally submitted payloads until confirmation.
#[derive(Debug)]
pub struct Transactor {
    config: TransactorConfig,
    entries: BTreeMap<EntryId, Entry>,
    next_id: EntryId,
}

impl Transactor {
    /// Empty watcher.
    pub fn new(config: TransactorConfig) -> Self {
        Self {
            config,
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Register `data`; the caller starts the first generation.
    pub fn transact(&mut self, data: String, generator: Generator) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                data,
                generator,
                block: None,
                attempts: 1,
                retry_at: None,
            },
        );
        id
    }

    /// Record a generation result.
    ///
    /// `None` schedules a retry, or fails the entry once attempts are used up.
    pub fn generated(&mut self, id: EntryId, block: Option<Block>, now: u64) -> Option<WatchEvent> {
        let entry = self.entries.get_mut(&id)?;
        match block {
            Some(block) => {
                debug!(id, index = block.index, "watching block");
                entry.block = Some(block);
                entry.retry_at = None;
                None
            }
            None if entry.attempts >= self.config.max_attempts => {
                let entry = self.entries.remove(&id)?;
                warn!(id, attempts = entry.attempts, "Transaction generation failed");
                Some(WatchEvent::Failed { id, data: entry.data })
            }
            None => {
                entry.retry_at = Some(now.saturating_add(self.config.retry_delay_ms));
                None
            }
        }
    }

    /// One watch tick.
    ///
    /// Does nothing while `ready` is false, so a replay does not look like
    /// rejected blocks.
    pub fn watch(&mut self, chain: &ChainStore, ready: bool, now: u64) -> Result<Vec<WatchEvent>, StateError> {
        if !ready {
            return Ok(Vec::new());
        }
        let max = chain.max_block().unwrap_or(0);
        let mut events = Vec::new();
        let mut done = Vec::new();

        for (&id, entry) in self.entries.iter_mut() {
            let Some(block) = &entry.block else {
                if entry.retry_at.map_or(false, |at| at <= now) {
                    entry.retry_at = None;
                    entry.attempts += 1;
                    events.push(WatchEvent::Regenerate {
                        id,
                        data: entry.data.clone(),
                        generator: entry.generator,
                    });
                }
                continue;
            };

            let stored = chain.block(block.index)?;
            if stored.map_or(true, |s| s.hash != block.hash) {
                if entry.attempts >= self.config.max_attempts {
                    warn!(id, index = block.index, "Transaction rejected too many times");
                    done.push(id);
                    events.push(WatchEvent::Failed {
                        id,
                        data: entry.data.clone(),
                    });
                    continue;
                }
                info!(id, index = block.index, "Block rejected, regenerating");
                entry.block = None;
                entry.attempts += 1;
                events.push(WatchEvent::Regenerate {
                    id,
                    data: entry.data.clone(),
                    generator: entry.generator,
                });
                continue;
            }

            if block.index.saturating_add(self.config.accept_count) <= max {
                info!(id, index = block.index, "Transaction accepted");
                done.push(id);
                events.push(WatchEvent::Accepted {
                    id,
                    block: block.clone(),
                });
            }
        }

        for id in done {
            self.entries.remove(&id);
        }
        Ok(events)
    }

    /// Whether `id` is still watched.
    pub fn is_pending(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Watched entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is watched.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lumen_core::{DefaultCryptography, Payload, DEFAULT_GENESIS_TIMESTAMP};
    use lumen_state::{BlockHandler, BlockStore, HandlerConfig, MemoryStore, WalletStore};

    fn chain() -> ChainStore {
        let c = Arc::new(DefaultCryptography);
        let blocks = BlockStore::open(Box::new(MemoryStore::new())).unwrap();
        let handler = BlockHandler::new(
            WalletStore::new(Box::new(MemoryStore::new())),
            c,
            HandlerConfig::default(),
        )
        .unwrap();
        let genesis = Block::genesis(&DefaultCryptography, DEFAULT_GENESIS_TIMESTAMP);
        ChainStore::load_or_init(blocks, handler, genesis, false).unwrap()
    }

    fn next(chain: &ChainStore, data: &str) -> Block {
        let prev = chain.latest_block().unwrap().unwrap();
        let ts = prev.timestamp + 1_000;
        Block::new(&DefaultCryptography, prev.index + 1, prev.hash, ts, ts, data)
    }

    fn grow(chain: &mut ChainStore, n: usize) {
        let empty = Payload::Empty(Default::default()).encode().unwrap();
        for _ in 0..n {
            let b = next(chain, &empty);
            chain.append(&b, true).unwrap();
        }
    }

    fn config() -> TransactorConfig {
        TransactorConfig {
            accept_count: 3,
            max_attempts: 2,
            retry_delay_ms: 5_000,
        }
    }

    #[test]
    fn block_is_accepted_after_enough_confirmations() {
        let mut chain = chain();
        let mut t = Transactor::new(config());
        let id = t.transact("payload".into(), Generator::Auto);
        let b = next(&chain, "payload");
        chain.append(&b, true).unwrap();
        assert_eq!(t.generated(id, Some(b.clone()), 0), None);

        grow(&mut chain, 2);
        assert!(t.watch(&chain, true, 0).unwrap().is_empty());
        grow(&mut chain, 1);
        assert_eq!(
            t.watch(&chain, true, 0).unwrap(),
            vec![WatchEvent::Accepted { id, block: b }]
        );
        assert!(t.is_empty());
    }

    #[test]
    fn replaced_block_is_regenerated_with_the_same_payload() {
        let mut chain = chain();
        let mut t = Transactor::new(config());
        let id = t.transact("payload".into(), Generator::Auto);
        let ours = next(&chain, "payload");
        t.generated(id, Some(ours), 0);

        let theirs = next(&chain, "something else");
        chain.write_blocks(&[theirs]).unwrap();
        assert_eq!(
            t.watch(&chain, true, 0).unwrap(),
            vec![WatchEvent::Regenerate {
                id,
                data: "payload".into(),
                generator: Generator::Auto
            }]
        );
        assert!(t.is_pending(id));
    }

    #[test]
    fn missing_block_fails_once_attempts_are_used() {
        let chain = chain();
        let mut t = Transactor::new(config());
        let id = t.transact("payload".into(), Generator::Lowest);
        let ghost = next(&chain, "payload");

        t.generated(id, Some(ghost.clone()), 0);
        assert!(matches!(
            t.watch(&chain, true, 0).unwrap().as_slice(),
            [WatchEvent::Regenerate { .. }]
        ));
        t.generated(id, Some(ghost), 0);
        assert_eq!(
            t.watch(&chain, true, 0).unwrap(),
            vec![WatchEvent::Failed {
                id,
                data: "payload".into()
            }]
        );
        assert!(!t.is_pending(id));
    }

    #[test]
    fn empty_generation_retries_after_delay() {
        let chain = chain();
        let mut t = Transactor::new(config());
        let id = t.transact("payload".into(), Generator::Auto);

        assert_eq!(t.generated(id, None, 1_000), None);
        assert!(t.watch(&chain, true, 5_999).unwrap().is_empty());
        assert_eq!(t.watch(&chain, true, 6_000).unwrap().len(), 1);
        assert!(matches!(t.generated(id, None, 6_000), Some(WatchEvent::Failed { .. })));
    }

    #[test]
    fn nothing_happens_while_not_ready() {
        let chain = chain();
        let mut t = Transactor::new(config());
        let id = t.transact("payload".into(), Generator::Auto);
        t.generated(id, Some(next(&chain, "payload")), 0);
        assert!(t.watch(&chain, false, 0).unwrap().is_empty());
        assert!(t.is_pending(id));
    }
}
