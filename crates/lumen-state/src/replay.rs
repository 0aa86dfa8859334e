//! Restartable replay cursor.
//!
//! A [`Replay`] walks heights `from..=max` one block at a time. The cursor
//! owns no storage; [`crate::ChainStore::replay_step`] advances it in bounded
//! batches so a driver can yield between batches.

/// Sync status of the derived state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SyncStatus {
    /// Live block acceptance may mutate state.
    #[default]
    Idle,
    /// A replay owns the derived state; chain responses are dropped.
    SyncInProgress,
}

/// Replay position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replay {
    pub(crate) next: u64,
    pub(crate) prev_hash: Option<String>,
    pub(crate) handled: u64,
}

impl Replay {
    pub(crate) fn starting_at(from: u64, prev_hash: Option<String>) -> Self {
        Self {
            next: from,
            prev_hash,
            handled: 0,
        }
    }

    /// Next height to handle.
    pub fn next_height(&self) -> u64 {
        self.next
    }

    /// Blocks handled so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }
}

/// Result of one replay batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayProgress {
    /// More heights remain.
    Continue,
    /// Replay reached the head.
    Finished,
    /// Autofix cut the chain; `height` is the new head.
    Truncated {
        /// Head after truncation, `None` if nothing survived.
        height: Option<u64>,
    },
}

impl ReplayProgress {
    /// Whether the replay is over.
    pub fn is_done(&self) -> bool {
        !matches!(self, ReplayProgress::Continue)
    }
}
