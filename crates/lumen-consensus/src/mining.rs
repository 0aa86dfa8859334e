//! Cooperative mining loop for the time-locked hash validators.
//!
//! The only free variable of a block hash is its timestamp, so mining walks
//! candidate timestamps from the local clock up to a short lookahead and
//! waits for the clock once the window is used up. The loop yields to the
//! runtime after every batch and re-reads the head before every attempt.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use lumen_core::{now_ms, Block};
use tracing::{debug, info};

use crate::strategy::{CancelPredicate, GenerationContext};

/// Attempts between cooperative yields.
pub const MINING_BATCH: usize = 256;

/// How far past the local clock candidate timestamps may go, ms.
pub const MINING_LOOKAHEAD_MS: u64 = 500;

/// Node-wide mining counters.
#[derive(Debug, Default)]
pub struct MiningStats {
    in_progress: AtomicUsize,
    hash_rate: AtomicU64,
}

impl MiningStats {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Miners currently running.
    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::Relaxed)
    }

    /// Last measured attempts per second.
    pub fn hash_rate(&self) -> u64 {
        self.hash_rate.load(Ordering::Relaxed)
    }

    fn start(&self) -> MinerGuard<'_> {
        let id = self.in_progress.fetch_add(1, Ordering::Relaxed) + 1;
        MinerGuard { stats: self, id }
    }
}

struct MinerGuard<'a> {
    stats: &'a MiningStats,
    id: usize,
}

impl Drop for MinerGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_progress.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Search for a block carrying `data` that satisfies `is_found(candidate, prev)`.
///
/// Returns `None` when `cancel` fires or the chain has no head.
pub async fn mine<F>(
    gen: &GenerationContext,
    data: &str,
    cancel: &CancelPredicate,
    miner: &'static str,
    is_found: F,
) -> Option<Block>
where
    F: Fn(&Block, &Block) -> bool + Send + Sync,
{
    let guard = gen.mining.start();
    info!(miner, id = guard.id, "Mining block...");
    let start_ts = now_ms();
    let mut next_ts = start_ts;
    let mut window_start = start_ts;
    let mut attempts = 0u64;

    loop {
        let mut window_used = false;
        for _ in 0..MINING_BATCH {
            if cancel() {
                info!(miner, id = guard.id, "Miner aborted");
                return None;
            }
            let prev = gen.view.latest_block()?;
            let now = now_ms();
            next_ts = next_ts.max(now).max(prev.timestamp);
            if next_ts > now + MINING_LOOKAHEAD_MS {
                window_used = true;
                break;
            }
            let candidate = Block::new(
                gen.crypto.as_ref(),
                prev.index + 1,
                prev.hash.clone(),
                next_ts,
                start_ts.min(next_ts),
                data,
            );
            next_ts += 1;
            attempts += 1;
            if is_found(&candidate, &prev) {
                info!(
                    miner,
                    hash = %candidate.hash,
                    secs = (candidate.timestamp.saturating_sub(start_ts)) as f64 / 1000.0,
                    "New block found"
                );
                return Some(candidate);
            }
        }

        let now = now_ms();
        if now.saturating_sub(window_start) >= 1_000 {
            let rate = attempts * 1_000 / now.saturating_sub(window_start).max(1);
            gen.mining.hash_rate.store(rate, Ordering::Relaxed);
            debug!(miner, id = guard.id, rate, "mining speed");
            window_start = now;
            attempts = 0;
        }

        if window_used {
            tokio::time::sleep(Duration::from_millis(1)).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
}
