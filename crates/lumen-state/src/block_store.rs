//! Height-indexed block persistence.
//!
//! Layout: one entry per height (`h` + big-endian height) holding the Borsh
//! encoded block, plus the reserved `maxBlock` key holding the head height
//! (chain length minus one). An absent `maxBlock` means the store is empty.

use lumen_core::{from_bytes, to_bytes, Block};
use tracing::debug;

use crate::error::StoreError;
use crate::kv::KeyValueStore;

const KEY_MAX_BLOCK: &[u8] = b"maxBlock";
const HEIGHT_PREFIX: u8 = b'h';

fn height_key(height: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = HEIGHT_PREFIX;
    key[1..].copy_from_slice(&height.to_be_bytes());
    key
}

/// Blocks addressed by height.
pub struct BlockStore {
    kv: Box<dyn KeyValueStore>,
    max_block: Option<u64>,
}

impl BlockStore {
    /// Wrap a store, loading the persisted head height.
    pub fn open(kv: Box<dyn KeyValueStore>) -> Result<Self, StoreError> {
        let max_block = match kv.get(KEY_MAX_BLOCK)? {
            Some(bytes) => Some(from_bytes::<u64>(&bytes)?),
            None => None,
        };
        Ok(Self { kv, max_block })
    }

    /// Head height, or `None` for an empty store.
    pub fn max_block(&self) -> Option<u64> {
        self.max_block
    }

    /// Block at `height`.
    pub fn get(&self, height: u64) -> Result<Option<Block>, StoreError> {
        match self.kv.get(&height_key(height))? {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Block at the head height.
    pub fn latest(&self) -> Result<Option<Block>, StoreError> {
        match self.max_block {
            Some(h) => self.get(h),
            None => Ok(None),
        }
    }

    /// Write `block` at its own index; raises the head if it is higher.
    pub fn put(&mut self, block: &Block) -> Result<(), StoreError> {
        let bytes = to_bytes(block)?;
        self.kv.put(&height_key(block.index), &bytes)?;
        if self.max_block.map_or(true, |m| block.index > m) {
            self.set_max_block(Some(block.index))?;
        }
        Ok(())
    }

    /// Persist a new head height.
    pub fn set_max_block(&mut self, max: Option<u64>) -> Result<(), StoreError> {
        match max {
            Some(h) => self.kv.put(KEY_MAX_BLOCK, &to_bytes(&h)?)?,
            None => self.kv.del(KEY_MAX_BLOCK)?,
        }
        self.max_block = max;
        Ok(())
    }

    /// Blocks `from..=to`, stopping at the head or the first gap.
    pub fn range(&self, from: u64, to: u64) -> Result<Vec<Block>, StoreError> {
        let Some(max) = self.max_block else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for h in from..=to.min(max) {
            match self.get(h)? {
                Some(b) => out.push(b),
                None => break,
            }
        }
        Ok(out)
    }

    /// Delete heights `from..=max` and make `from - 1` the head.
    pub fn truncate_from(&mut self, from: u64) -> Result<(), StoreError> {
        let Some(max) = self.max_block else {
            return Ok(());
        };
        for h in from..=max {
            self.kv.del(&height_key(h))?;
        }
        debug!(from, max, "truncated block store");
        self.set_max_block(from.checked_sub(1))
    }

    /// Flush the backend.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.kv.flush()
    }
}
