// Consensus-critical. Changes require a protocol version bump + tests.
//! Structural checks shared by the validators.
//!
//! Each check returns the reason it failed so the calling strategy can log it
//! under its own name.

use lumen_core::{is_ms_timestamp, Block, Cryptography, MAX_FUTURE_BLOCK_DRIFT_MS};

/// `new` must sit directly on top of `prev`.
pub fn check_link(new: &Block, prev: &Block) -> Result<(), &'static str> {
    if prev.index.checked_add(1) != Some(new.index) {
        return Err("invalid block index");
    }
    if new.previous_hash != prev.hash {
        return Err("invalid previous hash");
    }
    Ok(())
}

/// Stored hash must match the recomputed one.
pub fn check_hash(crypto: &dyn Cryptography, new: &Block) -> Result<(), &'static str> {
    if !new.has_valid_hash(crypto) {
        return Err("invalid hash for block");
    }
    Ok(())
}

/// Time-lock rules: ordered timestamps, bounded drift, 13-digit values.
pub fn check_timestamps(new: &Block, prev: &Block, now_ms: u64) -> Result<(), &'static str> {
    if new.start_timestamp > new.timestamp || prev.timestamp > new.timestamp {
        return Err("invalid start or block timestamp");
    }
    if new.timestamp > now_ms.saturating_add(MAX_FUTURE_BLOCK_DRIFT_MS) {
        return Err("invalid local time or block creator time");
    }
    if !is_ms_timestamp(new.timestamp) || !is_ms_timestamp(new.start_timestamp) {
        return Err("invalid timestamp number");
    }
    Ok(())
}

/// Only PoS blocks may claim an emission reward.
pub fn check_no_reward(new: &Block) -> Result<(), &'static str> {
    if new.carries_reward() {
        return Err("block claims a reward outside PoS");
    }
    Ok(())
}

/// Signature rules shared by the signing validators: linked, strictly later, signed.
pub fn check_signed_successor(new: &Block, prev: &Block) -> Result<(), &'static str> {
    if new.previous_hash != prev.hash {
        return Err("invalid block previous hash");
    }
    if new.timestamp <= prev.timestamp {
        return Err("block timestamp not after previous");
    }
    if prev.index.checked_add(1) != Some(new.index) {
        return Err("invalid block index");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::DefaultCryptography;

    const NOW: u64 = 1_700_000_000_000;

    fn pair() -> (Block, Block) {
        let prev = Block::new(&DefaultCryptography, 4, "p", NOW - 10, NOW - 10, "{}");
        let new = Block::new(&DefaultCryptography, 5, prev.hash.clone(), NOW, NOW - 5, "{}");
        (prev, new)
    }

    #[test]
    fn accepts_well_formed_successor() {
        let (prev, new) = pair();
        assert!(check_link(&new, &prev).is_ok());
        assert!(check_hash(&DefaultCryptography, &new).is_ok());
        assert!(check_timestamps(&new, &prev, NOW).is_ok());
    }

    #[test]
    fn rejects_index_gap_and_wrong_parent() {
        let (prev, mut new) = pair();
        new.index = 6;
        assert_eq!(check_link(&new, &prev), Err("invalid block index"));
        let (prev, mut new) = pair();
        new.previous_hash = "other".into();
        assert_eq!(check_link(&new, &prev), Err("invalid previous hash"));
    }

    #[test]
    fn rejects_future_and_short_timestamps() {
        let (prev, mut new) = pair();
        new.timestamp = NOW + MAX_FUTURE_BLOCK_DRIFT_MS + 1;
        assert!(check_timestamps(&new, &prev, NOW).is_err());

        let (mut prev, mut new) = pair();
        prev.timestamp = 1;
        new.start_timestamp = 99_999;
        new.timestamp = 100_000;
        assert_eq!(check_timestamps(&new, &prev, NOW), Err("invalid timestamp number"));
    }

    #[test]
    fn tampered_data_breaks_hash() {
        let (_, mut new) = pair();
        new.data = "{\"type\":\"Empty\"}".into();
        assert!(check_hash(&DefaultCryptography, &new).is_err());
    }
}
