// Consensus-critical. Changes require a protocol version bump + tests.
//! Canonical protocol types for Lumen.
//!
//! A [`Block`] is immutable once appended. Its `hash` commits to every
//! field except `sign`, `fee` and `wallet`; the sign slot of the hash
//! preimage is always empty because signatures are produced over the hash.

use borsh::{BorshDeserialize, BorshSerialize};
use core::fmt;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::crypto::Cryptography;
use crate::serialization::block_hash_preimage;

/// Errors related to parsing, validation, or construction of core protocol types.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Hex decoding failed.
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// A key or signature could not be decoded.
    #[error("invalid key material: {0}")]
    InvalidKey(&'static str),

    /// Encoding a value failed.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Arithmetic overflow or underflow occurred.
    #[error("amount overflow or underflow")]
    AmountOverflow,

    /// A value violated protocol constraints.
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

/// One ledger entry.
#[derive(Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Position in the chain; genesis is 0.
    pub index: u64,
    /// Hash of the preceding block (`"0"` for genesis).
    pub previous_hash: String,
    /// Finalization time, ms since epoch.
    pub timestamp: u64,
    /// Time block construction began, ms since epoch.
    pub start_timestamp: u64,
    /// Canonical payload serialization.
    pub data: String,
    /// Hex digest over the block fields.
    pub hash: String,
    /// Signature over `hash`; empty for hash-difficulty blocks.
    #[serde(default)]
    pub sign: String,
    /// Fee attached by stake validators.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    /// Owner wallet credited with `fee` on handling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
}

impl Block {
    /// Build an unsigned block and compute its hash.
    pub fn new(
        crypto: &dyn Cryptography,
        index: u64,
        previous_hash: impl Into<String>,
        timestamp: u64,
        start_timestamp: u64,
        data: impl Into<String>,
    ) -> Self {
        let mut block = Self {
            index,
            previous_hash: previous_hash.into(),
            timestamp,
            start_timestamp,
            data: data.into(),
            hash: String::new(),
            sign: String::new(),
            fee: None,
            wallet: None,
        };
        block.hash = block.compute_hash(crypto);
        block
    }

    /// Build the fixed genesis block for a network.
    pub fn genesis(crypto: &dyn Cryptography, genesis_timestamp: u64) -> Self {
        Self::new(
            crypto,
            0,
            GENESIS_PREVIOUS_HASH,
            genesis_timestamp,
            genesis_timestamp,
            GENESIS_DATA,
        )
    }

    /// Recompute the hash from the block fields.
    pub fn compute_hash(&self, crypto: &dyn Cryptography) -> String {
        let preimage = block_hash_preimage(
            self.index,
            &self.previous_hash,
            self.timestamp,
            self.start_timestamp,
            "",
            &self.data,
            self.fee,
            self.wallet.as_deref(),
        );
        crypto.hash(preimage.as_bytes())
    }

    /// Whether the block claims an emission reward.
    pub fn carries_reward(&self) -> bool {
        self.fee.is_some() || self.wallet.is_some()
    }

    /// Attach a reward and rehash; any signature is dropped.
    pub fn set_reward(&mut self, crypto: &dyn Cryptography, fee: u64, wallet: impl Into<String>) {
        self.fee = Some(fee);
        self.wallet = Some(wallet.into());
        self.sign.clear();
        self.hash = self.compute_hash(crypto);
    }

    /// Whether the stored hash matches the recomputed one.
    pub fn has_valid_hash(&self, crypto: &dyn Cryptography) -> bool {
        self.hash == self.compute_hash(crypto)
    }

    /// Whether the block carries a signature.
    pub fn is_signed(&self) -> bool {
        !self.sign.is_empty()
    }

    /// Sign the block hash with `private_key`.
    pub fn sign_with(
        &mut self,
        crypto: &dyn Cryptography,
        private_key: &str,
    ) -> Result<(), CoreError> {
        self.sign = crypto.sign(self.hash.as_bytes(), private_key)?;
        Ok(())
    }

    /// Whether `sign` verifies over `hash` with `public_key`.
    pub fn is_signed_by(&self, crypto: &dyn Cryptography, public_key: &str) -> bool {
        self.is_signed() && crypto.verify(self.hash.as_bytes(), &self.sign, public_key)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("hash", &self.hash)
            .field("previous_hash", &self.previous_hash)
            .field("timestamp", &self.timestamp)
            .field("signed", &self.is_signed())
            .finish()
    }
}
