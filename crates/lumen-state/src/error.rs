//! State errors.

use lumen_core::CoreError;
use thiserror::Error;

/// Failures of the keyed byte store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage backend failed.
    #[error("storage backend: {0}")]
    Backend(String),

    /// A stored record could not be decoded.
    #[error("corrupt record: {0}")]
    Codec(String),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<CoreError> for StoreError {
    fn from(e: CoreError) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Errors produced by the state machine.
#[derive(Debug, Error)]
pub enum StateError {
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Hash-chain discontinuity or unreadable block found during replay.
    #[error("saved chain corrupted at block {height}")]
    ChainCorrupted {
        /// First bad height.
        height: u64,
    },

    /// The stored genesis block differs from the configured one.
    #[error("stored genesis does not match configured genesis")]
    GenesisMismatch,

    /// An operation requires a non-empty chain.
    #[error("chain is empty")]
    EmptyChain,

    /// A replay or resync is running.
    #[error("sync in progress")]
    SyncInProgress,
}

/// Why a Transaction payload was not applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    /// Amount must be positive.
    #[error("amount must be positive")]
    NonPositiveAmount,

    /// Self-transfer after bootstrap by an untrusted key.
    #[error("self-transfer is not permitted")]
    Selfie,

    /// A transaction with the same timestamp was already processed.
    #[error("transaction clone")]
    Clone,

    /// Signature does not verify with the embedded key.
    #[error("fake transaction")]
    FakeSignature,

    /// Sender wallet is unknown.
    #[error("sender not found")]
    SenderNotFound,

    /// Signature does not verify with the sender's registered key.
    #[error("fake transaction (registered key mismatch)")]
    FakeSender,

    /// Sender balance below amount.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// Receiver wallet is unknown.
    #[error("recipient not found")]
    RecipientNotFound,

    /// Balance arithmetic overflowed.
    #[error("balance overflow")]
    Overflow,

    /// Store failure while applying.
    #[error("storage: {0}")]
    Storage(String),
}

impl From<StoreError> for TxError {
    fn from(e: StoreError) -> Self {
        TxError::Storage(e.to_string())
    }
}
