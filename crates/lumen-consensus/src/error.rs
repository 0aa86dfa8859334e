//! Consensus error types.

use lumen_core::CoreError;
use lumen_state::StoreError;
use thiserror::Error;

/// Errors returned by block generation and validator configuration.
///
/// Validation itself never fails; it yields a [`crate::Verdict`].
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// No validator is configured.
    #[error("no validators configured")]
    NoValidators,

    /// A configured validator name is not known.
    #[error("unknown validator: {0}")]
    UnknownValidator(String),

    /// No configured validator can currently produce a block.
    #[error("no consensus ready")]
    NotReady,

    /// The strategy needs a signing key the node does not hold.
    #[error("no signing key available")]
    NoSigner,

    /// A key operation block was not signed by an admin key.
    #[error("invalid admin signature")]
    NotAdmin,

    /// The message bus is gone.
    #[error("message bus closed")]
    BusClosed,

    /// The chain has no head to build on.
    #[error("chain is empty")]
    EmptyChain,

    /// Core encoding or key failure.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Key store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
