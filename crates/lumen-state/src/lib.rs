#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Lumen state machine.
//!
//! Responsibilities:
//! - Persist blocks by height behind a generic keyed byte store
//! - Maintain the derived wallet balances and the network keyring
//! - Dispatch blocks to payload handlers and replay the chain from genesis
//!
//! Block validity is not checked here beyond hash-chain linkage during
//! replay; consensus rules live in `lumen-consensus`.

pub mod block_store;
pub mod chain_store;
pub mod error;
pub mod handler;
pub mod kv;
pub mod replay;
pub mod wallets;

pub use block_store::*;
pub use chain_store::*;
pub use error::*;
pub use handler::*;
pub use kv::*;
pub use replay::*;
pub use wallets::*;
