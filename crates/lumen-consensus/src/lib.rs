#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Lumen consensus strategies.
//!
//! This crate is responsible for:
//! - the pluggable [`ConsensusStrategy`] contract and the priority-ordered [`ValidatorSet`]
//! - time-locked hash validators (LCPoA, DLCPoA) and their cooperative mining loop
//! - signature validators (Trusted keyring, KeyPoA key store) and remote mining requests
//! - the stake/fee validator (PoS) behind a master-contract seam
//!
//! It does **not** own chain storage or networking; strategies read the chain
//! through [`ChainView`] and return blocks to the caller.

pub mod dlcpoa;
pub mod error;
pub mod keypoa;
pub mod lcpoa;
pub mod mining;
pub mod pos;
pub mod remote;
pub mod set;
pub mod strategy;
pub mod trusted;
pub mod validate;

pub use dlcpoa::*;
pub use error::*;
pub use keypoa::*;
pub use lcpoa::*;
pub use mining::*;
pub use pos::*;
pub use remote::*;
pub use set::*;
pub use strategy::*;
pub use trusted::*;
pub use validate::*;
