#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Lumen full node.
//!
//! Responsibilities:
//! - configuration resolution (CLI, `LUMEN_*` environment, JSON file, defaults)
//! - the node wallet and emitted keyring keys on disk
//! - the [`Transactor`] commit watcher
//! - [`Node`]: store wiring, validator selection, timers, mining tasks and
//!   bus routing around the p2p synchronizer
//!
//! Consensus rules live in `lumen-consensus`; this crate only schedules them.

pub mod config;
pub mod logging;
pub mod node;
pub mod transactor;
pub mod wallet;

pub use config::*;
pub use logging::*;
pub use node::*;
pub use transactor::*;
pub use wallet::*;
