#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Lumen core: canonical block and payload types, hashing, the cryptography
//! service and the gossip envelope shared by consensus and networking.

pub mod bus;
pub mod clock;
pub mod constants;
pub mod crypto;
pub mod payload;
pub mod serialization;
pub mod types;

pub use bus::*;
pub use clock::*;
pub use constants::*;
pub use crypto::*;
pub use payload::*;
pub use serialization::*;
pub use types::*;
