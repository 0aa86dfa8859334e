#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Lumen peer-to-peer layer.
//!
//! Responsibilities:
//! - the wire [`Message`] set and its length-prefixed JSON framing
//! - peer admission, de-duplication, scoring and IP blacklisting
//! - [`ChainSync`], a sans-IO engine that turns peer messages into chain
//!   updates and outbound messages
//! - a tokio TCP transport driving [`ChainSync`]
//!
//! Fork resolution happens here: validators judge blocks, the engine
//! decides which chain to keep.

pub mod error;
pub mod message;
pub mod net;
pub mod peers;
pub mod sync;

pub use error::*;
pub use message::*;
pub use net::*;
pub use peers::*;
pub use sync::*;
