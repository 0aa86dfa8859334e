//! P2P errors.

use lumen_state::StateError;
use thiserror::Error;

/// Transport and protocol failures.
#[derive(Debug, Error)]
pub enum P2pError {
    /// Socket failure.
    #[error("io: {0}")]
    Io(String),

    /// A frame did not decode to a message.
    #[error("malformed message: {0}")]
    Codec(String),

    /// A frame exceeded the input cap.
    #[error("input message exceeds maximum input size ({len} > {max})")]
    Oversized {
        /// Announced frame length.
        len: usize,
        /// Configured cap.
        max: usize,
    },

    /// Connection refused by peer policy.
    #[error("policy: {0}")]
    Policy(String),

    /// The peer is not connected.
    #[error("disconnected")]
    Disconnected,

    /// Chain state failure.
    #[error(transparent)]
    State(#[from] StateError),
}

impl From<std::io::Error> for P2pError {
    fn from(e: std::io::Error) -> Self {
        P2pError::Io(e.to_string())
    }
}
