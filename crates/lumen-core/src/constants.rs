//! Protocol-wide constants for Lumen.

/// `previousHash` carried by the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Payload string embedded in the genesis block.
pub const GENESIS_DATA: &str =
    "New epoch begins here! *solemn music on the background* *loud applause*";

/// Default genesis timestamp (ms since the Unix epoch).
pub const DEFAULT_GENESIS_TIMESTAMP: u64 = 1_492_004_951_000;

/// Height at which the one-time Keyring block is accepted.
///
/// Below this height transfers are treated as bootstrap emission.
pub const KEY_EMISSION_MAX_BLOCK: u64 = 5;

/// Fixed-point scale of wallet balances (1 coin = `PRECISION` units).
pub const PRECISION: u64 = 1_000_000;

/// Maximum distance (ms) a new block may be timestamped ahead of local time.
pub const MAX_FUTURE_BLOCK_DRIFT_MS: u64 = 1_000;

/// Maximum distance (ms) a received chain head may be ahead of local time.
pub const MAX_FUTURE_RESPONSE_DRIFT_MS: u64 = 60_000;

/// Smallest 13-digit millisecond timestamp.
pub const MIN_MS_TIMESTAMP: u64 = 1_000_000_000_000;

/// Largest 13-digit millisecond timestamp.
pub const MAX_MS_TIMESTAMP: u64 = 9_999_999_999_999;

/// Bus address of the trusted-node role.
pub const TRUSTED_NODE_ADDRESS: &str = "trusted_node";
