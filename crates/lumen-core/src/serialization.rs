// Consensus-critical. Changes require a protocol version bump + tests.
//! Canonical serialization helpers.
//!
//! Rule: payloads are hashed and signed as deterministic JSON (object keys in
//! sorted order). Storage records use Borsh.

use borsh::{to_vec, BorshDeserialize, BorshSerialize};
use serde::Serialize;

use crate::types::CoreError;

/// Encode a value with canonical Borsh encoding.
pub fn to_bytes<T: BorshSerialize>(v: &T) -> Result<Vec<u8>, CoreError> {
    to_vec(v).map_err(|e| CoreError::Encoding(e.to_string()))
}

/// Decode a Borsh-encoded value.
pub fn from_bytes<T: BorshDeserialize>(bytes: &[u8]) -> Result<T, CoreError> {
    T::try_from_slice(bytes).map_err(|e| CoreError::Encoding(e.to_string()))
}

/// Deterministic JSON: maps are emitted with keys in ascending order.
///
/// Routing through `serde_json::Value` sorts keys because its map type is
/// ordered.
pub fn canonical_json<T: Serialize>(v: &T) -> Result<String, CoreError> {
    let value = serde_json::to_value(v).map_err(|e| CoreError::Encoding(e.to_string()))?;
    serde_json::to_string(&value).map_err(|e| CoreError::Encoding(e.to_string()))
}

/// The string hashed to produce a block hash.
#[allow(clippy::too_many_arguments)]
pub fn block_hash_preimage(
    index: u64,
    previous_hash: &str,
    timestamp: u64,
    start_timestamp: u64,
    sign: &str,
    data: &str,
    fee: Option<u64>,
    wallet: Option<&str>,
) -> String {
    let mut preimage = format!("{index}{previous_hash}{timestamp}{start_timestamp}{sign}{data}");
    // NUL never appears in JSON text, so the reward fields cannot alias `data`.
    if let Some(fee) = fee {
        preimage.push_str(&format!("\0fee={fee}"));
    }
    if let Some(wallet) = wallet {
        preimage.push_str(&format!("\0wallet={wallet}"));
    }
    preimage
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn canonical_json_sorts_keys() {
        let mut m = HashMap::new();
        m.insert("zeta", 1);
        m.insert("alpha", 2);
        m.insert("mid", 3);
        assert_eq!(canonical_json(&m).unwrap(), r#"{"alpha":2,"mid":3,"zeta":1}"#);
    }

    #[test]
    fn preimage_concatenates_fields_in_order() {
        let p = block_hash_preimage(7, "ab", 10, 9, "", "payload", None, None);
        assert_eq!(p, "7ab109payload");
        let rewarded = block_hash_preimage(7, "ab", 10, 9, "", "payload", Some(3), Some("w"));
        assert_eq!(rewarded, "7ab109payload\0fee=3\0wallet=w");
    }
}
