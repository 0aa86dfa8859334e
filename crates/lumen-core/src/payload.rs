// Consensus-critical. Changes require a protocol version bump + tests.
//! Block payloads.
//!
//! A block's `data` string is the canonical JSON of one [`Payload`], tagged by
//! its `type` field. Payload types outside this enum are decoded as
//! [`PayloadError::Unknown`] so extension hooks can claim them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{Cryptography, KeyPair};
use crate::serialization::canonical_json;
use crate::types::CoreError;

/// Tag of wallet registration payloads.
pub const WALLET_REGISTER: &str = "WalletRegister";
/// Tag of transfer payloads.
pub const TRANSACTION: &str = "Transaction";
/// Tag of keyring payloads.
pub const KEYRING: &str = "Keyring";
/// Tag of key-issue payloads.
pub const KEY_ISSUE: &str = "KO-KEY-ISSUE";
/// Tag of key-delete payloads.
pub const KEY_DELETE: &str = "KO-KEY-DELETE";
/// Tag of contract deployment payloads.
pub const CONTRACT_DEPLOY: &str = "EcmaContractDeploy";
/// Tag of contract call payloads.
pub const CONTRACT_CALL: &str = "EcmaContractCallBlock";
/// Tag of heartbeat payloads.
pub const EMPTY: &str = "Empty";

const KNOWN_TYPES: [&str; 8] = [
    WALLET_REGISTER,
    TRANSACTION,
    KEYRING,
    KEY_ISSUE,
    KEY_DELETE,
    CONTRACT_DEPLOY,
    CONTRACT_CALL,
    EMPTY,
];

/// Errors decoding a block's payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    /// `data` is not a JSON object.
    #[error("not a JSON block")]
    NotJson,

    /// JSON object without a string `type`.
    #[error("payload has no type")]
    Untyped,

    /// Well-formed JSON with a type this crate does not model.
    #[error("unknown payload type {0}")]
    Unknown(String),

    /// A known type whose body does not match its schema.
    #[error("malformed {kind} payload: {reason}")]
    Malformed {
        /// Payload type tag.
        kind: String,
        /// Decoder message.
        reason: String,
    },
}

/// Decoded block payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Create an account record.
    #[serde(rename = "WalletRegister")]
    WalletRegister(WalletRegister),
    /// Move balance between accounts.
    #[serde(rename = "Transaction")]
    Transaction(Transaction),
    /// One-time trusted key list.
    #[serde(rename = "Keyring")]
    Keyring(Keyring),
    /// Add a key to the KeyPoA key store.
    #[serde(rename = "KO-KEY-ISSUE")]
    KeyIssue(KeyIssue),
    /// Remove a key from the KeyPoA key store.
    #[serde(rename = "KO-KEY-DELETE")]
    KeyDelete(KeyDelete),
    /// Deploy a contract (executed outside the chain engine).
    #[serde(rename = "EcmaContractDeploy")]
    ContractDeploy(ContractDeploy),
    /// Call a contract (executed outside the chain engine).
    #[serde(rename = "EcmaContractCallBlock")]
    ContractCall(ContractCall),
    /// Heartbeat block with no state effect.
    #[serde(rename = "Empty")]
    Empty(Empty),
}

impl Payload {
    /// Decode a block's `data` string.
    pub fn decode(data: &str) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_str(data).map_err(|_| PayloadError::NotJson)?;
        if !value.is_object() {
            return Err(PayloadError::NotJson);
        }
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(PayloadError::Untyped)?
            .to_string();
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(PayloadError::Unknown(kind));
        }
        serde_json::from_value(value).map_err(|e| PayloadError::Malformed {
            kind,
            reason: e.to_string(),
        })
    }

    /// Canonical `data` string for a block carrying this payload.
    pub fn encode(&self) -> Result<String, CoreError> {
        canonical_json(self)
    }

    /// The `type` tag of this payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::WalletRegister(_) => WALLET_REGISTER,
            Payload::Transaction(_) => TRANSACTION,
            Payload::Keyring(_) => KEYRING,
            Payload::KeyIssue(_) => KEY_ISSUE,
            Payload::KeyDelete(_) => KEY_DELETE,
            Payload::ContractDeploy(_) => CONTRACT_DEPLOY,
            Payload::ContractCall(_) => CONTRACT_CALL,
            Payload::Empty(_) => EMPTY,
        }
    }
}

/// Wallet registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRegister {
    /// New wallet address.
    pub id: String,
    /// Signature over [`WalletRegister::signing_data`].
    pub sign: String,
    /// Verification key of the wallet.
    pub pubkey: String,
}

impl WalletRegister {
    /// Build and sign a registration.
    pub fn signed(
        crypto: &dyn Cryptography,
        id: impl Into<String>,
        keys: &KeyPair,
    ) -> Result<Self, CoreError> {
        let id = id.into();
        let sign = crypto.sign(Self::signing_data_for(&id).as_bytes(), &keys.private)?;
        Ok(Self {
            id,
            sign,
            pubkey: keys.public.clone(),
        })
    }

    /// Bytes covered by the registration signature.
    pub fn signing_data(&self) -> String {
        Self::signing_data_for(&self.id)
    }

    fn signing_data_for(id: &str) -> String {
        format!("{WALLET_REGISTER}{id}")
    }
}

/// Signed transfer intent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Sender address.
    pub from: String,
    /// Receiver address.
    pub to: String,
    /// Amount in fixed-point units.
    pub amount: u64,
    /// Creation time; also the duplicate-detection key.
    pub timestamp: u64,
    /// Earliest activation time of the receiver credit.
    pub from_timestamp: u64,
    /// Signature over [`Transaction::signing_data`].
    pub sign: String,
    /// Key the sender signed with.
    pub pubkey: String,
}

impl Transaction {
    /// Build and sign a transfer.
    pub fn signed(
        crypto: &dyn Cryptography,
        keys: &KeyPair,
        from: impl Into<String>,
        to: impl Into<String>,
        amount: u64,
        timestamp: u64,
        from_timestamp: u64,
    ) -> Result<Self, CoreError> {
        let mut tx = Self {
            from: from.into(),
            to: to.into(),
            amount,
            timestamp,
            from_timestamp,
            sign: String::new(),
            pubkey: keys.public.clone(),
        };
        tx.sign = crypto.sign(tx.signing_data().as_bytes(), &keys.private)?;
        Ok(tx)
    }

    /// Bytes covered by the transfer signature.
    pub fn signing_data(&self) -> String {
        format!(
            "{TRANSACTION}{}{}{}{}{}",
            self.from, self.to, self.amount, self.timestamp, self.from_timestamp
        )
    }
}

/// Trusted key list published once per network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyring {
    /// Trusted public keys.
    pub keys: Vec<String>,
    /// Address of the node that emitted the keyring.
    #[serde(default)]
    pub initiator: String,
}

/// Role of a KeyPoA key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyRole {
    /// May sign key operations.
    Admin,
    /// May sign blocks only.
    System,
}

/// Add a key to the KeyPoA key store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyIssue {
    /// Key being issued.
    pub public_key: String,
    /// Role granted.
    #[serde(default = "default_role")]
    pub key_type: KeyRole,
}

fn default_role() -> KeyRole {
    KeyRole::System
}

/// Remove a key from the KeyPoA key store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDelete {
    /// Key being removed.
    pub public_key: String,
}

/// Contract deployment; opaque to the chain engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDeploy {
    /// Contract source.
    pub ecma_code: String,
    /// Initial contract state.
    #[serde(default)]
    pub state: Value,
    /// Deployer signature.
    #[serde(default)]
    pub sign: String,
    /// Deployer key.
    #[serde(default)]
    pub pubkey: String,
}

/// Contract call; opaque to the chain engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractCall {
    /// Contract address.
    pub address: String,
    /// Method name.
    pub method: String,
    /// Call arguments.
    #[serde(default)]
    pub args: Value,
    /// Caller state.
    #[serde(default)]
    pub state: Value,
    /// Caller signature.
    #[serde(default)]
    pub sign: String,
    /// Caller key.
    #[serde(default)]
    pub pubkey: String,
}

/// Heartbeat payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DefaultCryptography;

    #[test]
    fn decode_distinguishes_failure_kinds() {
        assert_eq!(
            Payload::decode("New epoch begins here!"),
            Err(PayloadError::NotJson)
        );
        assert_eq!(Payload::decode("[1,2]"), Err(PayloadError::NotJson));
        assert_eq!(Payload::decode(r#"{"a":1}"#), Err(PayloadError::Untyped));
        assert_eq!(
            Payload::decode(r#"{"type":"VoteCast"}"#),
            Err(PayloadError::Unknown("VoteCast".into()))
        );
        assert!(matches!(
            Payload::decode(r#"{"type":"Transaction","from":"a"}"#),
            Err(PayloadError::Malformed { .. })
        ));
    }

    #[test]
    fn empty_tolerates_signable_fields() {
        let p = Payload::decode(r#"{"data":"","pubkey":"","sign":"","type":"Empty"}"#).unwrap();
        assert_eq!(p, Payload::Empty(Empty {}));
    }

    #[test]
    fn encode_is_sorted_and_tagged() {
        let p = Payload::Keyring(Keyring {
            keys: vec!["k1".into()],
            initiator: "n".into(),
        });
        assert_eq!(
            p.encode().unwrap(),
            r#"{"initiator":"n","keys":["k1"],"type":"Keyring"}"#
        );
    }

    #[test]
    fn transaction_signature_covers_fields() {
        let c = DefaultCryptography;
        let keys = c.generate_key_pair();
        let mut tx = Transaction::signed(&c, &keys, "a", "b", 10, 1_700_000_000_000, 0).unwrap();
        assert!(c.verify(tx.signing_data().as_bytes(), &tx.sign, &tx.pubkey));
        tx.amount = 11;
        assert!(!c.verify(tx.signing_data().as_bytes(), &tx.sign, &tx.pubkey));
    }

    #[test]
    fn key_issue_defaults_to_system_role() {
        let p = Payload::decode(r#"{"type":"KO-KEY-ISSUE","publicKey":"02ab"}"#).unwrap();
        assert_eq!(
            p,
            Payload::KeyIssue(KeyIssue {
                public_key: "02ab".into(),
                key_type: KeyRole::System
            })
        );
    }
}
