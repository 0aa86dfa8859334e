// Consensus-critical. Changes require a protocol version bump + tests.
//! KeyPoA: key-store proof of authority.
//!
//! Blocks are valid when signed by any key in a locally persisted key store.
//! The store changes through `KO-KEY-ISSUE` / `KO-KEY-DELETE` payloads, which
//! take effect only when the carrying block is signed by an Admin key.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use lumen_core::{Block, Cryptography, KeyDelete, KeyIssue, KeyRole, Payload};
use lumen_state::{KeyValueStore, PayloadHook, StoreError};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::ConsensusError;
use crate::strategy::{
    CancelPredicate, ConsensusStrategy, EmptyBlockSwitch, GenerationContext, ValidationContext,
    Verdict,
};
use crate::validate::{check_hash, check_no_reward, check_signed_successor};

const KEY_PREFIX: &[u8] = b"key/";

fn role_byte(role: KeyRole) -> u8 {
    match role {
        KeyRole::Admin => 1,
        KeyRole::System => 0,
    }
}

/// Persisted `{public key -> role}` map.
pub struct KeyStorage {
    kv: Box<dyn KeyValueStore>,
    keys: RwLock<HashMap<String, KeyRole>>,
}

impl KeyStorage {
    /// Load the store and seed it with `admins`.
    pub fn open(kv: Box<dyn KeyValueStore>, admins: &[String]) -> Result<Self, StoreError> {
        let mut keys = HashMap::new();
        for (k, v) in kv.scan_prefix(KEY_PREFIX)? {
            let key = String::from_utf8_lossy(&k[KEY_PREFIX.len()..]).into_owned();
            let role = if v.first() == Some(&1) { KeyRole::Admin } else { KeyRole::System };
            keys.insert(key, role);
        }
        if keys.is_empty() && admins.is_empty() {
            warn!("Key storage is empty");
        }
        let store = Self {
            kv,
            keys: RwLock::new(keys),
        };
        for admin in admins {
            store.keys.write().insert(admin.clone(), KeyRole::Admin);
            store.persist(admin, KeyRole::Admin)?;
        }
        Ok(store)
    }

    fn persist(&self, key: &str, role: KeyRole) -> Result<(), StoreError> {
        self.kv
            .put(&[KEY_PREFIX, key.as_bytes()].concat(), &[role_byte(role)])
    }

    /// Whether `key` is known.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.read().contains_key(key)
    }

    /// Role of `key`.
    pub fn role(&self, key: &str) -> Option<KeyRole> {
        self.keys.read().get(key).copied()
    }

    /// Add `key` unless it is already present.
    pub fn save_key(&self, key: &str, role: KeyRole) -> Result<(), StoreError> {
        if self.contains(key) {
            return Ok(());
        }
        self.keys.write().insert(key.to_string(), role);
        self.persist(key, role)
    }

    /// Remove `key`.
    pub fn delete_key(&self, key: &str) -> Result<(), StoreError> {
        self.keys.write().remove(key);
        self.kv.del(&[KEY_PREFIX, key.as_bytes()].concat())
    }

    /// Snapshot of all keys.
    pub fn keys(&self) -> Vec<(String, KeyRole)> {
        let mut out: Vec<_> = self.keys.read().iter().map(|(k, r)| (k.clone(), *r)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Whether `block` is signed by any stored key.
    pub fn is_signed_by_any(&self, crypto: &dyn Cryptography, block: &Block) -> bool {
        self.keys.read().keys().any(|k| block.is_signed_by(crypto, k))
    }

    /// Whether `block` is signed by an Admin key.
    pub fn is_signed_by_admin(&self, crypto: &dyn Cryptography, block: &Block) -> bool {
        self.keys
            .read()
            .iter()
            .any(|(k, r)| *r == KeyRole::Admin && block.is_signed_by(crypto, k))
    }
}

/// Key-store signature validator.
pub struct KeyPoa {
    storage: Arc<KeyStorage>,
    empty_blocks: EmptyBlockSwitch,
}

impl KeyPoa {
    /// Validator backed by `storage`.
    pub fn new(storage: Arc<KeyStorage>) -> Self {
        info!("KeyPoA validator loaded");
        Self {
            storage,
            empty_blocks: EmptyBlockSwitch::new(true),
        }
    }

    /// Shared key store.
    pub fn storage(&self) -> &Arc<KeyStorage> {
        &self.storage
    }

    /// Block handler hook applying key operations.
    pub fn hook(&self, crypto: Arc<dyn Cryptography>) -> Arc<dyn PayloadHook> {
        Arc::new(KeyOperationHook {
            storage: self.storage.clone(),
            crypto,
        })
    }

    fn signer_in_storage(&self, gen: &GenerationContext) -> bool {
        gen.signer
            .as_ref()
            .map_or(false, |k| self.storage.contains(&k.public))
    }

    /// Build an admin-signed block issuing `public_key`.
    pub fn issue_key(
        &self,
        gen: &GenerationContext,
        public_key: &str,
        role: KeyRole,
    ) -> Result<Block, ConsensusError> {
        self.key_operation(
            gen,
            Payload::KeyIssue(KeyIssue {
                public_key: public_key.to_string(),
                key_type: role,
            }),
        )
    }

    /// Build an admin-signed block deleting `public_key`.
    pub fn delete_key(&self, gen: &GenerationContext, public_key: &str) -> Result<Block, ConsensusError> {
        self.key_operation(
            gen,
            Payload::KeyDelete(KeyDelete {
                public_key: public_key.to_string(),
            }),
        )
    }

    fn key_operation(&self, gen: &GenerationContext, payload: Payload) -> Result<Block, ConsensusError> {
        if !self.is_ready(gen) {
            return Err(ConsensusError::NotReady);
        }
        let block = gen.signed_block(&payload.encode()?, None)?;
        if !self.storage.is_signed_by_admin(gen.crypto.as_ref(), &block) {
            return Err(ConsensusError::NotAdmin);
        }
        Ok(block)
    }
}

#[async_trait]
impl ConsensusStrategy for KeyPoa {
    fn name(&self) -> &'static str {
        "KeyPoA"
    }

    fn is_valid_new_block(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> Verdict {
        if let Err(reason) = check_signed_successor(new, prev)
            .and_then(|_| check_hash(ctx.crypto, new))
            .and_then(|_| check_no_reward(new))
        {
            error!(index = new.index, "KeyPoA: {reason}");
            return Verdict::Pass;
        }
        if !new.is_signed() {
            return Verdict::Pass;
        }
        if self.storage.is_signed_by_any(ctx.crypto, new) {
            return Verdict::Accept;
        }
        error!(index = new.index, "Fake signed block");
        Verdict::Pass
    }

    fn is_valid_hash(&self, _ctx: &ValidationContext<'_>, _hash: &str) -> bool {
        true
    }

    fn is_ready(&self, gen: &GenerationContext) -> bool {
        self.signer_in_storage(gen)
    }

    async fn generate_next_block(
        &self,
        gen: &GenerationContext,
        data: String,
        _cancel: CancelPredicate,
    ) -> Result<Option<Block>, ConsensusError> {
        gen.signed_block(&data, None).map(Some)
    }

    fn empty_block_due(&self, gen: &GenerationContext) -> bool {
        if !self.generates_empty_blocks() {
            return false;
        }
        if !self.signer_in_storage(gen) {
            info!("KeyPoA: we can't generate empty blocks");
            self.set_generate_empty_blocks(false);
            return false;
        }
        gen.head_age_ms()
            .map_or(false, |age| age > gen.empty_block_delay_ms)
    }

    fn set_generate_empty_blocks(&self, generate: bool) {
        self.empty_blocks.set(generate);
    }

    fn generates_empty_blocks(&self) -> bool {
        self.empty_blocks.get()
    }
}

struct KeyOperationHook {
    storage: Arc<KeyStorage>,
    crypto: Arc<dyn Cryptography>,
}

impl PayloadHook for KeyOperationHook {
    fn handle(&self, block: &Block, body: &Value) -> Result<(), String> {
        if !self.storage.is_signed_by_admin(self.crypto.as_ref(), block) {
            return Err(format!("invalid key operation block sign in {}", block.index));
        }
        let payload: Payload = serde_json::from_value(body.clone()).map_err(|e| e.to_string())?;
        let result = match payload {
            Payload::KeyIssue(issue) => self.storage.save_key(&issue.public_key, issue.key_type),
            Payload::KeyDelete(delete) => self.storage.delete_key(&delete.public_key),
            other => return Err(format!("not a key operation: {}", other.kind())),
        };
        result.map_err(|e| e.to_string())
    }
}
