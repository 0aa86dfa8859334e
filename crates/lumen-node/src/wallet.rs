//! Node key material on disk.

use std::fs;
use std::path::Path;

use anyhow::Context;
use lumen_core::{now_ms, CoreError, Cryptography, KeyPair, Payload, Transaction, WalletRegister};
use serde::{Deserialize, Serialize};
use tracing::info;

/// File holding the node wallet.
pub const WALLET_FILE: &str = "wallet.json";

/// File holding the keyring private keys this node emitted.
pub const KEYRING_KEYS_FILE: &str = "keyringKeys.json";

/// The node's own account.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeWallet {
    /// Account address.
    pub id: String,
    /// Signing keys.
    pub keys: KeyPair,
}

impl NodeWallet {
    /// Fresh wallet whose address is the hash of its public key.
    pub fn generate(crypto: &dyn Cryptography) -> Self {
        let keys = crypto.generate_key_pair();
        let id = crypto.hash(keys.public.as_bytes());
        Self { id, keys }
    }

    /// Load the wallet at `path`, creating and saving one if missing.
    pub fn load_or_create(path: &Path, crypto: &dyn Cryptography) -> anyhow::Result<Self> {
        if path.exists() {
            return read_json(path);
        }
        let wallet = Self::generate(crypto);
        write_json(path, &wallet)?;
        info!(target: "lumen::init", id = %wallet.id, "Wallet created");
        Ok(wallet)
    }

    /// Registration payload for this account.
    pub fn registration(&self, crypto: &dyn Cryptography) -> Result<Payload, CoreError> {
        Ok(Payload::WalletRegister(WalletRegister::signed(
            crypto,
            self.id.clone(),
            &self.keys,
        )?))
    }

    /// Signed transfer of `amount` to `to`, released at `from_timestamp`.
    pub fn transfer(
        &self,
        crypto: &dyn Cryptography,
        to: &str,
        amount: u64,
        from_timestamp: u64,
    ) -> Result<Payload, CoreError> {
        let now = now_ms();
        Ok(Payload::Transaction(Transaction::signed(
            crypto,
            &self.keys,
            self.id.clone(),
            to,
            amount,
            now,
            from_timestamp.max(now),
        )?))
    }
}

/// Keyring keys saved by [`save_keyring_keys`], empty if none.
pub fn load_keyring_keys(path: &Path) -> anyhow::Result<Vec<KeyPair>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    read_json(path)
}

/// Persist emitted keyring keys.
pub fn save_keyring_keys(path: &Path, keys: &[KeyPair]) -> anyhow::Result<()> {
    write_json(path, &keys)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let raw = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, raw).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::DefaultCryptography;

    #[test]
    fn wallet_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WALLET_FILE);
        let a = NodeWallet::load_or_create(&path, &DefaultCryptography).unwrap();
        let b = NodeWallet::load_or_create(&path, &DefaultCryptography).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.keys, b.keys);
    }

    #[test]
    fn transfer_is_signed_by_the_wallet_key() {
        let c = DefaultCryptography;
        let w = NodeWallet::generate(&c);
        let Payload::Transaction(tx) = w.transfer(&c, "dest", 10, 0).unwrap() else {
            panic!("not a transaction");
        };
        assert_eq!(tx.from, w.id);
        assert!(tx.from_timestamp >= tx.timestamp);
        assert!(c.verify(tx.signing_data().as_bytes(), &tx.sign, &w.keys.public));
    }

    #[test]
    fn keyring_keys_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEYRING_KEYS_FILE);
        assert!(load_keyring_keys(&path).unwrap().is_empty());
        let keys = vec![DefaultCryptography.generate_key_pair()];
        save_keyring_keys(&path, &keys).unwrap();
        assert_eq!(load_keyring_keys(&path).unwrap(), keys);
    }
}
