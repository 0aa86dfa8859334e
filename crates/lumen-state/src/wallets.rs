//! Wallet/account accumulator.
//!
//! Derived state only: every record here is rebuilt by replaying the chain.
//! Besides wallet records the store holds the transaction duplicate
//! markers, withheld (delayed) credits and the network keyring, so clearing
//! it resets all derived state at once.

use borsh::{BorshDeserialize, BorshSerialize};
use lumen_core::{from_bytes, to_bytes};

use crate::error::StoreError;
use crate::kv::KeyValueStore;

const WALLET_PREFIX: &[u8] = b"wallet/";
const TX_MUTEX_PREFIX: &[u8] = b"transmutex/";
const DEFERRED_PREFIX: &[u8] = b"deferred/";
const KEY_KEYRING: &[u8] = b"keyring";

/// Account record.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Wallet {
    /// Address.
    pub id: String,
    /// Balance in fixed-point units.
    pub balance: u64,
    /// Height of the registering block.
    pub block: u64,
    /// Registered verification key.
    pub public_key: String,
}

/// Receiver credit withheld until a block at or after `activates_at`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct DeferredCredit {
    /// Receiver address.
    pub to: String,
    /// Amount to credit.
    pub amount: u64,
    /// Activation time (the transaction's `fromTimestamp`).
    pub activates_at: u64,
}

/// Derived balances keyed by address.
pub struct WalletStore {
    kv: Box<dyn KeyValueStore>,
}

fn wallet_key(id: &str) -> Vec<u8> {
    [WALLET_PREFIX, id.as_bytes()].concat()
}

impl WalletStore {
    /// Wrap a store.
    pub fn new(kv: Box<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Wallet by address.
    pub fn get(&self, id: &str) -> Result<Option<Wallet>, StoreError> {
        match self.kv.get(&wallet_key(id))? {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert or overwrite a wallet.
    pub fn put(&self, wallet: &Wallet) -> Result<(), StoreError> {
        self.kv.put(&wallet_key(&wallet.id), &to_bytes(wallet)?)
    }

    /// Whether the address is registered.
    pub fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.kv.get(&wallet_key(id))?.is_some())
    }

    /// All wallets, ascending by address.
    pub fn all(&self) -> Result<Vec<Wallet>, StoreError> {
        self.kv
            .scan_prefix(WALLET_PREFIX)?
            .into_iter()
            .map(|(_, v)| from_bytes(&v).map_err(StoreError::from))
            .collect()
    }

    /// Whether a transaction with `timestamp` was already processed.
    pub fn tx_mutex_taken(&self, timestamp: u64) -> Result<bool, StoreError> {
        Ok(self.kv.get(&Self::tx_mutex_key(timestamp))?.is_some())
    }

    /// Claim the duplicate marker for `timestamp`.
    pub fn take_tx_mutex(&self, timestamp: u64) -> Result<(), StoreError> {
        self.kv.put(&Self::tx_mutex_key(timestamp), &[1])
    }

    fn tx_mutex_key(timestamp: u64) -> Vec<u8> {
        [TX_MUTEX_PREFIX, &timestamp.to_be_bytes()].concat()
    }

    /// Withhold a credit until `credit.activates_at`.
    pub fn defer(&self, tx_timestamp: u64, credit: &DeferredCredit) -> Result<(), StoreError> {
        let key = [
            DEFERRED_PREFIX,
            &credit.activates_at.to_be_bytes(),
            &tx_timestamp.to_be_bytes(),
        ]
        .concat();
        self.kv.put(&key, &to_bytes(credit)?)
    }

    /// Remove and return withheld credits active at `at`, oldest first.
    pub fn take_due_credits(&self, at: u64) -> Result<Vec<DeferredCredit>, StoreError> {
        let mut due = Vec::new();
        for (key, value) in self.kv.scan_prefix(DEFERRED_PREFIX)? {
            let credit: DeferredCredit = from_bytes(&value)?;
            if credit.activates_at > at {
                break;
            }
            self.kv.del(&key)?;
            due.push(credit);
        }
        Ok(due)
    }

    /// Persisted keyring, empty if none was accepted.
    pub fn keyring(&self) -> Result<Vec<String>, StoreError> {
        match self.kv.get(KEY_KEYRING)? {
            Some(bytes) => Ok(from_bytes(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Persist the keyring.
    pub fn set_keyring(&self, keys: &[String]) -> Result<(), StoreError> {
        self.kv.put(KEY_KEYRING, &to_bytes(&keys.to_vec())?)
    }

    /// Drop all derived state.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.kv.clear()
    }

    /// Flush the backend.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.kv.flush()
    }
}
