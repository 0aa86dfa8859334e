//! Block handler: applies block payloads to derived state.
//!
//! Handling never fails because of payload content. Bad payloads are logged
//! and reported as [`HandleOutcome::Rejected`] or [`HandleOutcome::Skipped`];
//! only storage failures surface as errors.

use std::sync::Arc;

use hashbrown::HashMap;
use lumen_core::{Block, Cryptography, Keyring, Payload, PayloadError, Transaction, WalletRegister};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{StateError, StoreError, TxError};
use crate::wallets::{DeferredCredit, Wallet, WalletStore};

/// Extension handler for a payload type (key operations, contract blocks).
pub trait PayloadHook: Send + Sync {
    /// Apply `body` (the decoded `data` of `block`); an error is logged as a rejection.
    fn handle(&self, block: &Block, body: &Value) -> Result<(), String>;
}

/// Result of handling one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The payload changed derived state.
    Applied,
    /// The payload was refused; balances are unchanged.
    Rejected(String),
    /// Nothing to apply (heartbeat, non-JSON data, unclaimed type).
    Skipped,
}

/// Handler settings.
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    /// Height at which the keyring is accepted.
    pub key_emission_max_block: u64,
    /// Log unclaimed payload types.
    pub verbose: bool,
    /// This node's public key, for the trusted-node notice.
    pub local_public_key: Option<String>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            key_emission_max_block: lumen_core::KEY_EMISSION_MAX_BLOCK,
            verbose: false,
            local_public_key: None,
        }
    }
}

/// Dispatches blocks by payload type and mutates the wallet store.
pub struct BlockHandler {
    wallets: WalletStore,
    crypto: Arc<dyn Cryptography>,
    keyring: Vec<String>,
    hooks: HashMap<String, Arc<dyn PayloadHook>>,
    config: HandlerConfig,
}

impl BlockHandler {
    /// Build a handler, loading any persisted keyring.
    pub fn new(
        wallets: WalletStore,
        crypto: Arc<dyn Cryptography>,
        config: HandlerConfig,
    ) -> Result<Self, StoreError> {
        let keyring = wallets.keyring()?;
        Ok(Self {
            wallets,
            crypto,
            keyring,
            hooks: HashMap::new(),
            config,
        })
    }

    /// Route payloads tagged `kind` to `hook`.
    pub fn register_hook(&mut self, kind: impl Into<String>, hook: Arc<dyn PayloadHook>) {
        self.hooks.insert(kind.into(), hook);
    }

    /// Current keyring.
    pub fn keyring(&self) -> &[String] {
        &self.keyring
    }

    /// Whether `key` is in the keyring.
    pub fn is_key_from_keyring(&self, key: &str) -> bool {
        self.keyring.iter().any(|k| k == key)
    }

    /// Read access to balances.
    pub fn wallets(&self) -> &WalletStore {
        &self.wallets
    }

    /// Keyring activation height.
    pub fn key_emission_max_block(&self) -> u64 {
        self.config.key_emission_max_block
    }

    /// Drop all derived state ahead of a full replay.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        self.wallets.clear()?;
        self.keyring.clear();
        Ok(())
    }

    /// Single transfer-trust rule shared by the self-transfer and funds checks:
    /// below the keyring height anyone may emit, afterwards keyring keys only.
    pub fn is_emission_allowed(&self, height: u64, signer: &str) -> bool {
        height < self.config.key_emission_max_block || self.is_key_from_keyring(signer)
    }

    /// Apply one block.
    pub fn handle_block(&mut self, block: &Block) -> Result<HandleOutcome, StateError> {
        self.release_due_credits(block)?;
        self.credit_block_fee(block)?;

        let outcome = match Payload::decode(&block.data) {
            Ok(payload) => self.dispatch(payload, block)?,
            Err(PayloadError::NotJson) | Err(PayloadError::Untyped) => {
                debug!(index = block.index, "Not JSON block");
                HandleOutcome::Skipped
            }
            Err(PayloadError::Unknown(kind)) => self.run_hook(&kind, block),
            Err(e) => {
                warn!(index = block.index, "{e}");
                HandleOutcome::Rejected(e.to_string())
            }
        };

        if block.index == self.config.key_emission_max_block {
            if self.keyring.is_empty() {
                warn!("Network without keyring");
            }
            if let Some(key) = &self.config.local_public_key {
                if self.is_key_from_keyring(key) {
                    warn!("TRUSTED NODE. BE CAREFUL.");
                }
            }
        }
        Ok(outcome)
    }

    fn dispatch(&mut self, payload: Payload, block: &Block) -> Result<HandleOutcome, StoreError> {
        match payload {
            Payload::WalletRegister(reg) => self.handle_wallet_block(&reg, block),
            Payload::Transaction(tx) => match self.handle_transaction(&tx, block) {
                Ok(()) => Ok(HandleOutcome::Applied),
                Err(TxError::Storage(e)) => Err(StoreError::Backend(e)),
                Err(e) => {
                    info!(index = block.index, "Transaction rejected: {e}");
                    Ok(HandleOutcome::Rejected(e.to_string()))
                }
            },
            Payload::Keyring(keyring) => self.handle_keyring(&keyring, block),
            Payload::Empty(_) => Ok(HandleOutcome::Skipped),
            other => Ok(self.run_hook(other.kind(), block)),
        }
    }

    fn handle_wallet_block(
        &mut self,
        reg: &WalletRegister,
        block: &Block,
    ) -> Result<HandleOutcome, StoreError> {
        if !self
            .crypto
            .verify(reg.signing_data().as_bytes(), &reg.sign, &reg.pubkey)
        {
            warn!(index = block.index, id = %reg.id, "Fake wallet registration");
            return Ok(HandleOutcome::Rejected("fake wallet registration".into()));
        }
        if self.wallets.contains(&reg.id)? {
            warn!(id = %reg.id, "Wallet already registered");
            return Ok(HandleOutcome::Rejected("duplicate wallet".into()));
        }
        self.wallets.put(&Wallet {
            id: reg.id.clone(),
            balance: 0,
            block: block.index,
            public_key: reg.pubkey.clone(),
        })?;
        debug!(id = %reg.id, index = block.index, "wallet registered");
        Ok(HandleOutcome::Applied)
    }

    /// Validate and apply a transfer carried by `block`.
    ///
    /// Receiver credits whose `fromTimestamp` is after the block timestamp are
    /// withheld and released by the first later block timestamped at or after
    /// activation.
    pub fn handle_transaction(&mut self, tx: &Transaction, block: &Block) -> Result<(), TxError> {
        if tx.amount == 0 {
            return Err(TxError::NonPositiveAmount);
        }
        let self_transfer = tx.from == tx.to;
        if self_transfer && !self.is_emission_allowed(block.index, &tx.pubkey) {
            return Err(TxError::Selfie);
        }
        if self.wallets.tx_mutex_taken(tx.timestamp)? {
            return Err(TxError::Clone);
        }
        // Claimed before the remaining checks: a refused transaction stays
        // refused on every later replay.
        self.wallets.take_tx_mutex(tx.timestamp)?;

        let signed = tx.signing_data();
        if !self.crypto.verify(signed.as_bytes(), &tx.sign, &tx.pubkey) {
            return Err(TxError::FakeSignature);
        }
        let mut sender = self.wallets.get(&tx.from)?.ok_or(TxError::SenderNotFound)?;
        if !self
            .crypto
            .verify(signed.as_bytes(), &tx.sign, &sender.public_key)
        {
            return Err(TxError::FakeSender);
        }

        let emission = self.is_emission_allowed(block.index, &sender.public_key);
        if sender.balance < tx.amount && !emission {
            return Err(TxError::InsufficientFunds);
        }
        let receiver = if self_transfer {
            None
        } else {
            Some(self.wallets.get(&tx.to)?.ok_or(TxError::RecipientNotFound)?)
        };

        let delayed = tx.from_timestamp > block.timestamp;
        match receiver {
            None => {
                if delayed {
                    self.defer_credit(tx)?;
                } else {
                    sender.balance = sender.balance.checked_add(tx.amount).ok_or(TxError::Overflow)?;
                }
                self.wallets.put(&sender)?;
            }
            Some(mut receiver) => {
                if block.index >= self.config.key_emission_max_block {
                    // Emission covers any shortfall of a trusted sender.
                    sender.balance = sender.balance.saturating_sub(tx.amount);
                }
                if delayed {
                    self.defer_credit(tx)?;
                } else {
                    receiver.balance =
                        receiver.balance.checked_add(tx.amount).ok_or(TxError::Overflow)?;
                }
                self.wallets.put(&sender)?;
                self.wallets.put(&receiver)?;
            }
        }
        Ok(())
    }

    fn defer_credit(&self, tx: &Transaction) -> Result<(), StoreError> {
        debug!(to = %tx.to, activates_at = tx.from_timestamp, "credit withheld");
        self.wallets.defer(
            tx.timestamp,
            &DeferredCredit {
                to: tx.to.clone(),
                amount: tx.amount,
                activates_at: tx.from_timestamp,
            },
        )
    }

    fn release_due_credits(&self, block: &Block) -> Result<(), StoreError> {
        for credit in self.wallets.take_due_credits(block.timestamp)? {
            let Some(mut wallet) = self.wallets.get(&credit.to)? else {
                warn!(to = %credit.to, "withheld credit for unknown wallet dropped");
                continue;
            };
            wallet.balance = wallet.balance.saturating_add(credit.amount);
            self.wallets.put(&wallet)?;
        }
        Ok(())
    }

    fn credit_block_fee(&self, block: &Block) -> Result<(), StoreError> {
        let (Some(fee), Some(owner)) = (block.fee, block.wallet.as_deref()) else {
            return Ok(());
        };
        if fee == 0 {
            return Ok(());
        }
        match self.wallets.get(owner)? {
            Some(mut wallet) => {
                wallet.balance = wallet.balance.saturating_add(fee);
                self.wallets.put(&wallet)
            }
            None => {
                debug!(owner, "fee owner not registered");
                Ok(())
            }
        }
    }

    fn handle_keyring(
        &mut self,
        keyring: &Keyring,
        block: &Block,
    ) -> Result<HandleOutcome, StoreError> {
        if block.index != self.config.key_emission_max_block || !self.keyring.is_empty() {
            warn!(index = block.index, "Fake keyring in block");
            return Ok(HandleOutcome::Rejected("fake keyring".into()));
        }
        self.keyring = keyring.keys.clone();
        self.wallets.set_keyring(&self.keyring)?;
        info!(index = block.index, keys = self.keyring.len(), "Keyring received");
        Ok(HandleOutcome::Applied)
    }

    fn run_hook(&self, kind: &str, block: &Block) -> HandleOutcome {
        let Some(hook) = self.hooks.get(kind) else {
            if self.config.verbose {
                info!(index = block.index, kind, "Unknown block type");
            }
            return HandleOutcome::Skipped;
        };
        let body: Value = match serde_json::from_str(&block.data) {
            Ok(v) => v,
            Err(e) => return HandleOutcome::Rejected(e.to_string()),
        };
        match hook.handle(block, &body) {
            Ok(()) => HandleOutcome::Applied,
            Err(e) => {
                warn!(index = block.index, kind, "{e}");
                HandleOutcome::Rejected(e)
            }
        }
    }
}
