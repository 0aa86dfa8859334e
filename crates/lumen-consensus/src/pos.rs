// Consensus-critical. Changes require a protocol version bump + tests.
//! PoS: stake/fee validator.
//!
//! Signer registration and fee schedule live in a master contract, which is
//! outside the chain engine; [`MasterContract`] is its seam.
//! [`StaticValidatorRegistry`] is a fixed in-process registry.

use std::sync::Arc;

use async_trait::async_trait;
use lumen_core::{Block, Cryptography};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::ConsensusError;
use crate::strategy::{
    CancelPredicate, ConsensusStrategy, EmptyBlockSwitch, GenerationContext, ValidationContext,
    Verdict,
};
use crate::trusted::TRUSTED_NODES_TIMEOUT_MS;
use crate::validate::{check_hash, check_signed_successor};

/// Rollback (read-only) calls into the master contract.
pub trait MasterContract: Send + Sync {
    /// Whether `sign` over `hash` comes from a registered validator node.
    fn check_block_sign(&self, hash: &str, sign: &str) -> bool;

    /// Fee due for `block`.
    fn fee_for_block(&self, block: &Block) -> u64;
}

/// Fixed validator list with a size-proportional fee.
pub struct StaticValidatorRegistry {
    validators: Vec<String>,
    crypto: Arc<dyn Cryptography>,
    base_fee: u64,
    fee_per_byte: u64,
}

impl StaticValidatorRegistry {
    /// Registry of `validators` charging `base_fee + fee_per_byte * data.len()`.
    pub fn new(
        validators: Vec<String>,
        crypto: Arc<dyn Cryptography>,
        base_fee: u64,
        fee_per_byte: u64,
    ) -> Self {
        Self {
            validators,
            crypto,
            base_fee,
            fee_per_byte,
        }
    }
}

impl MasterContract for StaticValidatorRegistry {
    fn check_block_sign(&self, hash: &str, sign: &str) -> bool {
        self.validators
            .iter()
            .any(|k| self.crypto.verify(hash.as_bytes(), sign, k))
    }

    fn fee_for_block(&self, block: &Block) -> u64 {
        let len = u64::try_from(block.data.len()).unwrap_or(u64::MAX);
        self.base_fee
            .saturating_add(self.fee_per_byte.saturating_mul(len))
    }
}

/// Stake validator.
pub struct Pos {
    contract: Arc<dyn MasterContract>,
    owner_wallet: Option<String>,
    empty_blocks: EmptyBlockSwitch,
}

impl Pos {
    /// Validator consulting `contract`; generated blocks credit `owner_wallet`.
    pub fn new(contract: Arc<dyn MasterContract>, owner_wallet: Option<String>) -> Self {
        info!("PoS validator loaded");
        Self {
            contract,
            owner_wallet,
            empty_blocks: EmptyBlockSwitch::new(true),
        }
    }

    fn payload_field<'a>(body: &'a Option<Value>, path: &[&str]) -> Option<&'a str> {
        let mut v = body.as_ref()?;
        for p in path {
            v = v.get(p)?;
        }
        v.as_str()
    }
}

#[async_trait]
impl ConsensusStrategy for Pos {
    fn name(&self) -> &'static str {
        "PoS"
    }

    fn is_valid_new_block(&self, ctx: &ValidationContext<'_>, new: &Block, prev: &Block) -> Verdict {
        if new.previous_hash != prev.hash || new.timestamp <= prev.timestamp {
            return Verdict::Pass;
        }
        if new.timestamp - prev.timestamp < TRUSTED_NODES_TIMEOUT_MS
            && !new.is_signed()
            && new.index > ctx.key_emission_max_block
        {
            error!(index = new.index, "PoS: adding other consensus block disabled");
            return Verdict::Veto;
        }
        if let Err(reason) = check_signed_successor(new, prev).and_then(|_| check_hash(ctx.crypto, new)) {
            error!(index = new.index, "PoS: {reason}");
            return Verdict::Pass;
        }
        if !new.is_signed() {
            return Verdict::Pass;
        }
        if matches!(new.index, 1 | 2) && !new.carries_reward() {
            return Verdict::Accept;
        }

        let body: Option<Value> = serde_json::from_str(&new.data).ok();
        let registered = self.contract.check_block_sign(&new.hash, &new.sign)
            || Self::payload_field(&body, &["state", "from"])
                .map_or(false, |from| new.is_signed_by(ctx.crypto, from));
        let fee_ok = new
            .fee
            .map_or(true, |fee| fee == self.contract.fee_for_block(new));
        debug!(index = new.index, registered, fee_ok, "PoS check block");
        if registered && fee_ok {
            Verdict::Accept
        } else {
            Verdict::Pass
        }
    }

    fn is_valid_hash(&self, _ctx: &ValidationContext<'_>, _hash: &str) -> bool {
        true
    }

    fn is_ready(&self, gen: &GenerationContext) -> bool {
        gen.signer.is_some()
    }

    async fn generate_next_block(
        &self,
        gen: &GenerationContext,
        data: String,
        _cancel: CancelPredicate,
    ) -> Result<Option<Block>, ConsensusError> {
        let mut block = gen.signed_block(&data, None)?;
        let body: Option<Value> = serde_json::from_str(&data).ok();
        let wallet = Self::payload_field(&body, &["wallet"])
            .map(str::to_string)
            .or_else(|| self.owner_wallet.clone());
        if let (Some(wallet), Some(keys)) = (wallet, gen.signer.as_ref()) {
            let fee = self.contract.fee_for_block(&block);
            block.set_reward(gen.crypto.as_ref(), fee, wallet);
            block.sign_with(gen.crypto.as_ref(), &keys.private)?;
        }
        Ok(Some(block))
    }

    fn set_generate_empty_blocks(&self, generate: bool) {
        self.empty_blocks.set(generate);
    }

    fn generates_empty_blocks(&self) -> bool {
        self.empty_blocks.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining::MiningStats;
    use crate::strategy::{never_cancel, ChainView};
    use lumen_core::{now_ms, DefaultCryptography, KeyPair};

    struct Head(Block);

    impl ChainView for Head {
        fn latest_block(&self) -> Option<Block> {
            Some(self.0.clone())
        }
        fn max_block(&self) -> Option<u64> {
            Some(self.0.index)
        }
        fn keyring(&self) -> Vec<String> {
            Vec::new()
        }
        fn peer_count(&self) -> usize {
            0
        }
        fn is_syncing(&self) -> bool {
            false
        }
        fn genesis_hash(&self) -> String {
            String::new()
        }
    }

    fn gen(head: &Block, signer: &KeyPair) -> GenerationContext {
        GenerationContext {
            view: Arc::new(Head(head.clone())),
            crypto: Arc::new(DefaultCryptography),
            signer: Some(signer.clone()),
            mining: Arc::new(MiningStats::new()),
            empty_block_delay_ms: 300_000,
        }
    }

    fn pos(validators: &[&KeyPair]) -> Pos {
        let registry = StaticValidatorRegistry::new(
            validators.iter().map(|k| k.public.clone()).collect(),
            Arc::new(DefaultCryptography),
            10,
            1,
        );
        Pos::new(Arc::new(registry), Some("owner".into()))
    }

    fn head(index: u64) -> Block {
        let ts = now_ms() - 10_000;
        Block::new(&DefaultCryptography, index, "p", ts, ts, "{}")
    }

    #[tokio::test]
    async fn registered_signer_with_matching_fee_is_accepted() {
        let node = DefaultCryptography.generate_key_pair();
        let v = pos(&[&node]);
        let prev = head(9);
        let block = v
            .generate_next_block(&gen(&prev, &node), "{\"type\":\"Empty\"}".into(), never_cancel())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.wallet.as_deref(), Some("owner"));
        assert_eq!(block.fee, Some(10 + block.data.len() as u64));
        let ctx = ValidationContext::new(&DefaultCryptography, &[], "genesis");
        assert_eq!(v.is_valid_new_block(&ctx, &block, &prev), Verdict::Accept);

        let mut overcharged = block.clone();
        overcharged.fee = Some(1_000);
        assert_eq!(v.is_valid_new_block(&ctx, &overcharged, &prev), Verdict::Pass);
    }

    #[tokio::test]
    async fn unregistered_signer_passes_except_at_heights_one_and_two() {
        let node = DefaultCryptography.generate_key_pair();
        let outsider = DefaultCryptography.generate_key_pair();
        let v = pos(&[&node]);
        let ctx = ValidationContext::new(&DefaultCryptography, &[], "genesis");

        let prev = head(9);
        let block = gen(&prev, &outsider).signed_block("{}", None).unwrap();
        assert_eq!(v.is_valid_new_block(&ctx, &block, &prev), Verdict::Pass);

        let prev = head(1);
        let block = gen(&prev, &outsider).signed_block("{}", None).unwrap();
        assert_eq!(v.is_valid_new_block(&ctx, &block, &prev), Verdict::Accept);
    }
}
