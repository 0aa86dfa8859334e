//! Process wiring: stores, validators, synchronizer, transport and timers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lumen_consensus::{
    CancelPredicate, ChainView, ConsensusError, ConsensusStrategy, Dlcpoa, GenerationContext,
    KeyPoa, KeyStorage, Lcpoa, MiningStats, Pos, RemoteMining, StaticValidatorRegistry, Trusted,
    ValidatorSet,
};
use lumen_core::{
    now_ms, Block, BusMessage, Cryptography, DefaultCryptography, KeyPair, Keyring, Payload,
    KEY_DELETE, KEY_ISSUE, TRUSTED_NODE_ADDRESS,
};
use lumen_p2p::{ChainSync, Network, Policy, SyncConfig};
use lumen_state::{
    BlockHandler, BlockStore, ChainStore, HandlerConfig, SledStore, StateError, WalletStore,
    REPLAY_BATCH,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::transactor::{EntryId, Generator, Transactor, TransactorConfig, WatchEvent};
use crate::wallet::{load_keyring_keys, save_keyring_keys, NodeWallet, KEYRING_KEYS_FILE, WALLET_FILE};

/// Chain database directory inside the work dir.
pub const CHAIN_DB_DIR: &str = "chain.db";

/// Resync polling period.
const RESYNC_POLL: Duration = Duration::from_millis(100);

/// Replay batches per resync poll.
const RESYNC_BATCHES_PER_POLL: usize = 16;

/// [`ChainView`] over the shared synchronizer.
///
/// Every call takes the engine lock, so strategies must not be consulted
/// while it is held.
struct SyncView(Arc<Mutex<ChainSync>>);

impl ChainView for SyncView {
    fn latest_block(&self) -> Option<Block> {
        self.0.lock().chain().latest_block().ok().flatten()
    }

    fn max_block(&self) -> Option<u64> {
        self.0.lock().chain().max_block()
    }

    fn keyring(&self) -> Vec<String> {
        self.0.lock().chain().handler().keyring().to_vec()
    }

    fn peer_count(&self) -> usize {
        self.0.lock().peers().len()
    }

    fn is_syncing(&self) -> bool {
        self.0.lock().is_syncing()
    }

    fn genesis_hash(&self) -> String {
        self.0.lock().chain().genesis().hash.clone()
    }
}

struct Validators {
    ascending: Vec<Arc<dyn ConsensusStrategy>>,
    trusted: Option<Arc<Trusted>>,
    keypoa: Option<Arc<KeyPoa>>,
}

fn build_validators(
    config: &NodeConfig,
    db: &sled::Db,
    crypto: &Arc<dyn Cryptography>,
    remote: &Arc<RemoteMining>,
    owner_wallet: &str,
) -> anyhow::Result<Validators> {
    let mut out = Validators {
        ascending: Vec::new(),
        trusted: None,
        keypoa: None,
    };
    for name in &config.validators {
        let v: Arc<dyn ConsensusStrategy> = match name.to_ascii_lowercase().as_str() {
            "lcpoa" => Arc::new(Lcpoa::new(config.block_endings.clone(), config.disable_mining)),
            "dlcpoa" => Arc::new(Dlcpoa::new(config.disable_mining)),
            "trusted" | "thrusted" => {
                let t = Arc::new(Trusted::new(Some(remote.clone())));
                out.trusted = Some(t.clone());
                t
            }
            "keypoa" => {
                let kv = SledStore::from_db(db, "keys")?;
                let storage = KeyStorage::open(Box::new(kv), &config.keypoa_admins)?;
                let k = Arc::new(KeyPoa::new(Arc::new(storage)));
                out.keypoa = Some(k.clone());
                k
            }
            "pos" => {
                let registry = StaticValidatorRegistry::new(
                    config.pos_validators.clone(),
                    crypto.clone(),
                    config.pos_base_fee,
                    config.pos_fee_per_byte,
                );
                Arc::new(Pos::new(Arc::new(registry), Some(owner_wallet.to_string())))
            }
            _ => return Err(ConsensusError::UnknownValidator(name.clone()).into()),
        };
        out.ascending.push(v);
    }
    Ok(out)
}

/// A running chain node.
pub struct Node {
    config: NodeConfig,
    db: sled::Db,
    crypto: Arc<dyn Cryptography>,
    wallet: NodeWallet,
    bus_address: String,
    sync: Arc<Mutex<ChainSync>>,
    network: Arc<Network>,
    validators: Arc<ValidatorSet>,
    gen: Mutex<GenerationContext>,
    remote: Arc<RemoteMining>,
    trusted: Option<Arc<Trusted>>,
    keypoa: Option<Arc<KeyPoa>>,
    transactor: Mutex<Transactor>,
    registration: Mutex<Option<EntryId>>,
    delivered: Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
    requests: Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
    empty_block_running: AtomicBool,
    shutdown: Arc<AtomicBool>,
}

impl Node {
    /// Open the stores under the work dir and wire every component.
    pub fn open(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.work_dir)
            .with_context(|| format!("creating {}", config.work_dir.display()))?;
        let crypto: Arc<dyn Cryptography> = Arc::new(DefaultCryptography);
        let wallet = NodeWallet::load_or_create(&config.work_path(WALLET_FILE), crypto.as_ref())?;
        let keyring_keys = load_keyring_keys(&config.work_path(KEYRING_KEYS_FILE))?;
        let signer = keyring_keys.first().cloned().unwrap_or_else(|| wallet.keys.clone());
        let bus_address = config.bus_address.clone().unwrap_or_else(|| wallet.id.clone());

        let db = sled::open(config.work_path(CHAIN_DB_DIR))
            .with_context(|| format!("opening {}", config.work_path(CHAIN_DB_DIR).display()))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let remote = Arc::new(RemoteMining::new(request_tx, bus_address.clone()));
        let built = build_validators(&config, &db, &crypto, &remote, &wallet.id)?;
        let validators = Arc::new(ValidatorSet::new(built.ascending)?);
        info!(target: "lumen::init", validators = ?validators.names(), "Validators loaded");

        let blocks = BlockStore::open(Box::new(SledStore::from_db(&db, "blocks")?))?;
        let mut handler = BlockHandler::new(
            WalletStore::new(Box::new(SledStore::from_db(&db, "wallets")?)),
            crypto.clone(),
            HandlerConfig {
                key_emission_max_block: config.key_emission_max_block,
                verbose: config.verbose,
                local_public_key: Some(signer.public.clone()),
            },
        )?;
        if let Some(k) = &built.keypoa {
            handler.register_hook(KEY_ISSUE, k.hook(crypto.clone()));
            handler.register_hook(KEY_DELETE, k.hook(crypto.clone()));
        }
        if config.clear_db {
            handler.clear()?;
            info!(target: "lumen::init", "Wallet store cleared");
        }

        let genesis = Block::genesis(crypto.as_ref(), config.genesis_timestamp);
        let chain = ChainStore::load_or_init(blocks, handler, genesis, config.autofix)?;

        let sync = ChainSync::new(
            chain,
            validators.clone(),
            crypto.clone(),
            Policy {
                max_peers: config.max_peers,
                ban_threshold: config.ban_threshold,
                blacklisting: config.blacklisting,
            },
            SyncConfig {
                max_block_send: config.max_block_send,
                block_quality_check: config.block_quality_check,
                limited_confidence_block_zone: config.limited_confidence_block_zone,
                messaging_max_ttl: config.messaging_max_ttl,
                peer_exchange_interval_ms: config.peer_exchange_interval_ms,
                new_network: config.new_network,
                listen_port: config.announced_port(),
                seeds: config.peers.clone(),
                verbose: config.verbose,
            },
            bus_address.clone(),
        );
        let sync = Arc::new(Mutex::new(sync));

        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let network = Network::new(sync.clone(), config.maximum_input_size, deliver_tx);

        let gen = GenerationContext {
            view: Arc::new(SyncView(sync.clone())),
            crypto: crypto.clone(),
            signer: Some(signer),
            mining: Arc::new(MiningStats::new()),
            empty_block_delay_ms: config.generate_empty_block_delay_ms,
        };
        let transactor = Transactor::new(TransactorConfig {
            accept_count: config.block_accept_count,
            max_attempts: config.max_transaction_attempts,
            ..TransactorConfig::default()
        });

        info!(target: "lumen::init", wallet = %wallet.id, bus = %bus_address, "Node ready");
        Ok(Arc::new(Self {
            config,
            db,
            crypto,
            wallet,
            bus_address,
            sync,
            network,
            validators,
            gen: Mutex::new(gen),
            remote,
            trusted: built.trusted,
            keypoa: built.keypoa,
            transactor: Mutex::new(transactor),
            registration: Mutex::new(None),
            delivered: Mutex::new(Some(deliver_rx)),
            requests: Mutex::new(Some(request_rx)),
            empty_block_running: AtomicBool::new(false),
            shutdown: Arc::new(AtomicBool::new(false)),
        }))
    }

    /// Resolved configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Shared synchronizer.
    pub fn sync(&self) -> &Arc<Mutex<ChainSync>> {
        &self.sync
    }

    /// Transport.
    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    /// The node's own account.
    pub fn wallet(&self) -> &NodeWallet {
        &self.wallet
    }

    /// Bus address announced to peers.
    pub fn bus_address(&self) -> &str {
        &self.bus_address
    }

    /// KeyPoA validator, when configured.
    pub fn keypoa(&self) -> Option<&Arc<KeyPoa>> {
        self.keypoa.as_ref()
    }

    /// Current generation context.
    pub fn generation_context(&self) -> GenerationContext {
        self.gen.lock().clone()
    }

    /// Height of the head block.
    pub fn max_block(&self) -> Option<u64> {
        self.sync.lock().chain().max_block()
    }

    /// Block at `height`.
    pub fn block(&self, height: u64) -> anyhow::Result<Option<Block>> {
        Ok(self.sync.lock().chain().block(height)?)
    }

    /// Balance of `id`, `None` for an unknown account.
    pub fn balance(&self, id: &str) -> anyhow::Result<Option<u64>> {
        let sync = self.sync.lock();
        let wallet = sync.chain().handler().wallets().get(id)?;
        Ok(wallet.map(|w| w.balance))
    }

    /// Current keyring.
    pub fn keyring(&self) -> Vec<String> {
        self.sync.lock().chain().handler().keyring().to_vec()
    }

    /// Payloads still watched by the transactor.
    pub fn pending_transactions(&self) -> usize {
        self.transactor.lock().len()
    }

    /// Whether a local transaction can be submitted now.
    pub fn is_ready_for_transaction(&self) -> bool {
        self.sync.lock().is_ready_for_transaction()
    }

    fn cancel(&self) -> CancelPredicate {
        let flag = self.shutdown.clone();
        Arc::new(move || flag.load(Ordering::Relaxed))
    }

    /// Run until `shutdown` completes, then flush the stores.
    ///
    /// Storage corruption found by a replay ends the run with the
    /// underlying [`StateError`].
    pub async fn run_until(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        self.startup_replay().await?;

        let listener = match &self.config.listen {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("binding {addr}"))?,
            ),
            None => None,
        };
        if let Some(addr) = listener.as_ref().and_then(|l| l.local_addr().ok()) {
            let own = vec![addr.to_string(), format!("127.0.0.1:{}", addr.port())];
            self.sync.lock().set_own_addresses(own);
        }
        tokio::spawn(self.network.clone().run(listener));
        for peer in &self.config.peers {
            self.network.dial(peer.clone());
        }
        self.spawn_bus_tasks();

        if self.config.new_network {
            if let Err(e) = self.bootstrap_network().await {
                error!("Keyring emission failed: {e:#}");
            }
        }

        let mut heartbeat = ticker(self.config.heartbeat_interval_ms);
        let mut exchange = ticker(self.config.peer_exchange_interval_ms);
        let mut watch = ticker(self.config.transactor_watch_interval_ms);
        let mut empty = ticker(self.config.empty_block_interval_ms);
        let mut resync = interval(RESYNC_POLL);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = heartbeat.tick() => self.heartbeat(),
                _ = exchange.tick() => self.peer_exchange(),
                _ = watch.tick() => {
                    if let Err(e) = self.watch_tick() {
                        break Err(e);
                    }
                }
                _ = empty.tick() => self.empty_block_tick(),
                _ = resync.tick() => {
                    if let Err(e) = self.poll_resync() {
                        break Err(e);
                    }
                }
            }
        };

        self.stop()?;
        result
    }

    /// Stop generation and flush the stores.
    pub fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        self.sync.lock().chain().flush()?;
        self.db.flush()?;
        info!("Stores flushed");
        Ok(())
    }

    async fn startup_replay(&self) -> anyhow::Result<()> {
        if self.config.fast_load {
            info!(target: "lumen::init", "Fast load: replay skipped");
            return Ok(());
        }
        if !self.sync.lock().start_resync()? {
            return Ok(());
        }
        info!(target: "lumen::init", "Replaying blockchain...");
        loop {
            let progress = self.sync.lock().poll_resync(now_ms(), REPLAY_BATCH)?;
            match progress {
                Some(p) if !p.is_done() => tokio::task::yield_now().await,
                _ => break,
            }
        }
        info!(target: "lumen::init", max_block = ?self.max_block(), "Blockchain replayed");
        Ok(())
    }

    fn poll_resync(&self) -> anyhow::Result<()> {
        for _ in 0..RESYNC_BATCHES_PER_POLL {
            let progress = self.sync.lock().poll_resync(now_ms(), REPLAY_BATCH);
            match progress {
                Ok(Some(p)) if !p.is_done() => continue,
                Ok(_) => break,
                Err(e @ StateError::ChainCorrupted { .. }) => return Err(e.into()),
                Err(e) => {
                    error!("Resync failed: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    fn heartbeat(&self) {
        let out = self.sync.lock().heartbeat();
        match out {
            Ok(out) => self.network.dispatch(out),
            Err(e) => warn!("heartbeat skipped: {e}"),
        }
    }

    fn peer_exchange(&self) {
        self.refresh_roles();
        let out = self.sync.lock().peer_exchange();
        self.network.dispatch(out);
    }

    /// Answer `trusted_node` envelopes while the signer is in the keyring.
    fn refresh_roles(&self) {
        if self.trusted.is_none() {
            return;
        }
        let trusted = self.generation_context().signer_in_keyring();
        let mut sync = self.sync.lock();
        if trusted {
            sync.add_role(TRUSTED_NODE_ADDRESS);
        } else {
            sync.remove_role(TRUSTED_NODE_ADDRESS);
        }
    }

    fn spawn_bus_tasks(self: &Arc<Self>) {
        if let Some(mut rx) = self.delivered.lock().take() {
            let node = self.clone();
            tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    node.on_delivered(envelope);
                }
            });
        }
        if let Some(mut rx) = self.requests.lock().take() {
            let node = self.clone();
            tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    let out = node.sync.lock().originate(envelope);
                    node.network.dispatch(out);
                }
            });
        }
    }

    fn on_delivered(&self, envelope: BusMessage) {
        if self.remote.resolve(&envelope) {
            return;
        }
        let Some(trusted) = &self.trusted else {
            debug!(receiver = %envelope.receiver, "bus envelope without handler");
            return;
        };
        let gen = self.generation_context();
        match trusted.serve_request(&gen, &envelope, &self.bus_address) {
            Ok(Some((block, reply))) => {
                self.accept_local(&block);
                let out = self.sync.lock().originate(reply);
                self.network.dispatch(out);
            }
            Ok(None) => {}
            Err(e) => warn!("Mining request failed: {e}"),
        }
    }

    /// Validate, append and announce a locally produced block.
    fn accept_local(&self, block: &Block) -> bool {
        let added = {
            let mut sync = self.sync.lock();
            match sync.add_block(block, now_ms()) {
                Ok(true) => sync.announce_head().map(Some),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            }
        };
        match added {
            Ok(Some(out)) => {
                self.network.dispatch(out);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(index = block.index, "Block not added: {e}");
                false
            }
        }
    }

    /// Submit `payload` through the highest-priority ready validator and
    /// watch it until confirmation.
    pub fn transact(self: &Arc<Self>, payload: &Payload) -> anyhow::Result<EntryId> {
        let data = payload.encode()?;
        Ok(self.submit(data, Generator::Auto))
    }

    fn submit(self: &Arc<Self>, data: String, generator: Generator) -> EntryId {
        let id = self.transactor.lock().transact(data.clone(), generator);
        tokio::spawn(self.clone().generate(id, data, generator));
        id
    }

    async fn generate(self: Arc<Self>, id: EntryId, data: String, generator: Generator) {
        let gen = self.generation_context();
        let result = match generator {
            Generator::Auto => {
                self.validators
                    .generate_next_block_auto(&gen, data, self.cancel())
                    .await
            }
            Generator::Lowest => {
                self.validators
                    .lowest()
                    .generate_next_block(&gen, data, self.cancel())
                    .await
            }
        };
        let block = match result {
            Ok(Some(block)) if self.accept_local(&block) => Some(block),
            Ok(_) => None,
            Err(e) => {
                warn!(id, "Block generation failed: {e}");
                None
            }
        };
        let event = self.transactor.lock().generated(id, block, now_ms());
        if let Some(event) = event {
            self.on_watch_event(event);
        }
    }

    /// One transactor tick; also registers the node wallet once possible.
    pub fn watch_tick(self: &Arc<Self>) -> anyhow::Result<()> {
        let events = {
            let sync = self.sync.lock();
            let ready = !sync.is_syncing();
            self.transactor.lock().watch(sync.chain(), ready, now_ms())
        };
        let events = match events {
            Ok(events) => events,
            Err(e @ StateError::ChainCorrupted { .. }) => return Err(e.into()),
            Err(e) => {
                warn!("Transactor watch failed: {e}");
                Vec::new()
            }
        };
        for event in events {
            self.on_watch_event(event);
        }
        self.ensure_registered()
    }

    fn on_watch_event(self: &Arc<Self>, event: WatchEvent) {
        match event {
            WatchEvent::Regenerate { id, data, generator } => {
                tokio::spawn(self.clone().generate(id, data, generator));
            }
            WatchEvent::Accepted { id, block } => {
                info!(id, index = block.index, hash = %block.hash, "Block accepted by the network");
                self.clear_registration(id);
            }
            WatchEvent::Failed { id, .. } => {
                error!(id, "Transaction dropped after {} attempts", self.config.max_transaction_attempts);
                self.clear_registration(id);
            }
        }
    }

    fn clear_registration(&self, id: EntryId) {
        let mut reg = self.registration.lock();
        if *reg == Some(id) {
            *reg = None;
        }
    }

    fn ensure_registered(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.registration.lock().is_some() {
            return Ok(());
        }
        let (ready, registered) = {
            let sync = self.sync.lock();
            let registered = sync.chain().handler().wallets().contains(&self.wallet.id)?;
            (sync.is_ready_for_transaction(), registered)
        };
        if !ready || registered {
            return Ok(());
        }
        info!(wallet = %self.wallet.id, "Registering node wallet");
        let payload = self.wallet.registration(self.crypto.as_ref())?;
        let id = self.transact(&payload)?;
        *self.registration.lock() = Some(id);
        Ok(())
    }

    fn empty_block_tick(self: &Arc<Self>) {
        if self.empty_block_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            node.generate_empty_block().await;
            node.empty_block_running.store(false, Ordering::Release);
        });
    }

    async fn generate_empty_block(&self) {
        if self.sync.lock().is_syncing() {
            return;
        }
        let gen = self.generation_context();
        self.validators.apply_empty_block_policy(&gen);
        let candidates: Vec<Arc<dyn ConsensusStrategy>> = self.validators.by_priority().cloned().collect();
        for v in candidates {
            if !v.empty_block_due(&gen) {
                continue;
            }
            match v.generate_empty_block(&gen, self.cancel()).await {
                Ok(Some(block)) => {
                    if self.accept_local(&block) {
                        debug!(validator = v.name(), index = block.index, "Empty block added");
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(validator = v.name(), "Empty block skipped: {e}"),
            }
            return;
        }
    }

    /// Generate through the lowest validator and append right away.
    async fn publish_now(&self, payload: &Payload) -> anyhow::Result<Block> {
        let gen = self.generation_context();
        let block = self
            .validators
            .lowest()
            .generate_next_block(&gen, payload.encode()?, self.cancel())
            .await?
            .ok_or(ConsensusError::NotReady)?;
        if !self.accept_local(&block) {
            anyhow::bail!("{} block at height {} was not accepted", payload.kind(), block.index);
        }
        Ok(block)
    }

    /// Bootstrap a new network: register the node wallet, fill the heights
    /// below the keyring height and publish a fresh keyring.
    ///
    /// Does nothing once the keyring height has passed, a keyring exists or
    /// a miner is busy.
    pub async fn bootstrap_network(self: &Arc<Self>) -> anyhow::Result<()> {
        let kemb = self.config.key_emission_max_block;
        let (max, keyring_empty, registered) = {
            let sync = self.sync.lock();
            let chain = sync.chain();
            (
                chain.max_block().unwrap_or(0),
                chain.handler().keyring().is_empty(),
                chain.handler().wallets().contains(&self.wallet.id)?,
            )
        };
        let mining = self.generation_context().mining.in_progress();
        if max >= kemb || !keyring_empty || mining > 0 {
            return Ok(());
        }
        info!(target: "lumen::init", "Starting keyring emission");

        if !registered {
            let block = self.publish_now(&self.wallet.registration(self.crypto.as_ref())?).await?;
            info!(target: "lumen::init", index = block.index, "Node wallet registered");
        }
        while self.max_block().unwrap_or(0) + 1 < kemb {
            self.publish_now(&Payload::Empty(Default::default())).await?;
        }
        if self.max_block().unwrap_or(0) + 1 != kemb {
            warn!("Keyring height already taken, emission skipped");
            return Ok(());
        }

        let keys: Vec<KeyPair> = (0..self.config.keyring_keys_count.max(1))
            .map(|_| self.crypto.generate_key_pair())
            .collect();
        save_keyring_keys(&self.config.work_path(KEYRING_KEYS_FILE), &keys)?;
        let payload = Payload::Keyring(Keyring {
            keys: keys.iter().map(|k| k.public.clone()).collect(),
            initiator: self.bus_address.clone(),
        });
        let block = self.publish_now(&payload).await?;
        if let Some(first) = keys.first() {
            self.gen.lock().signer = Some(first.clone());
        }
        self.refresh_roles();

        let id = self.transactor.lock().transact(payload.encode()?, Generator::Lowest);
        self.transactor.lock().generated(id, Some(block.clone()), now_ms());
        info!(target: "lumen::init", index = block.index, keys = keys.len(), "Keyring emitted");
        Ok(())
    }
}

fn ticker(ms: u64) -> tokio::time::Interval {
    let mut t = interval(Duration::from_millis(ms.max(1)));
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}
