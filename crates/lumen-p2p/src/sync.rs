//! Chain synchronization engine.
//!
//! [`ChainSync`] is sans-IO: it consumes peer messages and timer ticks and
//! returns [`Outbound`] actions for the transport to perform. It owns the
//! [`ChainStore`], so chain replacement, live appends and replay are
//! serialized by whoever holds the engine.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashSet;
use lumen_consensus::{ValidationContext, ValidatorSet};
use lumen_core::{Block, BusMessage, Cryptography, MAX_FUTURE_RESPONSE_DRIFT_MS};
use lumen_state::{ChainStore, Replay, ReplayProgress, StateError};
use tracing::{debug, error, info, warn};

use crate::error::P2pError;
use crate::message::{Message, NodeMeta, DEFAULT_QUERY_LIMIT};
use crate::peers::{PeerId, PeerTable, Policy};

/// Added to the peer exchange interval when debouncing a resync.
pub const RESYNC_EXTRA_DELAY_MS: u64 = 2_000;

/// Bus envelope ids remembered for deduplication.
pub const SEEN_CAPACITY: usize = 10_000;

/// Synchronizer settings.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Most blocks sent in one response.
    pub max_block_send: u64,
    /// How far behind the head a re-request starts.
    pub block_quality_check: u64,
    /// Trailing heights a replacement chain may rewrite.
    pub limited_confidence_block_zone: u64,
    /// Hops after which bus envelopes stop being relayed.
    pub messaging_max_ttl: u32,
    /// Peer exchange period, ms.
    pub peer_exchange_interval_ms: u64,
    /// Bootstrapping a new network.
    pub new_network: bool,
    /// Port announced in `META`.
    pub listen_port: Option<u16>,
    /// Configured peers dialed when few are connected.
    pub seeds: Vec<String>,
    /// Log rejected chains and dropped messages.
    pub verbose: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_block_send: 600,
            block_quality_check: 100,
            limited_confidence_block_zone: 288,
            messaging_max_ttl: 3,
            peer_exchange_interval_ms: 5_000,
            new_network: false,
            listen_port: None,
            seeds: Vec::new(),
            verbose: false,
        }
    }
}

/// An action for the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// Send to one peer.
    Send(PeerId, Message),
    /// Send to every peer.
    Broadcast(Message),
    /// Send to every peer but one.
    BroadcastExcept(PeerId, Message),
    /// Hand a bus envelope to local handlers.
    Deliver(BusMessage),
    /// Close a connection.
    Disconnect(PeerId),
    /// Open a connection.
    Dial(String),
}

/// Result of a chain replacement attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Heights `from..=to` were overwritten.
    Replaced {
        /// First written height.
        from: u64,
        /// Last written height.
        to: u64,
    },
    /// The candidate forks below the confidence boundary.
    OutsideConfidenceZone,
    /// The candidate failed validation.
    Invalid,
    /// Nothing to write.
    Empty,
}

struct SeenSet {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl SeenSet {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    /// `true` if `key` was not seen before.
    fn insert(&mut self, key: &str) -> bool {
        if self.set.contains(key) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.order.push_back(key.to_string());
        self.set.insert(key.to_string());
        true
    }
}

/// Peer protocol driver and fork resolution.
pub struct ChainSync {
    chain: ChainStore,
    validators: Arc<ValidatorSet>,
    crypto: Arc<dyn Cryptography>,
    peers: PeerTable,
    config: SyncConfig,
    bus_address: String,
    roles: Vec<String>,
    own_addresses: Vec<String>,
    seen: SeenSet,
    resync_at: Option<u64>,
    replay: Option<Replay>,
    last_peer_exchange: Option<u64>,
}

impl ChainSync {
    /// Engine over `chain`.
    pub fn new(
        chain: ChainStore,
        validators: Arc<ValidatorSet>,
        crypto: Arc<dyn Cryptography>,
        policy: Policy,
        config: SyncConfig,
        bus_address: impl Into<String>,
    ) -> Self {
        Self {
            chain,
            validators,
            crypto,
            peers: PeerTable::new(policy),
            config,
            bus_address: bus_address.into(),
            roles: Vec::new(),
            own_addresses: Vec::new(),
            seen: SeenSet::new(),
            resync_at: None,
            replay: None,
            last_peer_exchange: None,
        }
    }

    /// The chain.
    pub fn chain(&self) -> &ChainStore {
        &self.chain
    }

    /// The chain, mutably.
    pub fn chain_mut(&mut self) -> &mut ChainStore {
        &mut self.chain
    }

    /// Connected peers.
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Connected peers, mutably.
    pub fn peers_mut(&mut self) -> &mut PeerTable {
        &mut self.peers
    }

    /// Configured validators.
    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    /// Settings.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Local bus address.
    pub fn bus_address(&self) -> &str {
        &self.bus_address
    }

    /// Also deliver envelopes sent to `role` (for example `trusted_node`).
    pub fn add_role(&mut self, role: impl Into<String>) {
        let role = role.into();
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
    }

    /// Stop delivering envelopes sent to `role`.
    pub fn remove_role(&mut self, role: &str) {
        self.roles.retain(|r| r != role);
    }

    /// Addresses that refer to this node; never dialed.
    pub fn set_own_addresses(&mut self, addresses: Vec<String>) {
        self.own_addresses = addresses;
    }

    /// Dialable addresses of connected peers.
    pub fn current_peers(&self) -> Vec<String> {
        self.peers.addresses()
    }

    /// Whether a replay owns the derived state.
    pub fn is_syncing(&self) -> bool {
        self.chain.is_syncing()
    }

    /// Identity announced to peers.
    pub fn meta(&self) -> NodeMeta {
        NodeMeta {
            bus_address: self.bus_address.clone(),
            listen_port: self.config.listen_port,
            genesis_hash: self.chain.genesis().hash.clone(),
        }
    }

    fn is_valid_new_block(&self, new: &Block, prev: &Block, now: u64) -> bool {
        let ctx = ValidationContext {
            now_ms: now,
            key_emission_max_block: self.chain.handler().key_emission_max_block(),
            ..ValidationContext::new(
                self.crypto.as_ref(),
                self.chain.handler().keyring(),
                &self.chain.genesis().hash,
            )
        };
        self.validators.is_valid_new_block(&ctx, new, prev)
    }

    /// Whether each block of `blocks` validates against its predecessor.
    pub fn is_valid_chain(&self, blocks: &[Block], now: u64) -> bool {
        let ctx = ValidationContext {
            now_ms: now,
            key_emission_max_block: self.chain.handler().key_emission_max_block(),
            ..ValidationContext::new(
                self.crypto.as_ref(),
                self.chain.handler().keyring(),
                &self.chain.genesis().hash,
            )
        };
        self.validators.is_valid_chain(&ctx, blocks)
    }

    /// Greeting for a fresh connection.
    pub fn on_connected(&self, peer: PeerId) -> Vec<Outbound> {
        let from = self.chain.max_block().unwrap_or(0).saturating_sub(1);
        vec![
            Outbound::Send(peer, Message::Meta(self.meta())),
            Outbound::Send(peer, Message::QueryLatest),
            Outbound::Send(
                peer,
                Message::QueryAll {
                    from_index: from,
                    limit: DEFAULT_QUERY_LIMIT,
                },
            ),
        ]
    }

    /// Forget a closed connection.
    pub fn on_disconnected(&mut self, peer: PeerId) {
        if self.peers.remove(peer).is_some() {
            debug!(peer, "peer disconnected");
        }
    }

    /// Handle one message from `peer` at wall-clock `now`.
    pub fn handle_message(
        &mut self,
        peer: PeerId,
        msg: Message,
        now: u64,
    ) -> Result<Vec<Outbound>, P2pError> {
        match msg {
            Message::QueryLatest => Ok(self
                .latest_response()?
                .map(|m| vec![Outbound::Send(peer, m)])
                .unwrap_or_default()),
            Message::QueryAll { from_index, limit } => {
                let blocks = self.blocks_for_query(from_index, limit)?;
                Ok(vec![Outbound::Send(
                    peer,
                    Message::ResponseBlockchain { blocks },
                )])
            }
            Message::ResponseBlockchain { blocks } => {
                self.handle_blockchain_response(peer, blocks, now)
            }
            Message::MyPeers { peers } => Ok(self.handle_peer_list(&peers, now)),
            Message::Broadcast(envelope) => Ok(self.handle_bus(peer, envelope)),
            Message::Meta(meta) => Ok(self.handle_meta(peer, &meta)),
        }
    }

    fn latest_response(&self) -> Result<Option<Message>, P2pError> {
        Ok(self
            .chain
            .latest_block()?
            .map(|b| Message::ResponseBlockchain { blocks: vec![b] }))
    }

    /// Blocks answering `QUERY_ALL(from, limit)`.
    pub fn blocks_for_query(&self, from: u64, limit: u64) -> Result<Vec<Block>, P2pError> {
        let span = limit.min(self.config.max_block_send.saturating_sub(1));
        Ok(self.chain.blocks_range(from, from.saturating_add(span))?)
    }

    fn handle_meta(&mut self, peer: PeerId, meta: &NodeMeta) -> Vec<Outbound> {
        if meta.genesis_hash != self.chain.genesis().hash {
            warn!(peer, bus = %meta.bus_address, "peer runs a different genesis");
            self.peers.remove(peer);
            return vec![Outbound::Disconnect(peer)];
        }
        match self.peers.identify(peer, meta, &self.bus_address) {
            Ok(()) => Vec::new(),
            Err(e) => {
                if self.config.verbose {
                    info!(peer, "closing connection: {e}");
                }
                self.peers.remove(peer);
                vec![Outbound::Disconnect(peer)]
            }
        }
    }

    fn penalize(&mut self, peer: PeerId) -> Vec<Outbound> {
        if self.peers.penalize(peer) {
            self.peers.remove(peer);
            return vec![Outbound::Disconnect(peer)];
        }
        Vec::new()
    }

    fn requery_from(&self, head: u64) -> u64 {
        head.checked_sub(self.config.block_quality_check).unwrap_or(1)
    }

    /// Process a `RESPONSE_BLOCKCHAIN` from `peer`.
    pub fn handle_blockchain_response(
        &mut self,
        peer: PeerId,
        mut blocks: Vec<Block>,
        now: u64,
    ) -> Result<Vec<Outbound>, P2pError> {
        if self.chain.is_syncing() {
            debug!(peer, "chain response dropped: sync in progress");
            return Ok(Vec::new());
        }
        blocks.sort_by_key(|b| b.index);
        let Some(received) = blocks.last().cloned() else {
            return Ok(Vec::new());
        };

        if received.timestamp > now.saturating_add(MAX_FUTURE_RESPONSE_DRIFT_MS) {
            if self.config.verbose {
                error!(
                    received = received.timestamp,
                    current = now,
                    "Incorrect received block timestamp or local time"
                );
            }
            return Ok(Vec::new());
        }

        let Some(held) = self.chain.latest_block()? else {
            if self.chain.autofix() {
                self.chain.step_back_head()?;
            } else {
                error!("Can't receive last block. Maybe database busy?");
            }
            return Ok(Vec::new());
        };

        if received.index <= held.index {
            return Ok(Vec::new());
        }
        if blocks.len() == 1 {
            info!(height = received.index, "Synchronize: received last chain block");
        } else if self.config.verbose {
            info!(held = held.index, received = received.index, "Synchronize: received range");
        }

        if received.previous_hash == held.hash {
            let valid = self.is_valid_chain(&blocks, now)
                && self.is_valid_new_block(&received, &held, now);
            if !valid {
                return Ok(self.penalize(peer));
            }
            self.chain.append(&received, true)?;
            return Ok(vec![Outbound::BroadcastExcept(
                peer,
                Message::ResponseBlockchain {
                    blocks: vec![received],
                },
            )]);
        }

        if blocks.len() == 1 {
            return Ok(vec![Outbound::Broadcast(Message::QueryAll {
                from_index: self.requery_from(held.index),
                limit: self.config.max_block_send,
            })]);
        }

        if blocks[0].index > held.index {
            // The range does not reach our head; ask for the missing part.
            return Ok(vec![Outbound::Send(
                peer,
                Message::QueryAll {
                    from_index: self.requery_from(held.index),
                    limit: self.config.max_block_send,
                },
            )]);
        }

        match self.replace_chain(blocks, now)? {
            ReplaceOutcome::Replaced { .. } => Ok(self
                .latest_response()?
                .map(|m| vec![Outbound::Broadcast(m)])
                .unwrap_or_default()),
            ReplaceOutcome::Invalid => Ok(self.penalize(peer)),
            ReplaceOutcome::OutsideConfidenceZone | ReplaceOutcome::Empty => Ok(Vec::new()),
        }
    }

    /// Overwrite the local tail with `blocks` if they form a valid fork
    /// starting inside the confidence zone.
    ///
    /// Derived state is rebuilt by a resync scheduled
    /// `peer_exchange_interval_ms + RESYNC_EXTRA_DELAY_MS` after the write.
    pub fn replace_chain(&mut self, mut blocks: Vec<Block>, now: u64) -> Result<ReplaceOutcome, P2pError> {
        let max = self.chain.max_block().ok_or(StateError::EmptyChain)?;
        blocks.sort_by_key(|b| b.index);
        if blocks.first().map_or(false, |b| b.index == 0) {
            if blocks[0].hash != self.chain.genesis().hash {
                warn!("Received chain has a foreign genesis");
                return Ok(ReplaceOutcome::Invalid);
            }
            blocks.remove(0);
        }
        let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
            return Ok(ReplaceOutcome::Empty);
        };
        let (first, last) = (first.index, last.index);

        let boundary = max.saturating_sub(self.config.limited_confidence_block_zone);
        if first < boundary {
            if self.config.verbose {
                error!(first, boundary, "LimitedConfidence: Invalid chain");
            }
            return Ok(ReplaceOutcome::OutsideConfidenceZone);
        }

        let Some(anchor_height) = first.checked_sub(1) else {
            warn!("Received chain repeats the genesis height");
            return Ok(ReplaceOutcome::Invalid);
        };
        let Some(anchor) = self.chain.block(anchor_height)? else {
            error!(height = anchor_height, "Can't get block to anchor received chain");
            return Ok(ReplaceOutcome::Invalid);
        };
        let mut candidate = Vec::with_capacity(blocks.len() + 2);
        candidate.push(anchor);
        candidate.extend(blocks.iter().cloned());
        if let Some(right) = self.chain.block(last + 1)? {
            candidate.push(right);
        }
        if !self.is_valid_chain(&candidate, now) {
            error!(first, last, "Received blockchain corrupted");
            return Ok(ReplaceOutcome::Invalid);
        }

        info!(first, last, "Synchronize: replacing chain");
        self.chain.write_blocks(&blocks)?;
        self.schedule_resync(now);
        Ok(ReplaceOutcome::Replaced {
            from: first,
            to: last,
        })
    }

    /// Validate `block` against the head, then append and apply it.
    ///
    /// Re-adding the block already stored at its height is a no-op success.
    pub fn add_block(&mut self, block: &Block, now: u64) -> Result<bool, P2pError> {
        let latest = self.chain.latest_block()?.ok_or(StateError::EmptyChain)?;
        if block.index <= latest.index {
            let stored = self.chain.block(block.index)?;
            return Ok(stored.map_or(false, |b| b.hash == block.hash));
        }
        if !self.is_valid_new_block(block, &latest, now) {
            error!(index = block.index, "Trying add invalid block");
            return Ok(false);
        }
        self.chain.append(block, true)?;
        Ok(true)
    }

    /// Broadcast of the head block.
    pub fn announce_head(&self) -> Result<Vec<Outbound>, P2pError> {
        Ok(self
            .latest_response()?
            .map(|m| vec![Outbound::Broadcast(m)])
            .unwrap_or_default())
    }

    /// Heartbeat tick.
    pub fn heartbeat(&self) -> Result<Vec<Outbound>, P2pError> {
        self.announce_head()
    }

    /// Peer exchange tick: gossip our peers and top up from the seeds.
    pub fn peer_exchange(&self) -> Vec<Outbound> {
        let mut out = vec![Outbound::Broadcast(Message::MyPeers {
            peers: self.peers.addresses(),
        })];
        if self.peers.len() < 2 {
            out.extend(
                self.peers
                    .candidates(&self.config.seeds, &self.own_addresses)
                    .into_iter()
                    .map(Outbound::Dial),
            );
        }
        out
    }

    fn handle_peer_list(&mut self, offered: &[String], now: u64) -> Vec<Outbound> {
        let interval = self.config.peer_exchange_interval_ms;
        if self
            .last_peer_exchange
            .map_or(false, |at| now < at.saturating_add(interval))
        {
            return Vec::new();
        }
        self.last_peer_exchange = Some(now);
        self.peers
            .candidates(offered, &self.own_addresses)
            .into_iter()
            .map(Outbound::Dial)
            .collect()
    }

    fn is_local_receiver(&self, receiver: &str) -> bool {
        receiver == self.bus_address || self.roles.iter().any(|r| r == receiver)
    }

    /// Deliver and/or relay a bus envelope received from `peer`.
    pub fn handle_bus(&mut self, peer: PeerId, envelope: BusMessage) -> Vec<Outbound> {
        if !self.seen.insert(&envelope.mutex) {
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.is_local_receiver(&envelope.receiver) {
            out.push(Outbound::Deliver(envelope.clone()));
        }
        if envelope.receiver != self.bus_address && envelope.ttl < self.config.messaging_max_ttl {
            let mut relay = envelope;
            relay.ttl += 1;
            out.push(Outbound::BroadcastExcept(peer, Message::Broadcast(relay)));
        }
        out
    }

    /// Send a locally originated envelope.
    pub fn originate(&mut self, envelope: BusMessage) -> Vec<Outbound> {
        self.seen.insert(&envelope.mutex);
        vec![Outbound::Broadcast(Message::Broadcast(envelope))]
    }

    /// Schedule a debounced resync relative to `now`.
    pub fn schedule_resync(&mut self, now: u64) {
        let at = now
            .saturating_add(self.config.peer_exchange_interval_ms)
            .saturating_add(RESYNC_EXTRA_DELAY_MS);
        self.resync_at = Some(at);
    }

    /// When the pending resync is due.
    pub fn resync_due_at(&self) -> Option<u64> {
        self.resync_at
    }

    /// Start replaying from `from` over the current derived state.
    ///
    /// Returns `false` if a replay is already running.
    pub fn start_replay(&mut self, from: u64) -> Result<bool, StateError> {
        if self.replay.is_some() {
            return Ok(false);
        }
        self.replay = self.chain.begin_replay(from)?;
        Ok(self.replay.is_some())
    }

    /// Clear derived state and start a full replay; `false` if one is running.
    pub fn start_resync(&mut self) -> Result<bool, StateError> {
        if self.replay.is_some() {
            return Ok(false);
        }
        self.replay = self.chain.begin_resync()?;
        Ok(self.replay.is_some())
    }

    /// Advance the running replay, starting a due resync first.
    ///
    /// Returns `None` when there was nothing to do.
    pub fn poll_resync(&mut self, now: u64, budget: usize) -> Result<Option<ReplayProgress>, StateError> {
        if self.replay.is_none() {
            match self.resync_at {
                Some(at) if at <= now => {
                    self.resync_at = None;
                    self.replay = self.chain.begin_resync()?;
                }
                _ => return Ok(None),
            }
        }
        let Some(replay) = self.replay.as_mut() else {
            return Ok(None);
        };
        match self.chain.replay_step(replay, budget) {
            Ok(progress) => {
                if progress.is_done() {
                    self.replay = None;
                }
                Ok(Some(progress))
            }
            Err(e) => {
                self.replay = None;
                Err(e)
            }
        }
    }

    /// Whether a locally originated transaction can be submitted now.
    pub fn is_ready_for_transaction(&self) -> bool {
        if self.chain.is_syncing() {
            return false;
        }
        if self.config.new_network {
            return true;
        }
        let kemb = self.chain.handler().key_emission_max_block();
        !self.peers.is_empty() && self.chain.max_block().map_or(false, |m| m > kemb)
    }
}
