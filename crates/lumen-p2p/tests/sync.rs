use std::sync::Arc;

use lumen_consensus::{Lcpoa, ValidatorSet};
use lumen_core::{
    Block, BusMessage, Cryptography, DefaultCryptography, Payload, WalletRegister,
    DEFAULT_GENESIS_TIMESTAMP, TRUSTED_NODE_ADDRESS,
};
use lumen_p2p::{ChainSync, Message, NodeMeta, Outbound, PeerId, Policy, ReplaceOutcome, SyncConfig};
use lumen_state::{BlockHandler, BlockStore, ChainStore, HandlerConfig, MemoryStore, ReplayProgress, WalletStore};
use serde_json::json;

const NOW: u64 = DEFAULT_GENESIS_TIMESTAMP + 10_000_000;

fn crypto() -> Arc<dyn Cryptography> {
    Arc::new(DefaultCryptography)
}

fn genesis() -> Block {
    Block::genesis(&DefaultCryptography, DEFAULT_GENESIS_TIMESTAMP)
}

fn engine_with(config: SyncConfig, policy: Policy) -> ChainSync {
    let blocks = BlockStore::open(Box::new(MemoryStore::new())).unwrap();
    let handler = BlockHandler::new(
        WalletStore::new(Box::new(MemoryStore::new())),
        crypto(),
        HandlerConfig::default(),
    )
    .unwrap();
    let chain = ChainStore::load_or_init(blocks, handler, genesis(), false).unwrap();
    // Every hash ends with "", so any well-formed unsigned block passes.
    let validators = ValidatorSet::new(vec![Arc::new(Lcpoa::new(vec![String::new()], true))]).unwrap();
    ChainSync::new(chain, Arc::new(validators), crypto(), policy, config, "node-local")
}

fn engine() -> ChainSync {
    engine_with(SyncConfig::default(), Policy::default())
}

fn connect(sync: &mut ChainSync, last_octet: u8) -> PeerId {
    let addr = format!("10.0.0.{last_octet}:7000").parse().unwrap();
    sync.peers_mut().admit(addr, None).unwrap()
}

fn child(prev: &Block, offset_ms: u64) -> Block {
    let ts = prev.timestamp + offset_ms;
    let data = Payload::Empty(Default::default()).encode().unwrap();
    Block::new(&DefaultCryptography, prev.index + 1, prev.hash.clone(), ts, ts, data)
}

/// Grow the local chain to `height` with 1s spacing.
fn grow(sync: &mut ChainSync, height: u64) -> Vec<Block> {
    let mut out = vec![sync.chain().latest_block().unwrap().unwrap()];
    while out.last().unwrap().index < height {
        let b = child(out.last().unwrap(), 1_000);
        assert!(sync.add_block(&b, NOW).unwrap());
        out.push(b);
    }
    out
}

/// `len` blocks forking off `base` with a different cadence.
fn fork(base: &Block, len: usize) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::new();
    for _ in 0..len {
        let prev = out.last().unwrap_or(base).clone();
        out.push(child(&prev, 1_500));
    }
    out
}

#[test]
fn query_all_is_capped_by_max_block_send_and_head() {
    let mut sync = engine_with(
        SyncConfig {
            max_block_send: 4,
            ..SyncConfig::default()
        },
        Policy::default(),
    );
    grow(&mut sync, 10);
    let peer = connect(&mut sync, 1);

    let out = sync
        .handle_message(peer, Message::QueryAll { from_index: 2, limit: 10 }, NOW)
        .unwrap();
    let Outbound::Send(to, Message::ResponseBlockchain { blocks }) = &out[0] else {
        panic!("unexpected {out:?}");
    };
    assert_eq!(*to, peer);
    assert_eq!(blocks.iter().map(|b| b.index).collect::<Vec<_>>(), vec![2, 3, 4, 5]);

    let out = sync
        .handle_message(peer, Message::QueryAll { from_index: 8, limit: 5 }, NOW)
        .unwrap();
    let Outbound::Send(_, Message::ResponseBlockchain { blocks }) = &out[0] else {
        panic!("unexpected {out:?}");
    };
    assert_eq!(blocks.iter().map(|b| b.index).collect::<Vec<_>>(), vec![8, 9, 10]);
}

#[test]
fn greeting_announces_identity_and_queries() {
    let mut sync = engine();
    grow(&mut sync, 4);
    let out = sync.on_connected(7);
    assert!(matches!(&out[0], Outbound::Send(7, Message::Meta(m)) if m.bus_address == "node-local"));
    assert_eq!(out[1], Outbound::Send(7, Message::QueryLatest));
    assert_eq!(
        out[2],
        Outbound::Send(7, Message::QueryAll { from_index: 3, limit: 5 })
    );
}

#[test]
fn one_block_extension_is_appended_and_relayed() {
    let mut source = engine();
    let blocks = grow(&mut source, 3);

    let mut sync = engine();
    for b in &blocks[1..3] {
        assert!(sync.add_block(b, NOW).unwrap());
    }
    let peer = connect(&mut sync, 1);
    let out = sync
        .handle_blockchain_response(peer, vec![blocks[3].clone()], NOW)
        .unwrap();
    assert_eq!(sync.chain().max_block(), Some(3));
    assert_eq!(
        out,
        vec![Outbound::BroadcastExcept(
            peer,
            Message::ResponseBlockchain {
                blocks: vec![blocks[3].clone()]
            }
        )]
    );
}

#[test]
fn unlinked_single_block_triggers_range_request() {
    let mut source = engine();
    let blocks = grow(&mut source, 5);

    let mut sync = engine();
    grow(&mut sync, 1);
    let peer = connect(&mut sync, 1);
    let out = sync
        .handle_blockchain_response(peer, vec![blocks[5].clone()], NOW)
        .unwrap();
    assert_eq!(
        out,
        vec![Outbound::Broadcast(Message::QueryAll {
            from_index: 1,
            limit: 600
        })]
    );
    assert_eq!(sync.chain().max_block(), Some(1));
}

#[test]
fn shorter_and_future_responses_are_ignored() {
    let mut sync = engine();
    let local = grow(&mut sync, 4);
    let peer = connect(&mut sync, 1);

    let out = sync
        .handle_blockchain_response(peer, vec![local[2].clone()], NOW)
        .unwrap();
    assert!(out.is_empty());

    let mut ahead = child(&local[4], 0);
    ahead.timestamp = NOW + 61_000;
    ahead.start_timestamp = ahead.timestamp;
    ahead.hash = ahead.compute_hash(&DefaultCryptography);
    let out = sync.handle_blockchain_response(peer, vec![ahead], NOW).unwrap();
    assert!(out.is_empty());
    assert_eq!(sync.chain().max_block(), Some(4));
}

#[test]
fn fork_inside_confidence_zone_replaces_tail_and_schedules_resync() {
    let mut sync = engine();
    let local = grow(&mut sync, 6);
    let alt = fork(&local[3], 4);
    let peer = connect(&mut sync, 1);

    let out = sync.handle_blockchain_response(peer, alt.clone(), NOW).unwrap();
    assert_eq!(sync.chain().max_block(), Some(7));
    for b in &alt {
        assert_eq!(sync.chain().block(b.index).unwrap().unwrap().hash, b.hash);
    }
    assert_eq!(
        out,
        vec![Outbound::Broadcast(Message::ResponseBlockchain {
            blocks: vec![alt[3].clone()]
        })]
    );
    assert_eq!(sync.resync_due_at(), Some(NOW + 5_000 + 2_000));

    assert_eq!(sync.poll_resync(NOW + 1_000, 64).unwrap(), None);
    assert_eq!(
        sync.poll_resync(NOW + 7_000, 64).unwrap(),
        Some(ReplayProgress::Finished)
    );
    assert!(!sync.is_syncing());
    assert_eq!(sync.resync_due_at(), None);
}

#[test]
fn fork_older_than_confidence_zone_is_rejected() {
    let mut sync = engine_with(
        SyncConfig {
            limited_confidence_block_zone: 2,
            ..SyncConfig::default()
        },
        Policy::default(),
    );
    let local = grow(&mut sync, 6);
    let alt = fork(&local[2], 5);

    assert_eq!(
        sync.replace_chain(alt.clone(), NOW).unwrap(),
        ReplaceOutcome::OutsideConfidenceZone
    );
    assert_eq!(sync.chain().max_block(), Some(6));
    assert_eq!(sync.chain().block(3).unwrap().unwrap().hash, local[3].hash);

    // The same fork one height later starts exactly on the boundary.
    let alt = fork(&local[3], 4);
    assert_eq!(
        sync.replace_chain(alt, NOW).unwrap(),
        ReplaceOutcome::Replaced { from: 4, to: 7 }
    );
}

#[test]
fn replacement_starting_at_genesis_must_share_it() {
    let mut sync = engine();
    let local = grow(&mut sync, 2);
    let mut candidate = vec![local[0].clone()];
    candidate.extend(fork(&local[0], 3));
    assert!(matches!(
        sync.replace_chain(candidate, NOW).unwrap(),
        ReplaceOutcome::Replaced { from: 1, to: 3 }
    ));

    let foreign = Block::genesis(&DefaultCryptography, DEFAULT_GENESIS_TIMESTAMP + 1);
    let mut candidate = vec![foreign.clone()];
    candidate.extend(fork(&foreign, 4));
    assert_eq!(sync.replace_chain(candidate, NOW).unwrap(), ReplaceOutcome::Invalid);
}

#[test]
fn repeated_genesis_in_replacement_is_invalid() {
    let mut sync = engine();
    let local = grow(&mut sync, 2);
    let mut candidate = vec![local[0].clone(), local[0].clone()];
    candidate.extend(fork(&local[0], 3));
    assert_eq!(sync.replace_chain(candidate, NOW).unwrap(), ReplaceOutcome::Invalid);
    assert_eq!(sync.chain().block(2).unwrap(), Some(local[2].clone()));
}

#[test]
fn unsigned_block_claiming_a_reward_is_refused() {
    let mut sync = engine();
    let keys = DefaultCryptography.generate_key_pair();
    let reg = WalletRegister::signed(&DefaultCryptography, "attacker", &keys).unwrap();
    let head = sync.chain().latest_block().unwrap().unwrap();
    let ts = head.timestamp + 1_000;
    let register = Block::new(
        &DefaultCryptography,
        1,
        head.hash.clone(),
        ts,
        ts,
        Payload::WalletRegister(reg).encode().unwrap(),
    );
    assert!(sync.add_block(&register, NOW).unwrap());

    let mut rewarded = child(&register, 1_000);
    rewarded.set_reward(&DefaultCryptography, 1_000_000_000_000, "attacker");
    let peer = connect(&mut sync, 1);
    sync.handle_blockchain_response(peer, vec![rewarded], NOW).unwrap();

    assert_eq!(sync.chain().max_block(), Some(1));
    let wallet = sync.chain().handler().wallets().get("attacker").unwrap().unwrap();
    assert_eq!(wallet.balance, 0);
}

#[test]
fn invalid_fork_penalizes_and_blacklists_peer() {
    let mut sync = engine_with(
        SyncConfig::default(),
        Policy {
            ban_threshold: 1,
            blacklisting: true,
            ..Policy::default()
        },
    );
    let local = grow(&mut sync, 3);
    let f2 = child(&local[1], 1_500);
    let mut f3 = child(&f2, 1_500);
    f3.previous_hash = "00".into();
    f3.hash = f3.compute_hash(&DefaultCryptography);
    let f4 = child(&f3, 1_500);
    let peer = connect(&mut sync, 9);

    let out = sync
        .handle_blockchain_response(peer, vec![f2, f3, f4], NOW)
        .unwrap();
    assert_eq!(out, vec![Outbound::Disconnect(peer)]);
    assert_eq!(sync.chain().max_block(), Some(3));
    assert!(sync.peers().is_blacklisted("10.0.0.9"));
}

#[test]
fn responses_are_dropped_while_replaying() {
    let mut source = engine();
    let blocks = grow(&mut source, 3);
    let mut sync = engine();
    for b in &blocks[1..3] {
        sync.add_block(b, NOW).unwrap();
    }
    let peer = connect(&mut sync, 1);

    assert!(sync.start_replay(0).unwrap());
    assert!(!sync.start_replay(0).unwrap());
    let out = sync
        .handle_blockchain_response(peer, vec![blocks[3].clone()], NOW)
        .unwrap();
    assert!(out.is_empty());
    assert_eq!(sync.chain().max_block(), Some(2));
    assert!(!sync.is_ready_for_transaction());

    while !sync.poll_resync(NOW, 1).unwrap().unwrap().is_done() {}
    sync.handle_blockchain_response(peer, vec![blocks[3].clone()], NOW)
        .unwrap();
    assert_eq!(sync.chain().max_block(), Some(3));
}

#[test]
fn add_block_is_idempotent_and_validates() {
    let mut sync = engine();
    let local = grow(&mut sync, 2);
    assert!(sync.add_block(&local[2], NOW).unwrap());
    assert_eq!(sync.chain().max_block(), Some(2));

    let mut bad = child(&local[2], 1_000);
    bad.previous_hash = "ff".into();
    bad.hash = bad.compute_hash(&DefaultCryptography);
    assert!(!sync.add_block(&bad, NOW).unwrap());

    let mut stale = child(&local[1], 1_000);
    stale.timestamp += 1;
    stale.hash = stale.compute_hash(&DefaultCryptography);
    assert!(!sync.add_block(&stale, NOW).unwrap());
}

#[test]
fn bus_envelopes_are_relayed_with_ttl_and_deduplicated() {
    let mut sync = engine();
    let peer = connect(&mut sync, 1);

    let env = BusMessage::new(json!({"x": 1}), "node-far", "node-src", "1", NOW, 0);
    let out = sync.handle_bus(peer, env.clone());
    let mut relayed = env.clone();
    relayed.ttl = 1;
    assert_eq!(out, vec![Outbound::BroadcastExcept(peer, Message::Broadcast(relayed))]);
    assert!(sync.handle_bus(peer, env).is_empty());

    let mut tired = BusMessage::new(json!(null), "node-far", "node-src", "2", NOW, 0);
    tired.ttl = 3;
    assert!(sync.handle_bus(peer, tired).is_empty());

    let mine = BusMessage::new(json!(null), "node-local", "node-src", "3", NOW, 0);
    assert_eq!(sync.handle_bus(peer, mine.clone()), vec![Outbound::Deliver(mine)]);

    sync.add_role(TRUSTED_NODE_ADDRESS);
    let role = BusMessage::new(json!(null), TRUSTED_NODE_ADDRESS, "node-src", "4", NOW, 0);
    let out = sync.handle_bus(peer, role.clone());
    assert_eq!(out.len(), 2);
    assert_eq!(out[0], Outbound::Deliver(role));

    let own = BusMessage::new(json!(null), "node-far", "node-local", "5", NOW, 0);
    assert_eq!(sync.originate(own.clone()).len(), 1);
    assert!(sync.handle_bus(peer, own).is_empty());
}

#[test]
fn peer_lists_are_handled_once_per_interval() {
    let mut sync = engine();
    sync.set_own_addresses(vec!["127.0.0.1:6013".into()]);
    let peer = connect(&mut sync, 1);
    let offered = Message::MyPeers {
        peers: vec!["10.0.0.5:6013".into(), "127.0.0.1:6013".into()],
    };

    let out = sync.handle_message(peer, offered.clone(), NOW).unwrap();
    assert_eq!(out, vec![Outbound::Dial("10.0.0.5:6013".into())]);
    assert!(sync.handle_message(peer, offered.clone(), NOW + 4_999).unwrap().is_empty());
    assert_eq!(sync.handle_message(peer, offered, NOW + 5_000).unwrap().len(), 1);
}

#[test]
fn meta_from_self_or_foreign_network_disconnects() {
    let mut sync = engine();
    let genesis_hash = sync.chain().genesis().hash.clone();
    let a = connect(&mut sync, 1);
    let b = connect(&mut sync, 2);
    let c = connect(&mut sync, 3);

    let me = NodeMeta {
        bus_address: "node-local".into(),
        listen_port: None,
        genesis_hash: genesis_hash.clone(),
    };
    assert_eq!(sync.handle_message(a, Message::Meta(me), NOW).unwrap(), vec![Outbound::Disconnect(a)]);

    let stranger = NodeMeta {
        bus_address: "node-x".into(),
        listen_port: Some(6013),
        genesis_hash: "beef".into(),
    };
    assert_eq!(
        sync.handle_message(b, Message::Meta(stranger), NOW).unwrap(),
        vec![Outbound::Disconnect(b)]
    );

    let friend = NodeMeta {
        bus_address: "node-y".into(),
        listen_port: Some(6013),
        genesis_hash,
    };
    assert!(sync.handle_message(c, Message::Meta(friend), NOW).unwrap().is_empty());
    assert_eq!(sync.current_peers(), vec!["10.0.0.3:6013".to_string()]);
}

#[test]
fn readiness_depends_on_network_mode() {
    let mut fresh = engine_with(
        SyncConfig {
            new_network: true,
            ..SyncConfig::default()
        },
        Policy::default(),
    );
    assert!(fresh.is_ready_for_transaction());
    fresh.start_replay(0).unwrap();
    assert!(!fresh.is_ready_for_transaction());

    let mut joined = engine();
    grow(&mut joined, 6);
    assert!(!joined.is_ready_for_transaction());
    connect(&mut joined, 1);
    assert!(joined.is_ready_for_transaction());
}
