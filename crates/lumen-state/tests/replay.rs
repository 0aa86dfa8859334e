use std::sync::Arc;

use lumen_core::{
    Block, Cryptography, DefaultCryptography, KeyPair, Keyring, Payload, Transaction,
    WalletRegister, DEFAULT_GENESIS_TIMESTAMP, PRECISION,
};
use lumen_state::{
    BlockHandler, BlockStore, ChainStore, HandlerConfig, KeyValueStore, ReplayProgress, SledStore,
    StateError, WalletStore,
};
use tempfile::tempdir;

fn open(db: &sled::Db, autofix: bool) -> Result<ChainStore, StateError> {
    let blocks = BlockStore::open(Box::new(SledStore::from_db(db, "blocks")?))?;
    let handler = BlockHandler::new(
        WalletStore::new(Box::new(SledStore::from_db(db, "wallets")?)),
        Arc::new(DefaultCryptography),
        HandlerConfig::default(),
    )?;
    let genesis = Block::genesis(&DefaultCryptography, DEFAULT_GENESIS_TIMESTAMP);
    ChainStore::load_or_init(blocks, handler, genesis, autofix)
}

fn push(chain: &mut ChainStore, payload: &Payload) {
    let prev = chain.latest_block().unwrap().unwrap();
    let ts = prev.timestamp + 1_000;
    let b = Block::new(
        &DefaultCryptography,
        prev.index + 1,
        prev.hash.clone(),
        ts,
        ts,
        payload.encode().unwrap(),
    );
    chain.append(&b, true).unwrap();
}

fn push_rewarded(chain: &mut ChainStore, fee: u64, owner: &str) {
    let prev = chain.latest_block().unwrap().unwrap();
    let ts = prev.timestamp + 1_000;
    let mut b = Block::new(
        &DefaultCryptography,
        prev.index + 1,
        prev.hash.clone(),
        ts,
        ts,
        empty().encode().unwrap(),
    );
    b.set_reward(&DefaultCryptography, fee, owner);
    chain.append(&b, true).unwrap();
}

fn empty() -> Payload {
    Payload::Empty(Default::default())
}

/// genesis, register "abc" at 1, keyring [A] at 5, self-transfer at 6.
fn bootstrap(chain: &mut ChainStore, a: &KeyPair) {
    push(
        chain,
        &Payload::WalletRegister(WalletRegister::signed(&DefaultCryptography, "abc", a).unwrap()),
    );
    for _ in 2..5 {
        push(chain, &empty());
    }
    push(
        chain,
        &Payload::Keyring(Keyring {
            keys: vec![a.public.clone()],
            initiator: "node-a".into(),
        }),
    );
    let tx = Transaction::signed(
        &DefaultCryptography,
        a,
        "abc",
        "abc",
        PRECISION,
        DEFAULT_GENESIS_TIMESTAMP + 6_500,
        0,
    )
    .unwrap();
    push(chain, &Payload::Transaction(tx));
}

#[test]
fn trusted_emission_survives_full_replay() {
    let dir = tempdir().unwrap();
    let db = sled::open(dir.path().join("db")).unwrap();
    let a = DefaultCryptography.generate_key_pair();
    let mut chain = open(&db, false).unwrap();
    bootstrap(&mut chain, &a);

    let live = chain.handler().wallets().get("abc").unwrap().unwrap().balance;
    assert_eq!(live, PRECISION);
    assert_eq!(chain.max_block(), Some(6));

    assert_eq!(chain.resync().unwrap(), ReplayProgress::Finished);
    let replayed = chain.handler().wallets().get("abc").unwrap().unwrap();
    assert_eq!(replayed.balance, PRECISION);
    assert_eq!(chain.handler().keyring(), &[a.public.clone()]);
}

#[test]
fn replay_twice_is_idempotent() {
    let dir = tempdir().unwrap();
    let db = sled::open(dir.path().join("db")).unwrap();
    let a = DefaultCryptography.generate_key_pair();
    let mut chain = open(&db, false).unwrap();
    bootstrap(&mut chain, &a);

    chain.resync().unwrap();
    let first = chain.handler().wallets().all().unwrap();
    chain.resync().unwrap();
    assert_eq!(chain.handler().wallets().all().unwrap(), first);
}

fn pay(keys: &KeyPair, from: &str, to: &str, amount: u64, ts: u64) -> Payload {
    Payload::Transaction(
        Transaction::signed(&DefaultCryptography, keys, from, to, amount, ts, 0).unwrap(),
    )
}

fn balances(chain: &ChainStore) -> (u64, u64) {
    let get = |id: &str| chain.handler().wallets().get(id).unwrap().unwrap().balance;
    (get("a"), get("b"))
}

#[test]
fn restart_resync_keeps_refusals_and_rewards() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let a = DefaultCryptography.generate_key_pair();
    let b = DefaultCryptography.generate_key_pair();
    let t = DEFAULT_GENESIS_TIMESTAMP;
    {
        let db = sled::open(&path).unwrap();
        let mut chain = open(&db, false).unwrap();
        for (id, keys) in [("a", &a), ("b", &b)] {
            let reg = WalletRegister::signed(&DefaultCryptography, id, keys).unwrap();
            push(&mut chain, &Payload::WalletRegister(reg));
        }
        push(&mut chain, &pay(&a, "a", "a", 100, t + 3));
        push(&mut chain, &empty());
        push(&mut chain, &empty());
        push(&mut chain, &pay(&a, "a", "b", 100, t + 6));
        push(&mut chain, &pay(&a, "a", "b", 50, t + 7));
        push(&mut chain, &pay(&b, "b", "a", 100, t + 8));
        push_rewarded(&mut chain, 25, "a");
        assert_eq!(chain.max_block(), Some(9));
        assert_eq!(balances(&chain), (125, 0));
        chain.flush().unwrap();
    }

    let db = sled::open(&path).unwrap();
    let mut chain = open(&db, false).unwrap();
    assert_eq!(chain.resync().unwrap(), ReplayProgress::Finished);
    assert_eq!(balances(&chain), (125, 0));
    chain.resync().unwrap();
    assert_eq!(balances(&chain), (125, 0));
}

#[test]
fn reopened_node_rebuilds_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let a = DefaultCryptography.generate_key_pair();
    {
        let db = sled::open(&path).unwrap();
        let mut chain = open(&db, false).unwrap();
        bootstrap(&mut chain, &a);
        chain.flush().unwrap();
    }
    let db = sled::open(&path).unwrap();
    SledStore::from_db(&db, "wallets").unwrap().clear().unwrap();
    let mut chain = open(&db, false).unwrap();
    assert!(chain.handler().wallets().get("abc").unwrap().is_none());
    chain.play_blockchain(0).unwrap();
    assert_eq!(
        chain.handler().wallets().get("abc").unwrap().unwrap().balance,
        PRECISION
    );
}

#[test]
fn resync_requests_coalesce_while_running() {
    let dir = tempdir().unwrap();
    let db = sled::open(dir.path().join("db")).unwrap();
    let mut chain = open(&db, false).unwrap();
    for _ in 0..3 {
        push(&mut chain, &empty());
    }
    let mut replay = chain.begin_resync().unwrap().unwrap();
    assert!(chain.begin_resync().unwrap().is_none());
    assert!(matches!(chain.resync(), Err(StateError::SyncInProgress)));
    while !chain.replay_step(&mut replay, 1).unwrap().is_done() {}
    assert!(!chain.is_syncing());
    assert_eq!(replay.handled(), 4);
}
