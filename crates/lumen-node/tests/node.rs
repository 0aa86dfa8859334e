use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lumen_consensus::ConsensusError;
use lumen_core::Payload;
use lumen_node::{load_keyring_keys, Node, NodeConfig, NodeWallet, KEYRING_KEYS_FILE};
use tempfile::tempdir;

fn config(dir: &Path) -> NodeConfig {
    NodeConfig {
        work_dir: dir.to_path_buf(),
        listen: None,
        validators: vec!["lcpoa".into()],
        block_endings: vec![String::new()],
        new_network: true,
        keyring_keys_count: 3,
        block_accept_count: 1,
        ..NodeConfig::default()
    }
}

async fn wait_for_height(node: &Node, height: u64) {
    for _ in 0..500 {
        if node.max_block().unwrap_or(0) >= height {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("height {height} not reached, head at {:?}", node.max_block());
}

fn payload_at(node: &Node, height: u64) -> Payload {
    let block = node.block(height).unwrap().unwrap();
    Payload::decode(&block.data).unwrap()
}

#[tokio::test]
async fn new_network_registers_wallet_and_emits_keyring() {
    let dir = tempdir().unwrap();
    let node = Node::open(config(dir.path())).unwrap();
    node.bootstrap_network().await.unwrap();

    assert_eq!(node.max_block(), Some(5));
    assert!(matches!(payload_at(&node, 1), Payload::WalletRegister(r) if r.id == node.wallet().id));
    assert!(matches!(payload_at(&node, 3), Payload::Empty(_)));
    assert!(matches!(payload_at(&node, 5), Payload::Keyring(_)));

    let saved = load_keyring_keys(&dir.path().join(KEYRING_KEYS_FILE)).unwrap();
    let public: Vec<String> = saved.iter().map(|k| k.public.clone()).collect();
    assert_eq!(node.keyring(), public);
    assert_eq!(public.len(), 3);
    assert!(node.generation_context().signer_in_keyring());
    assert_eq!(node.balance(&node.wallet().id).unwrap(), Some(0));
    assert_eq!(node.pending_transactions(), 1);

    node.bootstrap_network().await.unwrap();
    assert_eq!(node.max_block(), Some(5));
    node.stop().unwrap();
}

#[tokio::test]
async fn transactions_are_mined_and_confirmed() {
    let dir = tempdir().unwrap();
    let node = Node::open(config(dir.path())).unwrap();
    node.bootstrap_network().await.unwrap();
    assert!(node.is_ready_for_transaction());

    let other = NodeWallet::generate(&lumen_core::DefaultCryptography);
    let payload = other.registration(&lumen_core::DefaultCryptography).unwrap();
    node.transact(&payload).unwrap();
    wait_for_height(&node, 6).await;

    assert_eq!(payload_at(&node, 6), payload);
    assert_eq!(node.balance(&other.id).unwrap(), Some(0));
    assert_eq!(node.pending_transactions(), 2);

    // One confirmation buries the keyring block; the new block still waits.
    node.watch_tick().unwrap();
    assert_eq!(node.pending_transactions(), 1);
    node.stop().unwrap();
}

#[tokio::test]
async fn run_until_stops_on_shutdown() {
    let dir = tempdir().unwrap();
    let node = Node::open(config(dir.path())).unwrap();
    Arc::clone(&node).run_until(async {}).await.unwrap();
    assert_eq!(node.max_block(), Some(5));
    assert_eq!(node.keyring().len(), 3);
}

#[test]
fn unknown_validator_is_refused() {
    let dir = tempdir().unwrap();
    let cfg = NodeConfig {
        validators: vec!["nope".into()],
        ..config(dir.path())
    };
    let err = Node::open(cfg).err().unwrap();
    assert!(matches!(
        err.downcast_ref::<ConsensusError>(),
        Some(ConsensusError::UnknownValidator(name)) if name == "nope"
    ));
}
