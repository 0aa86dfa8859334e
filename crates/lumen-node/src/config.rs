//! Node configuration.
//!
//! Every setting resolves in the same order: CLI flag, then `LUMEN_*`
//! environment variable, then the JSON file named by `--config`, then the
//! built-in default.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use lumen_consensus::DEFAULT_BLOCK_ENDINGS;
use lumen_core::{DEFAULT_GENESIS_TIMESTAMP, KEY_EMISSION_MAX_BLOCK};
use lumen_p2p::DEFAULT_MAX_INPUT_SIZE;
use serde::Deserialize;

/// Default P2P port.
pub const DEFAULT_P2P_PORT: u16 = 6013;

/// Command line flags.
#[derive(Parser, Debug, Default)]
#[command(name = "lumen-node", version, about = "Lumen chain node")]
pub struct Cli {
    /// JSON config file
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
    /// Directory holding the databases and key files
    #[arg(long = "work-dir")]
    pub work_dir: Option<PathBuf>,
    /// Listen address for P2P
    #[arg(long = "listen")]
    pub listen: Option<String>,
    /// Peers to dial, comma separated host:port list
    #[arg(long = "peers")]
    pub peers: Option<String>,
    /// Validators in ascending priority, comma separated
    #[arg(long = "validators")]
    pub validators: Option<String>,
    /// Truncate a corrupted chain tail instead of exiting
    #[arg(long = "autofix")]
    pub autofix: bool,
    /// Skip the startup replay
    #[arg(long = "fast-load")]
    pub fast_load: bool,
    /// Bootstrap a new network
    #[arg(long = "new-network")]
    pub new_network: bool,
    /// Debug logging
    #[arg(long = "verbose")]
    pub verbose: bool,
    /// Wipe derived wallet state before the startup replay
    #[arg(long = "clear-db")]
    pub clear_db: bool,
    /// Blacklist peers that keep sending invalid chains
    #[arg(long = "blacklisting")]
    pub blacklisting: bool,
}

/// `blockHashFilter` section.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HashFilterFile {
    /// Accepted hash suffixes.
    pub block_endls: Option<Vec<String>>,
}

/// `pos` section.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PosFile {
    /// Registered validator public keys.
    pub validators: Option<Vec<String>>,
    /// Flat fee per block.
    pub base_fee: Option<u64>,
    /// Fee per payload byte.
    pub fee_per_byte: Option<u64>,
}

/// On-disk config; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub work_dir: Option<PathBuf>,
    pub listen: Option<String>,
    pub peers: Option<Vec<String>>,
    pub validators: Option<Vec<String>>,
    pub autofix: Option<bool>,
    pub fast_load: Option<bool>,
    pub new_network: Option<bool>,
    pub verbose: Option<bool>,
    pub blacklisting: Option<bool>,
    pub bus_address: Option<String>,
    pub block_accept_count: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub peer_exchange_interval: Option<u64>,
    pub max_block_send: Option<u64>,
    pub block_quality_check: Option<u64>,
    pub limited_confidence_block_zone: Option<u64>,
    pub generate_empty_block_delay: Option<u64>,
    pub empty_block_interval: Option<u64>,
    pub block_hash_filter: Option<HashFilterFile>,
    pub genesis_timestamp: Option<u64>,
    pub max_transaction_attempts: Option<u32>,
    pub keyring_keys_count: Option<usize>,
    #[serde(rename = "messagingMaxTTL")]
    pub messaging_max_ttl: Option<u32>,
    pub maximum_input_size: Option<usize>,
    pub max_peers: Option<usize>,
    pub ban_threshold: Option<u32>,
    pub p2p_port: Option<u16>,
    pub key_emission_max_block: Option<u64>,
    pub transactor_watch_interval: Option<u64>,
    pub disable_mining: Option<bool>,
    pub keypoa_admins: Option<Vec<String>>,
    pub pos: Option<PosFile>,
}

impl FileConfig {
    /// Parse a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

/// Fully resolved node settings.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub work_dir: PathBuf,
    /// `None` disables the listener.
    pub listen: Option<String>,
    pub peers: Vec<String>,
    /// Validator names in ascending priority.
    pub validators: Vec<String>,
    pub autofix: bool,
    pub fast_load: bool,
    pub new_network: bool,
    pub verbose: bool,
    pub clear_db: bool,
    pub blacklisting: bool,
    /// Fixed bus address; a fresh random one otherwise.
    pub bus_address: Option<String>,
    pub block_accept_count: u64,
    pub heartbeat_interval_ms: u64,
    pub peer_exchange_interval_ms: u64,
    pub max_block_send: u64,
    pub block_quality_check: u64,
    pub limited_confidence_block_zone: u64,
    pub generate_empty_block_delay_ms: u64,
    pub empty_block_interval_ms: u64,
    pub block_endings: Vec<String>,
    pub genesis_timestamp: u64,
    pub max_transaction_attempts: u32,
    pub keyring_keys_count: usize,
    pub messaging_max_ttl: u32,
    pub maximum_input_size: usize,
    pub max_peers: usize,
    pub ban_threshold: u32,
    pub p2p_port: u16,
    pub key_emission_max_block: u64,
    pub transactor_watch_interval_ms: u64,
    pub disable_mining: bool,
    pub keypoa_admins: Vec<String>,
    pub pos_validators: Vec<String>,
    pub pos_base_fee: u64,
    pub pos_fee_per_byte: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("lumen-data"),
            listen: Some(format!("0.0.0.0:{DEFAULT_P2P_PORT}")),
            peers: Vec::new(),
            validators: vec!["dlcpoa".to_string()],
            autofix: false,
            fast_load: false,
            new_network: false,
            verbose: false,
            clear_db: false,
            blacklisting: false,
            bus_address: None,
            block_accept_count: 20,
            heartbeat_interval_ms: 10_000,
            peer_exchange_interval_ms: 5_000,
            max_block_send: 600,
            block_quality_check: 100,
            limited_confidence_block_zone: 288,
            generate_empty_block_delay_ms: 300_000,
            empty_block_interval_ms: 10_000,
            block_endings: DEFAULT_BLOCK_ENDINGS.iter().map(|s| s.to_string()).collect(),
            genesis_timestamp: DEFAULT_GENESIS_TIMESTAMP,
            max_transaction_attempts: 5,
            keyring_keys_count: 5,
            messaging_max_ttl: 3,
            maximum_input_size: DEFAULT_MAX_INPUT_SIZE,
            max_peers: 80,
            ban_threshold: 3,
            p2p_port: DEFAULT_P2P_PORT,
            key_emission_max_block: KEY_EMISSION_MAX_BLOCK,
            transactor_watch_interval_ms: 5_000,
            disable_mining: false,
            keypoa_admins: Vec::new(),
            pos_validators: Vec::new(),
            pos_base_fee: 0,
            pos_fee_per_byte: 0,
        }
    }
}

impl NodeConfig {
    /// Path of a file inside the work dir.
    pub fn work_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    /// Port announced to peers.
    pub fn announced_port(&self) -> Option<u16> {
        let listen = self.listen.as_deref()?;
        listen
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse().ok())
            .or(Some(self.p2p_port))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Resolve settings from the process environment.
pub fn resolve_config(cli: Cli) -> anyhow::Result<NodeConfig> {
    resolve_config_with(cli, |key| env::var(key).ok())
}

/// Resolve settings with `env` standing in for the process environment.
pub fn resolve_config_with(
    cli: Cli,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<NodeConfig> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| env("LUMEN_CONFIG").map(PathBuf::from));
    let file = match &config_path {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let d = NodeConfig::default();

    let flag = |set: bool, key: &str, file: Option<bool>| -> bool {
        set || env(key).map(|v| truthy(&v)).or(file).unwrap_or(false)
    };

    let p2p_port = file.p2p_port.unwrap_or(d.p2p_port);
    let listen = cli
        .listen
        .or_else(|| env("LUMEN_LISTEN"))
        .or(file.listen)
        .unwrap_or_else(|| format!("0.0.0.0:{p2p_port}"));
    let listen = match listen.trim() {
        "" | "none" | "off" => None,
        other => Some(other.to_string()),
    };

    let peers = cli
        .peers
        .or_else(|| env("LUMEN_PEERS"))
        .map(|raw| split_list(&raw))
        .or(file.peers)
        .unwrap_or_default();

    let validators: Vec<String> = cli
        .validators
        .or_else(|| env("LUMEN_VALIDATORS"))
        .map(|raw| split_list(&raw))
        .or(file.validators)
        .unwrap_or(d.validators);
    if validators.is_empty() {
        bail!("at least one validator must be configured");
    }

    let work_dir = cli
        .work_dir
        .or_else(|| env("LUMEN_WORK_DIR").map(PathBuf::from))
        .or(file.work_dir)
        .unwrap_or(d.work_dir);

    let pos = file.pos.unwrap_or_default();

    Ok(NodeConfig {
        work_dir,
        listen,
        peers,
        validators,
        autofix: flag(cli.autofix, "LUMEN_AUTOFIX", file.autofix),
        fast_load: flag(cli.fast_load, "LUMEN_FAST_LOAD", file.fast_load),
        new_network: flag(cli.new_network, "LUMEN_NEW_NETWORK", file.new_network),
        verbose: flag(cli.verbose, "LUMEN_VERBOSE", file.verbose),
        clear_db: flag(cli.clear_db, "LUMEN_CLEAR_DB", None),
        blacklisting: flag(cli.blacklisting, "LUMEN_BLACKLISTING", file.blacklisting),
        bus_address: env("LUMEN_BUS_ADDRESS").or(file.bus_address),
        block_accept_count: file.block_accept_count.unwrap_or(d.block_accept_count),
        heartbeat_interval_ms: file.heartbeat_interval.unwrap_or(d.heartbeat_interval_ms),
        peer_exchange_interval_ms: file
            .peer_exchange_interval
            .unwrap_or(d.peer_exchange_interval_ms),
        max_block_send: file.max_block_send.unwrap_or(d.max_block_send),
        block_quality_check: file.block_quality_check.unwrap_or(d.block_quality_check),
        limited_confidence_block_zone: file
            .limited_confidence_block_zone
            .unwrap_or(d.limited_confidence_block_zone),
        generate_empty_block_delay_ms: file
            .generate_empty_block_delay
            .unwrap_or(d.generate_empty_block_delay_ms),
        empty_block_interval_ms: file.empty_block_interval.unwrap_or(d.empty_block_interval_ms),
        block_endings: file
            .block_hash_filter
            .and_then(|f| f.block_endls)
            .unwrap_or(d.block_endings),
        genesis_timestamp: file.genesis_timestamp.unwrap_or(d.genesis_timestamp),
        max_transaction_attempts: file
            .max_transaction_attempts
            .unwrap_or(d.max_transaction_attempts),
        keyring_keys_count: file.keyring_keys_count.unwrap_or(d.keyring_keys_count),
        messaging_max_ttl: file.messaging_max_ttl.unwrap_or(d.messaging_max_ttl),
        maximum_input_size: file.maximum_input_size.unwrap_or(d.maximum_input_size),
        max_peers: file.max_peers.unwrap_or(d.max_peers),
        ban_threshold: file.ban_threshold.unwrap_or(d.ban_threshold),
        p2p_port,
        key_emission_max_block: file
            .key_emission_max_block
            .unwrap_or(d.key_emission_max_block),
        transactor_watch_interval_ms: file
            .transactor_watch_interval
            .unwrap_or(d.transactor_watch_interval_ms),
        disable_mining: file.disable_mining.unwrap_or(d.disable_mining),
        keypoa_admins: file.keypoa_admins.unwrap_or_default(),
        pos_validators: pos.validators.unwrap_or_default(),
        pos_base_fee: pos.base_fee.unwrap_or(d.pos_base_fee),
        pos_fee_per_byte: pos.fee_per_byte.unwrap_or(d.pos_fee_per_byte),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_match_network_constants() {
        let cfg = resolve_config_with(Cli::default(), no_env).unwrap();
        assert_eq!(cfg.validators, vec!["dlcpoa".to_string()]);
        assert_eq!(cfg.block_accept_count, 20);
        assert_eq!(cfg.limited_confidence_block_zone, 288);
        assert_eq!(cfg.genesis_timestamp, DEFAULT_GENESIS_TIMESTAMP);
        assert_eq!(cfg.listen.as_deref(), Some("0.0.0.0:6013"));
        assert_eq!(cfg.announced_port(), Some(6013));
        assert!(!cfg.autofix);
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"listen":"127.0.0.1:7000","peers":["10.0.0.1:6013"],"validators":["lcpoa"],
               "autofix":true,"maxBlockSend":50,"blockHashFilter":{"blockEndls":["00"]},
               "messagingMaxTTL":7,"pos":{"validators":["k"],"baseFee":3}}"#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("LUMEN_PEERS", "10.0.0.2:6013, 10.0.0.3:6013"),
            ("LUMEN_LISTEN", "127.0.0.1:7001"),
        ]
        .into_iter()
        .collect();
        let cli = Cli {
            config: Some(path),
            listen: Some("127.0.0.1:7002".into()),
            ..Cli::default()
        };
        let cfg = resolve_config_with(cli, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.listen.as_deref(), Some("127.0.0.1:7002"));
        assert_eq!(cfg.peers, vec!["10.0.0.2:6013".to_string(), "10.0.0.3:6013".to_string()]);
        assert_eq!(cfg.validators, vec!["lcpoa".to_string()]);
        assert!(cfg.autofix);
        assert_eq!(cfg.max_block_send, 50);
        assert_eq!(cfg.block_endings, vec!["00".to_string()]);
        assert_eq!(cfg.messaging_max_ttl, 7);
        assert_eq!(cfg.pos_validators, vec!["k".to_string()]);
        assert_eq!(cfg.pos_base_fee, 3);
        assert_eq!(cfg.announced_port(), Some(7002));
    }

    #[test]
    fn env_flags_and_disabled_listener() {
        let cfg = resolve_config_with(Cli::default(), |k| match k {
            "LUMEN_NEW_NETWORK" => Some("true".into()),
            "LUMEN_LISTEN" => Some("off".into()),
            _ => None,
        })
        .unwrap();
        assert!(cfg.new_network);
        assert!(cfg.listen.is_none());
        assert_eq!(cfg.announced_port(), None);
    }

    #[test]
    fn empty_validator_list_is_an_error() {
        let cli = Cli {
            validators: Some(" , ".into()),
            ..Cli::default()
        };
        assert!(resolve_config_with(cli, no_env).is_err());
    }

    #[test]
    fn unreadable_config_is_an_error() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/lumen.json")),
            ..Cli::default()
        };
        assert!(resolve_config_with(cli, no_env).is_err());
    }
}
