#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::process::ExitCode;

use clap::Parser;
use lumen_node::{init_logging, resolve_config, Cli, Node, NodeConfig};
use lumen_state::StateError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    let config = match resolve_config(cli) {
        Ok(config) => config,
        Err(e) => {
            init_logging(verbose);
            error!(target: "lumen::fatal", "Invalid configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.verbose);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_fatal(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    info!(target: "lumen::init", version = env!("CARGO_PKG_VERSION"), "Starting Lumen node");
    let node = Node::open(config)?;
    node.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Signal handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutting down");
    })
    .await
}

fn report_fatal(e: &anyhow::Error) {
    match e.downcast_ref::<StateError>() {
        Some(StateError::ChainCorrupted { height }) => error!(
            target: "lumen::fatal",
            height,
            "Saved chain corrupted. Remove the block and wallet stores to resync, or restart with --autofix"
        ),
        Some(StateError::GenesisMismatch) => error!(
            target: "lumen::fatal",
            "Stored genesis does not match this network. Remove the chain store or fix genesisTimestamp"
        ),
        _ => error!(target: "lumen::fatal", "{e:#}"),
    }
}
