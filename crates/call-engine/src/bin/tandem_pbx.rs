//! tandem PBX server binary
//!
//! Runs the SIP/RTP core against an in-memory store. Persistent
//! deployments wire a real store implementation in place of
//! `MemoryStore` before calling `PbxEngine::start`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tandem_call_engine::{Hooks, PbxConfig, PbxEngine};
use tandem_infra_common::{MemoryStore, PbxStore};

#[derive(Parser)]
#[command(name = "tandem-pbx", about = "tandem software PBX")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PbxConfig::load(path)?,
        None => PbxConfig::default(),
    };

    let store = Arc::new(MemoryStore::new()) as Arc<dyn PbxStore>;
    let engine = PbxEngine::start(config, Some(store), Hooks::default()).await?;

    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;
    Ok(())
}
