//! bussrv — building bus data plane
//!
//! Supervises the bus daemon, keeps the device state cache current from
//! bus traffic, and distributes changes over MQTT and websocket.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use bussrv::config::BusSrvConfig;
use bussrv::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(name = "bussrv", version, about = "Building bus data-plane service")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/domus/bussrv.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    common::logging::init("bussrv").context("initializing logging")?;
    info!("Starting bussrv v{}", env!("CARGO_PKG_VERSION"));

    let config = BusSrvConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let cancel = common::shutdown::shutdown_token();
    let runtime = Runtime::start(config, cancel.clone())
        .await
        .context("starting runtime")?;

    cancel.cancelled().await;

    runtime.shutdown().await;
    Ok(())
}
