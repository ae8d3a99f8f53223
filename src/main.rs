mod aggregator;
mod config;
mod controller;
mod error;
mod events;
mod exchange;
mod fees;
mod paper;
mod signal;
mod sizer;
mod stats;
mod types;

use std::env;
use std::sync::Arc;

use anyhow::Result;
use dotenv::dotenv;
use tracing_subscriber::EnvFilter;

use config::Config;
use controller::ArbitrageController;
use error::StartupError;
use events::EventBus;
use exchange::NullExchangeAdapter;
use signal::NullSignalSource;
use stats::StatsRegistry;

/// One asset's controller task: owns its `EventBus` and registers it with
/// the shared [`StatsRegistry`] before running to completion.
///
/// No concrete exchange client or signal detector is wired here (both out
/// of scope). `NullExchangeAdapter`/`NullSignalSource` make the binary
/// link and run, failing through the same startup-failure path a missing
/// real adapter would: `wait_for_first_market` exhausts its three
/// attempts against a source that never emits.
async fn run_asset(asset: String, cfg: Config, registry: StatsRegistry) -> Result<()> {
    let bus = Arc::new(EventBus::new());
    registry.track(&asset, &bus);

    let exchange = Arc::new(NullExchangeAdapter);
    let signal = NullSignalSource;
    let mut controller = ArbitrageController::new(cfg, bus, exchange, signal);
    controller.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Basic logging: set RUST_LOG=info (or debug) to see output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    dotenv().ok();

    let cfg = Config::default();
    let live_mode = !cfg.paper_enabled;

    if live_mode && env::var("WALLET_PRIVATE_KEY").is_err() {
        tracing::error!("{}", StartupError::MissingWalletKey);
        std::process::exit(StartupError::MissingWalletKey.exit_code());
    }

    // One controller per configured asset, each with its own event bus,
    // tallied into one shared registry.
    let registry = StatsRegistry::new();
    let mut tasks = Vec::new();
    for asset in cfg.assets.clone() {
        let cfg = cfg.clone();
        let registry = registry.clone();
        tasks.push(tokio::spawn(run_asset(asset, cfg, registry)));
    }

    let mut exit_code = 0;
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if let Some(startup_err) = e.downcast_ref::<StartupError>() {
                    tracing::error!(error = %startup_err, "startup failed");
                    exit_code = exit_code.max(startup_err.exit_code());
                } else {
                    tracing::error!(error = %e, "controller exited with error");
                    exit_code = exit_code.max(1);
                }
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "asset task panicked");
                exit_code = exit_code.max(1);
            }
        }
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
