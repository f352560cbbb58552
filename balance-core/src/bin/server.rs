//! Balance engine server binary
//!
//! Usage: `balance-server [config.toml]`. Without a path the configuration
//! comes from `BALANCE_*` environment variables.

use anyhow::Context;
use balance_core::{BalanceEngine, Config};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        data_dir = %config.data_dir.display(),
        "Starting balance server"
    );

    let report_secs = config.metrics_report_secs;
    let engine = BalanceEngine::open(config).await.context("opening balance engine")?;
    tracing::info!("Balance engine opened successfully");

    let reporter = (report_secs > 0).then(|| {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(report_secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.metrics().encode() {
                    Ok(text) => tracing::info!(
                        cache_hit_rate = engine.metrics().cache_hit_rate(),
                        holds_active = engine.metrics().holds_active.get(),
                        "Metrics report\n{}",
                        text
                    ),
                    Err(e) => tracing::warn!("Failed to encode metrics: {}", e),
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down balance server");
    if let Some(reporter) = reporter {
        reporter.abort();
    }
    engine.shutdown().await?;
    Ok(())
}
