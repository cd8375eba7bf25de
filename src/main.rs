use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use risk_supervisor::config::Config;
use risk_supervisor::exchange::NullExchange;
use risk_supervisor::flags::FeatureFlags;
use risk_supervisor::supervisor::Supervisor;

/// Process entrypoint: init logging, load config, wire the supervisor, and
/// idle. Scheduling trader cycles into `Supervisor::tick` and exposing the
/// result over HTTP/CLI is the out-of-scope outer layer (§1); this binary
/// exists to prove the core wires together and runs.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let flags = FeatureFlags::from_env();
    let trader_id = std::env::var("RISK_TRADER_ID").unwrap_or_else(|_| "default".to_string());

    tracing::info!("starting risk supervisor");
    let supervisor = Supervisor::new_with_persistence(
        &config,
        &trader_id,
        flags,
        Arc::new(NullExchange::new()),
    )
    .await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    supervisor.close().await;
    Ok(())
}
