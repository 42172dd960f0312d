use anyhow::Result;
use conductor_core::{api::ApiServer, config::Config, orchestrator::Orchestrator};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Conductor Core orchestrator");

    let config = Config::load()?;

    let orchestrator = Orchestrator::new(config.clone()).await?;
    let api_server = ApiServer::new(config, orchestrator.clone());

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("Control plane failed: {}", e);
                orchestrator.shutdown().await;
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            orchestrator.shutdown().await;
        }
    }

    Ok(())
}
