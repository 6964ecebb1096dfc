//! Checkpoint Quiz Server
//!
//! Scan checkpoints, answer questions, redeem rewards

use std::sync::Arc;
use std::time::Duration;

use checkpoint_quiz::{Config, HttpJwksProvider, IdentityVerifier, PgStorage};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Checkpoint Quiz Server");

    let config = Config::load()?;

    let audience = config.identity_audience().ok_or_else(|| {
        error!("identity audience is required (config [identity].audience or IDENTITY_AUDIENCE)");
        anyhow::anyhow!("identity audience not set")
    })?;

    // Initialize PostgreSQL storage (required)
    let database_url = std::env::var("DATABASE_URL").map_err(|_| {
        error!("DATABASE_URL environment variable is required");
        anyhow::anyhow!("DATABASE_URL not set")
    })?;

    let storage = Arc::new(PgStorage::new(&database_url, config.redemption.ttl_days).await?);
    info!("PostgreSQL storage initialized");

    let identity = Arc::new(IdentityVerifier::new(
        Arc::new(HttpJwksProvider::new(config.identity.jwks_url.clone())),
        config.identity.issuer.clone(),
        audience,
        Duration::from_secs(config.identity.jwks_cache_ttl_secs),
    ));

    // Get server config from environment (falls back to config file)
    let host = std::env::var("QUIZ_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port: u16 = std::env::var("QUIZ_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.server.port);

    // Keep the JWKS cache warm so token verification rarely pays a fetch.
    // The verifier also refreshes on miss, so failures here are not fatal.
    let warm_identity = identity.clone();
    let refresh_secs = config.identity.jwks_cache_ttl_secs;
    tokio::spawn(async move {
        // Initial fetch shortly after startup
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut interval = tokio::time::interval(Duration::from_secs(refresh_secs));
        loop {
            interval.tick().await;
            if let Err(e) = warm_identity.refresh().await {
                warn!("JWKS refresh failed: {}", e);
            }
        }
    });
    info!(
        "Background JWKS refresh started (every {} seconds)",
        refresh_secs
    );

    checkpoint_quiz::server::run_server(&host, port, storage, identity).await?;

    Ok(())
}
