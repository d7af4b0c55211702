use std::time::Duration;

use learnhub_auth::app;
use learnhub_auth::core::auth::RefreshTokenService;
use learnhub_auth::core::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "Server terminated");
        eprintln!("learnhub-auth: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file (if exists)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("learnhub_auth=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    // Log config status (without revealing secrets)
    tracing::info!(
        database = config.has_database(),
        identity_provider = config.has_identity_provider(),
        rotation = config.refresh_token_rotation,
        "Config loaded"
    );

    let app = app::build(&config).await?;

    if let Some(interval) = config.purge_interval {
        tokio::spawn(purge_expired_tokens(app.refresh_tokens.clone(), interval));
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app.router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gracefully shutdown");
    Ok(())
}

/// Periodically delete expired refresh tokens
async fn purge_expired_tokens(refresh_tokens: RefreshTokenService, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match refresh_tokens.purge_expired().await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "Purged expired refresh tokens"),
            Err(err) => tracing::warn!(error = %err, "Refresh token purge failed"),
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
