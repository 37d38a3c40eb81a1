mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use murmur_api::{AppStateInner, router};
use murmur_db::Database;
use murmur_gateway::{SessionGateway, sweep};

use crate::config::{DEFAULT_LOG_FILTER, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("FATAL: {:#}", e);
            std::process::exit(1);
        }
    };

    // Init database; nobody is connected yet, so clear any stale online flags
    let db = Arc::new(Database::open(&config.db_path)?);
    let cleared = db.reset_presence()?;
    if cleared > 0 {
        info!("Cleared stale presence for {} users", cleared);
    }

    let gateway = SessionGateway::new(db, config.gateway.clone());
    tokio::spawn(sweep::run_idle_sweep_loop(gateway.clone()));

    let state = AppStateInner::new(
        gateway,
        config.jwt_secret,
        config.rename_code,
        config.admin_code,
    );

    let app = router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Murmur server listening on {}", config.addr);
    info!(
        "Read receipts: {:?}, idle timeout: {}s",
        config.gateway.read_receipts,
        config.gateway.idle_threshold.as_secs()
    );

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
