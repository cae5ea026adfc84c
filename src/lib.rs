//! Server side of the consulting firm's website: the edge functions, the
//! session and security pipeline they rely on, and the background publisher
//! for scheduled social posts.

pub mod analytics;
pub mod auth;
pub mod config;
pub mod consent;
pub mod crypto;
pub mod db;
pub mod error;
pub mod feeds;
pub mod handlers;
pub mod health;
pub mod integrations;
pub mod model;
pub mod outbox;
pub mod router;
pub mod security;
pub mod session;
pub mod state;
pub mod tokens;

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::router::create_router;
use crate::security::rate_limit::JsonFileStore;
use crate::state::AppState;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Open the database, start the outbox worker and serve until ctrl-c.
pub async fn run(cfg: Config) -> Result<()> {
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let limiter_path = Path::new(&cfg.app.data_dir).join("rate_limits.json");
    let store = JsonFileStore::open(&limiter_path)?;
    let bind_addr = cfg.app.bind_addr.clone();
    let state = AppState::new(pool.clone(), cfg, Box::new(store)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(outbox::run_worker(
        pool.clone(),
        state.publishers(),
        Duration::from_millis(state.config().app.poll_interval_ms),
        i64::try_from(state.config().app.max_backoff_seconds).unwrap_or(i64::MAX),
        shutdown_rx,
    ));

    let housekeeping_state = state.clone();
    let housekeeping = tokio::spawn(async move {
        let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            tick.tick().await;
            housekeeping_pass(&housekeeping_state).await;
        }
    });
    let final_state = state.clone();

    let app = create_router(state);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("listening on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    housekeeping.abort();
    let _ = worker.await;
    flush_rate_limits(&final_state).await;
    pool.close().await;
    info!("server stopped");
    Ok(())
}

/// Drop finished sessions and dead rate-limit keys, then persist the limiter
/// off the async workers.
pub async fn housekeeping_pass(state: &AppState) {
    let pruned = state.sessions().prune_expired();
    if pruned > 0 {
        info!(pruned, "dropped expired sessions");
    }
    let longest = state.config().security.rate_limits.longest_window_ms();
    let evicted = state.limiter().evict_stale(longest);
    if evicted > 0 {
        debug!(evicted, "dropped stale rate limit keys");
    }
    flush_rate_limits(state).await;
}

async fn flush_rate_limits(state: &AppState) {
    let state = state.clone();
    match tokio::task::spawn_blocking(move || state.limiter().flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(?err, "failed to persist rate limit state"),
        Err(err) => warn!(?err, "rate limit flush task failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(?err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
        info!("received ctrl-c, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                tracing::error!(?err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
