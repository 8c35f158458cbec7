//! Worker HTTP server
//!
//! Single axum server bound to loopback. Hook events land in the queue;
//! reads go straight to the store and mirror. The queue maintenance task
//! (stale recovery plus slow mirror backfill) runs alongside the server.

mod api;
mod state;

pub use state::WorkerState;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;

/// Cadence of the stale-recovery sweep.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Mirror backfill runs on every Nth maintenance tick.
const BACKFILL_EVERY: u32 = 10;

pub fn build_router(state: WorkerState) -> Router {
    Router::new()
        // Session lifecycle + ingest
        .route("/api/sessions/init", post(api::session_init))
        .route("/api/sessions/observations", post(api::session_observations))
        .route("/api/sessions/summarize", post(api::session_summarize))
        .route("/api/sessions/complete", post(api::session_complete))
        // Context reads
        .route("/api/context/inject", get(api::get_context_inject))
        .route("/api/context/recent", get(api::get_context_recent))
        // Search and timeline
        .route("/api/search/observations", get(api::search_observations))
        .route("/api/timeline/by-query", get(api::timeline_by_query))
        // Worker introspection
        .route("/api/logs", get(api::get_logs))
        .route("/api/stats", get(api::get_stats))
        .route("/api/queue/stats", get(api::get_queue_stats))
        .route("/api/health", get(api::get_health))
        // Commit event stream
        .route("/stream", get(api::get_stream))
        .with_state(state)
}

/// Start the worker server. Runs until the shutdown receiver fires.
pub async fn start_worker(
    state: WorkerState,
    bind_addr: SocketAddr,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let app = build_router(state);

    tracing::info!("Starting worker on {}", bind_addr);
    let listener = TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Worker listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("Server error")?;

    tracing::info!("Worker shut down gracefully");
    Ok(())
}

/// Queue maintenance: stale recovery at every tick (and once at startup),
/// mirror backfill at a much slower cadence.
pub async fn run_maintenance(
    store: crate::store::Store,
    mirror: std::sync::Arc<crate::vector::VectorMirror>,
    stale_after: Duration,
    retry_limit: u32,
    cancel: crate::cancel::CancelSignal,
) {
    let stale_ms = stale_after.as_millis() as i64;
    let mut tick: u32 = 0;

    if let Err(e) = store.recover_stale(stale_ms, retry_limit) {
        tracing::warn!("Startup queue recovery failed: {}", e);
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }
        tick = tick.wrapping_add(1);

        if let Err(e) = store.recover_stale(stale_ms, retry_limit) {
            tracing::warn!("Queue recovery failed: {}", e);
        }

        if tick % BACKFILL_EVERY == 0 && mirror.is_enabled() {
            let projects = match store.distinct_projects() {
                Ok(projects) => projects,
                Err(e) => {
                    tracing::warn!("Could not list projects for backfill: {}", e);
                    continue;
                }
            };
            for project in projects {
                match mirror.backfill(&store, &project) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("Mirror backfill: {} documents for {}", n, project),
                    Err(e) => tracing::warn!("Mirror backfill failed for {}: {}", project, e),
                }
            }
        }
    }
}
