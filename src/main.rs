// mnemo - local memory worker for developer-assistant sessions
//
// Editor hooks feed tool-use events to the HTTP surface; events land in a
// durable queue; per-session agents distill them into observations via an
// LLM provider; the read path serves the composed recent-context document
// back to the assistant.
//
// Architecture:
// - Worker server (axum): hook ingest + read APIs + SSE commit stream
// - Store (rusqlite): sessions, observations, summaries, prompts, queue
// - Session registry: one agent loop per active session, capped
// - Providers: Claude CLI subprocess, Gemini / OpenRouter REST
// - Vector mirror: embedding mirror for semantic search (optional)

mod agent;
mod cancel;
mod cli;
mod compose;
mod config;
mod credentials;
mod events;
mod logging;
mod logtail;
mod modes;
mod processor;
mod providers;
mod server;
mod store;
mod util;
mod vector;

use anyhow::{Context, Result};
use config::Settings;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    if cli::handle_cli() {
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    runtime.block_on(run())
}

async fn run() -> Result<()> {
    let settings = Settings::resolve();
    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("Cannot create data dir {}", settings.data_dir.display()))?;

    let _log_guard = logging::init(&settings.logs_dir())?;
    settings.validate()?;

    tracing::info!(
        "mnemo {} starting (provider {}, data dir {})",
        config::VERSION,
        settings.provider.as_str(),
        settings.data_dir.display()
    );

    let credentials = credentials::Credentials::load(&settings.data_dir)
        .context("Cannot read credential file")?;

    // Structural failures abort startup; the store never degrades writes.
    let store = store::Store::open(settings.db_path()).context("Cannot open relational store")?;

    let mode = Arc::new(
        modes::Mode::load(&settings.modes_dir(), &settings.mode)
            .with_context(|| format!("Invalid mode {:?}", settings.mode))?,
    );

    let mirror = Arc::new(vector::VectorMirror::new(settings.vector_db_path()));
    let frames = events::frame_channel();
    let processor = Arc::new(processor::ResponseProcessor::new(
        store.clone(),
        mirror.clone(),
        frames.clone(),
    ));

    let chain = providers::build_chain(&settings, &credentials);
    let deps = Arc::new(agent::AgentDeps {
        store: store.clone(),
        chain,
        processor,
        mode: mode.clone(),
        provider_kind: settings.provider,
        idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
    });
    let registry = agent::SessionRegistry::new(deps, settings.max_concurrent_agents);

    // Recover queues that survived a restart and restart their agents.
    let stale_ms = (settings.queue_stale_secs * 1000) as i64;
    store
        .recover_stale(stale_ms, settings.queue_retry_limit)
        .context("Startup queue recovery failed")?;
    for session_db_id in store.sessions_with_pending()? {
        if let Some(session) = store.get_session(session_db_id)? {
            registry.ensure_agent(&session);
        }
    }

    let (maintenance_cancel, maintenance_signal) = cancel::cancel_pair();
    tokio::spawn(server::run_maintenance(
        store.clone(),
        mirror.clone(),
        Duration::from_secs(settings.queue_stale_secs),
        settings.queue_retry_limit,
        maintenance_signal,
    ));

    let composer = Arc::new(compose::Composer::new(
        store.clone(),
        compose::Composer::default_transcripts_root(),
    ));

    let state = server::WorkerState {
        store,
        registry: registry.clone(),
        composer,
        mirror: mirror.clone(),
        frames,
        mode,
        settings: Arc::new(settings.clone()),
    };

    let bind_addr = SocketAddr::new(settings.worker_host, settings.worker_port);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Signal handler error: {}", e);
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let result = server::start_worker(state, bind_addr, shutdown_rx).await;

    // Orderly teardown: stop agents first (releases queue claims by not
    // confirming), then the maintenance loop, then the mirror transport.
    registry.shutdown();
    maintenance_cancel.cancel();
    mirror.close();

    result
}
