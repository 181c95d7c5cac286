//! Service lifecycle: store recovery, worker pool startup, HTTP serving,
//! and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use promptforge_core::runner::SubprocessRunner;
use promptforge_core::{
    connect_store, ChildCommand, Executor, Result, ServiceConfig, StartMethod, WorkerPool,
    WorkerSettings,
};

use crate::routes::create_router;
use crate::state::AppState;

/// Total budget for joining workers on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Open the store, run crash recovery, and start the worker pool.
///
/// Orphan recovery runs before the pool exists and pending recovery right
/// after, so the queue is warm before the first request is served.
pub async fn build_state(
    config: &ServiceConfig,
    executor: Arc<dyn Executor>,
) -> Result<AppState> {
    let store = connect_store(&config.store).await?;

    let orphaned = store.recover_orphaned_jobs().await?;
    if orphaned > 0 {
        info!("Marked {orphaned} orphaned jobs as failed");
    }
    let pending = store.recover_pending_jobs().await?;

    if config.start_method == StartMethod::Fork {
        warn!(
            "fork start method is unavailable on this runtime; jobs run with a fresh executor \
             in a spawned child process"
        );
    }
    let command = ChildCommand::current_exe()?;
    let runner = Arc::new(SubprocessRunner::new(
        command,
        config.worker.cancel_poll_interval,
    ));

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&store),
        Arc::clone(&executor),
        runner,
        WorkerSettings::from(&config.worker),
    ));
    for job_id in &pending {
        pool.enqueue_job(job_id);
    }
    if !pending.is_empty() {
        info!("Re-queued {} pending jobs from previous run", pending.len());
    }
    pool.start();

    Ok(AppState::new(
        store,
        pool,
        executor,
        config.worker.stale_threshold,
    ))
}

/// Run the HTTP service until SIGTERM / ctrl-c, then stop the pool.
pub async fn run(config: ServiceConfig, executor: Arc<dyn Executor>) -> Result<()> {
    let state = build_state(&config, executor).await?;
    let app = create_router(state.clone());

    let ip = config
        .host
        .parse::<std::net::IpAddr>()
        .map_err(|e| promptforge_core::Error::Config(format!("Invalid host: {e}")))?;
    let addr = SocketAddr::from((ip, config.port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("PromptForge API listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.pool.stop(SHUTDOWN_TIMEOUT).await;
    info!("Background workers stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received, stopping gracefully");
}
