//! Daemon startup and shutdown — `slipway serve`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use slipway::config::SlipwayConfig;
use slipway::monitor::{GitPoller, MonitorSupervisor};
use slipway::queue::{BuildQueue, ProcessBuildRunner};
use slipway::server::{self, AppState};
use slipway::status::StatusHub;
use slipway::store::{SqliteStore, Store};

pub async fn cmd_serve(config: SlipwayConfig, dev_mode: bool) -> Result<()> {
    if let Some(parent) = config.daemon.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&config.daemon.db_path).with_context(|| {
            format!(
                "Failed to open database at {}",
                config.daemon.db_path.display()
            )
        })?);
    let hub = StatusHub::new();
    let poller = Arc::new(GitPoller::new(
        config.refs_dir(),
        config.monitor.activity_threshold(),
    ));
    let runner = Arc::new(ProcessBuildRunner::new(config.builds_dir(), hub.clone()));
    let queue = Arc::new(BuildQueue::new(
        Arc::clone(&store),
        hub.clone(),
        runner,
        config.queue.clone(),
    ));
    let supervisor = Arc::new(MonitorSupervisor::new(
        Arc::clone(&store),
        poller,
        Arc::clone(&queue),
        hub.clone(),
        config.monitor.clone(),
    ));

    // One token per stage so teardown can run in order: monitors stop
    // submitting, workers stop, then the listener closes.
    let monitor_cancel = CancellationToken::new();
    let queue_cancel = CancellationToken::new();
    let server_cancel = CancellationToken::new();

    let workers = queue.start_workers(queue_cancel.clone());
    let supervisor_task = {
        let supervisor = Arc::clone(&supervisor);
        let cancel = monitor_cancel.clone();
        tokio::spawn(async move { supervisor.run(cancel).await })
    };

    let state: server::SharedState = Arc::new(AppState {
        store,
        hub,
        queue,
        supervisor,
    });
    let mut server_task = tokio::spawn(server::serve(
        state,
        config.daemon.listen_addr.clone(),
        dev_mode,
        server_cancel.clone(),
    ));

    tracing::info!(
        db = %config.daemon.db_path.display(),
        listen = %config.daemon.listen_addr,
        workspace = %config.daemon.workspace_dir.display(),
        "Slipway daemon started"
    );

    // Run until Ctrl-C, or until the server exits on its own (bind failure).
    let early_exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        result = &mut server_task => Some(result),
    };
    if early_exit.is_none() {
        tracing::info!("Shutdown signal received");
    }

    monitor_cancel.cancel();
    if let Err(e) = supervisor_task.await {
        tracing::warn!(error = %e, "Supervisor task panicked");
    }

    queue_cancel.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Build worker panicked");
        }
    }

    server_cancel.cancel();
    let server_result = match early_exit {
        Some(result) => result,
        None => server_task.await,
    };
    match server_result {
        Ok(result) => result?,
        Err(e) => tracing::warn!(error = %e, "Server task panicked"),
    }

    tracing::info!("Slipway daemon stopped");
    Ok(())
}
