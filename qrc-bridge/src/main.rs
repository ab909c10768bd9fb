//! Bridge daemon: connect to the configured Core and serve until signalled

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use qrc_bridge::prelude::*;

/// Shutdown is forced if the graceful cascade stalls past this
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Bounded wait for in-flight change-group writes during shutdown
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;

    tracing::info!(
        host = %config.transport.host,
        port = config.transport.port,
        "Starting qrc-bridge"
    );

    // Transport stack: breaker -> retry manager -> QRC client
    let breaker = CircuitBreaker::with_error_filter(
        config.breaker.clone(),
        Arc::new(|err: &Error| err.is_retriable()),
    );
    let manager = ConnectionManager::new(RetryPolicy::from(&config.transport), breaker);
    let client = QrcClient::new(config.transport.clone(), Arc::clone(&manager));

    // State plane
    let executor = ChangeGroupExecutor::new(
        Arc::clone(&client) as Arc<dyn QrcPort>,
        ChangeGroupOptions::from(&config.change_group),
    );
    let repo = StateRepository::new(executor);
    repo.initialize(config.cache.clone())
        .await
        .context("initializing state repository")?;
    if config.cache.persistence_enabled {
        match repo.restore().await {
            Ok(count) => tracing::info!(count, "Restored control states from snapshot"),
            Err(e) => tracing::warn!("Snapshot restore failed, starting cold: {}", e),
        }
    }

    let adapter = SemanticAdapter::new(
        Arc::clone(&client) as Arc<dyn QrcPort>,
        Arc::clone(&repo),
        config.raw_command.deny_list.clone(),
    );
    let adapter_watch = adapter.watch_transport(client.subscribe());

    // Observation plane
    let event_cache =
        EventCacheManager::new(config.event_cache.clone()).context("initializing event cache")?;
    let memory_checker = event_cache.start_memory_checker();
    let spill_janitor = event_cache.start_spillover_janitor();

    let poller = ChangeGroupPoller::new(
        Arc::clone(&client) as Arc<dyn QrcPort>,
        config.transport.polling_interval(),
    );
    let autopoll_routing = poller.attach_notifications(client.subscribe_notifications());

    let ingest_cache = Arc::clone(&event_cache);
    let mut changes = poller.subscribe();
    let ingest_task = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(batch) => ingest_cache.ingest(&batch).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change ingestion lagged; events dropped");
                }
                Err(_) => break,
            }
        }
    });

    // Connect. Authentication failures are fatal and exit non-zero.
    client.install_signal_handlers();
    client
        .connect()
        .await
        .context("connecting to Q-SYS Core")?;

    let poll_loop = poller.start();
    let health_checks = manager.start_health_checks(Duration::from_secs(30));

    wait_for_shutdown_signal().await;
    tracing::info!("Shutdown signal received");

    let graceful = async {
        // Stop producing new work
        poller.stop();
        poll_loop.cancel();
        autopoll_routing.cancel();

        // Drain in-flight change-group writes, bounded
        let drain_start = std::time::Instant::now();
        while repo.executor().active_count() > 0 && drain_start.elapsed() < DRAIN_DEADLINE {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if repo.executor().active_count() > 0 {
            tracing::warn!("Change-group drain timed out; proceeding");
        }

        // Persist and stop the state plane
        repo.shutdown().await;

        // Close the transport and stop everything else
        client.disconnect().await;
        event_cache.stop();
        memory_checker.cancel();
        if let Some(janitor) = spill_janitor {
            janitor.cancel();
        }
        health_checks.cancel();
        adapter_watch.cancel();
        ingest_task.abort();
    };

    if tokio::time::timeout(SHUTDOWN_DEADLINE, graceful).await.is_err() {
        tracing::error!("Graceful shutdown stalled; forcing exit");
        shutdown_tracing();
        std::process::exit(1);
    }

    shutdown_tracing();
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Cannot install SIGTERM handler: {}", e);
                return std::future::pending().await;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Cannot install SIGINT handler: {}", e);
                return std::future::pending().await;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
