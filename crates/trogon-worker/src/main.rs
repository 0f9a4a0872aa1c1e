use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use tokio_util::sync::CancellationToken;
use trogon_worker::{
    DistributedLock, NatsLockStore, TickContext, WorkerBuilder, WorkerConfig, WorkerError,
};

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = WorkerConfig::from_process_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid worker configuration");
        std::process::exit(1);
    });

    let nats_url =
        env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

    tracing::info!(nats_url = %nats_url, worker = %config.name, "Connecting to NATS");

    let nats = async_nats::connect(&nats_url)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to connect to NATS");
            std::process::exit(1);
        });

    if let Err(e) = run(nats, config).await {
        tracing::error!(error = %e, "Worker exited with error");
        std::process::exit(1);
    }
}

/// Run a heartbeat worker guarded by the NATS lock until SIGINT / SIGTERM.
async fn run(nats: async_nats::Client, config: WorkerConfig) -> Result<(), WorkerError> {
    let js = jetstream::new(nats);
    let ttl = config.lock_ttl().unwrap_or(DEFAULT_LOCK_TTL);
    let store = NatsLockStore::open(&js, ttl)
        .await
        .map_err(|e| WorkerError::Store(Box::new(e)))?;
    let lock = Arc::new(DistributedLock::for_worker(store, &config.name, ttl)?);

    let shutdown = CancellationToken::new();
    let (completion_tx, completion_rx) = tokio::sync::oneshot::channel();

    let mut builder = WorkerBuilder::from_config(&config, |ctx: TickContext| async move {
        tracing::info!(tick = ctx.sequence(), fired_at = %ctx.fired_at(), "Heartbeat");
        Ok::<(), WorkerError>(())
    })
    .shutdown(shutdown.clone())
    .teardown(move |completion| {
        let _ = completion_tx.send(completion);
    });
    builder = match config.watch_interval() {
        Some(every) => builder.exclusive_with_watch_interval(lock, every),
        None => builder.exclusive(lock),
    };

    let _handle = builder.build()?.run().await;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, waiting for the current tick");
    shutdown.cancel();

    match completion_rx.await {
        Ok(completion) => completion.wait().await,
        Err(_) => Ok(()),
    }
}

/// Resolves when the process receives SIGINT or SIGTERM (Ctrl-C only on non-Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c  => {}
        _ = sigterm => {}
    }
}
