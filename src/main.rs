use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use job_runtime::alerts::{AlertEvaluator, spawn_alert_ticker};
use job_runtime::callbacks::CallbackDispatcher;
use job_runtime::config::RuntimeConfig;
use job_runtime::handlers::HandlerRegistry;
use job_runtime::handlers::builtin::EchoHandler;
use job_runtime::jobs::{Worker, spawn_lease_reaper, spawn_worker};
use job_runtime::metrics::Metrics;
use job_runtime::schedules::{ScheduleDispatcher, spawn_schedule_ticker};
use job_runtime::store::{JobStore, LibSqlBackend};

/// Console logging, plus a daily rolling file when `JOB_RUNTIME_LOG_DIR` is set.
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_target(false);

    match std::env::var("JOB_RUNTIME_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "job-runtime.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = RuntimeConfig::from_env().context("invalid configuration")?;

    eprintln!("Job Runtime v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   Queues: {}", config.worker.queues.join(", "));
    eprintln!("   Workers: {}", config.worker.concurrency);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn JobStore> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open database at {}",
                    config.database_path.display()
                )
            })?,
    );

    // ── Handlers ─────────────────────────────────────────────────────────
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(Arc::new(EchoHandler::new())).await;
    store
        .upsert_job_type(&EchoHandler::registration())
        .await
        .context("failed to publish built-in job types")?;
    eprintln!("   Handlers: {}", registry.list().await.join(", "));

    let metrics = Metrics::new();
    let callbacks = Arc::new(CallbackDispatcher::new(
        config.callbacks.clone(),
        Arc::clone(&store),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // ── Workers ──────────────────────────────────────────────────────────
    let mut reaper_worker = None;
    for slot in 0..config.worker.concurrency {
        let mut worker_config = config.worker.clone();
        if config.worker.concurrency > 1 {
            worker_config.worker_id = format!("{}-{slot}", config.worker.worker_id);
        }
        let worker = Arc::new(Worker::new(
            worker_config,
            Arc::clone(&store),
            Arc::clone(&registry),
            metrics.clone(),
            Some(Arc::clone(&callbacks)),
        ));
        reaper_worker.get_or_insert_with(|| Arc::clone(&worker));
        handles.push(spawn_worker(worker, shutdown_rx.clone()));
    }
    if let Some(worker) = reaper_worker {
        tracing::info!(worker = %worker.worker_id(), "Lease reaper attached");
        handles.push(spawn_lease_reaper(
            worker,
            config.worker.reaper_interval,
            shutdown_rx.clone(),
        ));
    }

    // ── Scheduler ────────────────────────────────────────────────────────
    if config.scheduler.enabled {
        let dispatcher = Arc::new(ScheduleDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            metrics.clone(),
            config.scheduler.clone(),
        ));
        handles.push(spawn_schedule_ticker(
            dispatcher,
            config.scheduler.tick_interval,
            shutdown_rx.clone(),
        ));
        eprintln!(
            "   Scheduler: enabled (tick every {}s, batch {})",
            config.scheduler.tick_interval.as_secs(),
            config.scheduler.batch_limit
        );
    } else {
        eprintln!("   Scheduler: disabled");
    }

    // ── Alerts ───────────────────────────────────────────────────────────
    if config.alerts.enabled {
        let evaluator = Arc::new(AlertEvaluator::new(
            Arc::clone(&store),
            metrics.clone(),
            config.alerts.clone(),
        ));
        handles.push(spawn_alert_ticker(
            evaluator,
            config.alerts.interval,
            shutdown_rx.clone(),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, draining workers");
    shutdown_tx.send(true).ok();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    let snapshot = metrics.snapshot().await;
    for (series, value) in &snapshot.counters {
        tracing::info!(series = %series, value, "Final counter");
    }
    Ok(())
}
