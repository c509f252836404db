//! The lifecycle supervisor (spec component C7): wires C1-C6 together, starts them in the
//! order spec.md §4.7 requires, and drains in-flight jobs on shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use coderunner_api::AppState;
use coderunner_catalog::Catalog;
use coderunner_queue::JobQueue;
use coderunner_sandbox::{SandboxDriver, SandboxLimits};
use coderunner_util::{Concurrency, CpuQuota, LogLevel, MemoryLimit, SandboxTimeout};
use coderunner_worker::WorkerPool;
use coderunner_workspace::Workspace;
use slog::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Configuration surface of the service, per spec.md §6's environment variables and §4.1-§4.3's
/// defaults. Deliberately a flat `clap::Parser` struct rather than the teacher's layered
/// `maelstrom-config` parser: this service's entire configuration is a handful of scalars, so
/// the generic multi-source (file/env/CLI) machinery would be disproportionate (see DESIGN.md).
#[derive(Parser, Debug)]
#[command(name = "coderunner-server", about = "Sandboxed code-execution service")]
struct Config {
    /// API listen port.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Redis broker host.
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    redis_host: String,

    /// Redis broker port.
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,

    /// Root directory of the shared code workspace.
    #[arg(long, env = "WORKSPACE_ROOT", default_value = "/tmp/coderunner-workspace")]
    workspace_root: std::path::PathBuf,

    /// Number of jobs the worker pool may run concurrently.
    #[arg(long, env = "CONCURRENCY", default_value_t = Concurrency::default())]
    concurrency: Concurrency,

    /// Memory cap applied to every sandbox invocation.
    #[arg(long, env = "SANDBOX_MEMORY", default_value_t = MemoryLimit::default())]
    sandbox_memory: MemoryLimit,

    /// CPU quota applied to every sandbox invocation.
    #[arg(long, env = "SANDBOX_CPUS", default_value_t = CpuQuota::default())]
    sandbox_cpus: CpuQuota,

    /// Wall-clock timeout applied to every sandbox invocation, in seconds.
    #[arg(long, env = "SANDBOX_TIMEOUT_SECS", default_value_t = SandboxTimeout::default())]
    sandbox_timeout_secs: SandboxTimeout,

    /// Container runtime binary to shell out to.
    #[arg(long, env = "SANDBOX_RUNTIME", default_value = "docker")]
    sandbox_runtime: String,

    /// Whether a job found stalled (its worker died mid-execution) is redelivered. Disabled by
    /// default to preserve at-most-once semantics for side-effectful user code (spec.md §9).
    #[arg(long, env = "REDELIVER_STALLED", default_value_t = false)]
    redeliver_stalled: bool,

    /// Minimum log level.
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::default())]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    let log = coderunner_util::build_root_logger(config.log_level);

    info!(log, "starting coderunner-server"; "port" => config.port, "concurrency" => config.concurrency.0);

    // Step 1: workspace directory must exist and be writable before any job is accepted
    // (spec.md §4.2's invariant, §4.7 step 1).
    let workspace = Arc::new(
        Workspace::ensure_ready(config.workspace_root.as_path())
            .context("failed to prepare workspace directory")?,
    );

    // Step 2: establish the queue connection.
    let redis_url = format!("redis://{}:{}", config.redis_host, config.redis_port);
    let queue = JobQueue::connect(&redis_url)
        .await
        .context("failed to connect to the queue broker")?;
    queue.ping().await.context("queue broker did not respond to ping at startup")?;

    let catalog = Arc::new(Catalog::with_defaults());
    let sandbox = Arc::new(SandboxDriver::new(config.sandbox_runtime));
    let limits = SandboxLimits {
        memory: config.sandbox_memory,
        cpu: config.sandbox_cpus,
        timeout: config.sandbox_timeout_secs,
    };

    // Step 3: start the worker pool.
    let pool = WorkerPool::new(
        catalog.clone(),
        workspace.clone(),
        sandbox,
        queue.clone(),
        limits,
        config.concurrency,
        log.clone(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool_handle = tokio::spawn({
        let pool = pool.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { pool.run(shutdown_rx).await }
    });
    let stalled_monitor_handle = tokio::spawn({
        let pool = pool.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            pool.run_stalled_monitor(
                Duration::from_secs(60),
                config.redeliver_stalled,
                Duration::from_secs(30),
                shutdown_rx,
            )
            .await
        }
    });

    // Step 4: open the API listener.
    let state = AppState { catalog, queue, log: log.clone() };
    let router = coderunner_api::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context("failed to bind API listener")?;

    info!(log, "listening"; "port" => config.port);

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal(log.clone()))
        .await
        .context("API listener exited unexpectedly")?;

    // Shutdown: stop accepting new deliveries, drain in-flight jobs within their own deadlines,
    // then close the broker connection (spec.md §4.7 step 2-4).
    info!(log, "shutting down, draining in-flight jobs");
    let _ = shutdown_tx.send(true);
    if let Err(err) = pool_handle.await {
        warn!(log, "worker pool task panicked during shutdown"; "error" => %err);
    }
    if let Err(err) = stalled_monitor_handle.await {
        warn!(log, "stalled monitor task panicked during shutdown"; "error" => %err);
    }

    Ok(())
}

async fn wait_for_shutdown_signal(log: slog::Logger) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(log, "received shutdown signal");
}
