//! cmdexec Engine - Main Entry Point
//! Composition root: configuration, logging, adapters, recovery, RPC server

mod logging;
mod settings;
mod telemetry;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cmdexec_api_rpc::{RpcHandler, RpcServer};
use cmdexec_core::application::{
    BroadcastEventSink, ExecutionManager, FanoutEventSink, InMemoryExecutionStore,
    ManagerSettings, OutputStreamer, PolicyValidator, RecoveryService, RetentionSweeper,
};
use cmdexec_core::port::id_provider::UuidProvider;
use cmdexec_core::port::time_provider::SystemTimeProvider;
use cmdexec_core::port::{EventSink, ExecutionStore, TimeProvider};
use cmdexec_core::EngineConfig;
use cmdexec_infra_sqlite::{create_file_pool, run_migrations, SqliteExecutionStore};
use cmdexec_infra_system::{HttpEventSink, TokioProcessRunner, UnixProcessControl};
use settings::DaemonSettings;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Settings + logging (logging needs the settings)
    let settings = DaemonSettings::from_env().context("invalid daemon settings")?;
    let _logging = logging::init_logging(&settings)?;

    info!(version = VERSION, "cmdexec engine starting");

    // 2. Engine configuration (validated at load time)
    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    info!(
        allowed_commands = ?config.policy.allowed_commands,
        denied_paths = ?config.policy.denied_paths,
        max_execution_secs = config.max_execution_time.as_secs(),
        max_output_bytes = config.max_output_bytes,
        max_concurrent = config.max_concurrent,
        "Configuration loaded"
    );
    if config.work_dir.is_none() {
        let cwd = std::env::current_dir().context("cannot read working directory")?;
        info!(cwd = %cwd.display(), "Executions run in the daemon's working directory");
    }

    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);

    // 3. Execution store (durable if a database path is configured)
    let store = open_store(&settings).await?;

    // 4. Recovery must finish before new work is accepted
    let recovery = RecoveryService::new(
        store.clone(),
        Arc::new(UnixProcessControl::new()),
        time_provider.clone(),
    );
    match recovery.recover_orphaned_executions().await {
        Ok(count) => info!(recovered = count, "Startup recovery completed"),
        Err(e) => error!(error = ?e, "Startup recovery failed"),
    }

    // 5. Event sinks: in-process broadcast (RPC subscriptions) + optional HTTP forwarding
    let broadcast = Arc::new(BroadcastEventSink::default());
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![broadcast.clone()];
    if let Some(url) = &settings.event_sink_url {
        let http = HttpEventSink::new(url).context("cannot build HTTP event sink")?;
        info!(endpoint = %http.endpoint(), "Forwarding events over HTTP");
        sinks.push(Arc::new(http));
    }
    let streamer = Arc::new(OutputStreamer::new(
        Arc::new(FanoutEventSink::new(sinks)),
        time_provider.clone(),
        config.output_queue_depth,
    ));

    // 6. Execution manager
    let manager = ExecutionManager::new(
        PolicyValidator::new(&config.policy),
        Arc::new(TokioProcessRunner::new(
            time_provider.clone(),
            config.env_allowlist.clone(),
        )),
        store.clone(),
        streamer,
        Arc::new(UuidProvider),
        time_provider.clone(),
        ManagerSettings::from(&config),
    );

    // 7. Retention sweeper
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = RetentionSweeper::new(
        store.clone(),
        time_provider.clone(),
        config.retention,
        config.retention_sweep_interval,
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    // 8. JSON-RPC server
    let handler = RpcHandler::new(manager.clone(), broadcast, time_provider.clone());
    let (addr, rpc_handle) = RpcServer::new(settings.rpc.clone(), handler)
        .start()
        .await
        .context("RPC server start failed")?;

    info!(addr = %addr, "System ready. Press Ctrl+C to shutdown");

    // 9. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // 10. Graceful shutdown: stop intake, cancel in-flight work, flush events
    if let Err(e) = rpc_handle.stop() {
        warn!(error = %e, "RPC server already stopped");
    }
    let unfinished = manager.shutdown(settings.shutdown_grace).await;
    if unfinished > 0 {
        warn!(unfinished, "Executions still running after shutdown grace");
    }
    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;

    telemetry::shutdown();
    info!("Shutdown complete");
    Ok(())
}

async fn open_store(settings: &DaemonSettings) -> Result<Arc<dyn ExecutionStore>> {
    match &settings.db_path {
        Some(path) => {
            info!(db_path = %path.display(), "Opening SQLite execution store");
            let pool = create_file_pool(path)
                .await
                .with_context(|| format!("cannot open database {}", path.display()))?;
            run_migrations(&pool).await.context("migration failed")?;
            Ok(Arc::new(SqliteExecutionStore::new(pool)))
        }
        None => {
            info!("Using in-memory execution store");
            Ok(Arc::new(InMemoryExecutionStore::new()))
        }
    }
}
