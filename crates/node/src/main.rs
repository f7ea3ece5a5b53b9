//! Oracle node
//!
//! Main entry point: starts plugins, runs rounds, serves diagnostics

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use oracle_core::CoreError;
use oracle_node::{settings, DiagnosticsServerBuilder, OracleService, VERSION};
use oracle_plugins::{
    discover_plugins, run_discovery, ProcessLauncher, PluginSupervisor, SupervisorConfig,
};
use oracle_reporter::RpcGateway;
use oracle_round::{ControllerConfig, RoundController};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if std::env::var("ORACLE_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }

    info!("Starting oracle node {}", VERSION);

    let config = settings::load()?;
    info!(
        rpc = %config.gateway.rpc_url,
        plugin_dir = %config.plugin_dir.display(),
        min_sources = config.aggregation.min_sources,
        "Configuration loaded"
    );

    // Start plugins
    let supervisor_config = SupervisorConfig::from(&config.supervisor);
    let launcher = Arc::new(ProcessLauncher::new(supervisor_config.handshake_timeout));
    let supervisor = Arc::new(PluginSupervisor::new(supervisor_config.clone(), launcher));

    let specs = discover_plugins(&config.plugin_dir, &config.plugins)?;
    let started = supervisor.start_all(specs).await;
    if started == 0 {
        supervisor.shutdown().await;
        return Err(CoreError::NoPlugins(config.plugin_dir.clone()).into());
    }
    info!("{} plugins started", started);

    // Round controller
    let gateway = Arc::new(RpcGateway::new(&config.gateway)?);
    let controller = RoundController::new(
        ControllerConfig::from_settings(&config.round, &config.supervisor, &config.aggregation),
        Arc::clone(&supervisor),
        gateway,
    );
    let status = controller.status_handle();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(controller.run(shutdown_rx.clone())));

    if let Some(interval) = supervisor_config.discovery_interval {
        tasks.push(tokio::spawn(run_discovery(
            Arc::clone(&supervisor),
            config.plugin_dir.clone(),
            config.plugins.clone(),
            interval,
            shutdown_rx.clone(),
        )));
    }

    if config.diagnostics.enabled {
        let server = DiagnosticsServerBuilder::new()
            .settings(&config.diagnostics)
            .service(OracleService::new(Arc::clone(&supervisor), status))
            .build()?;
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.start_with_shutdown(rx).await {
                error!("Diagnostics server error: {}", e);
            }
        }));
    } else {
        warn!("Diagnostics endpoint disabled");
    }

    // Wait for a shutdown signal
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received termination signal");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    supervisor.shutdown().await;
    info!("Oracle node shutdown complete");
    Ok(())
}
