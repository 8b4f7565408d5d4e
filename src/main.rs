//! Coordinator: trading-cycle coordination service.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! opens the store, rebuilds the registry, starts the health monitor and
//! the scheduler, and serves the HTTP API until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use coordinator::api::{self, CoordinatorState};
use coordinator::config::AppConfig;
use coordinator::orchestrator::workers::HttpWorkerClient;
use coordinator::orchestrator::CycleOrchestrator;
use coordinator::registry::monitor::HealthMonitor;
use coordinator::registry::{HttpHealthProbe, ServiceRegistry};
use coordinator::scheduler::Scheduler;
use coordinator::storage::Store;
use coordinator::workflow::WorkflowEngine;

const BANNER: &str = r#"
   ____                    _ _             _
  / ___|___   ___  _ __ __| (_)_ __   __ _| |_ ___  _ __
 | |   / _ \ / _ \| '__/ _` | | '_ \ / _` | __/ _ \| '__|
 | |__| (_) | (_) | | | (_| | | | | | (_| | || (_) | |
  \____\___/ \___/|_|  \__,_|_|_| |_|\__,_|\__\___/|_|

  Trading-cycle coordination service
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("COORDINATOR_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = if std::path::Path::new(&config_path).exists() {
        AppConfig::load(&config_path)?
    } else {
        AppConfig::default()
    };

    init_logging();

    println!("{BANNER}");
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path,
        port = cfg.server.port,
        database = %cfg.database.path,
        "Coordinator starting up"
    );

    // -- Store and registry ----------------------------------------------

    let store = Store::open(&cfg.database)
        .await
        .with_context(|| format!("Failed to open store at {}", cfg.database.path))?;

    let probe = Arc::new(HttpHealthProbe::new(cfg.registry.probe_timeout())?);
    let registry = Arc::new(
        ServiceRegistry::load(store.clone(), probe, cfg.registry.default_host.clone()).await?,
    );

    let catalog = cfg.registry.catalog();
    match registry.auto_discover(&catalog).await {
        Ok(found) => {
            let registered = registry.len().await;
            info!(discovered = found.len(), registered, "Startup discovery done");
        }
        Err(e) => warn!(error = %e, "Startup discovery failed"),
    }

    // -- Workflow --------------------------------------------------------

    let workers = Arc::new(HttpWorkerClient::new(cfg.workflow.phase_timeout())?);
    let orchestrator = Arc::new(CycleOrchestrator::new(
        WorkflowEngine::new(store.clone()),
        registry.clone(),
        workers,
        cfg.workflow.clone(),
    ));
    let scheduler = Arc::new(
        Scheduler::load(store.clone(), orchestrator.clone(), cfg.scheduler.tick()).await?,
    );

    // -- Background tasks ------------------------------------------------

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = HealthMonitor::new(registry.clone(), cfg.registry.health_check_interval())
        .spawn(shutdown_rx.clone());
    let ticker = scheduler.clone().spawn(shutdown_rx);

    // -- API -------------------------------------------------------------

    let state = Arc::new(CoordinatorState {
        registry,
        orchestrator,
        scheduler,
        catalog,
        version: env!("CARGO_PKG_VERSION").to_string(),
    });

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Serving. Press Ctrl+C to stop.");
    let served = api::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Could not listen for Ctrl+C");
        }
        info!("Shutdown signal received.");
    })
    .await;

    // -- Shutdown --------------------------------------------------------

    let _ = shutdown_tx.send(true);
    for (name, task) in [("health monitor", monitor), ("scheduler", ticker)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task ended abnormally");
        }
    }

    if let Err(e) = store.checkpoint().await {
        warn!(error = %e, "Final checkpoint failed");
    }
    store.close().await;

    served?;
    info!("Coordinator shut down cleanly.");
    Ok(())
}

/// Initialise the tracing subscriber.
///
/// `RUST_LOG` sets the filter (default `coordinator=info`); setting
/// `COORDINATOR_LOG_JSON` switches to JSON output.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("coordinator=info"));

    let json_logging = std::env::var("COORDINATOR_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
