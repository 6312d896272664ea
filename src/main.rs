use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;

use analysis_dispatch::api::{WorkerState, coordinator_routes, worker_routes};
use analysis_dispatch::config::{DispatchConfig, Role, ServerConfig, WorkerConfig};
use analysis_dispatch::executor::CommandExecutor;
use analysis_dispatch::workers::{
    Dispatcher, HealthReconciler, HttpWorkerClient, WorkerDirectory, spawn_discovery_ticker,
    spawn_health_reconciler,
};

/// Delay before the first health pass, so workers have time to come up.
const HEALTH_STARTUP_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let server = ServerConfig::from_env().context("Invalid server configuration")?;

    eprintln!("Analysis Dispatch v{}", env!("CARGO_PKG_VERSION"));

    let app = match server.role {
        Role::Coordinator => coordinator_app()?,
        Role::Worker => worker_app()?,
    };

    eprintln!("   API: http://0.0.0.0:{}/api/analyze\n", server.port);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", server.port))?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn coordinator_app() -> anyhow::Result<Router> {
    let config = DispatchConfig::from_env();
    config.validate().context("Invalid coordinator configuration")?;

    eprintln!("   Role: coordinator");
    if config.static_addresses.is_empty() {
        eprintln!("   Workers: {}:{} (DNS)", config.service_name, config.worker_port);
    } else {
        eprintln!("   Workers: {}", config.static_addresses.join(", "));
    }
    eprintln!(
        "   Queue: max {} waiting, {}ms timeout",
        config.max_queue_size,
        config.queue_timeout.as_millis()
    );

    let directory = WorkerDirectory::from_config(&config);
    let discovery_interval = config.discovery_interval;
    let health_interval = config.health_interval;
    let dispatcher = Dispatcher::new(config, directory, Arc::new(HttpWorkerClient::new()));

    spawn_discovery_ticker(Arc::clone(&dispatcher), discovery_interval);
    spawn_health_reconciler(
        HealthReconciler::new(Arc::clone(&dispatcher)),
        health_interval,
        HEALTH_STARTUP_DELAY,
    );

    Ok(coordinator_routes(dispatcher))
}

fn worker_app() -> anyhow::Result<Router> {
    let config = WorkerConfig::from_env();
    let executor = CommandExecutor::from_config(&config).context("Invalid worker configuration")?;

    eprintln!("   Role: worker ({})", config.worker_id);
    eprintln!(
        "   Queue: {} concurrent, max {} waiting",
        config.queue.max_concurrent, config.queue.max_queue_size
    );
    eprintln!("   Analyzer timeout: {}s", config.analyzer_timeout.as_secs());

    Ok(worker_routes(WorkerState::new(&config, Arc::new(executor))))
}
