mod api;
mod config;
mod error;
mod models;
mod paths;
mod repository;
mod runner;
mod services;

use crate::api::{AppState, create_router};
use crate::config::Config;
use crate::repository::{
    CommandRepository, ExecutionRepository, PlaybookRepository, ServerRepository,
    establish_connection,
};
use crate::runner::SshRunnerFactory;
use crate::services::{
    CommandService, Dispatcher, ExecutionLedger, ExecutionService, HealthMonitor,
    InventoryService, PlaybookService, WorkUnitResolver,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleetd=debug,tower_http=debug,axum=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Starting fleetd with config: {:?}", config);

    if let Some(path) = config.database_url.strip_prefix("sqlite:") {
        let path = std::path::Path::new(path.split('?').next().unwrap_or(path));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Establish database connection
    let db_pool = establish_connection(&config.database_url).await?;
    tracing::info!("Database connected: {}", config.database_url);

    // Initialize repositories
    let server_repo = ServerRepository::new(db_pool.clone());
    let command_repo = CommandRepository::new(db_pool.clone());
    let playbook_repo = PlaybookRepository::new(db_pool.clone());
    let execution_repo = ExecutionRepository::new(db_pool);

    // Initialize services
    let runners = Arc::new(SshRunnerFactory::new(
        config.ssh.clone(),
        config.output_limit,
    ));
    let inventory_service = InventoryService::new(server_repo.clone(), execution_repo.clone());
    let health_monitor = HealthMonitor::new(
        inventory_service.clone(),
        runners.clone(),
        Duration::from_secs(config.probe_timeout_secs),
    );
    let resolver = WorkUnitResolver::new(
        command_repo.clone(),
        playbook_repo.clone(),
        server_repo,
        config.default_step_timeout_secs,
    );
    let ledger = ExecutionLedger::new(
        execution_repo.clone(),
        Duration::from_secs(config.cancel_grace_secs),
    );
    let dispatcher = Dispatcher::new(
        runners,
        inventory_service.clone(),
        config.max_concurrency,
        config.output_limit,
    );

    ledger.recover_interrupted().await?;

    let state = AppState {
        inventory_service,
        health_monitor,
        command_service: CommandService::new(command_repo, execution_repo.clone()),
        playbook_service: PlaybookService::new(playbook_repo, execution_repo.clone()),
        execution_service: ExecutionService::new(resolver, ledger, dispatcher, execution_repo),
    };

    // Create router
    let app = create_router(state).layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let addr = addr.parse::<SocketAddr>()?;
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
