use anyhow::{Context, Result};
use intake_service::{
    start_api_server, AppState, Config, Database, HttpTransformService, IntakeSettings,
    Orchestrator, S3ObjectStore, Watchdog,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting intake service");

    init_metrics(config.service.metrics_port)?;

    let database = Database::new(&config.database)
        .await
        .context("Failed to initialize database")?;

    if config.database.run_migrations {
        database
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let objects = Arc::new(S3ObjectStore::new(&config.s3).await);
    let transform = Arc::new(
        HttpTransformService::new(&config.transform)
            .context("Failed to initialize transform client")?,
    );

    let orchestrator = Orchestrator::new(
        Arc::new(database.ledger()),
        objects,
        Arc::new(database.search_index()),
        transform,
        IntakeSettings::from_config(&config),
    );

    let cancel = CancellationToken::new();

    let watchdog = Watchdog::new(orchestrator.clone(), config.watchdog.clone());
    let watchdog_cancel = cancel.clone();
    let watchdog_handle = tokio::spawn(async move {
        watchdog.run(watchdog_cancel).await;
    });

    let api_state = AppState { orchestrator };
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_cancel).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Intake service started successfully");

    shutdown_signal().await;

    info!("Shutting down intake service");
    cancel.cancel();

    // in-flight effects stay recorded in the ledger and are resumed by the next watchdog pass
    if let Err(e) = watchdog_handle.await {
        error!(error = %e, "Watchdog task failed");
    }
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Intake service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
