use std::{sync::Arc, time::Duration};

use manager::{InstanceManager, ManagerConfig, PortAllocator};
use server::{AppState, file_logging, routes};
use store::{DBService, InstanceStore};
use thiserror::Error;
use utils::config::{Config, ConfigError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Manager(#[from] manager::ManagerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env()?;

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _log_guard = file_logging::init_logging(&log_level, config.logs_dir.clone());

    tracing::info!(
        bind_addr = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        port_range_lo = config.port_range.0,
        port_range_hi = config.port_range.1,
        max_instances = config.max_instances,
        "starting control plane"
    );

    let db = DBService::new(&config.database_path).await?;
    let store = InstanceStore::new(db.pool.clone());

    let ports = PortAllocator::new(config.port_range.0, config.port_range.1);
    let manager_config = ManagerConfig {
        max_instances: config.max_instances,
        startup_timeout: Duration::from_secs(config.startup_timeout_secs),
        stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        on_demand_start_timeout: Duration::from_secs(config.on_demand_start_timeout_secs),
        shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        log_tail_capacity: config.log_tail_capacity,
    };

    let manager =
        Arc::new(InstanceManager::bootstrap(store, ports, &config.instances_dir, manager_config).await?);

    let state = AppState {
        manager: manager.clone(),
        api_key: config.api_key.clone(),
        proxy_client: reqwest::Client::new(),
    };

    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("shutting down: stopping all instances");
    manager.shutdown().await;
    tracing::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
