mod cache;
mod config;
mod db;
mod error;
mod governor;
mod middleware;
mod openapi;
mod routes;
mod scheduler;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cache::CacheIndex;
use crate::config::AppConfig;
use crate::db::{
    create_pool, run_migrations, CacheEntryRepository, DbConfig, SqliteCacheEntryRepository,
    SqliteLedgerRepository, SqliteModeStateRepository,
};
use crate::governor::{
    Governor, LedgerStore, MemoryLedgerStore, MemoryModeStateStore, ModeStateStore, SystemClock,
};
use crate::scheduler::ReconsiderScheduler;

#[derive(Clone)]
pub struct AppState {
    pub governor: Arc<Governor>,
    /// `None` when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl+c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

/// Pick durable or in-process stores from `database_url`.
async fn open_stores(
    config: &AppConfig,
) -> anyhow::Result<(
    Arc<dyn LedgerStore>,
    Arc<dyn ModeStateStore>,
    Option<Arc<dyn CacheEntryRepository>>,
)> {
    if config.uses_memory_stores() {
        tracing::warn!("Using in-memory stores; usage and mode will not survive a restart");
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let mode: Arc<dyn ModeStateStore> = Arc::new(MemoryModeStateStore::new());
        return Ok((ledger, mode, None));
    }

    let pool = create_pool(&DbConfig {
        url: config.database_url.clone(),
        ..DbConfig::default()
    })
    .await?;
    run_migrations(&pool).await?;
    tracing::info!(url = %config.database_url, "Database ready");

    let ledger: Arc<dyn LedgerStore> = Arc::new(SqliteLedgerRepository::new(pool.clone()));
    let mode: Arc<dyn ModeStateStore> = Arc::new(SqliteModeStateRepository::new(pool.clone()));
    let cache: Arc<dyn CacheEntryRepository> = Arc::new(SqliteCacheEntryRepository::new(pool));
    Ok((ledger, mode, Some(cache)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quotagate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load()?;
    tracing::info!("Configuration loaded successfully");

    let settings = config.governor.settings(&config.cache)?;

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Prometheus recorder not installed, /metrics will be empty");
            None
        }
    };

    let (ledger_store, mode_store, cache_repo) = open_stores(&config).await?;

    let cache = Arc::new(CacheIndex::new(cache_repo));
    cache.warm().await?;

    let governor = Arc::new(
        Governor::start(
            settings,
            ledger_store,
            mode_store,
            Arc::clone(&cache),
            Arc::new(SystemClock),
        )
        .await?,
    );

    let mut reconsider_scheduler = ReconsiderScheduler::new().await?;
    if config.scheduler.enabled {
        reconsider_scheduler
            .schedule(&config.scheduler.cron, Arc::clone(&governor))
            .await?;
        reconsider_scheduler.start().await?;
        // Catch up right away instead of waiting for the first tick
        scheduler::run_reconsider(&governor).await;
    } else {
        tracing::info!("Scheduler disabled, mode changes only via operator endpoints");
    }

    let state = AppState { governor, metrics };
    let app = routes::build_router(state, config.operator_api_key.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if config.scheduler.enabled {
        if let Err(e) = reconsider_scheduler.shutdown().await {
            tracing::warn!(error = %e, "Scheduler did not shut down cleanly");
        }
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}
