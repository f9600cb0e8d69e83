//! Shelter - a resilient data-access layer
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Operations surface (Axum)                    │
//! │  - Health / report                                          │
//! │  - Admin: cache, fallback sync, connection                  │
//! │  - Prometheus metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Data access facade                        │
//! │  cache ──▶ live store ──▶ fallback snapshot                 │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                     │
//! ┌──────────────┐  ┌───────────────────┐  ┌──────────────────┐
//! │  TTL cache   │  │ Connection manager│  │ Snapshot files   │
//! │  (in-memory) │  │ (MongoDB/memory)  │  │ (JSON on disk)   │
//! └──────────────┘  └───────────────────┘  └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for the operations surface
//! - `data`: Cache, live store, fallback snapshots and the facade
//! - `health`: Health monitor and resource sampling
//! - `tasks`: Supervised periodic tasks
//! - `storage`: Atomic JSON file helpers
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod health;
pub mod metrics;
pub mod storage;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use data::{
    CacheStore, ConnectionManager, ConnectionState, Connector, DataAccess, FallbackStore, Record,
    UriConnector,
};
use health::HealthMonitor;
use tasks::PeriodicTask;

/// Application state shared across all handlers
///
/// Cloned for each request; every service is constructed once and shared.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Read cache used by the facade (bounded, TTL)
    pub cache: Arc<CacheStore<Record>>,

    /// Live store connection
    pub connection: Arc<ConnectionManager>,

    /// On-disk fallback snapshots
    pub fallback: Arc<FallbackStore>,

    /// Data access facade
    pub data: Arc<DataAccess>,

    /// Health monitor
    pub health: Arc<HealthMonitor>,

    tasks: Arc<BackgroundTasks>,
}

struct BackgroundTasks {
    health: PeriodicTask,
    cache_persist: PeriodicTask,
    fallback_sync: PeriodicTask,
}

impl AppState {
    /// Initialize application state with the URI-selected live store
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        Self::with_connector(config, Arc::new(UriConnector::new())).await
    }

    /// Initialize application state
    ///
    /// # Steps
    /// 1. Restore the cache backup (if configured)
    /// 2. Create or repair fallback snapshots
    /// 3. Connect to the live store (failure is not fatal)
    /// 4. Wire the facade and health monitor
    ///
    /// # Errors
    /// Returns error if the configuration is invalid
    pub async fn with_connector(
        config: config::AppConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, error::AppError> {
        config.validate()?;
        tracing::info!("Initializing application state...");

        // 1. Cache
        let cache = Arc::new(CacheStore::new("records", config.cache.max_capacity));
        if let Some(path) = &config.cache.persist_path {
            let restored = cache.restore_from(path);
            tracing::info!(restored, path = %path.display(), "Cache backup loaded");
        }

        // 2. Fallback snapshots
        let fallback = Arc::new(FallbackStore::new(config.fallback.clone()));
        let created = fallback.ensure_initialized();
        tracing::info!(
            datasets = fallback.datasets().len(),
            created = created.len(),
            "Fallback snapshots ready"
        );

        // 3. Live store
        let connection = Arc::new(ConnectionManager::new(
            connector,
            config.database.clone(),
            config.reconnect.clone(),
        ));
        if !connection.initialize().await {
            if connection.state() == ConnectionState::Disconnected {
                connection.schedule_reconnect(config.reconnect.initial_delay());
            }
            tracing::warn!("Starting without a live store; reads are served from fallback");
        }

        // 4. Facade and health
        let data = Arc::new(DataAccess::new(
            cache.clone(),
            connection.clone(),
            fallback.clone(),
            &config,
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            connection.clone(),
            cache.clone(),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            cache,
            connection,
            fallback,
            data,
            health,
            tasks: Arc::new(BackgroundTasks {
                health: PeriodicTask::new("health"),
                cache_persist: PeriodicTask::new("cache_persist"),
                fallback_sync: PeriodicTask::new("fallback_sync"),
            }),
        })
    }

    /// Start the health loop, cache persistence and fallback sync
    pub fn start_background_tasks(&self) {
        let health = self.health.clone();
        self.tasks.health.start(self.health.interval(), move || {
            let health = health.clone();
            async move {
                health.run_cycle().await;
            }
        });

        if let Some(path) = self.config.cache.persist_path.clone() {
            let cache = self.cache.clone();
            let interval = Duration::from_secs(self.config.cache.persist_interval_secs);
            self.tasks.cache_persist.start(interval, move || {
                let cache = cache.clone();
                let path = path.clone();
                async move {
                    persist_cache(cache, path).await;
                }
            });
        }

        if self.config.fallback.sync_interval_secs > 0 {
            let data = self.data.clone();
            let connection = self.connection.clone();
            let interval = Duration::from_secs(self.config.fallback.sync_interval_secs);
            self.tasks.fallback_sync.start(interval, move || {
                let data = data.clone();
                let connection = connection.clone();
                async move {
                    if !connection.is_connected() {
                        tracing::debug!("Live store unavailable; skipping fallback sync");
                        return;
                    }
                    let report = data.sync_all().await;
                    tracing::info!(
                        synced = report.synced.len(),
                        failed = report.failed.len(),
                        "Scheduled fallback sync completed"
                    );
                }
            });
        } else {
            tracing::debug!("fallback.sync_interval_secs=0; periodic fallback sync disabled");
        }
    }

    /// Stop background work and flush state to disk
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down...");

        self.tasks.health.stop().await;
        self.tasks.cache_persist.stop().await;
        self.tasks.fallback_sync.stop().await;
        self.connection.shutdown().await;

        if let Some(path) = self.config.cache.persist_path.clone() {
            persist_cache(self.cache.clone(), path).await;
        }
        if let Err(error) = self.health.persist_snapshot().await {
            tracing::warn!(%error, "Failed to write final health snapshot");
        }

        tracing::info!("Shutdown complete");
    }
}

async fn persist_cache(cache: Arc<CacheStore<Record>>, path: std::path::PathBuf) {
    match tokio::task::spawn_blocking(move || cache.persist_to(&path)).await {
        Ok(Ok(report)) => {
            tracing::debug!(written = report.written, dropped = report.dropped, "Cache persisted");
        }
        Ok(Err(error)) => tracing::error!(%error, "Cache persistence failed"),
        Err(error) => tracing::error!(%error, "Cache persistence task failed"),
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{Router, http::Method, middleware};
    use tower_http::cors::{Any, CorsLayer};
    use tower_http::trace::TraceLayer;

    let cors_layer = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE]);

    Router::new()
        .merge(api::health_router())
        .nest("/admin", api::admin_router())
        .merge(api::metrics_router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::track_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}
