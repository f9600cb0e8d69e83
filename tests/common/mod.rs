//! Common test utilities for E2E tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use shelter::data::{Dataset, MemoryStore, UriConnector};
use shelter::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Baseline configuration rooted in `dir`, backed by the in-memory store
pub fn test_config(dir: &Path) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0, // Let OS assign port
        },
        database: config::DatabaseConfig {
            uri: Some("memory://test".to_string()),
            name: "shelter_test".to_string(),
            app_name: "shelter-test".to_string(),
            connect_timeout_ms: 200,
            server_selection_timeout_ms: 200,
            query_timeout_ms: 200,
            max_pool_size: 2,
            min_pool_size: 0,
        },
        reconnect: config::ReconnectConfig {
            initial_delay_secs: 1,
            max_delay_secs: 4,
            multiplier: 2.0,
        },
        cache: config::CacheConfig {
            max_capacity: 100,
            ttl_by_id_secs: 300,
            ttl_by_key_secs: 300,
            ttl_scan_secs: 60,
            persist_path: Some(dir.join("cache.json")),
            persist_interval_secs: 600,
        },
        access: config::AccessConfig {
            max_scan_results: 25,
            projections: HashMap::new(),
        },
        fallback: config::FallbackConfig {
            data_dir: dir.join("fallback"),
            datasets: vec![Dataset::Users, Dataset::Products, Dataset::Categories],
            cache_ttl_secs: 30,
            sync_interval_secs: 0,
            max_sync_records: 1000,
            bootstrap_admin: config::BootstrapAdminConfig {
                username: "admin".to_string(),
                email: "admin@localhost".to_string(),
                display_name: "Administrator".to_string(),
            },
        },
        health: config::HealthConfig {
            interval_secs: 900,
            snapshot_path: dir.join("health_metrics.json"),
            temp_dir: Some(dir.join("tmp")),
            temp_retention_secs: 86_400,
            error_rate_threshold: 0.25,
            error_rate_alpha: 0.1,
            min_requests: 20,
            cpu_threshold: 100.0,
            memory_threshold: 100.0,
            disk_threshold: 100.0,
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Application state over a fresh temp dir and in-memory live store
pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub _temp_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build with a tweaked configuration; the store starts available
    pub async fn with_config(configure: impl FnOnce(&mut config::AppConfig)) -> Self {
        Self::build(configure, true).await
    }

    /// Build with the live store unreachable from the start
    pub async fn offline() -> Self {
        Self::build(|_| {}, false).await
    }

    async fn build(configure: impl FnOnce(&mut config::AppConfig), live: bool) -> Self {
        shelter::metrics::init_metrics();

        let temp_dir = TempDir::new().unwrap();
        let mut config = test_config(temp_dir.path());
        configure(&mut config);

        let connector = UriConnector::new();
        let store = connector.memory_store();
        store.set_available(live);

        let state = AppState::with_connector(config, Arc::new(connector))
            .await
            .unwrap();

        Self {
            state,
            store,
            _temp_dir: temp_dir,
        }
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self._temp_dir.path().join(name)
    }
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub app: TestApp,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::serve(TestApp::new().await).await
    }

    pub async fn offline() -> Self {
        Self::serve(TestApp::offline().await).await
    }

    async fn serve(app: TestApp) -> Self {
        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let router = shelter::build_router(app.state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            app,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn state(&self) -> &AppState {
        &self.app.state
    }
}
