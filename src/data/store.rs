//! Live document store abstraction
//!
//! The connection manager talks to the live database only through
//! [`DocumentStore`] handles produced by a [`Connector`]. Driver failures are
//! classified into [`StoreError`] so callers can tell connectivity problems
//! (fall back, reconnect) from query problems (surface to caller).

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::memory::MemoryStore;
use super::models::Record;
use crate::config::DatabaseConfig;
use crate::error::AppError;

/// Live store failure
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Server unreachable, connection dropped, no server selectable
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// Call exceeded its deadline
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Server rejected the operation
    #[error("query failed: {0}")]
    Query(String),

    /// Connection settings are missing or invalid
    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the failure says something about the connection rather than the query.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => {
                AppError::Unavailable(err.to_string())
            }
            StoreError::Query(msg) => AppError::Internal(anyhow::anyhow!("query failed: {msg}")),
            StoreError::Config(msg) => AppError::Config(msg),
        }
    }
}

/// Single-field read against one collection
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: &'static str,
    /// `(field, value)`; values are compared in their string form
    pub filter: Option<(String, String)>,
    /// Fields to return; empty returns whole documents
    pub projection: Vec<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: &'static str) -> Self {
        Self {
            collection,
            filter: None,
            projection: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, value: &str) -> Self {
        self.filter = Some((field.to_string(), value.to_string()));
        self
    }

    pub fn projection(mut self, fields: &[String]) -> Self {
        self.projection = fields.to_vec();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Handle to a live document database
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Liveness probe
    async fn ping(&self) -> Result<(), StoreError>;

    async fn find_one(&self, query: &Query) -> Result<Option<Record>, StoreError>;

    async fn find_many(&self, query: &Query) -> Result<Vec<Record>, StoreError>;

    /// Insert a record, returning its identifier
    async fn insert_one(&self, collection: &str, record: Record) -> Result<String, StoreError>;

    /// Apply `changes` to the record with `id`, returning the record as it was before
    async fn update_one(
        &self,
        collection: &str,
        id: &str,
        changes: Record,
    ) -> Result<Option<Record>, StoreError>;

    /// Remove the record with `id`, returning it
    async fn delete_one(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError>;
}

/// Produces live store handles from configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn DocumentStore>, StoreError>;
}

/// Connector choosing the backend from the URI scheme
///
/// - `mongodb://`, `mongodb+srv://` -> [`MongoStore`](super::mongo::MongoStore)
/// - `memory://` -> a process-local [`MemoryStore`], shared across reconnects
pub struct UriConnector {
    memory: Arc<MemoryStore>,
}

impl UriConnector {
    pub fn new() -> Self {
        Self {
            memory: Arc::new(MemoryStore::new()),
        }
    }

    /// The store handed out for `memory://` URIs
    pub fn memory_store(&self) -> Arc<MemoryStore> {
        self.memory.clone()
    }
}

impl Default for UriConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for UriConnector {
    async fn connect(&self, config: &DatabaseConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let uri = config
            .uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| StoreError::Config("database.uri is not set".to_string()))?;

        if uri.starts_with("memory://") {
            return Ok(self.memory.clone());
        }

        if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
            let store = super::mongo::MongoStore::connect(uri, config).await?;
            return Ok(Arc::new(store));
        }

        Err(StoreError::Config(format!(
            "unsupported database.uri scheme: {}",
            uri.split("://").next().unwrap_or(uri)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database_config(uri: Option<&str>) -> DatabaseConfig {
        DatabaseConfig {
            uri: uri.map(str::to_string),
            name: "shelter_test".to_string(),
            app_name: "shelter-test".to_string(),
            connect_timeout_ms: 200,
            server_selection_timeout_ms: 200,
            query_timeout_ms: 200,
            max_pool_size: 2,
            min_pool_size: 0,
        }
    }

    #[tokio::test]
    async fn missing_uri_is_a_configuration_error() {
        let connector = UriConnector::new();
        let result = connector.connect(&database_config(None)).await;
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let connector = UriConnector::new();
        let result = connector
            .connect(&database_config(Some("postgres://localhost/db")))
            .await;
        assert!(matches!(result, Err(StoreError::Config(message)) if message.contains("postgres")));
    }

    #[tokio::test]
    async fn memory_scheme_shares_one_store() {
        let connector = UriConnector::new();
        let config = database_config(Some("memory://local"));
        let store = connector.connect(&config).await.unwrap();
        store.ping().await.unwrap();

        connector
            .memory_store()
            .insert_one("users", serde_json::json!({"_id": "u1", "username": "ada"}))
            .await
            .unwrap();

        let again = connector.connect(&config).await.unwrap();
        let found = again
            .find_one(&Query::new("users").filter("username", "ada"))
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn connectivity_classification() {
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_connectivity());
        assert!(StoreError::Unavailable("refused".to_string()).is_connectivity());
        assert!(!StoreError::Query("duplicate key".to_string()).is_connectivity());
        assert!(matches!(
            AppError::from(StoreError::Timeout(Duration::from_secs(1))),
            AppError::Unavailable(_)
        ));
    }
}
