//! Live store connection manager
//!
//! Owns the single handle to the live store and its lifecycle:
//!
//! ```text
//! Uninitialized ──initialize ok──▶ Connected ──call/probe failure──▶ Disconnected
//!       │                              ▲                                  │
//!       └──initialize failure──────────┼──────────────────────────────────┤
//!                                      └────────reconnect ok──────────────┘
//! ```
//!
//! Loss of connectivity is detected lazily by whichever caller hits it. At most
//! one reconnection task runs at a time; it retries with exponential backoff
//! until connected or stopped.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::store::{Connector, DocumentStore, StoreError};
use crate::config::{DatabaseConfig, ReconnectConfig};
use crate::error::AppError;
use crate::metrics::{CONNECTION_STATE, RECONNECT_ATTEMPTS_TOTAL, observe_live_query};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Connected,
    Disconnected,
}

impl ConnectionState {
    fn gauge_value(self) -> i64 {
        match self {
            ConnectionState::Uninitialized => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Disconnected => 2,
        }
    }
}

/// Point-in-time view of the connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub connected_since: Option<DateTime<Utc>>,
    pub reconnect_attempts: u64,
    pub reconnecting: bool,
}

struct Inner {
    state: ConnectionState,
    client: Option<Arc<dyn DocumentStore>>,
    last_error: Option<String>,
    last_attempt_at: Option<DateTime<Utc>>,
    connected_since: Option<DateTime<Utc>>,
    reconnect_attempts: u64,
}

impl Inner {
    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        CONNECTION_STATE.set(state.gauge_value());
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    database: DatabaseConfig,
    reconnect: ReconnectConfig,
    inner: RwLock<Inner>,
    reconnector: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        database: DatabaseConfig,
        reconnect: ReconnectConfig,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        CONNECTION_STATE.set(ConnectionState::Uninitialized.gauge_value());
        Self {
            connector,
            database,
            reconnect,
            inner: RwLock::new(Inner {
                state: ConnectionState::Uninitialized,
                client: None,
                last_error: None,
                last_attempt_at: None,
                connected_since: None,
                reconnect_attempts: 0,
            }),
            reconnector: Mutex::new(None),
            stop,
        }
    }

    /// Connect and probe
    ///
    /// Returns whether the manager ended up Connected. Never fails: errors are
    /// recorded in [`status`](Self::status). A configuration error leaves the
    /// state untouched (Uninitialized on first use).
    pub async fn initialize(&self) -> bool {
        self.inner.write().last_attempt_at = Some(Utc::now());

        let deadline = self.database.server_selection_timeout() + self.database.query_timeout();
        let attempt = async {
            let store = self.connector.connect(&self.database).await?;
            store.ping().await?;
            Ok::<_, StoreError>(store)
        };
        let result = match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(deadline)),
        };

        let mut inner = self.inner.write();
        match result {
            Ok(store) => {
                inner.client = Some(store);
                inner.last_error = None;
                inner.connected_since = Some(Utc::now());
                inner.set_state(ConnectionState::Connected);
                tracing::info!(database = %self.database.name, "Connected to live store");
                true
            }
            Err(StoreError::Config(message)) => {
                tracing::error!(error = %message, "Live store is not configured");
                inner.client = None;
                inner.last_error = Some(message);
                false
            }
            Err(error) => {
                tracing::warn!(%error, "Live store connection failed");
                inner.client = None;
                inner.connected_since = None;
                inner.last_error = Some(error.to_string());
                inner.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnector
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn status(&self) -> ConnectionStatus {
        let reconnecting = self.is_reconnecting();
        let inner = self.inner.read();
        ConnectionStatus {
            state: inner.state,
            last_error: inner.last_error.clone(),
            last_attempt_at: inner.last_attempt_at,
            connected_since: inner.connected_since,
            reconnect_attempts: inner.reconnect_attempts,
            reconnecting,
        }
    }

    /// The live handle, if Connected
    ///
    /// The view may be stale: a handle returned here can fail on first use.
    pub fn client(&self) -> Option<Arc<dyn DocumentStore>> {
        let inner = self.inner.read();
        match inner.state {
            ConnectionState::Connected => inner.client.clone(),
            _ => None,
        }
    }

    /// Start the reconnection task unless one is already running
    ///
    /// Returns whether a new task was spawned.
    pub fn schedule_reconnect(self: &Arc<Self>, delay: Duration) -> bool {
        if *self.stop.borrow() {
            return false;
        }

        let mut slot = self.reconnector.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!("Reconnection already in progress");
            return false;
        }

        let manager = Arc::clone(self);
        let stop = self.stop.subscribe();
        *slot = Some(tokio::spawn(async move {
            manager.reconnect_loop(delay, stop).await;
        }));
        true
    }

    async fn reconnect_loop(self: Arc<Self>, mut delay: Duration, mut stop: watch::Receiver<bool>) {
        loop {
            tracing::info!(delay_ms = delay.as_millis() as u64, "Reconnection scheduled");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => {
                    tracing::debug!("Reconnection cancelled");
                    return;
                }
            }
            if *stop.borrow() {
                return;
            }
            if self.is_connected() {
                return;
            }

            self.inner.write().reconnect_attempts += 1;
            if self.initialize().await {
                RECONNECT_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                tracing::info!("Reconnected to live store");
                return;
            }
            RECONNECT_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();

            if self.state() == ConnectionState::Uninitialized {
                tracing::warn!("Live store is not configured; giving up on reconnection");
                return;
            }
            delay = self.reconnect.next_delay(delay);
        }
    }

    /// Record a connectivity failure seen by a caller
    ///
    /// Moves Connected to Disconnected and makes sure a reconnection is
    /// pending.
    pub fn report_failure(self: &Arc<Self>, error: &StoreError) {
        let (transitioned, state) = {
            let mut inner = self.inner.write();
            inner.last_error = Some(error.to_string());
            let transitioned = inner.state == ConnectionState::Connected;
            if transitioned {
                inner.client = None;
                inner.connected_since = None;
                inner.set_state(ConnectionState::Disconnected);
            }
            (transitioned, inner.state)
        };

        if transitioned {
            tracing::warn!(%error, "Lost connection to live store");
        }
        if state == ConnectionState::Disconnected {
            self.schedule_reconnect(self.reconnect.initial_delay());
        }
    }

    /// Active liveness check
    pub async fn probe(self: &Arc<Self>) -> bool {
        let Some(client) = self.client() else {
            if self.state() == ConnectionState::Disconnected {
                self.schedule_reconnect(self.reconnect.initial_delay());
            }
            return false;
        };

        let timeout = self.database.query_timeout();
        let result = match tokio::time::timeout(timeout, client.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };
        match result {
            Ok(()) => true,
            Err(error) => {
                self.report_failure(&error);
                false
            }
        }
    }

    /// Run one bounded call against the live handle
    ///
    /// Fails with [`AppError::Unavailable`] when not Connected, on timeout, or
    /// on a connectivity error; the latter two also report the failure.
    pub async fn call<T, F, Fut>(self: &Arc<Self>, operation: &'static str, f: F) -> Result<T, AppError>
    where
        F: FnOnce(Arc<dyn DocumentStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let Some(client) = self.client() else {
            return Err(AppError::Unavailable(
                "live store is not connected".to_string(),
            ));
        };

        let timeout = self.database.query_timeout();
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, f(client)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };

        let status = match &result {
            Ok(_) => "success",
            Err(error) if error.is_connectivity() => "unavailable",
            Err(_) => "error",
        };
        observe_live_query(operation, status, started.elapsed());

        result.map_err(|error| {
            if error.is_connectivity() {
                self.report_failure(&error);
            } else {
                tracing::error!(operation, %error, "Live store call failed");
            }
            error.into()
        })
    }

    /// Stop the reconnection task and wait for it
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let handle = self.reconnector.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "Reconnection task ended abnormally");
            }
        }
        tracing::debug!("Connection manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::data::memory::MemoryStore;
    use crate::data::store::{MockConnector, Query, UriConnector};
    use std::path::Path;

    fn manager_with(connector: Arc<dyn Connector>, uri: Option<&str>) -> Arc<ConnectionManager> {
        let config = test_config(Path::new("/nonexistent"));
        let mut database = config.database;
        database.uri = uri.map(str::to_string);
        Arc::new(ConnectionManager::new(connector, database, config.reconnect))
    }

    fn memory_manager() -> (Arc<ConnectionManager>, Arc<MemoryStore>) {
        let connector = UriConnector::new();
        let store = connector.memory_store();
        (manager_with(Arc::new(connector), Some("memory://test")), store)
    }

    #[tokio::test]
    async fn initialize_connects_through_the_connector() {
        let store = Arc::new(MemoryStore::new());
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(move |_| Ok(store.clone() as Arc<dyn DocumentStore>));

        let manager = manager_with(Arc::new(connector), Some("memory://test"));
        assert!(manager.initialize().await);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.last_error.is_none());
        assert!(status.connected_since.is_some());
        assert!(manager.client().is_some());
    }

    #[tokio::test]
    async fn missing_uri_keeps_manager_uninitialized() {
        let manager = manager_with(Arc::new(UriConnector::new()), None);
        assert!(!manager.initialize().await);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Uninitialized);
        assert!(status.last_error.unwrap().contains("database.uri"));
        assert!(manager.client().is_none());
    }

    #[tokio::test]
    async fn unreachable_host_reports_disconnected() {
        let manager = manager_with(
            Arc::new(UriConnector::new()),
            Some("mongodb://127.0.0.1:1/?directConnection=true"),
        );
        assert!(!manager.initialize().await);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.last_error.unwrap_or_default().is_empty());
        assert!(manager.client().is_none());
    }

    #[tokio::test]
    async fn only_one_reconnection_runs_at_a_time() {
        let (manager, store) = memory_manager();
        store.set_available(false);
        assert!(!manager.initialize().await);

        assert!(manager.schedule_reconnect(Duration::from_millis(10)));
        assert!(!manager.schedule_reconnect(Duration::from_millis(10)));
        assert!(manager.is_reconnecting());

        store.set_available(true);
        for _ in 0..200 {
            if manager.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.is_connected());
        assert!(manager.status().reconnect_attempts >= 1);

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reported_failure_disconnects_then_recovers() {
        let (manager, _store) = memory_manager();
        assert!(manager.initialize().await);

        manager.report_failure(&StoreError::Unavailable("connection reset".to_string()));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.client().is_none());
        assert!(manager.is_reconnecting());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.is_connected());
        assert!(manager.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_as_unavailable() {
        let (manager, store) = memory_manager();
        assert!(manager.initialize().await);
        store.set_delay(Some(Duration::from_secs(1)));

        let result = manager
            .call("find_one", |client| async move {
                client.find_one(&Query::new("users")).await
            })
            .await;
        assert!(matches!(result, Err(AppError::Unavailable(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.shutdown().await;
        assert!(!manager.is_reconnecting());
    }

    #[tokio::test]
    async fn query_errors_do_not_disconnect() {
        let (manager, store) = memory_manager();
        assert!(manager.initialize().await);
        store
            .insert_one("users", serde_json::json!({"_id": "u1"}))
            .await
            .unwrap();

        let result = manager
            .call("insert_one", |client| async move {
                client
                    .insert_one("users", serde_json::json!({"_id": "u1"}))
                    .await
            })
            .await;
        assert!(matches!(result, Err(AppError::Internal(_))));
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn calls_fail_fast_when_not_connected() {
        let (manager, _store) = memory_manager();
        let result = manager
            .call("ping", |client| async move { client.ping().await })
            .await;
        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }
}
