//! Data access facade
//!
//! The single entry point for reads and writes. Reads go cache, then live
//! store, then fallback snapshot; whichever source answers first wins and the
//! result is cached with the accessor's TTL. Writes go to the live store only
//! and invalidate every cache key the written record could be reached by.
//!
//! A write's invalidation is not ordered against a concurrent read that
//! started before it: such a read can put the pre-write value back into the
//! cache, where it lives until the accessor TTL expires.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::cache::CacheStore;
use super::connection::ConnectionManager;
use super::fallback::FallbackStore;
use super::keys::CacheKey;
use super::models::{
    Dataset, ID_FIELD, Lookup, Record, coerce_to_string, normalize_record, record_id,
};
use super::store::Query;
use crate::config::{AccessConfig, AppConfig, CacheConfig};
use crate::error::AppError;
use crate::metrics::DATA_READS_TOTAL;

/// Outcome of refreshing every snapshotted dataset
#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    /// Records written per dataset
    pub synced: BTreeMap<Dataset, usize>,
    pub failed: BTreeMap<Dataset, String>,
}

pub struct DataAccess {
    cache: Arc<CacheStore<Record>>,
    connection: Arc<ConnectionManager>,
    fallback: Arc<FallbackStore>,
    cache_config: CacheConfig,
    access: AccessConfig,
    max_sync_records: usize,
}

fn record_read(dataset: Dataset, source: &str) {
    DATA_READS_TOTAL
        .with_label_values(&[dataset.collection(), source])
        .inc();
}

impl DataAccess {
    pub fn new(
        cache: Arc<CacheStore<Record>>,
        connection: Arc<ConnectionManager>,
        fallback: Arc<FallbackStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            cache,
            connection,
            fallback,
            cache_config: config.cache.clone(),
            access: config.access.clone(),
            max_sync_records: config.fallback.max_sync_records,
        }
    }

    fn projection(&self, dataset: Dataset) -> &[String] {
        self.access
            .projections
            .get(&dataset)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    // Reads

    pub async fn get_by_id(&self, dataset: Dataset, id: &str) -> Result<Lookup<Record>, AppError> {
        let key = CacheKey::by_id(dataset, id)?;
        let ttl = Duration::from_secs(self.cache_config.ttl_by_id_secs);
        Ok(self.lookup_one(key, ID_FIELD, ttl).await)
    }

    pub async fn get_by_key(&self, dataset: Dataset, value: &str) -> Result<Lookup<Record>, AppError> {
        let key = CacheKey::by_key(dataset, value)?;
        let ttl = Duration::from_secs(self.cache_config.ttl_by_key_secs);
        Ok(self.lookup_one(key, dataset.natural_key(), ttl).await)
    }

    /// Records owned by `owner_id`, at most `access.max_scan_results`
    pub async fn list_by_owner(
        &self,
        dataset: Dataset,
        owner_id: &str,
    ) -> Result<Lookup<Vec<Record>>, AppError> {
        let key = CacheKey::by_owner(dataset, owner_id)?;
        let field = dataset.owner_field().ok_or_else(|| {
            AppError::Validation(format!("{dataset} cannot be listed by owner"))
        })?;
        let ttl = Duration::from_secs(self.cache_config.ttl_scan_secs);
        let limit = self.access.max_scan_results;

        let mut loaded = false;
        let result = self
            .cache
            .read_through(&key, ttl, || {
                loaded = true;
                self.load_many(key.dataset, field, key.arg.clone(), limit)
            })
            .await;
        if !loaded {
            record_read(dataset, "cache");
        }

        Ok(result.map(|value| match value {
            Value::Array(records) => records,
            other => vec![other],
        }))
    }

    pub async fn user_by_id(&self, id: &str) -> Result<Lookup<Record>, AppError> {
        self.get_by_id(Dataset::Users, id).await
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Lookup<Record>, AppError> {
        self.get_by_key(Dataset::Users, username).await
    }

    pub async fn products_by_seller(&self, seller_id: &str) -> Result<Lookup<Vec<Record>>, AppError> {
        self.list_by_owner(Dataset::Products, seller_id).await
    }

    async fn lookup_one(&self, key: CacheKey, field: &'static str, ttl: Duration) -> Lookup<Record> {
        let dataset = key.dataset;
        let mut loaded = false;
        let result = self
            .cache
            .read_through(&key, ttl, || {
                loaded = true;
                self.load_one(dataset, field, key.arg.clone())
            })
            .await;
        if !loaded {
            record_read(dataset, "cache");
        }
        result
    }

    async fn load_one(&self, dataset: Dataset, field: &'static str, value: String) -> Lookup<Record> {
        let query = Query::new(dataset.collection())
            .filter(field, &value)
            .projection(self.projection(dataset));

        match self
            .connection
            .call("find_one", |client| async move { client.find_one(&query).await })
            .await
        {
            Ok(found) => {
                record_read(dataset, "live");
                return found.map(normalize_record).map_or(Lookup::NotFound, Lookup::Found);
            }
            Err(error) => {
                tracing::debug!(%dataset, field, %error, "Live read failed; using fallback");
            }
        }

        let result = self
            .from_fallback(move |fallback| fallback.lookup_by_field(dataset, field, &value))
            .await
            .unwrap_or(Lookup::Degraded);
        match &result {
            Lookup::Found(_) => record_read(dataset, "fallback"),
            Lookup::NotFound => record_read(dataset, "none"),
            Lookup::Degraded => {
                record_read(dataset, "degraded");
                tracing::warn!(%dataset, "No source can serve the read");
            }
        }
        result
    }

    async fn load_many(
        &self,
        dataset: Dataset,
        field: &'static str,
        value: String,
        limit: usize,
    ) -> Lookup<Record> {
        let query = Query::new(dataset.collection())
            .filter(field, &value)
            .projection(self.projection(dataset))
            .limit(limit);

        match self
            .connection
            .call("find_many", |client| async move { client.find_many(&query).await })
            .await
        {
            Ok(records) => {
                record_read(dataset, "live");
                let records = records.into_iter().take(limit).map(normalize_record).collect();
                return Lookup::Found(Value::Array(records));
            }
            Err(error) => {
                tracing::debug!(%dataset, field, %error, "Live scan failed; using fallback");
            }
        }

        let records = self
            .from_fallback(move |fallback| fallback.filter_by_field(dataset, field, &value, limit))
            .await
            .flatten();
        match records {
            Some(records) => {
                record_read(dataset, "fallback");
                Lookup::Found(Value::Array(records))
            }
            None => {
                record_read(dataset, "degraded");
                tracing::warn!(%dataset, "No source can serve the scan");
                Lookup::Degraded
            }
        }
    }

    /// Run a snapshot read on the blocking pool; a cold read touches the disk
    async fn from_fallback<T, F>(&self, read: F) -> Option<T>
    where
        F: FnOnce(&FallbackStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let fallback = self.fallback.clone();
        match tokio::task::spawn_blocking(move || read(&fallback)).await {
            Ok(result) => Some(result),
            Err(error) => {
                tracing::error!(%error, "Fallback read task failed");
                None
            }
        }
    }

    // Writes

    /// Insert a record, returning its identifier
    pub async fn insert(&self, dataset: Dataset, record: Record) -> Result<String, AppError> {
        if !record.is_object() {
            return Err(AppError::Validation("record must be a JSON object".to_string()));
        }

        let image = record.clone();
        let collection = dataset.collection();
        let id = self
            .connection
            .call("insert_one", |client| async move {
                client.insert_one(collection, record).await
            })
            .await?;

        self.invalidate_images(dataset, &id, &[&image]);
        tracing::debug!(%dataset, id = %id, "Record inserted");
        Ok(id)
    }

    /// Apply `changes` to the record with `id`
    pub async fn update(&self, dataset: Dataset, id: &str, changes: Record) -> Result<(), AppError> {
        let key = CacheKey::by_id(dataset, id)?;
        if !changes.as_object().is_some_and(|fields| !fields.is_empty()) {
            return Err(AppError::Validation(
                "changes must be a non-empty JSON object".to_string(),
            ));
        }

        let image = changes.clone();
        let collection = dataset.collection();
        let target = key.arg.clone();
        let before = self
            .connection
            .call("update_one", |client| async move {
                client.update_one(collection, &target, changes).await
            })
            .await?;

        match before {
            Some(before) => {
                self.invalidate_images(dataset, &key.arg, &[&before, &image]);
                Ok(())
            }
            None => {
                self.cache.delete(&key);
                Err(AppError::NotFound)
            }
        }
    }

    /// Remove the record with `id`
    pub async fn delete(&self, dataset: Dataset, id: &str) -> Result<(), AppError> {
        let key = CacheKey::by_id(dataset, id)?;
        let collection = dataset.collection();
        let target = key.arg.clone();
        let removed = self
            .connection
            .call("delete_one", |client| async move {
                client.delete_one(collection, &target).await
            })
            .await?;

        match removed {
            Some(removed) => {
                self.invalidate_images(dataset, &key.arg, &[&removed]);
                Ok(())
            }
            None => {
                self.cache.delete(&key);
                Err(AppError::NotFound)
            }
        }
    }

    /// Drop cached reads of the record with `id`
    ///
    /// Covers the by-id entry and every natural-key or owner-scan entry whose
    /// cached value carries the record.
    pub fn invalidate(&self, dataset: Dataset, id: &str) -> Result<usize, AppError> {
        let target = CacheKey::by_id(dataset, id)?;
        let removed = self.cache.delete_where(|key, value| {
            key.dataset == dataset && (*key == target || carries_id(value, &target.arg))
        });
        tracing::debug!(%dataset, id = %target.arg, removed, "Cache invalidated");
        Ok(removed)
    }

    fn invalidate_images(&self, dataset: Dataset, id: &str, images: &[&Record]) -> usize {
        let keys = invalidation_keys(dataset, id, images);
        let removed = self.cache.delete_many(&keys);
        tracing::debug!(%dataset, id, keys = keys.len(), removed, "Cache invalidated");
        removed
    }

    // Fallback refresh

    /// Copy up to `fallback.max_sync_records` live records into the snapshot
    pub async fn sync_dataset(&self, dataset: Dataset) -> Result<usize, AppError> {
        if !self.fallback.is_snapshotted(dataset) {
            return Err(AppError::Validation(format!(
                "{dataset} has no fallback snapshot"
            )));
        }

        let query = Query::new(dataset.collection()).limit(self.max_sync_records);
        let records = self
            .connection
            .call("find_many", |client| async move { client.find_many(&query).await })
            .await?;
        let count = records.len();

        let fallback = self.fallback.clone();
        let written = tokio::task::spawn_blocking(move || fallback.sync_from_source(dataset, records))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("snapshot writer task failed: {e}")))?;

        if written {
            Ok(count)
        } else {
            Err(AppError::Internal(anyhow::anyhow!(
                "failed to write {dataset} snapshot"
            )))
        }
    }

    /// Refresh every snapshotted dataset
    pub async fn sync_all(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for &dataset in self.fallback.datasets() {
            match self.sync_dataset(dataset).await {
                Ok(count) => {
                    report.synced.insert(dataset, count);
                }
                Err(error) => {
                    tracing::warn!(%dataset, %error, "Fallback sync skipped");
                    report.failed.insert(dataset, error.to_string());
                }
            }
        }
        report
    }
}

/// Whether a cached value is, or lists, the record with `id`
fn carries_id(value: &Record, id: &str) -> bool {
    match value {
        Value::Array(records) => records.iter().any(|record| carries_id(record, id)),
        record => record_id(record).as_deref() == Some(id),
    }
}

/// Every key under which a record with `id` and the given images could be cached
fn invalidation_keys(dataset: Dataset, id: &str, images: &[&Record]) -> Vec<CacheKey> {
    let mut keys = Vec::new();
    if let Ok(key) = CacheKey::by_id(dataset, id) {
        keys.push(key);
    }

    for image in images {
        if let Some(value) = image.get(dataset.natural_key()).and_then(coerce_to_string) {
            if let Ok(key) = CacheKey::by_key(dataset, &value) {
                keys.push(key);
            }
        }
        if let Some(owner) = dataset
            .owner_field()
            .and_then(|field| image.get(field))
            .and_then(coerce_to_string)
        {
            if let Ok(key) = CacheKey::by_owner(dataset, &owner) {
                keys.push(key);
            }
        }
    }

    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::data::memory::MemoryStore;
    use crate::data::store::{DocumentStore, UriConnector};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<MemoryStore>,
        connection: Arc<ConnectionManager>,
        fallback: Arc<FallbackStore>,
        cache: Arc<CacheStore<Record>>,
        access: DataAccess,
    }

    async fn fixture_with(configure: impl FnOnce(&mut AppConfig), live: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        configure(&mut config);

        let connector = UriConnector::new();
        let store = connector.memory_store();
        store.set_available(live);
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(connector),
            config.database.clone(),
            config.reconnect.clone(),
        ));
        assert_eq!(connection.initialize().await, live);

        let fallback = Arc::new(FallbackStore::new(config.fallback.clone()));
        fallback.ensure_initialized();
        let cache = Arc::new(CacheStore::new("records", config.cache.max_capacity));
        let access = DataAccess::new(cache.clone(), connection.clone(), fallback.clone(), &config);

        Fixture {
            _dir: dir,
            store,
            connection,
            fallback,
            cache,
            access,
        }
    }

    async fn fixture(live: bool) -> Fixture {
        fixture_with(|_| {}, live).await
    }

    #[tokio::test]
    async fn live_reads_are_cached() {
        let f = fixture(true).await;
        f.store
            .insert_one("users", json!({"_id": "u1", "username": "ada"}))
            .await
            .unwrap();

        let first = f.access.user_by_id("u1").await.unwrap();
        assert_eq!(first.found().unwrap()["username"], json!("ada"));

        f.store.set_available(false);
        let second = f.access.user_by_id("u1").await.unwrap();
        assert_eq!(second.found().unwrap()["username"], json!("ada"));
        assert_eq!(f.cache.stats().hits, 1);
        assert!(f.connection.is_connected());
    }

    #[tokio::test]
    async fn disconnected_reads_come_from_fallback() {
        let f = fixture(false).await;
        f.fallback.sync_from_source(
            Dataset::Users,
            vec![json!({"_id": "u1", "username": "ada"})],
        );

        let found = f.access.user_by_username("ada").await.unwrap();
        assert_eq!(found.found().unwrap()["_id"], json!("u1"));
        assert_eq!(f.cache.len(), 1);
    }

    #[tokio::test]
    async fn absent_everywhere_is_not_found() {
        let f = fixture(true).await;
        assert_eq!(f.access.user_by_id("ghost").await.unwrap(), Lookup::NotFound);

        let f = fixture(false).await;
        assert_eq!(f.access.user_by_id("ghost").await.unwrap(), Lookup::NotFound);
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn unsnapshotted_dataset_degrades_when_live_is_down() {
        let f = fixture(false).await;
        assert_eq!(
            f.access.get_by_id(Dataset::Orders, "o1").await.unwrap(),
            Lookup::Degraded
        );
        assert_eq!(
            f.access.list_by_owner(Dataset::Orders, "u1").await.unwrap(),
            Lookup::Degraded
        );
    }

    #[tokio::test]
    async fn live_failure_mid_read_falls_back() {
        let f = fixture(true).await;
        f.fallback.sync_from_source(
            Dataset::Categories,
            vec![json!({"_id": "c1", "slug": "tools"})],
        );
        f.store.set_available(false);

        let found = f.access.get_by_key(Dataset::Categories, "tools").await.unwrap();
        assert!(found.is_found());
        assert!(!f.connection.is_connected());
        f.connection.shutdown().await;
    }

    #[tokio::test]
    async fn update_invalidates_every_derived_key() {
        let f = fixture(true).await;
        f.store
            .insert_one(
                "products",
                json!({"_id": "p1", "sku": "LAMP-1", "seller_id": "s1", "price": 10}),
            )
            .await
            .unwrap();

        f.access.get_by_id(Dataset::Products, "p1").await.unwrap();
        f.access.get_by_key(Dataset::Products, "LAMP-1").await.unwrap();
        f.access.products_by_seller("s1").await.unwrap();
        assert_eq!(f.cache.len(), 3);

        f.access
            .update(Dataset::Products, "p1", json!({"sku": "LAMP-2", "price": 12}))
            .await
            .unwrap();
        assert!(f.cache.is_empty());

        let fresh = f.access.get_by_id(Dataset::Products, "p1").await.unwrap();
        assert_eq!(fresh.found().unwrap()["price"], json!(12));
        assert_eq!(
            f.access.get_by_key(Dataset::Products, "LAMP-1").await.unwrap(),
            Lookup::NotFound
        );
    }

    #[tokio::test]
    async fn delete_and_insert_invalidate() {
        let f = fixture(true).await;
        let id = f
            .access
            .insert(Dataset::Products, json!({"sku": "A", "seller_id": "s1"}))
            .await
            .unwrap();

        let listed = f.access.products_by_seller("s1").await.unwrap().found().unwrap();
        assert_eq!(listed.len(), 1);

        f.access
            .insert(Dataset::Products, json!({"sku": "B", "seller_id": "s1"}))
            .await
            .unwrap();
        let listed = f.access.products_by_seller("s1").await.unwrap().found().unwrap();
        assert_eq!(listed.len(), 2);

        f.access.delete(Dataset::Products, &id).await.unwrap();
        assert_eq!(
            f.access.get_by_id(Dataset::Products, &id).await.unwrap(),
            Lookup::NotFound
        );
        assert!(matches!(
            f.access.delete(Dataset::Products, &id).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn writes_fail_when_disconnected() {
        let f = fixture(false).await;
        let result = f
            .access
            .insert(Dataset::Users, json!({"username": "ada"}))
            .await;
        assert!(matches!(result, Err(AppError::Unavailable(_))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn scans_are_capped() {
        let f = fixture_with(|config| config.access.max_scan_results = 5, true).await;
        for n in 0..12 {
            f.store
                .insert_one("products", json!({"sku": format!("S-{n}"), "seller_id": "s1"}))
                .await
                .unwrap();
        }

        let listed = f.access.products_by_seller("s1").await.unwrap().found().unwrap();
        assert_eq!(listed.len(), 5);
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected() {
        let f = fixture(true).await;
        assert!(matches!(
            f.access.user_by_id("   ").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            f.access.list_by_owner(Dataset::Users, "u1").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            f.access.insert(Dataset::Users, json!(["not", "an", "object"])).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn projections_limit_live_fields() {
        let f = fixture_with(
            |config| {
                config
                    .access
                    .projections
                    .insert(Dataset::Users, vec!["username".to_string()]);
            },
            true,
        )
        .await;
        f.store
            .insert_one("users", json!({"_id": "u1", "username": "ada", "password_hash": "x"}))
            .await
            .unwrap();

        let user = f.access.user_by_id("u1").await.unwrap().found().unwrap();
        assert_eq!(user["username"], json!("ada"));
        assert!(user.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn invalidate_drops_cached_copy_and_derived_keys() {
        let f = fixture(true).await;
        f.store
            .insert_one("users", json!({"_id": "u1", "username": "ada"}))
            .await
            .unwrap();
        f.access.user_by_id("u1").await.unwrap();
        f.access.user_by_username("ada").await.unwrap();

        assert_eq!(f.access.invalidate(Dataset::Users, "u1").unwrap(), 2);
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn invalidate_then_read_sees_fresh_key_and_owner_reads() {
        let f = fixture(true).await;
        f.store
            .insert_one("users", json!({"_id": "u1", "username": "ada", "email": "old"}))
            .await
            .unwrap();
        f.store
            .insert_one("products", json!({"_id": "p1", "sku": "LAMP-1", "seller_id": "s1"}))
            .await
            .unwrap();
        f.access.user_by_username("ada").await.unwrap();
        f.access.products_by_seller("s1").await.unwrap();

        // Changed behind the facade's back
        f.store
            .update_one("users", "u1", json!({"email": "new"}))
            .await
            .unwrap();
        f.store
            .update_one("products", "p1", json!({"price": 7}))
            .await
            .unwrap();

        assert_eq!(f.access.invalidate(Dataset::Users, "u1").unwrap(), 1);
        assert_eq!(f.access.invalidate(Dataset::Products, "p1").unwrap(), 1);

        let user = f.access.user_by_username("ada").await.unwrap().found().unwrap();
        assert_eq!(user["email"], json!("new"));
        let listed = f.access.products_by_seller("s1").await.unwrap().found().unwrap();
        assert_eq!(listed[0]["price"], json!(7));
    }

    #[tokio::test]
    async fn invalidate_leaves_other_records_cached() {
        let f = fixture(true).await;
        f.store
            .insert_one("products", json!({"_id": "p1", "sku": "A", "seller_id": "s1"}))
            .await
            .unwrap();
        f.store
            .insert_one("products", json!({"_id": "p2", "sku": "B", "seller_id": "s2"}))
            .await
            .unwrap();
        f.access.get_by_key(Dataset::Products, "B").await.unwrap();
        f.access.products_by_seller("s2").await.unwrap();

        assert_eq!(f.access.invalidate(Dataset::Products, "p1").unwrap(), 0);
        assert_eq!(f.cache.len(), 2);
    }

    #[tokio::test]
    async fn empty_update_is_rejected() {
        let f = fixture(true).await;
        f.store
            .insert_one("users", json!({"_id": "u1", "username": "ada"}))
            .await
            .unwrap();

        assert!(matches!(
            f.access.update(Dataset::Users, "u1", json!({})).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn degraded_read_recreates_missing_snapshot() {
        let f = fixture(false).await;
        let path = f.fallback.snapshot_path(Dataset::Users);
        std::fs::remove_file(&path).unwrap();

        let admin = f.access.user_by_username("admin").await.unwrap();
        assert_eq!(admin.found().unwrap()["role"], json!("admin"));
        assert!(path.exists());
        f.connection.shutdown().await;
    }

    #[tokio::test]
    async fn sync_copies_live_records_into_snapshot() {
        let f = fixture(true).await;
        f.store
            .insert_one("users", json!({"_id": "u1", "username": "ada"}))
            .await
            .unwrap();

        let report = f.access.sync_all().await;
        assert_eq!(report.synced.get(&Dataset::Users), Some(&1));
        assert_eq!(report.synced.get(&Dataset::Products), Some(&0));
        assert!(report.failed.is_empty());

        let snapshot = f.fallback.read(Dataset::Users).unwrap();
        assert_eq!(snapshot[0]["username"], json!("ada"));
    }
}
