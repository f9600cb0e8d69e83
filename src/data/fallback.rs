//! Fallback snapshot store
//!
//! One JSON file per snapshotted dataset under `fallback.data_dir`, refreshed
//! from the live store and read when the live store cannot answer. Parsed
//! snapshots are kept in a small TTL cache so repeated degraded reads do not
//! hit the disk.

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::cache::CacheStore;
use super::keys::CacheKey;
use super::models::{Dataset, Lookup, Record, coerce_to_string, normalize_record};
use crate::config::FallbackConfig;
use crate::error::AppError;
use crate::metrics::FALLBACK_SYNCS_TOTAL;
use crate::storage::{self, JsonFileError};

pub struct FallbackStore {
    config: FallbackConfig,
    cache: CacheStore<Arc<Vec<Record>>>,
}

impl FallbackStore {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            cache: CacheStore::new("fallback", Dataset::ALL.len()),
        }
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.config.datasets
    }

    pub fn is_snapshotted(&self, dataset: Dataset) -> bool {
        self.config.datasets.contains(&dataset)
    }

    pub fn snapshot_path(&self, dataset: Dataset) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.json", dataset.collection()))
    }

    /// Snapshot contents written when none exists
    fn default_records(&self, dataset: Dataset) -> Vec<Record> {
        match dataset {
            Dataset::Users => {
                let admin = &self.config.bootstrap_admin;
                vec![json!({
                    "_id": "admin",
                    "username": admin.username,
                    "email": admin.email,
                    "display_name": admin.display_name,
                    "role": "admin",
                    "is_active": true,
                })]
            }
            Dataset::Products | Dataset::Categories | Dataset::Orders => Vec::new(),
        }
    }

    fn write_default(&self, dataset: Dataset) -> Result<Vec<Record>, AppError> {
        let records = self.default_records(dataset);
        storage::write_json_atomic(&self.snapshot_path(dataset), &records)?;
        self.cache.delete(&CacheKey::snapshot(dataset));
        Ok(records)
    }

    fn load(&self, dataset: Dataset) -> Result<Option<Vec<Record>>, AppError> {
        storage::read_json::<Vec<Record>>(&self.snapshot_path(dataset)).map_err(|error| {
            let reason = match error {
                JsonFileError::Io { source, .. } => source.to_string(),
                JsonFileError::Malformed { source, .. } => source.to_string(),
            };
            AppError::CorruptFallback { dataset, reason }
        })
    }

    /// Create missing snapshots and regenerate unreadable ones
    ///
    /// # Returns
    /// The datasets whose snapshot was (re)written.
    pub fn ensure_initialized(&self) -> Vec<Dataset> {
        let mut created = Vec::new();

        for &dataset in &self.config.datasets {
            let needs_default = match self.load(dataset) {
                Ok(Some(_)) => false,
                Ok(None) => {
                    tracing::info!(%dataset, "Creating default fallback snapshot");
                    true
                }
                Err(error) => {
                    tracing::warn!(%dataset, %error, "Regenerating fallback snapshot");
                    true
                }
            };
            if !needs_default {
                continue;
            }

            match self.write_default(dataset) {
                Ok(_) => created.push(dataset),
                Err(error) => {
                    tracing::error!(%dataset, %error, "Failed to write default fallback snapshot");
                }
            }
        }

        created
    }

    /// Replace a dataset's snapshot with `records`
    ///
    /// Identifiers are coerced to strings. On I/O failure the previous
    /// snapshot stays in place and `false` is returned. Blocking.
    pub fn sync_from_source(&self, dataset: Dataset, records: Vec<Record>) -> bool {
        if !self.is_snapshotted(dataset) {
            tracing::warn!(%dataset, "Refusing to sync a dataset without a snapshot");
            return false;
        }

        let records: Vec<Record> = records
            .into_iter()
            .filter(Record::is_object)
            .map(normalize_record)
            .collect();

        match storage::write_json_atomic(&self.snapshot_path(dataset), &records) {
            Ok(()) => {
                self.cache.delete(&CacheKey::snapshot(dataset));
                FALLBACK_SYNCS_TOTAL
                    .with_label_values(&[dataset.collection(), "success"])
                    .inc();
                tracing::info!(%dataset, records = records.len(), "Fallback snapshot synced");
                true
            }
            Err(error) => {
                FALLBACK_SYNCS_TOTAL
                    .with_label_values(&[dataset.collection(), "failure"])
                    .inc();
                tracing::error!(%dataset, %error, "Fallback snapshot sync failed");
                false
            }
        }
    }

    /// Current snapshot of `dataset`
    ///
    /// `None` when the dataset is not snapshotted or its file cannot be read
    /// even after regeneration.
    pub fn read(&self, dataset: Dataset) -> Option<Arc<Vec<Record>>> {
        if !self.is_snapshotted(dataset) {
            return None;
        }

        let key = CacheKey::snapshot(dataset);
        if let Some(records) = self.cache.get(&key) {
            return Some(records);
        }

        let records = match self.load(dataset) {
            Ok(Some(records)) => records,
            Ok(None) => {
                tracing::warn!(%dataset, "Fallback snapshot missing; recreating default");
                self.regenerate(dataset)?
            }
            Err(error) => {
                tracing::warn!(%dataset, %error, "Fallback snapshot unreadable; recreating default");
                self.regenerate(dataset)?
            }
        };

        let records = Arc::new(records.into_iter().map(normalize_record).collect::<Vec<_>>());
        self.cache.set(
            key,
            records.clone(),
            Duration::from_secs(self.config.cache_ttl_secs),
        );
        Some(records)
    }

    fn regenerate(&self, dataset: Dataset) -> Option<Vec<Record>> {
        match self.write_default(dataset) {
            Ok(records) => Some(records),
            Err(error) => {
                tracing::error!(%dataset, %error, "Fallback snapshot cannot be served");
                None
            }
        }
    }

    /// First snapshot record whose `field` equals `value`
    ///
    /// Degraded when the snapshot cannot be served.
    pub fn lookup_by_field(&self, dataset: Dataset, field: &str, value: &str) -> Lookup<Record> {
        let Some(records) = self.read(dataset) else {
            return Lookup::Degraded;
        };
        records
            .iter()
            .find(|record| field_matches(record, field, value))
            .cloned()
            .map_or(Lookup::NotFound, Lookup::Found)
    }

    /// Snapshot records whose `field` equals `value`, at most `limit`
    pub fn filter_by_field(
        &self,
        dataset: Dataset,
        field: &str,
        value: &str,
        limit: usize,
    ) -> Option<Vec<Record>> {
        let records = self.read(dataset)?;
        Some(
            records
                .iter()
                .filter(|record| field_matches(record, field, value))
                .take(limit)
                .cloned()
                .collect(),
        )
    }
}

fn field_matches(record: &Record, field: &str, value: &str) -> bool {
    record
        .get(field)
        .and_then(coerce_to_string)
        .is_some_and(|candidate| candidate == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FallbackStore {
        FallbackStore::new(test_config(dir.path()).fallback)
    }

    #[test]
    fn deleted_users_snapshot_is_recreated_with_admin() {
        let dir = TempDir::new().unwrap();
        let fallback = store(&dir);
        fallback.ensure_initialized();

        std::fs::remove_file(fallback.snapshot_path(Dataset::Users)).unwrap();
        let created = fallback.ensure_initialized();
        assert_eq!(created, vec![Dataset::Users]);

        let users: Vec<Record> = storage::read_json(&fallback.snapshot_path(Dataset::Users))
            .unwrap()
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["role"], json!("admin"));
        assert_eq!(users[0]["username"], json!("admin"));
    }

    #[test]
    fn first_initialization_creates_every_snapshot() {
        let dir = TempDir::new().unwrap();
        let fallback = store(&dir);

        let created = fallback.ensure_initialized();
        assert_eq!(
            created,
            vec![Dataset::Users, Dataset::Products, Dataset::Categories]
        );
        assert!(fallback.ensure_initialized().is_empty());
        assert!(fallback.read(Dataset::Products).unwrap().is_empty());
    }

    #[test]
    fn corrupt_snapshot_is_regenerated() {
        let dir = TempDir::new().unwrap();
        let fallback = store(&dir);
        fallback.ensure_initialized();
        std::fs::write(fallback.snapshot_path(Dataset::Categories), b"{not json").unwrap();

        let records = fallback.read(Dataset::Categories).unwrap();
        assert!(records.is_empty());

        let on_disk: Vec<Record> = storage::read_json(&fallback.snapshot_path(Dataset::Categories))
            .unwrap()
            .unwrap();
        assert!(on_disk.is_empty());
    }

    #[test]
    fn repeated_sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fallback = store(&dir);
        let records = vec![
            json!({"_id": {"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"}, "sku": "LAMP-1", "seller_id": "s1"}),
            json!({"_id": 7, "sku": "DESK-2", "seller_id": "s2"}),
        ];

        assert!(fallback.sync_from_source(Dataset::Products, records.clone()));
        let first = fallback.read(Dataset::Products).unwrap();
        assert!(fallback.sync_from_source(Dataset::Products, records));
        let second = fallback.read(Dataset::Products).unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0]["_id"], json!("65a1f0c2e4b0a1b2c3d4e5f6"));
        assert_eq!(first[1]["_id"], json!("7"));
    }

    #[test]
    fn sync_is_visible_to_the_next_read() {
        let dir = TempDir::new().unwrap();
        let fallback = store(&dir);
        fallback.ensure_initialized();
        assert_eq!(fallback.read(Dataset::Users).unwrap().len(), 1);

        let users = vec![
            json!({"_id": "u1", "username": "ada"}),
            json!({"_id": "u2", "username": "grace"}),
        ];
        assert!(fallback.sync_from_source(Dataset::Users, users));
        assert_eq!(fallback.read(Dataset::Users).unwrap().len(), 2);
    }

    #[test]
    fn lookups_compare_string_forms() {
        let dir = TempDir::new().unwrap();
        let fallback = store(&dir);
        fallback.sync_from_source(
            Dataset::Products,
            vec![
                json!({"_id": "p1", "sku": "A", "seller_id": 10}),
                json!({"_id": "p2", "sku": "B", "seller_id": 10}),
                json!({"_id": "p3", "sku": "C", "seller_id": 11}),
            ],
        );

        let found = fallback.lookup_by_field(Dataset::Products, "sku", "B");
        assert_eq!(found.found().unwrap()["_id"], json!("p2"));
        assert_eq!(
            fallback.lookup_by_field(Dataset::Products, "sku", "Z"),
            Lookup::NotFound
        );

        let owned = fallback
            .filter_by_field(Dataset::Products, "seller_id", "10", 1)
            .unwrap();
        assert_eq!(owned.len(), 1);
    }

    #[test]
    fn unsnapshotted_dataset_cannot_be_served() {
        let dir = TempDir::new().unwrap();
        let fallback = store(&dir);
        assert!(fallback.read(Dataset::Orders).is_none());
        assert_eq!(
            fallback.lookup_by_field(Dataset::Orders, "_id", "o1"),
            Lookup::Degraded
        );
        assert!(!fallback.sync_from_source(Dataset::Orders, Vec::new()));
    }

    #[test]
    fn unwritable_directory_fails_sync() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path()).fallback;
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        config.data_dir = blocker.join("fallback");
        let fallback = FallbackStore::new(config);

        assert!(!fallback.sync_from_source(Dataset::Users, vec![json!({"_id": "u1"})]));
    }
}
