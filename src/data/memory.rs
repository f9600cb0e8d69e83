//! Process-local document store
//!
//! Selected with a `memory://` URI. Useful for local development without a
//! database server; availability and latency can be toggled to rehearse
//! outages.

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::models::{ID_FIELD, Record, coerce_to_string, record_id};
use super::store::{DocumentStore, Query, StoreError};

pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Record>>>,
    available: AtomicBool,
    /// Artificial latency applied to every call
    delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            delay: Mutex::new(None),
        }
    }

    /// Simulate the server going away (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of records in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn enter(&self) -> Result<(), StoreError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "memory store is marked unavailable".to_string(),
            ))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches(record: &Record, filter: &Option<(String, String)>) -> bool {
    match filter {
        None => true,
        Some((field, value)) => record
            .get(field)
            .and_then(coerce_to_string)
            .is_some_and(|candidate| candidate == *value),
    }
}

fn project(record: &Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record.clone();
    }
    let Some(object) = record.as_object() else {
        return record.clone();
    };
    let projected = object
        .iter()
        .filter(|(name, _)| name.as_str() == ID_FIELD || fields.iter().any(|f| f == *name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Record::Object(projected)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.enter().await
    }

    async fn find_one(&self, query: &Query) -> Result<Option<Record>, StoreError> {
        self.enter().await?;
        let collections = self.collections.read();
        Ok(collections.get(query.collection).and_then(|records| {
            records
                .iter()
                .find(|record| matches(record, &query.filter))
                .map(|record| project(record, &query.projection))
        }))
    }

    async fn find_many(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        self.enter().await?;
        let collections = self.collections.read();
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(collections
            .get(query.collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| matches(record, &query.filter))
                    .take(limit)
                    .map(|record| project(record, &query.projection))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert_one(&self, collection: &str, record: Record) -> Result<String, StoreError> {
        self.enter().await?;
        let Record::Object(mut object) = record else {
            return Err(StoreError::Query("record must be a JSON object".to_string()));
        };

        let id = match object.get(ID_FIELD).and_then(coerce_to_string) {
            Some(id) => id,
            None => ObjectId::new().to_hex(),
        };
        object.insert(ID_FIELD.to_string(), Record::String(id.clone()));

        let mut collections = self.collections.write();
        let records = collections.entry(collection.to_string()).or_default();
        if records
            .iter()
            .any(|existing| record_id(existing).as_deref() == Some(id.as_str()))
        {
            return Err(StoreError::Query(format!("duplicate key: {id}")));
        }
        records.push(Record::Object(object));
        Ok(id)
    }

    async fn update_one(
        &self,
        collection: &str,
        id: &str,
        changes: Record,
    ) -> Result<Option<Record>, StoreError> {
        self.enter().await?;
        let Record::Object(changes) = changes else {
            return Err(StoreError::Query("changes must be a JSON object".to_string()));
        };

        let mut collections = self.collections.write();
        let Some(record) = collections.get_mut(collection).and_then(|records| {
            records
                .iter_mut()
                .find(|record| record_id(record).as_deref() == Some(id))
        }) else {
            return Ok(None);
        };

        let before = record.clone();
        if let Some(object) = record.as_object_mut() {
            for (field, value) in changes {
                if field != ID_FIELD {
                    object.insert(field, value);
                }
            }
        }
        Ok(Some(before))
    }

    async fn delete_one(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError> {
        self.enter().await?;
        let mut collections = self.collections.write();
        let Some(records) = collections.get_mut(collection) else {
            return Ok(None);
        };
        let position = records
            .iter()
            .position(|record| record_id(record).as_deref() == Some(id));
        Ok(position.map(|index| records.remove(index)))
    }
}
