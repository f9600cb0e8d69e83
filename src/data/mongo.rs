//! MongoDB live store
//!
//! Wraps the official driver. Connection string, pool sizes and timeouts come
//! from [`DatabaseConfig`]; TLS is negotiated from the URI (`tls=true` or
//! `mongodb+srv://`) using the driver's rustls backend.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc, oid::ObjectId};
use mongodb::options::{ClientOptions, ReturnDocument};
use mongodb::{Client, Collection, Database};
use std::time::Duration;

use super::models::{ID_FIELD, Record};
use super::store::{DocumentStore, Query, StoreError};
use crate::config::DatabaseConfig;

pub struct MongoStore {
    database: Database,
    /// Server-side bound applied to reads
    max_time: Duration,
}

impl MongoStore {
    /// Build a client from `uri`
    ///
    /// Does not contact the server; the connection manager probes with
    /// [`DocumentStore::ping`] before trusting the handle.
    pub async fn connect(uri: &str, config: &DatabaseConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(uri).await.map_err(classify)?;
        options.app_name = Some(config.app_name.clone());
        options.connect_timeout = Some(config.connect_timeout());
        options.server_selection_timeout = Some(config.server_selection_timeout());
        options.max_pool_size = Some(config.max_pool_size);
        options.min_pool_size = Some(config.min_pool_size);

        let client = Client::with_options(options).map_err(classify)?;
        let database = client.database(&config.name);

        tracing::debug!(
            database = %config.name,
            app_name = %config.app_name,
            max_pool_size = config.max_pool_size,
            "MongoDB client created"
        );

        Ok(Self {
            database,
            max_time: config.query_timeout(),
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection::<Document>(name)
    }
}

/// Map driver errors onto connectivity vs. query failures.
fn classify(error: mongodb::error::Error) -> StoreError {
    use mongodb::error::ErrorKind;

    match error.kind.as_ref() {
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::Authentication { .. } => StoreError::Unavailable(error.to_string()),
        ErrorKind::InvalidArgument { .. } => StoreError::Config(error.to_string()),
        _ => StoreError::Query(error.to_string()),
    }
}

/// Filter on a field compared in string form.
///
/// Values that look like object ids match both the `ObjectId` and the plain
/// string, since snapshots and some writers store identifiers as strings.
fn field_filter(field: &str, value: &str) -> Document {
    match ObjectId::parse_str(value) {
        Ok(oid) => doc! { field: { "$in": [oid, value] } },
        Err(_) => doc! { field: value },
    }
}

fn query_filter(query: &Query) -> Document {
    query
        .filter
        .as_ref()
        .map(|(field, value)| field_filter(field, value))
        .unwrap_or_default()
}

fn projection(fields: &[String]) -> Option<Document> {
    if fields.is_empty() {
        return None;
    }
    let mut projection = Document::new();
    for field in fields {
        projection.insert(field.as_str(), 1);
    }
    Some(projection)
}

fn to_record(document: Document) -> Record {
    Bson::Document(document).into_relaxed_extjson()
}

fn to_document(record: &Record) -> Result<Document, StoreError> {
    bson::to_document(record).map_err(|e| StoreError::Query(format!("record is not a document: {e}")))
}

fn id_to_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn find_one(&self, query: &Query) -> Result<Option<Record>, StoreError> {
        let collection = self.collection(query.collection);
        let mut action = collection
            .find_one(query_filter(query))
            .max_time(self.max_time);
        if let Some(projection) = projection(&query.projection) {
            action = action.projection(projection);
        }
        let found = action.await.map_err(classify)?;
        Ok(found.map(to_record))
    }

    async fn find_many(&self, query: &Query) -> Result<Vec<Record>, StoreError> {
        let collection = self.collection(query.collection);
        let mut action = collection
            .find(query_filter(query))
            .max_time(self.max_time);
        if let Some(limit) = query.limit {
            action = action.limit(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if let Some(projection) = projection(&query.projection) {
            action = action.projection(projection);
        }
        let cursor = action.await.map_err(classify)?;
        let documents: Vec<Document> = cursor.try_collect().await.map_err(classify)?;
        Ok(documents.into_iter().map(to_record).collect())
    }

    async fn insert_one(&self, collection: &str, record: Record) -> Result<String, StoreError> {
        let document = to_document(&record)?;
        let result = self
            .collection(collection)
            .insert_one(document)
            .await
            .map_err(classify)?;
        Ok(id_to_string(&result.inserted_id))
    }

    async fn update_one(
        &self,
        collection: &str,
        id: &str,
        changes: Record,
    ) -> Result<Option<Record>, StoreError> {
        let mut changes = to_document(&changes)?;
        changes.remove(ID_FIELD);
        let before = self
            .collection(collection)
            .find_one_and_update(field_filter(ID_FIELD, id), doc! { "$set": changes })
            .return_document(ReturnDocument::Before)
            .await
            .map_err(classify)?;
        Ok(before.map(to_record))
    }

    async fn delete_one(&self, collection: &str, id: &str) -> Result<Option<Record>, StoreError> {
        let removed = self
            .collection(collection)
            .find_one_and_delete(field_filter(ID_FIELD, id))
            .await
            .map_err(classify)?;
        Ok(removed.map(to_record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_id_values_match_both_representations() {
        let filter = field_filter("_id", "65a1f0c2e4b0a1b2c3d4e5f6");
        let clause = filter.get_document("_id").unwrap();
        let candidates = clause.get_array("$in").unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(matches!(candidates[0], Bson::ObjectId(_)));

        let filter = field_filter("username", "ada");
        assert_eq!(filter.get_str("username").unwrap(), "ada");
    }

    #[test]
    fn documents_become_extended_json_records() {
        let oid = ObjectId::parse_str("65a1f0c2e4b0a1b2c3d4e5f6").unwrap();
        let record = to_record(doc! { "_id": oid, "username": "ada" });
        assert_eq!(record["_id"], json!({"$oid": "65a1f0c2e4b0a1b2c3d4e5f6"}));

        let normalized = crate::data::models::normalize_record(record);
        assert_eq!(normalized["_id"], json!("65a1f0c2e4b0a1b2c3d4e5f6"));
    }

    #[test]
    fn empty_projection_returns_whole_documents() {
        assert!(projection(&[]).is_none());
        let projection = projection(&["sku".to_string()]).unwrap();
        assert_eq!(projection.get_i32("sku").unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_host_fails_the_probe() {
        let config = DatabaseConfig {
            uri: Some("mongodb://127.0.0.1:1/?directConnection=true".to_string()),
            name: "shelter_test".to_string(),
            app_name: "shelter-test".to_string(),
            connect_timeout_ms: 200,
            server_selection_timeout_ms: 300,
            query_timeout_ms: 300,
            max_pool_size: 1,
            min_pool_size: 0,
        };
        let store = MongoStore::connect(config.uri.as_deref().unwrap(), &config)
            .await
            .unwrap();
        let error = store.ping().await.unwrap_err();
        assert!(error.is_connectivity(), "unexpected error: {error}");
    }
}
