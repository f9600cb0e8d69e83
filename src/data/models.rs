//! Data models
//!
//! Records are plain JSON objects; the datasets they belong to are a closed set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single document as seen by callers.
///
/// Identifiers are always strings regardless of which source produced the record.
pub type Record = serde_json::Value;

/// Field holding a record's identifier.
pub const ID_FIELD: &str = "_id";

/// Datasets served by the data layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Users,
    Products,
    Categories,
    Orders,
}

impl Dataset {
    pub const ALL: [Dataset; 4] = [
        Dataset::Users,
        Dataset::Products,
        Dataset::Categories,
        Dataset::Orders,
    ];

    /// Collection name in the live store, also used as the snapshot file stem.
    pub fn collection(&self) -> &'static str {
        match self {
            Dataset::Users => "users",
            Dataset::Products => "products",
            Dataset::Categories => "categories",
            Dataset::Orders => "orders",
        }
    }

    /// Field that uniquely identifies a record for humans (username, sku, ...).
    pub fn natural_key(&self) -> &'static str {
        match self {
            Dataset::Users => "username",
            Dataset::Products => "sku",
            Dataset::Categories => "slug",
            Dataset::Orders => "reference",
        }
    }

    /// Field referencing the owning user, if the dataset supports owner scans.
    pub fn owner_field(&self) -> Option<&'static str> {
        match self {
            Dataset::Products => Some("seller_id"),
            Dataset::Orders => Some("user_id"),
            Dataset::Users | Dataset::Categories => None,
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

impl std::str::FromStr for Dataset {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dataset::ALL
            .into_iter()
            .find(|dataset| dataset.collection().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| crate::error::AppError::Validation(format!("unknown dataset: {s}")))
    }
}

/// Outcome of a facade read.
///
/// `NotFound` means every reachable source was consulted and none has the
/// record. `Degraded` means the live store was unavailable and the fallback
/// snapshot could not be served either, so absence is unknown.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Degraded,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound | Lookup::Degraded => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Degraded => Lookup::Degraded,
        }
    }

    /// Convert to a result for callers that surface absence as an error.
    pub fn into_result(self) -> crate::error::Result<T> {
        match self {
            Lookup::Found(value) => Ok(value),
            Lookup::NotFound => Err(crate::error::AppError::NotFound),
            Lookup::Degraded => Err(crate::error::AppError::Degraded),
        }
    }
}

/// Render a JSON scalar the way identifiers and lookup values are compared.
///
/// Extended-JSON object ids (`{"$oid": ".."}`) collapse to their hex string.
pub fn coerce_to_string(value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;

    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => match map.get("$oid") {
            Some(Value::String(oid)) if map.len() == 1 => Some(oid.clone()),
            _ => None,
        },
        Value::Null | Value::Array(_) => None,
    }
}

/// Make a record self-contained: the identifier becomes a plain string, and
/// so does every top-level object id reference.
pub fn normalize_record(mut record: Record) -> Record {
    use serde_json::Value;

    if let Some(object) = record.as_object_mut() {
        for (field, value) in object.iter_mut() {
            let coerced = if field == ID_FIELD || value.is_object() {
                coerce_to_string(value)
            } else {
                None
            };
            if let Some(coerced) = coerced {
                *value = Value::String(coerced);
            }
        }
    }
    record
}

/// String form of a record's identifier, if it has one.
pub fn record_id(record: &Record) -> Option<String> {
    record.get(ID_FIELD).and_then(coerce_to_string)
}
