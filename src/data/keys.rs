//! Cache key definitions.
//!
//! Every facade accessor builds its key from the dataset, the accessor kind and
//! a normalized argument, so two accessors can never collide on a key.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::models::Dataset;
use crate::error::AppError;

/// Which facade accessor produced a cached value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Accessor {
    /// Point lookup by identifier
    ById,
    /// Point lookup by the dataset's natural key
    ByKey,
    /// Bounded scan by owner
    ByOwner,
    /// Whole fallback snapshot
    Snapshot,
}

impl Accessor {
    fn as_str(&self) -> &'static str {
        match self {
            Accessor::ById => "by_id",
            Accessor::ByKey => "by_key",
            Accessor::ByOwner => "by_owner",
            Accessor::Snapshot => "snapshot",
        }
    }
}

/// Typed cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub dataset: Dataset,
    pub accessor: Accessor,
    pub arg: String,
}

impl CacheKey {
    pub fn by_id(dataset: Dataset, id: &str) -> Result<Self, AppError> {
        Ok(Self {
            dataset,
            accessor: Accessor::ById,
            arg: normalize_arg(id, "id")?,
        })
    }

    pub fn by_key(dataset: Dataset, value: &str) -> Result<Self, AppError> {
        Ok(Self {
            dataset,
            accessor: Accessor::ByKey,
            arg: normalize_arg(value, dataset.natural_key())?,
        })
    }

    pub fn by_owner(dataset: Dataset, owner_id: &str) -> Result<Self, AppError> {
        let Some(field) = dataset.owner_field() else {
            return Err(AppError::Validation(format!(
                "{dataset} does not support owner scans"
            )));
        };
        Ok(Self {
            dataset,
            accessor: Accessor::ByOwner,
            arg: normalize_arg(owner_id, field)?,
        })
    }

    pub fn snapshot(dataset: Dataset) -> Self {
        Self {
            dataset,
            accessor: Accessor::Snapshot,
            arg: String::new(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.dataset, self.accessor.as_str(), self.arg)
    }
}

fn normalize_arg(raw: &str, what: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{what} must not be blank")));
    }
    Ok(trimmed.to_string())
}
