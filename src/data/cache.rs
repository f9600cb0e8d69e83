//! In-memory TTL cache
//!
//! A bounded key/value cache guarded by a single mutex. The lock is only held
//! for map operations, never across I/O or an `.await`.
//!
//! Eviction happens on insert: once the cache is full, expired entries are
//! purged first, then the oldest-expiring fifth of what remains.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

use super::keys::CacheKey;
use super::models::Lookup;
use crate::error::AppError;
use crate::metrics::{CACHE_EVICTIONS_TOTAL, CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_SIZE};

/// Share of entries removed when the cache is still full after purging expired ones.
const EVICTION_FRACTION: f64 = 0.2;

/// Upper bound for a single TTL so `Instant` arithmetic cannot overflow.
const MAX_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<CacheKey, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub name: String,
    pub size: usize,
    pub max_capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache (0.0 when nothing was looked up).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded TTL cache
pub struct CacheStore<V> {
    /// Label used in metrics and logs
    name: &'static str,
    max_capacity: usize,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> CacheStore<V> {
    /// Create new cache
    ///
    /// # Arguments
    /// * `name` - Metrics label (e.g. "records", "fallback")
    /// * `max_capacity` - Maximum number of entries (at least 1)
    pub fn new(name: &'static str, max_capacity: usize) -> Self {
        Self {
            name,
            max_capacity: max_capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Get a live value
    ///
    /// An expired entry counts as a miss and is removed.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let live = match inner.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };

        if live.is_some() {
            inner.hits += 1;
            CACHE_HITS_TOTAL.with_label_values(&[self.name]).inc();
        } else {
            inner.misses += 1;
            CACHE_MISSES_TOTAL.with_label_values(&[self.name]).inc();
        }
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(inner.entries.len() as i64);

        live
    }

    /// Remove every entry matching `predicate` under one lock acquisition
    pub fn delete_where(&self, mut predicate: impl FnMut(&CacheKey, &V) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|key, entry| !predicate(key, &entry.value));
        let removed = before - inner.entries.len();
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(inner.entries.len() as i64);
        removed
    }

    /// Insert or replace a value
    ///
    /// Inserting a new key into a full cache first purges expired entries,
    /// then evicts the oldest-expiring entries. Size never exceeds capacity.
    pub fn set(&self, key: CacheKey, value: V, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now + ttl.min(MAX_TTL);
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_capacity {
            let purged = purge_expired_locked(&mut inner.entries, now);
            let mut evicted = 0;
            if inner.entries.len() >= self.max_capacity {
                evicted = evict_oldest_locked(&mut inner.entries, self.max_capacity);
            }
            inner.evictions += (purged + evicted) as u64;
            CACHE_EVICTIONS_TOTAL
                .with_label_values(&[self.name])
                .inc_by((purged + evicted) as u64);
            tracing::debug!(
                cache = self.name,
                purged,
                evicted,
                "Cache at capacity, swept entries"
            );
        }

        inner.entries.insert(key, CacheEntry { value, expires_at });
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(inner.entries.len() as i64);
    }

    /// Remove one entry
    pub fn delete(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(key).is_some();
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(inner.entries.len() as i64);
        removed
    }

    /// Remove several entries under one lock acquisition
    pub fn delete_many<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) -> usize {
        let mut inner = self.inner.lock();
        let removed = keys
            .into_iter()
            .filter(|key| inner.entries.remove(key).is_some())
            .count();
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(inner.entries.len() as i64);
        removed
    }

    /// Remove all entries
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        CACHE_SIZE.with_label_values(&[self.name]).set(0);
        tracing::debug!(cache = self.name, removed, "Cache cleared");
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep expired entries
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let purged = purge_expired_locked(&mut inner.entries, Instant::now());
        inner.evictions += purged as u64;
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(inner.entries.len() as i64);
        purged
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            name: self.name.to_string(),
            size: inner.entries.len(),
            max_capacity: self.max_capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }

    /// Read-through helper
    ///
    /// Returns the cached value for `key` if live; otherwise runs `loader`
    /// and caches a found result for `ttl`. The lock is released while the
    /// loader runs.
    pub async fn read_through<F, Fut>(&self, key: &CacheKey, ttl: Duration, loader: F) -> Lookup<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Lookup<V>>,
    {
        if let Some(value) = self.get(key) {
            tracing::debug!(cache = self.name, key = %key, "Cache hit");
            return Lookup::Found(value);
        }

        let result = loader().await;
        if let Lookup::Found(value) = &result {
            self.set(key.clone(), value.clone(), ttl);
        }
        result
    }

    fn live_entries(&self) -> Vec<(CacheKey, V, Duration)> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, entry)| {
                (
                    key.clone(),
                    entry.value.clone(),
                    entry.expires_at.saturating_duration_since(now),
                )
            })
            .collect()
    }
}

/// Cache entry as written to the backup file
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    key: CacheKey,
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// Outcome of writing a cache backup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistReport {
    pub written: usize,
    /// Entries left out because their value could not be serialized
    pub dropped: usize,
}

impl<V> CacheStore<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Write live entries to `path`
    ///
    /// Entries that fail to serialize are dropped from the written copy only;
    /// the in-memory entries stay untouched. Blocking.
    pub fn persist_to(&self, path: &Path) -> Result<PersistReport, AppError> {
        let now = Utc::now();
        let mut report = PersistReport::default();
        let mut persisted = Vec::new();

        for (key, value, remaining) in self.live_entries() {
            match serde_json::to_value(&value) {
                Ok(value) => {
                    let remaining = chrono::Duration::from_std(remaining)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    persisted.push(PersistedEntry {
                        key,
                        value,
                        expires_at: now + remaining,
                    });
                }
                Err(e) => {
                    let error = AppError::CacheSerialization(e.to_string());
                    tracing::warn!(
                        cache = self.name,
                        key = %key,
                        %error,
                        "Dropping entry from cache backup"
                    );
                    report.dropped += 1;
                }
            }
        }

        report.written = persisted.len();
        crate::storage::write_json_atomic(path, &persisted)?;
        tracing::debug!(
            cache = self.name,
            path = %path.display(),
            written = report.written,
            dropped = report.dropped,
            "Cache backup written"
        );
        Ok(report)
    }

    /// Reload unexpired entries from a backup written by [`persist_to`](Self::persist_to)
    ///
    /// A missing or unreadable backup restores nothing. Blocking.
    pub fn restore_from(&self, path: &Path) -> usize {
        let persisted: Vec<PersistedEntry> = match crate::storage::read_json(path) {
            Ok(Some(entries)) => entries,
            Ok(None) => return 0,
            Err(error) => {
                tracing::warn!(cache = self.name, %error, "Ignoring unreadable cache backup");
                return 0;
            }
        };

        let now = Utc::now();
        let mut restored = 0;
        for entry in persisted {
            let Ok(remaining) = (entry.expires_at - now).to_std() else {
                continue;
            };
            if remaining.is_zero() {
                continue;
            }
            match serde_json::from_value::<V>(entry.value) {
                Ok(value) => {
                    self.set(entry.key, value, remaining);
                    restored += 1;
                }
                Err(error) => {
                    tracing::debug!(cache = self.name, %error, "Skipping undecodable cache backup entry");
                }
            }
        }

        tracing::info!(cache = self.name, restored, "Cache restored from backup");
        restored
    }
}

fn purge_expired_locked<V>(entries: &mut HashMap<CacheKey, CacheEntry<V>>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    before - entries.len()
}

/// Remove the oldest-expiring entries so that one more insert fits.
fn evict_oldest_locked<V>(
    entries: &mut HashMap<CacheKey, CacheEntry<V>>,
    max_capacity: usize,
) -> usize {
    let len = entries.len();
    let fraction = (len as f64 * EVICTION_FRACTION).ceil() as usize;
    let needed = (len + 1).saturating_sub(max_capacity);
    let count = fraction.max(needed).max(1).min(len);

    let mut by_expiry: Vec<(Instant, CacheKey)> = entries
        .iter()
        .map(|(key, entry)| (entry.expires_at, key.clone()))
        .collect();
    by_expiry.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    for (_, key) in by_expiry.into_iter().take(count) {
        entries.remove(&key);
    }
    count
}
