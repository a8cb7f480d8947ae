//! Cache layer fronting the completion and places services.
//!
//! # Key Concepts
//! - Store: raw string key/value storage with an expiry per entry
//! - Key class: every key belongs to a class that fixes its time-to-live
//! - Stats: hit/miss counters reported on the usage dashboard
//!
//! # Invariants
//! - `get` never returns an entry whose expiry has passed
//! - Writes replace entries wholesale; nothing is mutated in place
//! - A store failure is treated as a miss on read and logged on write

pub mod keys;
mod memory;

pub use keys::{autocomplete_key, completion_key, place_key, CacheKey};
pub use memory::MemoryCache;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::store::StoreError;

/// Raw key/value storage with expiry.
pub trait CacheStore: Send + Sync {
    /// Value for `key` if present and `expires_at > now`.
    fn get_raw(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError>;

    /// Unconditionally overwrite `key`.
    fn put_raw(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Drop expired entries, returning how many were removed.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Class of a cache key; decides its time-to-live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyClass {
    Completion,
    Place,
    Autocomplete,
    /// Briefly cached "not found" answers and permanent failures.
    Negative,
}

/// Time-to-live per key class.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    pub completion: Duration,
    pub place: Duration,
    pub autocomplete: Duration,
    pub negative: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            completion: Duration::from_secs(24 * 3600),
            place: Duration::from_secs(7 * 24 * 3600),
            autocomplete: Duration::from_secs(3600),
            negative: Duration::from_secs(3600),
        }
    }
}

impl TtlPolicy {
    pub fn ttl_for(&self, class: KeyClass) -> Duration {
        match class {
            KeyClass::Completion => self.completion,
            KeyClass::Place => self.place,
            KeyClass::Autocomplete => self.autocomplete,
            KeyClass::Negative => self.negative,
        }
    }
}

/// Hit/miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time view of [`CacheStats`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Percentage in `[0, 100]`.
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        CacheStatsSnapshot {
            hits,
            misses,
            hit_rate,
        }
    }
}

/// Typed cache facade used by the upstream gateway.
pub struct Cache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ttl: TtlPolicy,
    stats: CacheStats,
}

impl Cache {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, ttl: TtlPolicy) -> Self {
        Self {
            store,
            clock,
            ttl,
            stats: CacheStats::default(),
        }
    }

    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.ttl
    }

    /// Look up a live entry and decode it.
    ///
    /// Store errors and undecodable payloads count as misses.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let raw = match self.store.get_raw(key.as_str(), self.clock.now()) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        };

        let value = raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        if value.is_some() {
            self.stats.record_hit();
            tracing::debug!(key = %key, "Cache hit");
        } else {
            self.stats.record_miss();
            tracing::debug!(key = %key, "Cache miss");
        }
        value
    }

    /// Look up a negative entry without touching the hit/miss counters.
    pub fn get_negative(&self, key: &CacheKey) -> Option<String> {
        let negative = key.negative();
        self.store
            .get_raw(negative.as_str(), self.clock.now())
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok())
    }

    /// Store `value` under `key` with the TTL of `class`.
    pub fn put<T: Serialize>(&self, key: &CacheKey, value: &T, class: KeyClass) {
        self.put_with_ttl(key, value, self.ttl.ttl_for(class));
    }

    /// Store `value` under `key` with an explicit TTL.
    pub fn put_with_ttl<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache value not serializable, skipping");
                return;
            }
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        let expires_at = self.clock.now() + ttl;
        if let Err(e) = self.store.put_raw(key.as_str(), raw, expires_at) {
            tracing::warn!(key = %key, error = %e, "Cache write failed");
        }
    }

    /// Remember a permanent failure for `key` for the negative TTL.
    pub fn put_negative(&self, key: &CacheKey, message: &str) {
        self.put(&key.negative(), &message, KeyClass::Negative);
    }

    /// Remove expired entries from the backing store.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        self.store.purge_expired(self.clock.now())
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
