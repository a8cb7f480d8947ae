//! Persistence for trip requests, generated plans, cache entries and
//! budget counters.
//!
//! # Key Concepts
//! - `PlanStore`: trip requests and their single generated plan
//! - Generation claim: a lease on a request so only one worker generates it
//! - Artifact reference: `artifact_path` plus `artifact_fingerprint` on the plan
//!
//! The SQLite implementation also backs the cache and the budget counters.

mod sqlite;

pub use sqlite::SqliteStore;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::trip::{GeneratedPlan, NewTripRequest, TripId, TripRequest, TripStatus};

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Trip request {0} not found")]
    TripNotFound(TripId),

    #[error("Corrupt stored value: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("File system error at path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Attach a message to rusqlite errors.
pub trait DatabaseResultExt<T> {
    fn db_context(self, message: &str) -> Result<T, StoreError>;
}

impl<T> DatabaseResultExt<T> for Result<T, rusqlite::Error> {
    fn db_context(self, message: &str) -> Result<T, StoreError> {
        self.map_err(|source| StoreError::Database {
            message: message.to_string(),
            source,
        })
    }
}

/// Storage for trip requests and generated plans.
pub trait PlanStore: Send + Sync {
    fn create_trip(&self, trip: &NewTripRequest, now: DateTime<Utc>)
        -> Result<TripRequest, StoreError>;

    fn get_trip(&self, id: TripId) -> Result<TripRequest, StoreError>;

    fn set_status(&self, id: TripId, status: TripStatus) -> Result<(), StoreError>;

    /// Take the generation lease for `id`.
    ///
    /// Succeeds when nobody holds the lease or the holder's lease is older
    /// than `lease`. On success the status becomes `generating`.
    fn claim_generation(
        &self,
        id: TripId,
        owner: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<bool, StoreError>;

    /// Drop the lease held by `owner` and set the final status.
    fn release_generation(
        &self,
        id: TripId,
        owner: &str,
        status: TripStatus,
    ) -> Result<(), StoreError>;

    fn get_plan(&self, id: TripId) -> Result<Option<GeneratedPlan>, StoreError>;

    /// Insert or replace the plan text, keeping any artifact reference.
    fn save_plan_content(
        &self,
        id: TripId,
        content: &str,
        locations: &[String],
        degraded: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Point the plan at a rendered artifact.
    fn set_artifact(
        &self,
        id: TripId,
        path: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn clear_artifact(&self, id: TripId, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Delete the request and its plan, returning the plan as it was.
    fn delete_trip(&self, id: TripId) -> Result<Option<GeneratedPlan>, StoreError>;

    /// Every artifact path currently referenced by a plan.
    fn artifact_paths(&self) -> Result<Vec<String>, StoreError>;
}
