//! SQLite-backed store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{DatabaseResultExt, PlanStore, StoreError};
use crate::budget::{BudgetCounter, ReserveOutcome, Service, ServiceLimits, UsageStore};
use crate::cache::CacheStore;
use crate::trip::{GeneratedPlan, NewTripRequest, TripId, TripRequest, TripStatus};

const SCHEMA: &str = include_str!("../../assets/schema.sql");

/// One SQLite connection shared behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

struct TripRow {
    id: i64,
    destination: String,
    destination_country: Option<String>,
    budget: f64,
    duration_days: i64,
    travelers: i64,
    interests: Option<String>,
    transportation: Option<String>,
    experience_style: Option<String>,
    status: String,
    created_at: String,
}

impl TripRow {
    fn into_trip(self) -> Result<TripRequest, StoreError> {
        let status = TripStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{}'", self.status)))?;
        Ok(TripRequest {
            id: self.id,
            destination: self.destination,
            destination_country: self.destination_country,
            budget: self.budget,
            duration_days: self.duration_days.max(0) as u32,
            travelers: self.travelers.max(0) as u32,
            interests: self.interests,
            transportation: self.transportation,
            experience_style: self.experience_style,
            status,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct PlanRow {
    request_id: i64,
    content: String,
    locations: String,
    degraded: bool,
    artifact_path: Option<String>,
    artifact_fingerprint: Option<String>,
    updated_at: String,
}

impl PlanRow {
    fn into_plan(self) -> Result<GeneratedPlan, StoreError> {
        Ok(GeneratedPlan {
            request_id: self.request_id,
            content: self.content,
            locations: serde_json::from_str(&self.locations)?,
            degraded: self.degraded,
            artifact_path: self.artifact_path,
            artifact_fingerprint: self.artifact_fingerprint,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn select_plan(conn: &Connection, id: TripId) -> Result<Option<GeneratedPlan>, StoreError> {
    let row = conn
        .query_row(
            "SELECT request_id, content, locations, degraded, artifact_path, artifact_fingerprint, updated_at
             FROM generated_plans WHERE request_id = ?1",
            params![id],
            |row| {
                Ok(PlanRow {
                    request_id: row.get(0)?,
                    content: row.get(1)?,
                    locations: row.get(2)?,
                    degraded: row.get(3)?,
                    artifact_path: row.get(4)?,
                    artifact_fingerprint: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            },
        )
        .optional()
        .db_context("Failed to load generated plan")?;
    row.map(PlanRow::into_plan).transpose()
}

fn trip_exists(conn: &Connection, id: TripId) -> Result<bool, StoreError> {
    conn.query_row(
        "SELECT 1 FROM trip_requests WHERE id = ?1",
        params![id],
        |_| Ok(()),
    )
    .optional()
    .db_context("Failed to look up trip request")
    .map(|found| found.is_some())
}

fn select_counter(
    conn: &Connection,
    service: Service,
    day: NaiveDate,
) -> Result<BudgetCounter, StoreError> {
    let row = conn
        .query_row(
            "SELECT call_count, accumulated_cost, inflight_calls, inflight_cost
             FROM budget_counters WHERE service = ?1 AND day = ?2",
            params![service.as_str(), day_key(day)],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            },
        )
        .optional()
        .db_context("Failed to load budget counter")?;

    Ok(match row {
        Some((calls, cost, inflight_calls, inflight_cost)) => BudgetCounter {
            service,
            day,
            call_count: calls.max(0) as u64,
            accumulated_cost: cost,
            inflight_calls: inflight_calls.max(0) as u64,
            inflight_cost,
        },
        None => BudgetCounter::empty(service, day),
    })
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path).db_context("Failed to open database connection")?;
        Self::init(conn)
    }

    /// Fresh private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().db_context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .db_context("Failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA)
            .db_context("Failed to initialize schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Zero every in-flight budget reservation.
    ///
    /// Reservations live only as long as the process that took them, so the
    /// service calls this once at startup to drop what a crashed run left
    /// behind. Returns the number of counter rows touched.
    pub fn reset_inflight(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE budget_counters SET inflight_calls = 0, inflight_cost = 0
             WHERE inflight_calls > 0 OR inflight_cost > 0",
            [],
        )
        .db_context("Failed to reset in-flight reservations")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database lock poisoned".to_string()))
    }
}

impl PlanStore for SqliteStore {
    fn create_trip(
        &self,
        trip: &NewTripRequest,
        now: DateTime<Utc>,
    ) -> Result<TripRequest, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO trip_requests
                (destination, destination_country, budget, duration_days, travelers,
                 interests, transportation, experience_style, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                trip.destination,
                trip.destination_country,
                trip.budget,
                trip.duration_days,
                trip.travelers,
                trip.interests,
                trip.transportation,
                trip.experience_style,
                TripStatus::Pending.as_str(),
                ts(now),
            ],
        )
        .db_context("Failed to insert trip request")?;

        Ok(TripRequest {
            id: conn.last_insert_rowid(),
            destination: trip.destination.clone(),
            destination_country: trip.destination_country.clone(),
            budget: trip.budget,
            duration_days: trip.duration_days,
            travelers: trip.travelers,
            interests: trip.interests.clone(),
            transportation: trip.transportation.clone(),
            experience_style: trip.experience_style.clone(),
            status: TripStatus::Pending,
            created_at: now,
        })
    }

    fn get_trip(&self, id: TripId) -> Result<TripRequest, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, destination, destination_country, budget, duration_days, travelers,
                        interests, transportation, experience_style, status, created_at
                 FROM trip_requests WHERE id = ?1",
                params![id],
                |row| {
                    Ok(TripRow {
                        id: row.get(0)?,
                        destination: row.get(1)?,
                        destination_country: row.get(2)?,
                        budget: row.get(3)?,
                        duration_days: row.get(4)?,
                        travelers: row.get(5)?,
                        interests: row.get(6)?,
                        transportation: row.get(7)?,
                        experience_style: row.get(8)?,
                        status: row.get(9)?,
                        created_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .db_context("Failed to load trip request")?;
        row.ok_or(StoreError::TripNotFound(id))?.into_trip()
    }

    fn set_status(&self, id: TripId, status: TripStatus) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE trip_requests SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .db_context("Failed to update trip status")?;
        if changed == 0 {
            return Err(StoreError::TripNotFound(id));
        }
        Ok(())
    }

    fn claim_generation(
        &self,
        id: TripId,
        owner: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let stale_before = ts(now - lease);
        let changed = conn
            .execute(
                "UPDATE trip_requests
                 SET generation_owner = ?2, generation_started_at = ?3, status = 'generating'
                 WHERE id = ?1
                   AND (generation_owner IS NULL
                        OR generation_owner = ?2
                        OR generation_started_at < ?4)",
                params![id, owner, ts(now), stale_before],
            )
            .db_context("Failed to claim generation")?;
        if changed == 1 {
            return Ok(true);
        }
        if !trip_exists(&conn, id)? {
            return Err(StoreError::TripNotFound(id));
        }
        Ok(false)
    }

    fn release_generation(
        &self,
        id: TripId,
        owner: &str,
        status: TripStatus,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE trip_requests
                 SET generation_owner = NULL, generation_started_at = NULL, status = ?3
                 WHERE id = ?1 AND generation_owner = ?2",
                params![id, owner, status.as_str()],
            )
            .db_context("Failed to release generation")?;
        if changed == 0 {
            tracing::warn!(request_id = id, owner, "Generation lease no longer held at release");
        }
        Ok(())
    }

    fn get_plan(&self, id: TripId) -> Result<Option<GeneratedPlan>, StoreError> {
        let conn = self.conn()?;
        select_plan(&conn, id)
    }

    fn save_plan_content(
        &self,
        id: TripId,
        content: &str,
        locations: &[String],
        degraded: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let locations = serde_json::to_string(locations)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO generated_plans (request_id, content, locations, degraded, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(request_id) DO UPDATE SET
                content = excluded.content,
                locations = excluded.locations,
                degraded = excluded.degraded,
                updated_at = excluded.updated_at",
            params![id, content, locations, degraded, ts(now)],
        )
        .db_context("Failed to save plan content")?;
        Ok(())
    }

    fn set_artifact(
        &self,
        id: TripId,
        path: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE generated_plans
                 SET artifact_path = ?2, artifact_fingerprint = ?3, updated_at = ?4
                 WHERE request_id = ?1",
                params![id, path, fingerprint, ts(now)],
            )
            .db_context("Failed to record artifact")?;
        if changed == 0 {
            return Err(StoreError::TripNotFound(id));
        }
        Ok(())
    }

    fn clear_artifact(&self, id: TripId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE generated_plans
             SET artifact_path = NULL, artifact_fingerprint = NULL, updated_at = ?2
             WHERE request_id = ?1",
            params![id, ts(now)],
        )
        .db_context("Failed to clear artifact")?;
        Ok(())
    }

    fn delete_trip(&self, id: TripId) -> Result<Option<GeneratedPlan>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .db_context("Failed to begin delete transaction")?;
        let plan = select_plan(&tx, id)?;
        tx.execute(
            "DELETE FROM generated_plans WHERE request_id = ?1",
            params![id],
        )
        .db_context("Failed to delete generated plan")?;
        let changed = tx
            .execute("DELETE FROM trip_requests WHERE id = ?1", params![id])
            .db_context("Failed to delete trip request")?;
        if changed == 0 {
            return Err(StoreError::TripNotFound(id));
        }
        tx.commit().db_context("Failed to commit delete")?;
        Ok(plan)
    }

    fn artifact_paths(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT artifact_path FROM generated_plans WHERE artifact_path IS NOT NULL")
            .db_context("Failed to prepare artifact query")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .db_context("Failed to query artifact paths")?
            .collect::<Result<Vec<_>, _>>()
            .db_context("Failed to read artifact paths")?;
        Ok(paths)
    }
}

impl CacheStore for SqliteStore {
    fn get_raw(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM cache_entries WHERE key = ?1 AND expires_at > ?2",
            params![key, ts(now)],
            |row| row.get(0),
        )
        .optional()
        .db_context("Failed to read cache entry")
    }

    fn put_raw(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, ts(expires_at)],
        )
        .db_context("Failed to write cache entry")?;
        Ok(())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM cache_entries WHERE expires_at <= ?1",
            params![ts(now)],
        )
        .db_context("Failed to purge cache entries")
    }
}

impl UsageStore for SqliteStore {
    fn try_reserve(
        &self,
        service: Service,
        day: NaiveDate,
        estimated_cost: f64,
        limits: &ServiceLimits,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .db_context("Failed to begin reservation")?;
        let counter = select_counter(&tx, service, day)?;
        let outcome = counter.check(estimated_cost, limits);
        if outcome == ReserveOutcome::Reserved {
            tx.execute(
                "INSERT INTO budget_counters (service, day, inflight_calls, inflight_cost)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(service, day) DO UPDATE SET
                    inflight_calls = inflight_calls + 1,
                    inflight_cost = inflight_cost + excluded.inflight_cost",
                params![service.as_str(), day_key(day), estimated_cost],
            )
            .db_context("Failed to reserve budget")?;
        }
        tx.commit().db_context("Failed to commit reservation")?;
        Ok(outcome)
    }

    fn commit(
        &self,
        service: Service,
        day: NaiveDate,
        estimated_cost: f64,
        actual_cost: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO budget_counters (service, day, call_count, accumulated_cost)
             VALUES (?1, ?2, 1, ?4)
             ON CONFLICT(service, day) DO UPDATE SET
                call_count = call_count + 1,
                accumulated_cost = accumulated_cost + ?4,
                inflight_calls = MAX(inflight_calls - 1, 0),
                inflight_cost = MAX(inflight_cost - ?3, 0)",
            params![
                service.as_str(),
                day_key(day),
                estimated_cost,
                actual_cost.max(0.0)
            ],
        )
        .db_context("Failed to record budget usage")?;
        Ok(())
    }

    fn release(
        &self,
        service: Service,
        day: NaiveDate,
        estimated_cost: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE budget_counters
             SET inflight_calls = MAX(inflight_calls - 1, 0),
                 inflight_cost = MAX(inflight_cost - ?3, 0)
             WHERE service = ?1 AND day = ?2",
            params![service.as_str(), day_key(day), estimated_cost],
        )
        .db_context("Failed to release budget reservation")?;
        Ok(())
    }

    fn counter(&self, service: Service, day: NaiveDate) -> Result<BudgetCounter, StoreError> {
        let conn = self.conn()?;
        select_counter(&conn, service, day)
    }

    fn bump_hourly(&self, service: Service, hour: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hourly_usage (service, hour, call_count) VALUES (?1, ?2, 1)
             ON CONFLICT(service, hour) DO UPDATE SET call_count = call_count + 1",
            params![service.as_str(), ts(hour)],
        )
        .db_context("Failed to bump hourly usage")?;
        Ok(())
    }

    fn hourly_count(&self, service: Service, hour: DateTime<Utc>) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let count = conn
            .query_row(
                "SELECT call_count FROM hourly_usage WHERE service = ?1 AND hour = ?2",
                params![service.as_str(), ts(hour)],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .db_context("Failed to read hourly usage")?;
        Ok(count.unwrap_or(0).max(0) as u64)
    }
}
