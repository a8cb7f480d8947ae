//! Budget counters and their backing store.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::Service;
use crate::store::StoreError;

/// Daily ceilings for one service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceLimits {
    pub max_calls: u64,
    /// Ceiling on the accumulated cost estimate, in USD.
    pub max_cost: f64,
    /// Cost charged to the budget for one call when the adapter knows no better.
    pub cost_per_call: f64,
}

/// Counters for one (service, day).
///
/// `call_count` and `accumulated_cost` only ever grow within a day. The
/// in-flight fields hold admitted calls that have not reported back yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetCounter {
    pub service: Service,
    pub day: NaiveDate,
    pub call_count: u64,
    pub accumulated_cost: f64,
    pub inflight_calls: u64,
    pub inflight_cost: f64,
}

/// Result of an atomic reservation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved,
    CallCeiling { used: u64, ceiling: u64 },
    CostCeiling { spent: f64, ceiling: f64 },
}

impl BudgetCounter {
    pub fn empty(service: Service, day: NaiveDate) -> Self {
        Self {
            service,
            day,
            call_count: 0,
            accumulated_cost: 0.0,
            inflight_calls: 0,
            inflight_cost: 0.0,
        }
    }

    /// Decide whether one more call of `estimated_cost` fits under `limits`,
    /// counting calls that are still in flight.
    pub fn check(&self, estimated_cost: f64, limits: &ServiceLimits) -> ReserveOutcome {
        let used = self.call_count + self.inflight_calls;
        if used + 1 > limits.max_calls {
            return ReserveOutcome::CallCeiling {
                used,
                ceiling: limits.max_calls,
            };
        }
        let spent = self.accumulated_cost + self.inflight_cost;
        if spent + estimated_cost > limits.max_cost + f64::EPSILON {
            return ReserveOutcome::CostCeiling {
                spent,
                ceiling: limits.max_cost,
            };
        }
        ReserveOutcome::Reserved
    }

    fn reserve(&mut self, estimated_cost: f64) {
        self.inflight_calls += 1;
        self.inflight_cost += estimated_cost;
    }

    fn settle(&mut self, estimated_cost: f64) {
        self.inflight_calls = self.inflight_calls.saturating_sub(1);
        self.inflight_cost = (self.inflight_cost - estimated_cost).max(0.0);
    }

    fn commit(&mut self, estimated_cost: f64, actual_cost: f64) {
        self.settle(estimated_cost);
        self.call_count += 1;
        self.accumulated_cost += actual_cost.max(0.0);
    }
}

/// Storage for budget counters.
///
/// Implementations must make `try_reserve` atomic with respect to concurrent
/// callers: check and increment happen under one lock or transaction.
pub trait UsageStore: Send + Sync {
    fn try_reserve(
        &self,
        service: Service,
        day: NaiveDate,
        estimated_cost: f64,
        limits: &ServiceLimits,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Turn an in-flight reservation into a recorded call.
    fn commit(
        &self,
        service: Service,
        day: NaiveDate,
        estimated_cost: f64,
        actual_cost: f64,
    ) -> Result<(), StoreError>;

    /// Drop an in-flight reservation without recording a call.
    fn release(&self, service: Service, day: NaiveDate, estimated_cost: f64)
        -> Result<(), StoreError>;

    fn counter(&self, service: Service, day: NaiveDate) -> Result<BudgetCounter, StoreError>;

    fn bump_hourly(&self, service: Service, hour: DateTime<Utc>) -> Result<(), StoreError>;

    fn hourly_count(&self, service: Service, hour: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryUsage {
    counters: HashMap<(Service, NaiveDate), BudgetCounter>,
    hourly: HashMap<(Service, DateTime<Utc>), u64>,
}

/// Process-local [`UsageStore`].
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    inner: Mutex<MemoryUsage>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryUsage) -> R) -> Result<R, StoreError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("usage lock poisoned".to_string()))?;
        Ok(f(&mut inner))
    }
}

impl UsageStore for MemoryUsageStore {
    fn try_reserve(
        &self,
        service: Service,
        day: NaiveDate,
        estimated_cost: f64,
        limits: &ServiceLimits,
    ) -> Result<ReserveOutcome, StoreError> {
        self.with(|inner| {
            let counter = inner
                .counters
                .entry((service, day))
                .or_insert_with(|| BudgetCounter::empty(service, day));
            let outcome = counter.check(estimated_cost, limits);
            if outcome == ReserveOutcome::Reserved {
                counter.reserve(estimated_cost);
            }
            outcome
        })
    }

    fn commit(
        &self,
        service: Service,
        day: NaiveDate,
        estimated_cost: f64,
        actual_cost: f64,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            inner
                .counters
                .entry((service, day))
                .or_insert_with(|| BudgetCounter::empty(service, day))
                .commit(estimated_cost, actual_cost)
        })
    }

    fn release(
        &self,
        service: Service,
        day: NaiveDate,
        estimated_cost: f64,
    ) -> Result<(), StoreError> {
        self.with(|inner| {
            if let Some(counter) = inner.counters.get_mut(&(service, day)) {
                counter.settle(estimated_cost);
            }
        })
    }

    fn counter(&self, service: Service, day: NaiveDate) -> Result<BudgetCounter, StoreError> {
        self.with(|inner| {
            inner
                .counters
                .get(&(service, day))
                .cloned()
                .unwrap_or_else(|| BudgetCounter::empty(service, day))
        })
    }

    fn bump_hourly(&self, service: Service, hour: DateTime<Utc>) -> Result<(), StoreError> {
        self.with(|inner| *inner.hourly.entry((service, hour)).or_insert(0) += 1)
    }

    fn hourly_count(&self, service: Service, hour: DateTime<Utc>) -> Result<u64, StoreError> {
        self.with(|inner| inner.hourly.get(&(service, hour)).copied().unwrap_or(0))
    }
}

/// Usage of one service for the current day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceUsage {
    pub service: Service,
    pub calls: u64,
    pub cost: f64,
    pub in_flight: u64,
    pub call_limit: u64,
    pub cost_limit: f64,
}

/// Calls per hour for the last N hours, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourlyUsage {
    pub labels: Vec<String>,
    pub series: Vec<HourlySeries>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourlySeries {
    pub service: Service,
    pub counts: Vec<u64>,
}

/// Today's usage across services, as shown on the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageReport {
    pub day: NaiveDate,
    pub services: Vec<ServiceUsage>,
    pub total_cost: f64,
}

impl UsageReport {
    pub fn service(&self, service: Service) -> Option<&ServiceUsage> {
        self.services.iter().find(|u| u.service == service)
    }

    /// Cost-saving advice derived from today's numbers.
    pub fn recommendations(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.total_cost > 1.0 {
            out.push("Consider enabling more aggressive caching".to_string());
            out.push("Use template-based responses for common queries".to_string());
        }
        if self.service(Service::Completion).map_or(0, |u| u.calls) > 50 {
            out.push("Switch to a cheaper completion model".to_string());
            out.push("Reduce token limits in prompts".to_string());
        }
        if self.service(Service::Places).map_or(0, |u| u.calls) > 50 {
            out.push("Increase the places cache TTL".to_string());
            out.push("Use plain map links instead of places lookups".to_string());
        }
        out
    }
}
