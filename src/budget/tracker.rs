//! Admission control in front of paid calls.

use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;

use super::usage::{
    HourlySeries, HourlyUsage, ReserveOutcome, ServiceLimits, ServiceUsage, UsageReport,
    UsageStore,
};
use super::Service;
use crate::clock::Clock;
use crate::store::StoreError;

/// Ceilings for every service.
#[derive(Debug, Clone)]
pub struct BudgetLimits {
    pub completion: ServiceLimits,
    pub places: ServiceLimits,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            completion: ServiceLimits {
                max_calls: 100,
                max_cost: 5.0,
                cost_per_call: 0.002,
            },
            places: ServiceLimits {
                max_calls: 100,
                max_cost: 5.0,
                cost_per_call: 0.005,
            },
        }
    }
}

impl BudgetLimits {
    pub fn for_service(&self, service: Service) -> &ServiceLimits {
        match service {
            Service::Completion => &self.completion,
            Service::Places => &self.places,
        }
    }
}

/// Why a call was not admitted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DenialReason {
    #[error("{service} call ceiling reached ({used}/{ceiling} calls today)")]
    CallCeiling {
        service: Service,
        used: u64,
        ceiling: u64,
    },

    #[error("{service} cost ceiling reached (${spent:.4} of ${ceiling:.2} today)")]
    CostCeiling {
        service: Service,
        spent: f64,
        ceiling: f64,
    },

    #[error("{service} budget tracker unavailable")]
    TrackerUnavailable { service: Service },
}

/// An admitted call, handed back through `record` or `release`.
///
/// Dropping an unsettled reservation releases it, so a fetch that is
/// cancelled mid-call does not hold its slot for the rest of the day.
#[must_use = "a reservation must be recorded or released"]
pub struct Reservation {
    service: Service,
    day: NaiveDate,
    estimated_cost: f64,
    /// None once settled, or when admitted without the tracker (fail-open mode).
    store: Option<Arc<dyn UsageStore>>,
}

impl Reservation {
    pub fn service(&self) -> Service {
        self.service
    }

    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    fn is_tracked(&self) -> bool {
        self.store.is_some()
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("service", &self.service)
            .field("day", &self.day)
            .field("estimated_cost", &self.estimated_cost)
            .field("tracked", &self.is_tracked())
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        tracing::warn!(service = %self.service, "Reservation dropped before settling, releasing");
        if let Err(e) = store.release(self.service, self.day, self.estimated_cost) {
            tracing::error!(service = %self.service, error = %e, "Failed to release dropped reservation");
        }
    }
}

/// Outcome of [`BudgetTracker::admit`].
#[derive(Debug)]
pub enum Admission {
    Admitted(Reservation),
    Denied(DenialReason),
}

/// Daily budget enforcement for paid services.
pub struct BudgetTracker {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    limits: BudgetLimits,
    allow_on_tracker_failure: bool,
}

impl BudgetTracker {
    /// Create a tracker that denies calls when its store fails.
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>, limits: BudgetLimits) -> Self {
        Self {
            store,
            clock,
            limits,
            allow_on_tracker_failure: false,
        }
    }

    /// Admit calls without accounting when the store fails.
    pub fn allow_on_tracker_failure(mut self, allow: bool) -> Self {
        self.allow_on_tracker_failure = allow;
        self
    }

    pub fn limits(&self) -> &BudgetLimits {
        &self.limits
    }

    /// Default per-call estimate for `service`.
    pub fn cost_per_call(&self, service: Service) -> f64 {
        self.limits.for_service(service).cost_per_call
    }

    /// Atomically check the ceilings and reserve one call.
    pub fn admit(&self, service: Service, estimated_cost: f64) -> Admission {
        let day = self.clock.today();
        let limits = self.limits.for_service(service);

        match self.store.try_reserve(service, day, estimated_cost, limits) {
            Ok(ReserveOutcome::Reserved) => {
                tracing::debug!(%service, %day, estimated_cost, "Budget reserved");
                Admission::Admitted(Reservation {
                    service,
                    day,
                    estimated_cost,
                    store: Some(self.store.clone()),
                })
            }
            Ok(ReserveOutcome::CallCeiling { used, ceiling }) => {
                tracing::warn!(%service, used, ceiling, "Daily call ceiling reached");
                Admission::Denied(DenialReason::CallCeiling {
                    service,
                    used,
                    ceiling,
                })
            }
            Ok(ReserveOutcome::CostCeiling { spent, ceiling }) => {
                tracing::warn!(%service, spent, ceiling, "Daily cost ceiling reached");
                Admission::Denied(DenialReason::CostCeiling {
                    service,
                    spent,
                    ceiling,
                })
            }
            Err(e) if self.allow_on_tracker_failure => {
                tracing::error!(%service, error = %e, "Budget tracker failed, admitting untracked call");
                Admission::Admitted(Reservation {
                    service,
                    day,
                    estimated_cost,
                    store: None,
                })
            }
            Err(e) => {
                tracing::error!(%service, error = %e, "Budget tracker failed, denying call");
                Admission::Denied(DenialReason::TrackerUnavailable { service })
            }
        }
    }

    /// Record a completed call against the day it was admitted on.
    ///
    /// `actual_cost` replaces the estimate when the adapter knows better.
    pub fn record(&self, mut reservation: Reservation, actual_cost: Option<f64>) {
        let cost = actual_cost.unwrap_or(reservation.estimated_cost);
        let Some(store) = reservation.store.take() else {
            tracing::warn!(service = %reservation.service, cost, "Untracked call completed");
            return;
        };
        if let Err(e) = store.commit(
            reservation.service,
            reservation.day,
            reservation.estimated_cost,
            cost,
        ) {
            tracing::error!(service = %reservation.service, error = %e, "Failed to record call");
        }
        if let Err(e) = store.bump_hourly(reservation.service, self.clock.current_hour()) {
            tracing::warn!(service = %reservation.service, error = %e, "Failed to bump hourly usage");
        }
    }

    /// Return a reservation whose call never happened or failed.
    pub fn release(&self, mut reservation: Reservation) {
        let Some(store) = reservation.store.take() else {
            return;
        };
        if let Err(e) = store.release(
            reservation.service,
            reservation.day,
            reservation.estimated_cost,
        ) {
            tracing::error!(service = %reservation.service, error = %e, "Failed to release reservation");
        }
    }

    /// Today's counters for every service.
    pub fn usage_report(&self) -> Result<UsageReport, StoreError> {
        let day = self.clock.today();
        let mut services = Vec::with_capacity(Service::ALL.len());
        for service in Service::ALL {
            let counter = self.store.counter(service, day)?;
            let limits = self.limits.for_service(service);
            services.push(ServiceUsage {
                service,
                calls: counter.call_count,
                cost: counter.accumulated_cost,
                in_flight: counter.inflight_calls,
                call_limit: limits.max_calls,
                cost_limit: limits.max_cost,
            });
        }
        let total_cost = services.iter().map(|s| s.cost).sum();
        Ok(UsageReport {
            day,
            services,
            total_cost,
        })
    }

    /// Calls per hour over the last `hours` hours, current hour last.
    pub fn hourly_usage(&self, hours: u32) -> Result<HourlyUsage, StoreError> {
        let current = self.clock.current_hour();
        let slots: Vec<_> = (0..hours as i64)
            .rev()
            .map(|back| current - chrono::Duration::hours(back))
            .collect();

        let labels = slots
            .iter()
            .map(|hour| hour.format("%H:00").to_string())
            .collect();
        let mut series = Vec::with_capacity(Service::ALL.len());
        for service in Service::ALL {
            let counts = slots
                .iter()
                .map(|hour| self.store.hourly_count(service, *hour))
                .collect::<Result<Vec<_>, _>>()?;
            series.push(HourlySeries { service, counts });
        }
        Ok(HourlyUsage { labels, series })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::MemoryUsageStore;
    use crate::clock::ManualClock;
    use chrono::{DateTime, TimeZone, Utc};

    struct BrokenStore;

    impl UsageStore for BrokenStore {
        fn try_reserve(
            &self,
            _: Service,
            _: NaiveDate,
            _: f64,
            _: &ServiceLimits,
        ) -> Result<ReserveOutcome, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        fn commit(&self, _: Service, _: NaiveDate, _: f64, _: f64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        fn release(&self, _: Service, _: NaiveDate, _: f64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        fn counter(
            &self,
            _: Service,
            _: NaiveDate,
        ) -> Result<crate::budget::BudgetCounter, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        fn bump_hourly(&self, _: Service, _: DateTime<Utc>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        fn hourly_count(&self, _: Service, _: DateTime<Utc>) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 23, 30, 0).unwrap(),
        ))
    }

    fn tight_limits() -> BudgetLimits {
        let mut limits = BudgetLimits::default();
        limits.places.max_calls = 1;
        limits
    }

    #[test]
    fn test_denies_at_ceiling() {
        let tracker = BudgetTracker::new(Arc::new(MemoryUsageStore::new()), clock(), tight_limits());
        let first = match tracker.admit(Service::Places, 0.005) {
            Admission::Admitted(r) => r,
            Admission::Denied(reason) => panic!("unexpected denial: {}", reason),
        };
        assert!(matches!(
            tracker.admit(Service::Places, 0.005),
            Admission::Denied(DenialReason::CallCeiling { used: 1, ceiling: 1, .. })
        ));
        tracker.record(first, None);
        assert!(matches!(
            tracker.admit(Service::Places, 0.005),
            Admission::Denied(DenialReason::CallCeiling { .. })
        ));
        // Other services have their own counters.
        assert!(matches!(
            tracker.admit(Service::Completion, 0.002),
            Admission::Admitted(_)
        ));
    }

    #[test]
    fn test_new_day_resets() {
        let clock = clock();
        let tracker = BudgetTracker::new(Arc::new(MemoryUsageStore::new()), clock.clone(), tight_limits());
        if let Admission::Admitted(r) = tracker.admit(Service::Places, 0.005) {
            tracker.record(r, None);
        }
        assert!(matches!(
            tracker.admit(Service::Places, 0.005),
            Admission::Denied(_)
        ));

        clock.advance(chrono::Duration::hours(1));
        assert!(matches!(
            tracker.admit(Service::Places, 0.005),
            Admission::Admitted(_)
        ));
    }

    #[test]
    fn test_reservation_recorded_on_admission_day() {
        let clock = clock();
        let store = Arc::new(MemoryUsageStore::new());
        let tracker = BudgetTracker::new(store.clone(), clock.clone(), BudgetLimits::default());
        let reservation = match tracker.admit(Service::Completion, 0.002) {
            Admission::Admitted(r) => r,
            Admission::Denied(reason) => panic!("unexpected denial: {}", reason),
        };
        let admitted_on = clock.today();
        clock.advance(chrono::Duration::hours(1));
        tracker.record(reservation, Some(0.003));

        let counter = store.counter(Service::Completion, admitted_on).unwrap();
        assert_eq!(counter.call_count, 1);
        assert_eq!(counter.inflight_calls, 0);
        assert!((counter.accumulated_cost - 0.003).abs() < 1e-9);
        assert_eq!(tracker.usage_report().unwrap().total_cost, 0.0);
    }

    #[test]
    fn test_release_frees_slot() {
        let tracker = BudgetTracker::new(Arc::new(MemoryUsageStore::new()), clock(), tight_limits());
        if let Admission::Admitted(r) = tracker.admit(Service::Places, 0.005) {
            tracker.release(r);
        }
        assert!(matches!(
            tracker.admit(Service::Places, 0.005),
            Admission::Admitted(_)
        ));
        assert_eq!(tracker.usage_report().unwrap().service(Service::Places).unwrap().calls, 0);
    }

    #[test]
    fn test_dropped_reservation_frees_slot() {
        let clock = clock();
        let store = Arc::new(MemoryUsageStore::new());
        let tracker = BudgetTracker::new(store.clone(), clock.clone(), tight_limits());
        match tracker.admit(Service::Places, 0.005) {
            Admission::Admitted(r) => drop(r),
            Admission::Denied(reason) => panic!("unexpected denial: {}", reason),
        }
        let counter = store.counter(Service::Places, clock.today()).unwrap();
        assert_eq!(counter.inflight_calls, 0);
        assert_eq!(counter.call_count, 0);

        // A recorded reservation is not released a second time on drop.
        if let Admission::Admitted(r) = tracker.admit(Service::Places, 0.005) {
            tracker.record(r, None);
        }
        let counter = store.counter(Service::Places, clock.today()).unwrap();
        assert_eq!((counter.call_count, counter.inflight_calls), (1, 0));
    }

    #[test]
    fn test_tracker_failure_fails_closed_by_default() {
        let tracker = BudgetTracker::new(Arc::new(BrokenStore), clock(), BudgetLimits::default());
        assert!(matches!(
            tracker.admit(Service::Completion, 0.002),
            Admission::Denied(DenialReason::TrackerUnavailable { .. })
        ));

        let tracker = BudgetTracker::new(Arc::new(BrokenStore), clock(), BudgetLimits::default())
            .allow_on_tracker_failure(true);
        match tracker.admit(Service::Completion, 0.002) {
            Admission::Admitted(r) => tracker.record(r, None),
            Admission::Denied(reason) => panic!("unexpected denial: {}", reason),
        }
    }

    #[test]
    fn test_hourly_usage_window() {
        let clock = clock();
        let tracker = BudgetTracker::new(Arc::new(MemoryUsageStore::new()), clock.clone(), BudgetLimits::default());
        for _ in 0..2 {
            if let Admission::Admitted(r) = tracker.admit(Service::Completion, 0.002) {
                tracker.record(r, None);
            }
        }
        let usage = tracker.hourly_usage(3).unwrap();
        assert_eq!(usage.labels, vec!["21:00", "22:00", "23:00"]);
        let completion = usage
            .series
            .iter()
            .find(|s| s.service == Service::Completion)
            .unwrap();
        assert_eq!(completion.counts, vec![0, 0, 2]);
    }
}
