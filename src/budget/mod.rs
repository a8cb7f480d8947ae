//! Budget module - daily call and cost ceilings per paid service.
//!
//! # Key Concepts
//! - Counter: calls made and cost accumulated per (service, day)
//! - Reservation: an admitted call that has not reported back yet
//! - Admission: check-and-reserve in one atomic step, so concurrent callers
//!   can never push a counter past its ceiling
//! - Day boundary: counters are keyed by UTC day; a new day starts at zero

mod tracker;
mod usage;

pub use tracker::{Admission, BudgetLimits, BudgetTracker, DenialReason, Reservation};
pub use usage::{
    BudgetCounter, HourlySeries, HourlyUsage, MemoryUsageStore, ReserveOutcome, ServiceLimits,
    ServiceUsage, UsageReport, UsageStore,
};

use serde::{Deserialize, Serialize};

/// A paid upstream service with its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Completion,
    Places,
}

impl Service {
    pub const ALL: [Service; 2] = [Service::Completion, Service::Places];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Places => "places",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
