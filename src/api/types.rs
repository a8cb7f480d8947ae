//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::budget::{HourlyUsage, UsageReport};
use crate::cache::CacheStatsSnapshot;
use crate::trip::{PlaceRecord, TripId, TripRequest, TripStatus};
use crate::upstream::PlaceSuggestion;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Response to a new trip request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripCreated {
    pub id: TripId,
    pub status: TripStatus,
    /// Whether generation was queued right away.
    pub queued: bool,
}

/// Trip request with its plan, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripDetails {
    pub trip: TripRequest,
    pub plan: Option<PlanView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanView {
    /// Plan text without place markers.
    pub content: String,
    pub locations: Vec<String>,
    pub degraded: bool,
    pub has_artifact: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Queued,
    AlreadyQueued,
}

/// Response to a generation trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub request_id: TripId,
    pub status: TriggerStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageQuery {
    pub hours: Option<u32>,
}

/// Cost dashboard payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageResponse {
    pub usage: UsageReport,
    pub cache: CacheStatsSnapshot,
    pub hourly: HourlyUsage,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutocompleteParams {
    #[serde(default)]
    pub query: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutocompleteResponse {
    pub suggestions: Vec<PlaceSuggestion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceDetailsParams {
    pub location: String,
    pub destination: Option<String>,
}

/// One place, enriched when the lookup succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceDetailsResponse {
    pub name: String,
    pub maps_link: String,
    pub place: Option<PlaceRecord>,
}
