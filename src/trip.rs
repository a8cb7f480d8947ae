//! Trip requests, generated plans and resolved places.
//!
//! # Invariants
//! - A `TripRequest` never changes after creation except for `status`
//! - At most one `GeneratedPlan` exists per request
//! - If `GeneratedPlan::artifact_path` is set, the blob exists and was rendered
//!   from inputs whose fingerprint is `artifact_fingerprint`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a trip request.
pub type TripId = i64;

/// Lifecycle of a trip request's generation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    Pending,
    Generating,
    Complete,
    Failed,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "generating" => Some(Self::Generating),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TripStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Travel preferences submitted by a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTripRequest {
    pub destination: String,
    #[serde(default)]
    pub destination_country: Option<String>,
    /// Total budget in the user's currency.
    pub budget: f64,
    pub duration_days: u32,
    #[serde(default = "default_travelers")]
    pub travelers: u32,
    #[serde(default)]
    pub interests: Option<String>,
    #[serde(default)]
    pub transportation: Option<String>,
    #[serde(default)]
    pub experience_style: Option<String>,
}

fn default_travelers() -> u32 {
    1
}

pub const MAX_DURATION_DAYS: u32 = 365;
pub const MAX_TRAVELERS: u32 = 50;
pub const MAX_BUDGET: f64 = 100_000_000.0;
const MAX_NAME_CHARS: usize = 255;
const MAX_NOTES_CHARS: usize = 2000;

impl NewTripRequest {
    /// Check the request for values generation cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        let destination = self.destination.trim();
        if destination.is_empty() {
            return Err("destination is required".to_string());
        }
        if destination.chars().count() > MAX_NAME_CHARS {
            return Err(format!("destination must be at most {} characters", MAX_NAME_CHARS));
        }
        if !(1..=MAX_DURATION_DAYS).contains(&self.duration_days) {
            return Err(format!("duration_days must be between 1 and {}", MAX_DURATION_DAYS));
        }
        if !(1..=MAX_TRAVELERS).contains(&self.travelers) {
            return Err(format!("travelers must be between 1 and {}", MAX_TRAVELERS));
        }
        if !self.budget.is_finite() || self.budget < 0.0 || self.budget >= MAX_BUDGET {
            return Err("budget must be a non-negative number below 100000000".to_string());
        }
        let text_fields = [
            ("destination_country", self.destination_country.as_deref(), MAX_NAME_CHARS),
            ("transportation", self.transportation.as_deref(), MAX_NAME_CHARS),
            ("experience_style", self.experience_style.as_deref(), MAX_NAME_CHARS),
            ("interests", self.interests.as_deref(), MAX_NOTES_CHARS),
        ];
        for (name, value, max) in text_fields {
            if value.is_some_and(|v| v.chars().count() > max) {
                return Err(format!("{} must be at most {} characters", name, max));
            }
        }
        Ok(())
    }
}

/// A stored trip request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TripRequest {
    pub id: TripId,
    pub destination: String,
    pub destination_country: Option<String>,
    pub budget: f64,
    pub duration_days: u32,
    pub travelers: u32,
    pub interests: Option<String>,
    pub transportation: Option<String>,
    pub experience_style: Option<String>,
    pub status: TripStatus,
    pub created_at: DateTime<Utc>,
}

impl TripRequest {
    /// Budget per traveler per day.
    pub fn daily_budget_per_person(&self) -> f64 {
        let days = self.duration_days.max(1) as f64;
        let travelers = self.travelers.max(1) as f64;
        self.budget / days / travelers
    }
}

/// The plan produced for a trip request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedPlan {
    pub request_id: TripId,
    pub content: String,
    /// Location names extracted from `content`, in order.
    pub locations: Vec<String>,
    /// True when the content came from the template fallback.
    pub degraded: bool,
    pub artifact_path: Option<String>,
    pub artifact_fingerprint: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl GeneratedPlan {
    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// Structured record for one place returned by the places service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaceRecord {
    pub place_id: Option<String>,
    pub name: String,
    pub address: Option<String>,
    pub rating: Option<f64>,
    #[serde(default)]
    pub photo_refs: Vec<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    #[serde(default)]
    pub types: Vec<String>,
}

/// One location of a plan, enriched when the places lookup succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedLocation {
    pub name: String,
    pub place: Option<PlaceRecord>,
}

impl ResolvedLocation {
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            place: None,
        }
    }

    pub fn is_enriched(&self) -> bool {
        self.place.is_some()
    }

    /// Google Maps search link; built locally, no API call.
    pub fn maps_link(&self, city: Option<&str>) -> String {
        if let Some(place_id) = self.place.as_ref().and_then(|p| p.place_id.as_deref()) {
            return format!("https://maps.google.com/?q=place_id:{}", place_id);
        }
        maps_search_link(&self.name, city)
    }
}

/// Build a Google Maps search link for a free-text location.
pub fn maps_search_link(location: &str, city: Option<&str>) -> String {
    let query = match city {
        Some(city) if !city.trim().is_empty() => format!("{}, {}", location, city),
        _ => location.to_string(),
    };
    format!("https://maps.google.com/?q={}", urlencoding::encode(&query))
}
