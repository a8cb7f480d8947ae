//! Deterministic cache key derivation.
//!
//! Keys are `"{class}:{sha256 hex}"` over normalized inputs, so cosmetic
//! differences (case, surrounding or repeated whitespace) map to one entry.

use sha2::{Digest, Sha256};

use crate::trip::TripRequest;

/// A derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Companion key holding a briefly cached permanent failure.
    pub fn negative(&self) -> CacheKey {
        CacheKey(format!("{}:neg", self.0))
    }

    /// Wrap an already-derived key string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, trim and collapse inner whitespace.
pub fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn digest(prefix: &str, parts: &[&str]) -> CacheKey {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(normalize(part).as_bytes());
        // Unit separator keeps ("ab", "c") and ("a", "bc") apart.
        hasher.update([0x1f]);
    }
    CacheKey(format!("{}:{}", prefix, hex::encode(hasher.finalize())))
}

/// Key for a completion over the given trip parameters.
pub fn completion_key(model: &str, template_id: &str, trip: &TripRequest) -> CacheKey {
    let duration = trip.duration_days.to_string();
    let budget = format!("{:.2}", trip.budget);
    let travelers = trip.travelers.to_string();
    digest(
        "completion",
        &[
            model,
            template_id,
            &trip.destination,
            trip.destination_country.as_deref().unwrap_or(""),
            &duration,
            &budget,
            &travelers,
            trip.interests.as_deref().unwrap_or(""),
            trip.transportation.as_deref().unwrap_or(""),
            trip.experience_style.as_deref().unwrap_or(""),
        ],
    )
}

/// Key for a single place lookup.
pub fn place_key(location: &str, city: Option<&str>) -> CacheKey {
    digest("place", &[location, city.unwrap_or("")])
}

/// Key for an autocomplete query.
pub fn autocomplete_key(query: &str, limit: usize) -> CacheKey {
    digest("autocomplete", &[query, &limit.to_string()])
}
