//! Upstream error taxonomy and the single place where raw upstream responses
//! are classified.
//!
//! Every adapter funnels HTTP statuses, provider status strings and transport
//! failures through the functions here, so retry and fallback policy changes
//! happen in one file.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use thiserror::Error;

/// Classification of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    /// Too many requests in a short window (HTTP 429 and friends).
    RateLimited,
    /// Account or billing quota exhausted.
    QuotaExceeded,
    /// Network failure, timeout or 5xx.
    Transient,
    /// Bad input or an unparseable response.
    Malformed,
    /// Bad or missing credentials.
    Unauthorized,
}

impl UpstreamErrorKind {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Failures that indicate a setup problem rather than load.
    pub fn is_operator_error(&self) -> bool {
        matches!(self, Self::Malformed | Self::Unauthorized)
    }
}

impl std::fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate limited",
            Self::QuotaExceeded => "quota exceeded",
            Self::Transient => "transient failure",
            Self::Malformed => "malformed request or response",
            Self::Unauthorized => "unauthorized",
        };
        f.write_str(s)
    }
}

/// A classified upstream failure.
///
/// `message` carries raw upstream text and is meant for logs only.
#[derive(Debug, Clone, Error)]
#[error("upstream {kind}{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::RateLimited, message)
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::QuotaExceeded, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Transient, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Malformed, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Unauthorized, message)
    }

    /// Build an error from a non-success HTTP response.
    pub fn from_http(status: u16, body: &str) -> Self {
        Self::new(classify_http_status(status, body), truncate(body, 500)).with_status(status)
    }
}

const QUOTA_MARKERS: &[&str] = &[
    "insufficient_quota",
    "quota",
    "billing",
    "exceeded your current",
    "daily limit",
    "over_query_limit",
];

const RATE_MARKERS: &[&str] = &["rate limit", "rate_limit", "too many requests"];

const AUTH_MARKERS: &[&str] = &[
    "invalid api key",
    "invalid_api_key",
    "incorrect api key",
    "unauthorized",
    "request_denied",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    needles.iter().any(|n| lower.contains(n))
}

/// Classify an upstream failure from free text alone.
///
/// Returns `None` when the text carries no recognizable signal.
pub fn classify_message(message: &str) -> Option<UpstreamErrorKind> {
    if contains_any(message, QUOTA_MARKERS) {
        Some(UpstreamErrorKind::QuotaExceeded)
    } else if contains_any(message, RATE_MARKERS) {
        Some(UpstreamErrorKind::RateLimited)
    } else if contains_any(message, AUTH_MARKERS) {
        Some(UpstreamErrorKind::Unauthorized)
    } else {
        None
    }
}

/// Classify a non-success HTTP status, refined by the response body.
pub fn classify_http_status(status: u16, body: &str) -> UpstreamErrorKind {
    match status {
        429 => {
            if contains_any(body, QUOTA_MARKERS) {
                UpstreamErrorKind::QuotaExceeded
            } else {
                UpstreamErrorKind::RateLimited
            }
        }
        402 => UpstreamErrorKind::QuotaExceeded,
        401 | 403 => {
            if contains_any(body, QUOTA_MARKERS) {
                UpstreamErrorKind::QuotaExceeded
            } else {
                UpstreamErrorKind::Unauthorized
            }
        }
        408 => UpstreamErrorKind::Transient,
        400..=499 => classify_message(body).unwrap_or(UpstreamErrorKind::Malformed),
        _ => UpstreamErrorKind::Transient,
    }
}

/// Classify the `status` field of a Google Maps web service response.
///
/// `Ok(())` means the payload can be read; `ZERO_RESULTS` is not an error.
pub fn classify_places_status(
    status: &str,
    error_message: Option<&str>,
) -> Result<(), UpstreamError> {
    let message = error_message.unwrap_or(status).to_string();
    match status {
        "OK" | "ZERO_RESULTS" => Ok(()),
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => {
            if status == "OVER_DAILY_LIMIT" || contains_any(&message, &["quota", "billing", "daily"]) {
                Err(UpstreamError::quota_exceeded(message))
            } else {
                Err(UpstreamError::rate_limited(message))
            }
        }
        "REQUEST_DENIED" => Err(UpstreamError::unauthorized(message)),
        "INVALID_REQUEST" | "NOT_FOUND" => Err(UpstreamError::malformed(message)),
        "UNKNOWN_ERROR" => Err(UpstreamError::transient(message)),
        other => Err(UpstreamError::malformed(format!(
            "unexpected places status {}: {}",
            other, message
        ))),
    }
}

/// Classify a transport-level failure from the HTTP client.
pub fn classify_transport(err: &reqwest::Error) -> UpstreamError {
    if err.is_decode() {
        return UpstreamError::malformed(format!("undecodable response: {}", err));
    }
    if let Some(status) = err.status() {
        return UpstreamError::from_http(status.as_u16(), &err.to_string());
    }
    UpstreamError::transient(err.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Retry policy for transient upstream failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter (0 disables).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1 = first retry).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let base = self.initial_backoff.as_secs_f64() * exp;
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=capped * self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}
