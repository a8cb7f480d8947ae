//! Configuration management.
//!
//! Every knob comes from an environment variable with a default, so limits,
//! TTLs and retry behaviour change without a rebuild.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::budget::{BudgetLimits, ServiceLimits};
use crate::cache::TtlPolicy;
use crate::orchestrator::OrchestratorSettings;
use crate::plan::CompletionSettings;
use crate::upstream::RetryConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: String, value: String },
}

/// Where cache entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Sqlite,
}

impl FromStr for CacheBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub api_key: Option<String>,
    pub base_url: String,
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub database_path: PathBuf,
    pub artifact_dir: PathBuf,
    pub cache_backend: CacheBackend,
    pub completion: UpstreamConfig,
    pub completion_settings: CompletionSettings,
    pub places: UpstreamConfig,
    pub places_max_photos: usize,
    pub budget: BudgetLimits,
    /// Admit calls when the budget store cannot be read.
    pub allow_on_tracker_failure: bool,
    pub ttl: TtlPolicy,
    pub retry: RetryConfig,
    pub upstream_timeout: Duration,
    pub generation_workers: usize,
    pub generation_lease: Duration,
    pub max_locations: usize,
    pub cache_purge_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = BudgetLimits::default();
        let ttl = TtlPolicy::default();
        let retry = RetryConfig::default();
        let completion_defaults = CompletionSettings::default();

        Ok(Self {
            bind_addr: env.parse("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            database_path: env.string("DATABASE_PATH", "data/trip_planner.db").into(),
            artifact_dir: env.string("ARTIFACT_DIR", "data/artifacts").into(),
            cache_backend: env.parse("CACHE_BACKEND", CacheBackend::Memory)?,
            completion: UpstreamConfig {
                api_key: env.optional("COMPLETION_API_KEY"),
                base_url: env.string("COMPLETION_BASE_URL", "https://api.openai.com/v1"),
            },
            completion_settings: CompletionSettings {
                model: env.string("COMPLETION_MODEL", &completion_defaults.model),
                max_tokens: env.parse("COMPLETION_MAX_TOKENS", completion_defaults.max_tokens)?,
                temperature: env.parse("COMPLETION_TEMPERATURE", completion_defaults.temperature)?,
            },
            places: UpstreamConfig {
                api_key: env.optional("PLACES_API_KEY"),
                base_url: env.string(
                    "PLACES_BASE_URL",
                    "https://maps.googleapis.com/maps/api/place",
                ),
            },
            places_max_photos: env.parse("PLACES_MAX_PHOTOS", 3)?,
            budget: BudgetLimits {
                completion: ServiceLimits {
                    max_calls: env.parse("BUDGET_COMPLETION_MAX_CALLS", defaults.completion.max_calls)?,
                    max_cost: env.parse("BUDGET_COMPLETION_MAX_COST", defaults.completion.max_cost)?,
                    cost_per_call: env.parse("COST_PER_COMPLETION_CALL", defaults.completion.cost_per_call)?,
                },
                places: ServiceLimits {
                    max_calls: env.parse("BUDGET_PLACES_MAX_CALLS", defaults.places.max_calls)?,
                    max_cost: env.parse("BUDGET_PLACES_MAX_COST", defaults.places.max_cost)?,
                    cost_per_call: env.parse("COST_PER_PLACES_CALL", defaults.places.cost_per_call)?,
                },
            },
            allow_on_tracker_failure: env.flag("ALLOW_ON_TRACKER_FAILURE", false)?,
            ttl: TtlPolicy {
                completion: env.secs("CACHE_TTL_COMPLETION_SECS", ttl.completion)?,
                place: env.secs("CACHE_TTL_PLACES_SECS", ttl.place)?,
                autocomplete: env.secs("CACHE_TTL_AUTOCOMPLETE_SECS", ttl.autocomplete)?,
                negative: env.secs("CACHE_TTL_NEGATIVE_SECS", ttl.negative)?,
            },
            retry: RetryConfig {
                max_attempts: env.parse("UPSTREAM_MAX_ATTEMPTS", retry.max_attempts)?.max(1),
                initial_backoff: Duration::from_millis(env.parse(
                    "UPSTREAM_INITIAL_BACKOFF_MS",
                    retry.initial_backoff.as_millis() as u64,
                )?),
                ..retry
            },
            upstream_timeout: env.secs("UPSTREAM_TIMEOUT_SECS", Duration::from_secs(60))?,
            generation_workers: env.parse("GENERATION_WORKERS", 2usize)?.max(1),
            generation_lease: env.secs("GENERATION_LEASE_SECS", Duration::from_secs(600))?,
            max_locations: env.parse("MAX_LOCATIONS", 5)?,
            cache_purge_interval: env.secs("CACHE_PURGE_INTERVAL_SECS", Duration::from_secs(900))?,
        })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            completion: self.completion_settings.clone(),
            max_locations: self.max_locations,
            lease: chrono::Duration::from_std(self.generation_lease)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError> {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: name.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "y" | "on" => Ok(true),
                "0" | "false" | "no" | "n" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    name: name.to_string(),
                    value,
                }),
            },
        }
    }
}
