//! Upstream service adapters.
//!
//! Both paid services (completion and places) implement one [`Upstream`]
//! trait. Caching, budget admission and retry live once in the
//! [`Gateway`], so adapters only know how to make a single HTTP call and
//! classify its failure.

mod completion;
mod error;
mod gateway;
mod places;

pub use completion::{Completion, CompletionRequest, OpenAiCompletionClient};
pub use error::{
    classify_http_status, classify_message, classify_places_status, classify_transport,
    RetryConfig, UpstreamError, UpstreamErrorKind,
};
pub use gateway::{FetchError, Fetched, Gateway};
pub use places::{
    AutocompleteQuery, GoogleAutocompleteClient, GooglePlacesClient, PlaceQuery, PlaceSuggestion,
};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::budget::Service;
use crate::cache::{CacheKey, KeyClass};
use crate::trip::PlaceRecord;

/// A metered upstream service.
#[async_trait]
pub trait Upstream: Send + Sync {
    type Params: Send + Sync;
    type Output: Serialize + DeserializeOwned + Send + Sync;

    /// Budget this service is charged against.
    fn service(&self) -> Service;

    /// Cache class for successful results.
    fn key_class(&self) -> KeyClass;

    /// Deterministic cache key for `params`.
    fn cache_key(&self, params: &Self::Params) -> CacheKey;

    /// Cache class for a particular result. Empty answers may expire sooner.
    fn output_class(&self, _output: &Self::Output) -> KeyClass {
        self.key_class()
    }

    /// Billed cost of a result when the provider reports it.
    fn actual_cost(&self, _output: &Self::Output) -> Option<f64> {
        None
    }

    /// Make exactly one call. No caching, no retry.
    async fn call(&self, params: &Self::Params) -> Result<Self::Output, UpstreamError>;
}

/// Completion service as used by the orchestrator.
pub type CompletionUpstream = dyn Upstream<Params = CompletionRequest, Output = Completion>;

/// Single-location places lookup.
pub type PlacesUpstream = dyn Upstream<Params = PlaceQuery, Output = Option<PlaceRecord>>;

/// City suggestions for the intake form.
pub type AutocompleteUpstream =
    dyn Upstream<Params = AutocompleteQuery, Output = Vec<PlaceSuggestion>>;
