//! Plan orchestrator: turns a trip request into stored content and an
//! artifact.
//!
//! # Key Concepts
//! - Idempotent skip: a request with content and a live artifact is done
//! - Degraded: the template plan stands in when the completion service is
//!   denied, rate limited, out of quota or down
//! - Per-location isolation: a failed places lookup only costs that
//!   location its enrichment
//!
//! # Invariants
//! - One generation per request at a time: an in-process lock plus a
//!   database lease for other processes
//! - Quota and rate limits never fail a request

mod locks;
mod progress;
mod runner;

pub use locks::{RequestGuard, RequestLocks};
pub use progress::{GenerationStage, Progress, ProgressBoard};
pub use runner::{EnqueueOutcome, GenerationQueue, QueueError};

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::artifact::{ArtifactError, ArtifactGuard, ArtifactRef};
use crate::clock::Clock;
use crate::plan::{
    completion_request, display_text, extract_locations, extract_marked, template_plan,
    CompletionSettings,
};
use crate::store::{PlanStore, StoreError};
use crate::trip::{GeneratedPlan, ResolvedLocation, TripId, TripRequest, TripStatus};
use crate::upstream::{CompletionUpstream, FetchError, Gateway, PlaceQuery, PlacesUpstream};

/// Shown to users whenever a generation fails. Upstream text never is.
pub const FAILURE_MESSAGE: &str =
    "We couldn't generate your trip plan right now. Please try again later.";

const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub completion: CompletionSettings,
    /// Cap on locations extracted from one plan.
    pub max_locations: usize,
    /// Age after which another process may take over a generation claim.
    pub lease: chrono::Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            completion: CompletionSettings::default(),
            max_locations: 5,
            lease: chrono::Duration::minutes(10),
        }
    }
}

/// Result of one `generate` call.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// Already complete; nothing was called or written.
    Skipped(ArtifactRef),
    /// Another run owns this request.
    InFlight,
    Completed {
        artifact: ArtifactRef,
        degraded: bool,
    },
    /// Marked failed; `message` is safe to show.
    Failed { message: String },
}

/// Unrecoverable failure inside a run.
#[derive(Debug, Error)]
enum RunFailure {
    #[error("completion rejected: {0}")]
    Completion(FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Status poll response.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub request_id: TripId,
    pub state: TripStatus,
    pub stage: GenerationStage,
    pub has_artifact: bool,
    pub degraded: bool,
    pub content_excerpt: Option<String>,
    pub message: Option<String>,
}

/// Outcome of a forced artifact render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenerateOutcome {
    Regenerated(ArtifactRef),
    /// Nothing to render until generation has produced content.
    NoContent,
    /// A generation is running for the request.
    Busy,
}

/// Outcome of a delete request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// A generation is running for the request.
    Busy,
}

pub struct PlanOrchestrator {
    store: Arc<dyn PlanStore>,
    gateway: Arc<Gateway>,
    completion: Arc<CompletionUpstream>,
    places: Arc<PlacesUpstream>,
    artifacts: Arc<ArtifactGuard>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
    locks: RequestLocks,
    progress: ProgressBoard,
    instance_id: String,
}

impl PlanOrchestrator {
    pub fn new(
        store: Arc<dyn PlanStore>,
        gateway: Arc<Gateway>,
        completion: Arc<CompletionUpstream>,
        places: Arc<PlacesUpstream>,
        artifacts: Arc<ArtifactGuard>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            completion,
            places,
            artifacts,
            progress: ProgressBoard::new(clock.clone()),
            clock,
            settings,
            locks: RequestLocks::new(),
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PlanStore> {
        &self.store
    }

    pub fn artifacts(&self) -> &Arc<ArtifactGuard> {
        &self.artifacts
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn places(&self) -> &Arc<PlacesUpstream> {
        &self.places
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Record that a run for `id` is waiting in the queue.
    pub async fn mark_queued(&self, id: TripId) {
        self.progress.set(id, GenerationStage::Queued).await;
    }

    pub async fn clear_progress(&self, id: TripId) {
        self.progress.remove(id).await;
    }

    /// Requests currently queued or running in this process.
    pub async fn active_runs(&self) -> usize {
        self.progress.active().await
    }

    /// Generate the plan and artifact for `id`.
    ///
    /// Safe to call any number of times: a complete request is skipped and
    /// a request owned by another run reports `InFlight`. Only a missing
    /// request or a store failure before the run starts is an `Err`.
    pub async fn generate(&self, id: TripId) -> Result<GenerationOutcome, StoreError> {
        let result = self.try_generate(id).await;
        if result.is_err() {
            self.progress.remove(id).await;
        }
        result
    }

    async fn try_generate(&self, id: TripId) -> Result<GenerationOutcome, StoreError> {
        let trip = self.store.get_trip(id)?;

        let Some(_guard) = self.locks.try_acquire(id) else {
            tracing::debug!(request_id = id, "Generation already running in this process");
            return Ok(GenerationOutcome::InFlight);
        };

        self.progress.set(id, GenerationStage::CheckingArtifact).await;
        let existing = self.store.get_plan(id)?;
        if let Some(artifact) = self.completed_artifact(existing.as_ref()).await {
            if trip.status != TripStatus::Complete {
                self.store.set_status(id, TripStatus::Complete)?;
            }
            let stage = if existing.as_ref().is_some_and(|p| p.degraded) {
                GenerationStage::Degraded
            } else {
                GenerationStage::Done
            };
            self.progress.finish(id, stage).await;
            tracing::info!(request_id = id, "Plan already complete, skipping generation");
            return Ok(GenerationOutcome::Skipped(artifact));
        }

        let owner = format!("{}:{}", self.instance_id, Uuid::new_v4());
        if !self
            .store
            .claim_generation(id, &owner, self.clock.now(), self.settings.lease)?
        {
            tracing::info!(request_id = id, "Generation claimed by another worker");
            self.progress.remove(id).await;
            return Ok(GenerationOutcome::InFlight);
        }

        tracing::info!(request_id = id, destination = %trip.destination, "Generation starting");
        let result = self.run(&trip, existing).await;

        let final_status = if result.is_ok() {
            TripStatus::Complete
        } else {
            TripStatus::Failed
        };
        if let Err(e) = self.store.release_generation(id, &owner, final_status) {
            tracing::error!(request_id = id, error = %e, "Failed to release generation claim");
        }

        match result {
            Ok((artifact, degraded)) => {
                let stage = if degraded {
                    GenerationStage::Degraded
                } else {
                    GenerationStage::Done
                };
                self.progress.finish(id, stage).await;
                tracing::info!(request_id = id, degraded, "Generation finished");
                Ok(GenerationOutcome::Completed { artifact, degraded })
            }
            Err(e) => {
                tracing::error!(request_id = id, error = %e, "Generation failed");
                self.progress.finish(id, GenerationStage::Failed).await;
                Ok(GenerationOutcome::Failed {
                    message: FAILURE_MESSAGE.to_string(),
                })
            }
        }
    }

    async fn completed_artifact(&self, plan: Option<&GeneratedPlan>) -> Option<ArtifactRef> {
        let plan = plan?;
        if !self.artifacts.is_complete(plan).await {
            return None;
        }
        Some(ArtifactRef {
            request_id: plan.request_id,
            key: plan.artifact_path.clone()?,
            fingerprint: plan.artifact_fingerprint.clone().unwrap_or_default(),
        })
    }

    async fn run(
        &self,
        trip: &TripRequest,
        existing: Option<GeneratedPlan>,
    ) -> Result<(ArtifactRef, bool), RunFailure> {
        let id = trip.id;

        let (content, names, degraded) = match existing.filter(GeneratedPlan::has_content) {
            Some(plan) => {
                tracing::info!(request_id = id, "Reusing stored plan content");
                (plan.content, plan.locations, plan.degraded)
            }
            None => {
                self.progress.set(id, GenerationStage::ResolvingContent).await;
                let (content, degraded) = self.resolve_content(trip).await?;
                let names = if degraded {
                    extract_marked(&content, self.settings.max_locations)
                } else {
                    extract_locations(&content, self.settings.max_locations)
                };
                self.store
                    .save_plan_content(id, &content, &names, degraded, self.clock.now())?;
                (content, names, degraded)
            }
        };
        self.progress.set(id, GenerationStage::ResolvingLocations).await;
        let locations = self.resolve_locations(&names, Some(&trip.destination)).await;

        self.progress.set(id, GenerationStage::RenderingArtifact).await;
        let artifact = self.artifacts.ensure(id, &content, &locations).await?;
        Ok((artifact, degraded))
    }

    /// Completion text, or the template plan when the service is unavailable.
    async fn resolve_content(&self, trip: &TripRequest) -> Result<(String, bool), RunFailure> {
        let request = completion_request(trip, &self.settings.completion);
        match self.gateway.fetch(self.completion.as_ref(), &request).await {
            Ok(fetched) => {
                tracing::debug!(request_id = trip.id, from_cache = fetched.from_cache, "Plan content resolved");
                Ok((fetched.value.text, false))
            }
            Err(e) if e.is_degradable() => {
                tracing::warn!(request_id = trip.id, error = %e, "Completion unavailable, using template plan");
                Ok((template_plan(trip), true))
            }
            Err(e) => Err(RunFailure::Completion(e)),
        }
    }

    /// Resolve every name concurrently. Order is kept and a failed lookup
    /// leaves that one location bare.
    pub async fn resolve_locations(&self, names: &[String], city: Option<&str>) -> Vec<ResolvedLocation> {
        let lookups = names.iter().map(|name| async move {
            let query = PlaceQuery::new(name.clone(), city);
            match self.gateway.fetch(self.places.as_ref(), &query).await {
                Ok(fetched) => ResolvedLocation {
                    name: name.clone(),
                    place: fetched.value,
                },
                Err(e) => {
                    tracing::warn!(location = %name, error = %e, "Place lookup failed");
                    ResolvedLocation::bare(name.clone())
                }
            }
        });
        join_all(lookups).await
    }

    /// Current state of `id`. Reads only; never starts a run.
    pub async fn status(&self, id: TripId) -> Result<StatusSnapshot, StoreError> {
        let trip = self.store.get_trip(id)?;
        let plan = self.store.get_plan(id)?;
        let progress = self.progress.get(id).await;

        let stage = match &progress {
            Some(progress) => progress.stage,
            None => match trip.status {
                TripStatus::Pending => GenerationStage::Idle,
                TripStatus::Generating => GenerationStage::ResolvingContent,
                TripStatus::Complete if plan.as_ref().is_some_and(|p| p.degraded) => {
                    GenerationStage::Degraded
                }
                TripStatus::Complete => GenerationStage::Done,
                TripStatus::Failed => GenerationStage::Failed,
            },
        };
        let message = (trip.status == TripStatus::Failed).then(|| FAILURE_MESSAGE.to_string());

        Ok(StatusSnapshot {
            request_id: id,
            state: trip.status,
            stage,
            has_artifact: plan.as_ref().is_some_and(|p| p.artifact_path.is_some()),
            degraded: plan.as_ref().is_some_and(|p| p.degraded),
            content_excerpt: plan
                .as_ref()
                .filter(|p| p.has_content())
                .map(|p| excerpt(&display_text(&p.content), EXCERPT_CHARS)),
            message,
        })
    }

    /// Render the stored plan again and replace its artifact.
    ///
    /// Never calls the completion service; locations are resolved from the
    /// stored names, normally out of the places cache.
    pub async fn regenerate(&self, id: TripId) -> Result<RegenerateOutcome, ArtifactError> {
        let trip = self.store.get_trip(id)?;
        let Some(_guard) = self.locks.try_acquire(id) else {
            return Ok(RegenerateOutcome::Busy);
        };
        let Some(plan) = self.store.get_plan(id)?.filter(GeneratedPlan::has_content) else {
            return Ok(RegenerateOutcome::NoContent);
        };

        let owner = format!("{}:{}", self.instance_id, Uuid::new_v4());
        if !self
            .store
            .claim_generation(id, &owner, self.clock.now(), self.settings.lease)?
        {
            return Ok(RegenerateOutcome::Busy);
        }

        self.progress.set(id, GenerationStage::ResolvingLocations).await;
        let locations = self.resolve_locations(&plan.locations, Some(&trip.destination)).await;
        self.progress.set(id, GenerationStage::RenderingArtifact).await;
        let result = self.artifacts.regenerate(id, &plan.content, &locations).await;

        // A failed forced render keeps whatever outcome the request had.
        let final_status = match (&result, trip.status) {
            (Ok(_), _) => TripStatus::Complete,
            (Err(_), TripStatus::Generating) => TripStatus::Failed,
            (Err(_), previous) => previous,
        };
        if let Err(e) = self.store.release_generation(id, &owner, final_status) {
            tracing::error!(request_id = id, error = %e, "Failed to release generation claim");
        }

        let stage = match &result {
            Ok(_) if plan.degraded => GenerationStage::Degraded,
            Ok(_) => GenerationStage::Done,
            Err(_) => GenerationStage::Failed,
        };
        self.progress.finish(id, stage).await;

        match result {
            Ok(artifact) => {
                tracing::info!(request_id = id, "Artifact regenerated");
                Ok(RegenerateOutcome::Regenerated(artifact))
            }
            Err(e) => {
                tracing::error!(request_id = id, error = %e, "Artifact regeneration failed");
                Err(e)
            }
        }
    }

    /// Delete a request and its artifact unless it is being generated.
    pub async fn delete(&self, id: TripId) -> Result<DeleteOutcome, ArtifactError> {
        let Some(_guard) = self.locks.try_acquire(id) else {
            return Ok(DeleteOutcome::Busy);
        };
        if self.store.get_trip(id)?.status == TripStatus::Generating {
            return Ok(DeleteOutcome::Busy);
        }
        self.artifacts.delete_trip(id).await?;
        self.progress.remove(id).await;
        Ok(DeleteOutcome::Deleted)
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{FsBlobStore, PdfRenderer, RenderError};
    use crate::budget::{BudgetLimits, BudgetTracker, MemoryUsageStore, Service};
    use crate::cache::{Cache, CacheKey, KeyClass, MemoryCache, TtlPolicy};
    use crate::clock::SystemClock;
    use crate::store::SqliteStore;
    use crate::trip::{NewTripRequest, PlaceRecord};
    use crate::upstream::{
        Completion, CompletionRequest, RetryConfig, Upstream, UpstreamError,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FixedCompletion {
        reply: Result<String, UpstreamError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Upstream for FixedCompletion {
        type Params = CompletionRequest;
        type Output = Completion;

        fn service(&self) -> Service {
            Service::Completion
        }
        fn key_class(&self) -> KeyClass {
            KeyClass::Completion
        }
        fn cache_key(&self, params: &CompletionRequest) -> CacheKey {
            params.key.clone()
        }
        async fn call(&self, _: &CompletionRequest) -> Result<Completion, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map(|text| Completion {
                text,
                model: None,
                usage: None,
            })
        }
    }

    struct NoPlaces;

    #[async_trait]
    impl Upstream for NoPlaces {
        type Params = PlaceQuery;
        type Output = Option<PlaceRecord>;

        fn service(&self) -> Service {
            Service::Places
        }
        fn key_class(&self) -> KeyClass {
            KeyClass::Place
        }
        fn cache_key(&self, params: &PlaceQuery) -> CacheKey {
            crate::cache::place_key(&params.location, params.region_hint.as_deref())
        }
        async fn call(&self, _: &PlaceQuery) -> Result<Option<PlaceRecord>, UpstreamError> {
            Ok(None)
        }
    }

    struct EchoRenderer;

    impl PdfRenderer for EchoRenderer {
        fn render(&self, content: &str, _: &[ResolvedLocation]) -> Result<Vec<u8>, RenderError> {
            Ok(content.as_bytes().to_vec())
        }
    }

    fn build(reply: Result<String, UpstreamError>) -> (tempfile::TempDir, Arc<SqliteStore>, Arc<FixedCompletion>, PlanOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = Arc::new(Cache::new(
            Arc::new(MemoryCache::new()),
            clock.clone(),
            TtlPolicy::default(),
        ));
        let budget = Arc::new(BudgetTracker::new(
            Arc::new(MemoryUsageStore::new()),
            clock.clone(),
            BudgetLimits::default(),
        ));
        let gateway = Arc::new(Gateway::new(
            cache,
            budget,
            RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
            Duration::from_secs(5),
        ));
        let completion = Arc::new(FixedCompletion {
            reply,
            calls: AtomicUsize::new(0),
        });
        let artifacts = Arc::new(ArtifactGuard::new(
            store.clone(),
            Arc::new(FsBlobStore::new(dir.path())),
            Arc::new(EchoRenderer),
            clock.clone(),
        ));
        let orchestrator = PlanOrchestrator::new(
            store.clone(),
            gateway,
            completion.clone(),
            Arc::new(NoPlaces),
            artifacts,
            clock,
            OrchestratorSettings::default(),
        );
        (dir, store, completion, orchestrator)
    }

    fn trip(store: &SqliteStore, destination: &str) -> TripId {
        store
            .create_trip(
                &NewTripRequest {
                    destination: destination.to_string(),
                    destination_country: None,
                    budget: 900.0,
                    duration_days: 3,
                    travelers: 1,
                    interests: None,
                    transportation: None,
                    experience_style: None,
                },
                chrono::Utc::now(),
            )
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_generate_then_skip() {
        let (_dir, store, completion, orchestrator) =
            build(Ok("Day 1: see [[Sagrada Familia]] and [[Park Guell]]".to_string()));
        let id = trip(&store, "Barcelona");

        let first = orchestrator.generate(id).await.unwrap();
        assert!(matches!(first, GenerationOutcome::Completed { degraded: false, .. }));
        let plan = store.get_plan(id).unwrap().unwrap();
        assert_eq!(plan.locations, vec!["Sagrada Familia", "Park Guell"]);

        let second = orchestrator.generate(id).await.unwrap();
        assert!(matches!(second, GenerationOutcome::Skipped(_)));
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);

        let status = orchestrator.status(id).await.unwrap();
        assert_eq!(status.state, TripStatus::Complete);
        assert_eq!(status.stage, GenerationStage::Done);
        assert!(status.has_artifact);
        assert!(status.content_excerpt.unwrap().contains("Sagrada Familia"));
    }

    #[tokio::test]
    async fn test_malformed_marks_failed_with_generic_message() {
        let (_dir, store, _completion, orchestrator) =
            build(Err(UpstreamError::malformed("invalid_request_error: raw provider text")));
        let id = trip(&store, "Lisbon");

        let outcome = orchestrator.generate(id).await.unwrap();
        assert_eq!(
            outcome,
            GenerationOutcome::Failed {
                message: FAILURE_MESSAGE.to_string()
            }
        );
        let status = orchestrator.status(id).await.unwrap();
        assert_eq!(status.state, TripStatus::Failed);
        assert_eq!(status.message.as_deref(), Some(FAILURE_MESSAGE));
        assert!(!status.message.unwrap().contains("raw provider text"));
    }

    #[tokio::test]
    async fn test_status_of_new_request_is_idle() {
        let (_dir, store, completion, orchestrator) = build(Ok("x".to_string()));
        let id = trip(&store, "Oslo");

        let status = orchestrator.status(id).await.unwrap();
        assert_eq!(status.state, TripStatus::Pending);
        assert_eq!(status.stage, GenerationStage::Idle);
        assert!(!status.has_artifact);
        assert!(status.content_excerpt.is_none());
        assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_request() {
        let (_dir, _store, _completion, orchestrator) = build(Ok("x".to_string()));
        assert!(matches!(
            orchestrator.generate(404).await,
            Err(StoreError::TripNotFound(404))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_request() {
        let (_dir, store, _completion, orchestrator) = build(Ok("Visit [[Belem Tower]]".to_string()));
        let id = trip(&store, "Lisbon");
        orchestrator.generate(id).await.unwrap();

        assert_eq!(orchestrator.delete(id).await.unwrap(), DeleteOutcome::Deleted);
        assert!(matches!(store.get_trip(id), Err(StoreError::TripNotFound(_))));
    }

    #[tokio::test]
    async fn test_settled_runs_leave_no_progress() {
        let (_dir, store, _completion, orchestrator) =
            build(Ok("Walk to [[Belem Tower]]".to_string()));
        for destination in ["Lisbon", "Porto", "Faro"] {
            let id = trip(&store, destination);
            orchestrator.generate(id).await.unwrap();
            orchestrator.generate(id).await.unwrap();
        }
        orchestrator.mark_queued(999).await;
        assert!(orchestrator.generate(999).await.is_err());
        assert_eq!(orchestrator.active_runs().await, 0);

        let id = trip(&store, "Braga");
        orchestrator.mark_queued(id).await;
        assert_eq!(orchestrator.status(id).await.unwrap().stage, GenerationStage::Queued);
        orchestrator.generate(id).await.unwrap();
        let status = orchestrator.status(id).await.unwrap();
        assert_eq!(status.stage, GenerationStage::Done);
        assert_eq!(orchestrator.active_runs().await, 0);
    }

    #[tokio::test]
    async fn test_regenerate_needs_content() {
        let (_dir, store, completion, orchestrator) =
            build(Ok("Walk to [[Belem Tower]]".to_string()));
        let id = trip(&store, "Lisbon");
        assert_eq!(orchestrator.regenerate(id).await.unwrap(), RegenerateOutcome::NoContent);
        assert_eq!(store.get_trip(id).unwrap().status, TripStatus::Pending);

        orchestrator.generate(id).await.unwrap();
        let before = store.get_plan(id).unwrap().unwrap();
        let outcome = orchestrator.regenerate(id).await.unwrap();
        let RegenerateOutcome::Regenerated(artifact) = outcome else {
            panic!("expected a regenerated artifact, got {:?}", outcome);
        };
        assert_eq!(Some(artifact.key), before.artifact_path);
        assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_trip(id).unwrap().status, TripStatus::Complete);
        assert_eq!(orchestrator.active_runs().await, 0);
    }

    #[test]
    fn test_excerpt_truncates_on_chars() {
        assert_eq!(excerpt("  short  ", 10), "short");
        assert_eq!(excerpt("ééééé", 3), "ééé...");
    }
}
