//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use trip_planner::artifact::{ArtifactGuard, FsBlobStore, PdfRenderer, RenderError};
use trip_planner::budget::{BudgetLimits, BudgetTracker, Service};
use trip_planner::cache::{place_key, Cache, CacheKey, KeyClass, MemoryCache, TtlPolicy};
use trip_planner::clock::{Clock, ManualClock};
use trip_planner::orchestrator::{OrchestratorSettings, PlanOrchestrator};
use trip_planner::store::{PlanStore, SqliteStore, StoreError};
use trip_planner::trip::{
    GeneratedPlan, NewTripRequest, PlaceRecord, ResolvedLocation, TripId, TripRequest, TripStatus,
};
use trip_planner::upstream::{
    Completion, CompletionRequest, Gateway, PlaceQuery, RetryConfig, Upstream, UpstreamError,
};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

pub fn barcelona() -> NewTripRequest {
    NewTripRequest {
        destination: "Barcelona".to_string(),
        destination_country: Some("Spain".to_string()),
        budget: 1500.0,
        duration_days: 3,
        travelers: 2,
        interests: Some("architecture, food".to_string()),
        transportation: None,
        experience_style: None,
    }
}

pub fn paris() -> NewTripRequest {
    NewTripRequest {
        destination: "Paris".to_string(),
        destination_country: Some("France".to_string()),
        budget: 900.0,
        duration_days: 2,
        travelers: 1,
        interests: None,
        transportation: None,
        experience_style: None,
    }
}

/// Completion stub: replies with `reply` (or fails) and counts calls.
pub struct StubCompletion {
    reply: Result<String, UpstreamError>,
    pub calls: AtomicUsize,
    delay: Duration,
}

impl StubCompletion {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(err: UpstreamError) -> Self {
        Self {
            reply: Err(err),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for StubCompletion {
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

    async fn call(&self, _params: &CompletionRequest) -> Result<Completion, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.clone().map(|text| Completion {
            text,
            model: Some("stub".to_string()),
            usage: None,
        })
    }
}

/// Places stub: enriches every name except those in `failing`.
pub struct StubPlaces {
    failing: HashSet<String>,
    pub calls: AtomicUsize,
}

impl StubPlaces {
    pub fn new(failing: &[&str]) -> Self {
        Self {
            failing: failing.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for StubPlaces {
    type Params = PlaceQuery;
    type Output = Option<PlaceRecord>;

    fn service(&self) -> Service {
        Service::Places
    }

    fn key_class(&self) -> KeyClass {
        KeyClass::Place
    }

    fn cache_key(&self, params: &PlaceQuery) -> CacheKey {
        place_key(&params.location, params.region_hint.as_deref())
    }

    async fn call(&self, params: &PlaceQuery) -> Result<Option<PlaceRecord>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&params.location) {
            return Err(UpstreamError::transient("connection reset"));
        }
        Ok(Some(PlaceRecord {
            place_id: Some(format!("id-{}", params.location.replace(' ', "-"))),
            name: params.location.clone(),
            address: Some(format!("{} address", params.location)),
            rating: Some(4.5),
            photo_refs: vec!["photo-1".to_string()],
            lat: Some(41.4),
            lng: Some(2.17),
            types: vec!["tourist_attraction".to_string()],
        }))
    }
}

/// Renderer stub that records every render.
#[derive(Default)]
pub struct CountingRenderer {
    pub calls: AtomicUsize,
    pub last_locations: Mutex<Vec<ResolvedLocation>>,
}

impl CountingRenderer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PdfRenderer for CountingRenderer {
    fn render(&self, content: &str, locations: &[ResolvedLocation]) -> Result<Vec<u8>, RenderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_locations.lock().unwrap() = locations.to_vec();
        Ok(format!("%PDF-stub render={} len={}", n, content.len()).into_bytes())
    }
}

/// Plan store whose `set_artifact` can be made to fail once.
pub struct FaultyStore {
    inner: SqliteStore,
    pub fail_next_set_artifact: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            fail_next_set_artifact: AtomicBool::new(false),
        }
    }
}

impl PlanStore for FaultyStore {
    fn create_trip(&self, trip: &NewTripRequest, now: DateTime<Utc>) -> Result<TripRequest, StoreError> {
        self.inner.create_trip(trip, now)
    }

    fn get_trip(&self, id: TripId) -> Result<TripRequest, StoreError> {
        self.inner.get_trip(id)
    }

    fn set_status(&self, id: TripId, status: TripStatus) -> Result<(), StoreError> {
        self.inner.set_status(id, status)
    }

    fn claim_generation(
        &self,
        id: TripId,
        owner: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<bool, StoreError> {
        self.inner.claim_generation(id, owner, now, lease)
    }

    fn release_generation(&self, id: TripId, owner: &str, status: TripStatus) -> Result<(), StoreError> {
        self.inner.release_generation(id, owner, status)
    }

    fn get_plan(&self, id: TripId) -> Result<Option<GeneratedPlan>, StoreError> {
        self.inner.get_plan(id)
    }

    fn save_plan_content(
        &self,
        id: TripId,
        content: &str,
        locations: &[String],
        degraded: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.save_plan_content(id, content, locations, degraded, now)
    }

    fn set_artifact(&self, id: TripId, path: &str, fingerprint: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        if self.fail_next_set_artifact.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        self.inner.set_artifact(id, path, fingerprint, now)
    }

    fn clear_artifact(&self, id: TripId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.clear_artifact(id, now)
    }

    fn delete_trip(&self, id: TripId) -> Result<Option<GeneratedPlan>, StoreError> {
        self.inner.delete_trip(id)
    }

    fn artifact_paths(&self) -> Result<Vec<String>, StoreError> {
        self.inner.artifact_paths()
    }
}

/// A fully wired orchestrator over stubs.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub clock: Arc<ManualClock>,
    pub store: Arc<dyn PlanStore>,
    pub blobs: Arc<FsBlobStore>,
    pub renderer: Arc<CountingRenderer>,
    pub completion: Arc<StubCompletion>,
    pub places: Arc<StubPlaces>,
    pub cache: Arc<Cache>,
    pub budget: Arc<BudgetTracker>,
    pub gateway: Arc<Gateway>,
    pub artifacts: Arc<ArtifactGuard>,
    pub orchestrator: Arc<PlanOrchestrator>,
}

pub struct HarnessBuilder {
    completion: StubCompletion,
    places: StubPlaces,
    limits: BudgetLimits,
    store: Option<Arc<dyn PlanStore>>,
}

impl HarnessBuilder {
    pub fn new(completion: StubCompletion) -> Self {
        Self {
            completion,
            places: StubPlaces::new(&[]),
            limits: BudgetLimits::default(),
            store: None,
        }
    }

    pub fn places(mut self, places: StubPlaces) -> Self {
        self.places = places;
        self
    }

    pub fn limits(mut self, limits: BudgetLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(start_time()));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let sqlite = Arc::new(SqliteStore::open(dir.path().join("planner.db")).unwrap());
        let store: Arc<dyn PlanStore> = match self.store {
            Some(store) => store,
            None => sqlite.clone(),
        };

        let cache = Arc::new(Cache::new(
            Arc::new(MemoryCache::new()),
            dyn_clock.clone(),
            TtlPolicy::default(),
        ));
        let budget = Arc::new(BudgetTracker::new(sqlite, dyn_clock.clone(), self.limits));
        let gateway = Arc::new(Gateway::new(
            cache.clone(),
            budget.clone(),
            RetryConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                jitter: 0.0,
                ..RetryConfig::default()
            },
            Duration::from_secs(5),
        ));

        let blobs = Arc::new(FsBlobStore::new(dir.path().join("artifacts")));
        let renderer = Arc::new(CountingRenderer::default());
        let artifacts = Arc::new(ArtifactGuard::new(
            store.clone(),
            blobs.clone(),
            renderer.clone(),
            dyn_clock.clone(),
        ));
        let completion = Arc::new(self.completion);
        let places = Arc::new(self.places);
        let orchestrator = Arc::new(PlanOrchestrator::new(
            store.clone(),
            gateway.clone(),
            completion.clone(),
            places.clone(),
            artifacts.clone(),
            dyn_clock,
            OrchestratorSettings::default(),
        ));

        Harness {
            dir,
            clock,
            store,
            blobs,
            renderer,
            completion,
            places,
            cache,
            budget,
            gateway,
            artifacts,
            orchestrator,
        }
    }
}

impl Harness {
    pub fn create(&self, trip: &NewTripRequest) -> TripId {
        self.store.create_trip(trip, self.clock.now()).unwrap().id
    }
}

pub const MARKED_PLAN: &str = "🌟 Barcelona in 3 days\n\
🗓️ Day 1: Gaudí\n\
📍 Visit [[Sagrada Familia]] in the morning.\n\
📍 Walk up to [[Park Guell]] for the views.\n\
🗓️ Day 2: Old town\n\
📍 Lose yourself in the [[Gothic Quarter]].\n";
