//! Trip planner service entry point.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trip_planner::api::{self, AppState};
use trip_planner::artifact::{ArtifactGuard, FsBlobStore, TextPdfRenderer};
use trip_planner::budget::BudgetTracker;
use trip_planner::cache::{Cache, CacheStore, MemoryCache};
use trip_planner::clock::{Clock, SystemClock};
use trip_planner::config::{CacheBackend, Config};
use trip_planner::orchestrator::{GenerationQueue, PlanOrchestrator};
use trip_planner::store::SqliteStore;
use trip_planner::upstream::{
    GoogleAutocompleteClient, GooglePlacesClient, Gateway, OpenAiCompletionClient,
};

const QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        bind = %config.bind_addr,
        database = %config.database_path.display(),
        artifacts = %config.artifact_dir.display(),
        cache = ?config.cache_backend,
        "Starting trip planner"
    );
    if config.completion.api_key.is_none() {
        tracing::warn!("COMPLETION_API_KEY not set; plans will fail until it is configured");
    }
    if config.places.api_key.is_none() {
        tracing::warn!("PLACES_API_KEY not set; locations will not be enriched");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(
        SqliteStore::open(&config.database_path).context("Failed to open database")?,
    );
    let stale = store
        .reset_inflight()
        .context("Failed to reset budget reservations")?;
    if stale > 0 {
        tracing::warn!(rows = stale, "Cleared budget reservations left by a previous run");
    }

    let cache_store: Arc<dyn CacheStore> = match config.cache_backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::Sqlite => store.clone(),
    };
    let cache = Arc::new(Cache::new(cache_store, clock.clone(), config.ttl.clone()));
    let budget = Arc::new(
        BudgetTracker::new(store.clone(), clock.clone(), config.budget.clone())
            .allow_on_tracker_failure(config.allow_on_tracker_failure),
    );
    let gateway = Arc::new(Gateway::new(
        cache.clone(),
        budget,
        config.retry.clone(),
        config.upstream_timeout,
    ));

    let artifacts = Arc::new(ArtifactGuard::new(
        store.clone(),
        Arc::new(FsBlobStore::new(&config.artifact_dir)),
        Arc::new(TextPdfRenderer),
        clock.clone(),
    ));
    let orchestrator = Arc::new(PlanOrchestrator::new(
        store.clone(),
        gateway,
        Arc::new(OpenAiCompletionClient::new(
            &config.completion.base_url,
            config.completion.api_key.clone(),
        )),
        Arc::new(GooglePlacesClient::new(
            &config.places.base_url,
            config.places.api_key.clone(),
            config.places_max_photos,
        )),
        artifacts,
        clock,
        config.orchestrator_settings(),
    ));
    let queue = Arc::new(GenerationQueue::start(
        orchestrator.clone(),
        config.generation_workers,
        QUEUE_CAPACITY,
    ));

    let shutdown = CancellationToken::new();
    let purge = tokio::spawn(purge_expired_cache(
        cache,
        config.cache_purge_interval,
        shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        orchestrator,
        queue: queue.clone(),
        autocomplete: Arc::new(GoogleAutocompleteClient::new(
            &config.places.base_url,
            config.places.api_key.clone(),
        )),
    });

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    api::serve(state, config.bind_addr, shutdown.clone())
        .await
        .context("API server failed")?;

    shutdown.cancel();
    queue.shutdown().await;
    if let Err(e) = purge.await {
        tracing::error!(error = %e, "Cache purge task panicked");
    }
    tracing::info!("Trip planner stopped");
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

/// Drop expired cache entries on a fixed interval until shutdown.
async fn purge_expired_cache(
    cache: Arc<Cache>,
    every: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every.max(std::time::Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match cache.purge_expired() {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "Expired cache entries purged"),
                Err(e) => tracing::warn!(error = %e, "Cache purge failed"),
            },
        }
    }
}
