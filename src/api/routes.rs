//! Router and handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::types::*;
use crate::artifact::{ArtifactError, ArtifactRef};
use crate::orchestrator::{
    DeleteOutcome, EnqueueOutcome, GenerationQueue, PlanOrchestrator, QueueError,
    RegenerateOutcome, StatusSnapshot,
};
use crate::store::StoreError;
use crate::trip::{NewTripRequest, ResolvedLocation, TripId};
use crate::upstream::{AutocompleteQuery, AutocompleteUpstream, PlaceQuery};

const AUTOCOMPLETE_MIN_CHARS: usize = 2;
const AUTOCOMPLETE_DEFAULT_LIMIT: usize = 5;
const AUTOCOMPLETE_MAX_LIMIT: usize = 10;
const MAX_USAGE_HOURS: u32 = 168;

/// Shared state for all handlers.
pub struct AppState {
    pub orchestrator: Arc<PlanOrchestrator>,
    pub queue: Arc<GenerationQueue>,
    pub autocomplete: Arc<AutocompleteUpstream>,
}

type ApiError = (StatusCode, String);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/trips", post(create_trip))
        .route("/api/trips/:id", get(get_trip).delete(delete_trip))
        .route("/api/trips/:id/generate", post(trigger_generation))
        .route("/api/trips/:id/status", get(generation_status))
        .route("/api/trips/:id/artifact", get(download_artifact))
        .route("/api/trips/:id/artifact/regenerate", post(regenerate_artifact))
        .route("/api/usage", get(usage))
        .route("/api/places/autocomplete", get(autocomplete))
        .route("/api/places/details", get(place_details))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::TripNotFound(id) => (
            StatusCode::NOT_FOUND,
            format!("Trip request {} not found", id),
        ),
        other => {
            tracing::error!(error = %other, "Store failure while serving request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage is unavailable, please retry".to_string(),
            )
        }
    }
}

fn artifact_error(err: ArtifactError) -> ApiError {
    match err {
        ArtifactError::Store(e) => store_error(e),
        other => {
            tracing::error!(error = %other, "Artifact failure while serving request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Artifact storage is unavailable, please retry".to_string(),
            )
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn create_trip(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewTripRequest>,
) -> Result<(StatusCode, Json<TripCreated>), ApiError> {
    req.validate().map_err(|msg| (StatusCode::BAD_REQUEST, msg))?;

    let trip = state
        .orchestrator
        .store()
        .create_trip(&req, state.orchestrator.clock().now())
        .map_err(store_error)?;
    tracing::info!(request_id = trip.id, destination = %trip.destination, "Trip request created");

    let queued = match state.queue.enqueue(trip.id).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(request_id = trip.id, error = %e, "Could not queue generation for new trip");
            false
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(TripCreated {
            id: trip.id,
            status: trip.status,
            queued,
        }),
    ))
}

async fn get_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TripId>,
) -> Result<Json<TripDetails>, ApiError> {
    let store = state.orchestrator.store();
    let trip = store.get_trip(id).map_err(store_error)?;
    let plan = store.get_plan(id).map_err(store_error)?.map(|plan| PlanView {
        content: crate::plan::display_text(&plan.content),
        has_artifact: plan.artifact_path.is_some(),
        locations: plan.locations,
        degraded: plan.degraded,
    });
    Ok(Json(TripDetails { trip, plan }))
}

async fn delete_trip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TripId>,
) -> Result<StatusCode, ApiError> {
    match state.orchestrator.delete(id).await.map_err(artifact_error)? {
        DeleteOutcome::Deleted => Ok(StatusCode::NO_CONTENT),
        DeleteOutcome::Busy => Err((
            StatusCode::CONFLICT,
            "Plan generation is in progress, try again shortly".to_string(),
        )),
    }
}

/// Queue generation and return right away. Repeat calls are harmless.
async fn trigger_generation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TripId>,
) -> Result<(StatusCode, Json<GenerateResponse>), ApiError> {
    state
        .orchestrator
        .store()
        .get_trip(id)
        .map_err(store_error)?;

    let status = match state.queue.enqueue(id).await {
        Ok(EnqueueOutcome::Queued) => TriggerStatus::Queued,
        Ok(EnqueueOutcome::AlreadyQueued) => TriggerStatus::AlreadyQueued,
        Err(QueueError::Full) => {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "Too many plans are being generated, try again shortly".to_string(),
            ))
        }
        Err(QueueError::Closed) => {
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "Service is shutting down".to_string(),
            ))
        }
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            request_id: id,
            status,
        }),
    ))
}

async fn generation_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TripId>,
) -> Result<Json<StatusSnapshot>, ApiError> {
    state
        .orchestrator
        .status(id)
        .await
        .map(Json)
        .map_err(store_error)
}

async fn download_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TripId>,
) -> Result<Response, ApiError> {
    let bytes = state
        .orchestrator
        .artifacts()
        .open(id)
        .await
        .map_err(artifact_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No artifact for this trip yet".to_string()))?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"trip_plan_{}.pdf\"", id)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok((headers, Body::from(bytes)).into_response())
}

async fn usage(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UsageQuery>,
) -> Result<Json<UsageResponse>, ApiError> {
    let gateway = state.orchestrator.gateway();
    let budget = gateway.budget();
    let hours = q.hours.unwrap_or(24).clamp(1, MAX_USAGE_HOURS);

    let report = budget.usage_report().map_err(store_error)?;
    let hourly = budget.hourly_usage(hours).map_err(store_error)?;
    Ok(Json(UsageResponse {
        recommendations: report.recommendations(),
        usage: report,
        cache: gateway.cache().stats(),
        hourly,
    }))
}

async fn autocomplete(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AutocompleteParams>,
) -> Json<AutocompleteResponse> {
    let input = q.query.trim();
    if input.chars().count() < AUTOCOMPLETE_MIN_CHARS {
        return Json(AutocompleteResponse {
            suggestions: Vec::new(),
        });
    }

    let query = AutocompleteQuery {
        input: input.to_string(),
        limit: q
            .limit
            .unwrap_or(AUTOCOMPLETE_DEFAULT_LIMIT)
            .clamp(1, AUTOCOMPLETE_MAX_LIMIT),
    };
    let suggestions = match state
        .orchestrator
        .gateway()
        .fetch(state.autocomplete.as_ref(), &query)
        .await
    {
        Ok(fetched) => fetched.value,
        Err(e) => {
            tracing::warn!(input = %query.input, error = %e, "Autocomplete unavailable");
            Vec::new()
        }
    };
    Json(AutocompleteResponse { suggestions })
}

async fn place_details(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PlaceDetailsParams>,
) -> Result<Json<PlaceDetailsResponse>, ApiError> {
    let location = q.location.trim();
    if location.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "location is required".to_string()));
    }
    let destination = q.destination.as_deref().map(str::trim).filter(|d| !d.is_empty());

    let query = PlaceQuery::new(location, destination);
    let resolved = match state
        .orchestrator
        .gateway()
        .fetch(state.orchestrator.places().as_ref(), &query)
        .await
    {
        Ok(fetched) => ResolvedLocation {
            name: location.to_string(),
            place: fetched.value,
        },
        Err(e) => {
            tracing::warn!(location, error = %e, "Place details unavailable");
            ResolvedLocation::bare(location)
        }
    };

    Ok(Json(PlaceDetailsResponse {
        maps_link: resolved.maps_link(destination),
        name: resolved.name,
        place: resolved.place,
    }))
}

/// Render the stored plan again. Runs inline: no completion call is made.
async fn regenerate_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<TripId>,
) -> Result<Json<ArtifactRef>, ApiError> {
    match state.orchestrator.regenerate(id).await.map_err(artifact_error)? {
        RegenerateOutcome::Regenerated(artifact) => Ok(Json(artifact)),
        RegenerateOutcome::NoContent => Err((
            StatusCode::BAD_REQUEST,
            "No trip plan content available to render".to_string(),
        )),
        RegenerateOutcome::Busy => Err((
            StatusCode::CONFLICT,
            "A plan is being generated for this trip, try again shortly".to_string(),
        )),
    }
}
