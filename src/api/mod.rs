//! HTTP API for the trip planner.
//!
//! ## Endpoints
//!
//! - `POST /api/trips` - Create a trip request and queue its generation
//! - `GET /api/trips/{id}` - Trip request and plan
//! - `DELETE /api/trips/{id}` - Delete a trip request and its artifact
//! - `POST /api/trips/{id}/generate` - Queue generation (idempotent)
//! - `GET /api/trips/{id}/status` - Poll generation state
//! - `GET /api/trips/{id}/artifact` - Download the PDF
//! - `POST /api/trips/{id}/artifact/regenerate` - Render the stored plan again
//! - `GET /api/usage` - Daily cost report, cache stats and recommendations
//! - `GET /api/places/autocomplete` - City suggestions
//! - `GET /api/places/details` - Details and map link for one place
//! - `GET /api/health` - Health check

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
