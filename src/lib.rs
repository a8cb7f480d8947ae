//! Cost-aware trip plan generation.
//!
//! A trip request becomes a generated plan and a PDF artifact. Paid
//! upstream calls go through one cache-first, budget-gated gateway, and
//! the artifact for a request is rendered once per distinct input.
//!
//! ## Modules
//!
//! - `budget`: daily call and cost ceilings per service
//! - `cache`: TTL cache in front of every upstream call
//! - `upstream`: completion and places adapters plus the shared gateway
//! - `plan`: prompt, location extraction and the template fallback
//! - `artifact`: the only writer of PDF blobs
//! - `orchestrator`: generation state machine and background workers
//! - `store`: SQLite persistence
//! - `api`: HTTP surface

pub mod api;
pub mod artifact;
pub mod budget;
pub mod cache;
pub mod clock;
pub mod config;
pub mod orchestrator;
pub mod plan;
pub mod store;
pub mod trip;
pub mod upstream;

pub use config::Config;
