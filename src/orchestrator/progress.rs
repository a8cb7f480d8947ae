//! In-memory progress of live generation runs, read by the status endpoint.
//!
//! Only queued and running requests have an entry. Once a run settles its
//! outcome is in the store, so `finish` drops the entry and the board stays
//! as large as the work in flight.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::trip::TripId;

/// Where a generation run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStage {
    Idle,
    Queued,
    CheckingArtifact,
    ResolvingContent,
    ResolvingLocations,
    RenderingArtifact,
    Done,
    /// Finished using the template fallback.
    Degraded,
    Failed,
}

impl GenerationStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Degraded | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub stage: GenerationStage,
    pub updated_at: DateTime<Utc>,
}

pub struct ProgressBoard {
    entries: RwLock<HashMap<TripId, Progress>>,
    clock: Arc<dyn Clock>,
}

impl ProgressBoard {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn set(&self, id: TripId, stage: GenerationStage) {
        let progress = Progress {
            stage,
            updated_at: self.clock.now(),
        };
        self.entries.write().await.insert(id, progress);
        tracing::debug!(request_id = id, ?stage, "Generation stage");
    }

    /// Drop the entry for a run whose outcome has been persisted.
    pub async fn finish(&self, id: TripId, stage: GenerationStage) {
        self.entries.write().await.remove(&id);
        tracing::debug!(request_id = id, ?stage, "Generation settled");
    }

    pub async fn get(&self, id: TripId) -> Option<Progress> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: TripId) {
        self.entries.write().await.remove(&id);
    }

    /// Number of requests with a live entry.
    pub async fn active(&self) -> usize {
        self.entries.read().await.len()
    }
}
