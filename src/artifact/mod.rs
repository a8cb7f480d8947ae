//! Artifact guard: the only component that touches blob storage.
//!
//! # Invariants
//! - One artifact key per request: `artifact:{request_id}`
//! - Replacement order is write-new, update reference, delete-old. A crash
//!   part way leaves at worst an unreferenced blob, never a reference to a
//!   missing one
//! - Identical (content, locations) never renders twice

mod blob;
mod render;

pub use blob::{BlobError, BlobKey, BlobStore, FsBlobStore};
pub use render::{PdfRenderer, RenderError, TextPdfRenderer};

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::clock::Clock;
use crate::store::{PlanStore, StoreError};
use crate::trip::{GeneratedPlan, ResolvedLocation, TripId};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Render task failed: {0}")]
    Task(String),
}

/// Reference to the stored artifact of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub request_id: TripId,
    pub key: String,
    pub fingerprint: String,
}

/// Result of an orphan sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub referenced: usize,
    pub orphans: Vec<String>,
    pub deleted: usize,
}

/// Hex SHA-256 over the content and the resolved location list.
pub fn fingerprint(content: &str, locations: &[ResolvedLocation]) -> Result<String, ArtifactError> {
    let locations = serde_json::to_vec(locations).map_err(StoreError::from)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update([0x1e]);
    hasher.update(&locations);
    Ok(hex::encode(hasher.finalize()))
}

pub struct ArtifactGuard {
    store: Arc<dyn PlanStore>,
    blobs: Arc<dyn BlobStore>,
    renderer: Arc<dyn PdfRenderer>,
    clock: Arc<dyn Clock>,
}

impl ArtifactGuard {
    pub fn new(
        store: Arc<dyn PlanStore>,
        blobs: Arc<dyn BlobStore>,
        renderer: Arc<dyn PdfRenderer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            blobs,
            renderer,
            clock,
        }
    }

    /// True when the plan has content and its referenced blob exists.
    ///
    /// The fingerprint is not compared here: a stale artifact is replaced by
    /// `ensure`, which every generation run goes through.
    pub async fn is_complete(&self, plan: &GeneratedPlan) -> bool {
        if !plan.has_content() {
            return false;
        }
        let Some(path) = plan.artifact_path.as_deref() else {
            return false;
        };
        match self.blobs.exists(&BlobKey::from_raw(path)).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(request_id = plan.request_id, error = %e, "Could not check artifact blob");
                false
            }
        }
    }

    /// Make sure the stored artifact for `request_id` matches
    /// (content, locations), rendering only when it does not.
    ///
    /// The plan row must already exist.
    pub async fn ensure(
        &self,
        request_id: TripId,
        content: &str,
        locations: &[ResolvedLocation],
    ) -> Result<ArtifactRef, ArtifactError> {
        let fingerprint = fingerprint(content, locations)?;
        let previous = self.store.get_plan(request_id)?;
        let previous_path = previous.as_ref().and_then(|p| p.artifact_path.clone());

        if let Some(plan) = &previous {
            if plan.artifact_fingerprint.as_deref() == Some(fingerprint.as_str()) {
                if let Some(path) = plan.artifact_path.as_deref() {
                    if self.blobs.exists(&BlobKey::from_raw(path)).await? {
                        tracing::debug!(request_id, "Artifact up to date, skipping render");
                        return Ok(ArtifactRef {
                            request_id,
                            key: path.to_string(),
                            fingerprint,
                        });
                    }
                }
            }
        }

        self.render_and_store(request_id, content, locations, fingerprint, previous_path)
            .await
    }

    /// Render (content, locations) again even if the stored artifact is
    /// current, replacing it through the same write path as `ensure`.
    pub async fn regenerate(
        &self,
        request_id: TripId,
        content: &str,
        locations: &[ResolvedLocation],
    ) -> Result<ArtifactRef, ArtifactError> {
        let fingerprint = fingerprint(content, locations)?;
        let previous_path = self
            .store
            .get_plan(request_id)?
            .and_then(|p| p.artifact_path);
        tracing::info!(request_id, "Forcing artifact render");
        self.render_and_store(request_id, content, locations, fingerprint, previous_path)
            .await
    }

    async fn render_and_store(
        &self,
        request_id: TripId,
        content: &str,
        locations: &[ResolvedLocation],
        fingerprint: String,
        previous_path: Option<String>,
    ) -> Result<ArtifactRef, ArtifactError> {
        let key = BlobKey::for_request(request_id);
        let renderer = self.renderer.clone();
        let owned_content = content.to_string();
        let owned_locations = locations.to_vec();
        let bytes = tokio::task::spawn_blocking(move || renderer.render(&owned_content, &owned_locations))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))??;

        self.blobs.replace(&key, &bytes).await?;
        self.store
            .set_artifact(request_id, key.as_str(), &fingerprint, self.clock.now())?;
        tracing::info!(request_id, key = %key, bytes = bytes.len(), "Artifact stored");

        if let Some(old) = previous_path.filter(|old| old != key.as_str()) {
            if let Err(e) = self.blobs.delete(&BlobKey::from_raw(old.clone())).await {
                tracing::warn!(request_id, old = %old, error = %e, "Failed to delete replaced artifact");
            }
        }

        Ok(ArtifactRef {
            request_id,
            key: key.to_string(),
            fingerprint,
        })
    }

    /// Bytes of the artifact currently referenced by the plan, if any.
    pub async fn open(&self, request_id: TripId) -> Result<Option<Vec<u8>>, ArtifactError> {
        let Some(path) = self
            .store
            .get_plan(request_id)?
            .and_then(|plan| plan.artifact_path)
        else {
            return Ok(None);
        };
        match self.blobs.read(&BlobKey::from_raw(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(BlobError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a trip request, then its artifact blob.
    pub async fn delete_trip(&self, request_id: TripId) -> Result<(), ArtifactError> {
        let plan = self.store.delete_trip(request_id)?;

        let mut keys = vec![BlobKey::for_request(request_id)];
        if let Some(path) = plan.and_then(|p| p.artifact_path) {
            let referenced = BlobKey::from_raw(path);
            if !keys.contains(&referenced) {
                keys.push(referenced);
            }
        }
        for key in keys {
            if let Err(e) = self.blobs.delete(&key).await {
                tracing::warn!(request_id, key = %key, error = %e, "Artifact left behind after delete");
            }
        }
        tracing::info!(request_id, "Trip request deleted");
        Ok(())
    }

    /// Find blobs no plan references and, unless `dry_run`, delete them.
    pub async fn sweep_orphans(&self, dry_run: bool) -> Result<SweepReport, ArtifactError> {
        let referenced: HashSet<String> = self.store.artifact_paths()?.into_iter().collect();
        let keys = self.blobs.list().await?;

        let mut report = SweepReport {
            scanned: keys.len(),
            referenced: referenced.len(),
            ..SweepReport::default()
        };
        for key in keys {
            if referenced.contains(key.as_str()) {
                continue;
            }
            if !dry_run && self.blobs.delete(&key).await? {
                report.deleted += 1;
            }
            report.orphans.push(key.to_string());
        }
        tracing::info!(
            scanned = report.scanned,
            orphans = report.orphans.len(),
            deleted = report.deleted,
            dry_run,
            "Artifact sweep finished"
        );
        Ok(report)
    }
}
