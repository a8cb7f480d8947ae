//! Background generation workers.
//!
//! Request handlers enqueue a trip id and return; a fixed pool of workers
//! drains the queue and runs the orchestrator. The status endpoint reads
//! progress the workers publish.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{GenerationOutcome, PlanOrchestrator};
use crate::trip::TripId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Generation queue is full")]
    Full,

    #[error("Generation queue is shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The id was already waiting; nothing was added.
    AlreadyQueued,
}

pub struct GenerationQueue {
    tx: mpsc::Sender<TripId>,
    pending: Arc<Mutex<HashSet<TripId>>>,
    orchestrator: Arc<PlanOrchestrator>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl GenerationQueue {
    /// Spawn `workers` tasks that drain a queue of up to `capacity` ids.
    pub fn start(orchestrator: Arc<PlanOrchestrator>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&rx),
                    Arc::clone(&pending),
                    Arc::clone(&orchestrator),
                    cancel.clone(),
                ))
            })
            .collect();

        tracing::info!(workers = workers.max(1), capacity, "Generation queue started");
        Self {
            tx,
            pending,
            orchestrator,
            cancel,
            workers: Mutex::new(handles),
        }
    }

    /// Queue a generation for `id` unless one is already waiting.
    pub async fn enqueue(&self, id: TripId) -> Result<EnqueueOutcome, QueueError> {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Closed);
        }
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if !pending.insert(id) {
                return Ok(EnqueueOutcome::AlreadyQueued);
            }
        }

        self.orchestrator.mark_queued(id).await;
        if let Err(e) = self.tx.try_send(id) {
            self.orchestrator.clear_progress(id).await;
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            });
        }
        tracing::debug!(request_id = id, "Generation queued");
        Ok(EnqueueOutcome::Queued)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop taking work and wait for running generations to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Generation worker panicked");
            }
        }
        tracing::info!("Generation queue stopped");
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TripId>>>,
    pending: Arc<Mutex<HashSet<TripId>>>,
    orchestrator: Arc<PlanOrchestrator>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            id = async { rx.lock().await.recv().await } => id,
        };
        let Some(id) = next else { break };

        pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);

        match orchestrator.generate(id).await {
            Ok(GenerationOutcome::Completed { degraded, .. }) => {
                tracing::info!(worker, request_id = id, degraded, "Worker completed generation");
            }
            Ok(GenerationOutcome::Skipped(_)) | Ok(GenerationOutcome::InFlight) => {
                tracing::debug!(worker, request_id = id, "Worker had nothing to do");
            }
            Ok(GenerationOutcome::Failed { .. }) => {
                tracing::warn!(worker, request_id = id, "Worker finished with a failed generation");
            }
            Err(e) => {
                tracing::error!(worker, request_id = id, error = %e, "Worker could not start generation");
            }
        }
    }
    tracing::debug!(worker, "Generation worker exiting");
}
