//! Per-request mutual exclusion within one process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::trip::TripId;

/// Set of request ids currently being worked on.
#[derive(Debug, Clone, Default)]
pub struct RequestLocks {
    held: Arc<Mutex<HashSet<TripId>>>,
}

/// Held lock on one request id; released on drop.
#[derive(Debug)]
pub struct RequestGuard {
    id: TripId,
    held: Arc<Mutex<HashSet<TripId>>>,
}

impl RequestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `id` without waiting.
    pub fn try_acquire(&self, id: TripId) -> Option<RequestGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(id) {
            return None;
        }
        Some(RequestGuard {
            id,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, id: TripId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}

impl RequestGuard {
    pub fn id(&self) -> TripId {
        self.id
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
