//! Registry of active review loops
//!
//! Loops register themselves on creation and leave on abort or cleanup. The
//! registry is an ordinary value: share it by cloning, and give each test its
//! own.

use conclave_core::{ConclaveError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::review_loop::{ReviewLoopCoordinator, ReviewLoopState};

#[derive(Clone, Default)]
pub struct LoopRegistry {
    loops: Arc<Mutex<HashMap<String, Arc<ReviewLoopCoordinator>>>>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ReviewLoopCoordinator>> {
        self.lock().get(id).cloned()
    }

    /// Snapshots of every registered loop, oldest first
    pub fn list(&self) -> Vec<ReviewLoopState> {
        let loops: Vec<Arc<ReviewLoopCoordinator>> = self.lock().values().cloned().collect();
        let mut states: Vec<ReviewLoopState> = loops.iter().map(|l| l.state()).collect();
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        states
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Abort a registered loop by id
    pub async fn abort(&self, id: &str) -> Result<ReviewLoopState> {
        let review_loop = self
            .get(id)
            .ok_or_else(|| ConclaveError::NotFound(format!("review loop {}", id)))?;
        review_loop.abort().await
    }

    pub(crate) fn insert(&self, review_loop: Arc<ReviewLoopCoordinator>) {
        self.lock().insert(review_loop.id().to_string(), review_loop);
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ReviewLoopCoordinator>>> {
        self.loops.lock().unwrap_or_else(|e| e.into_inner())
    }
}
