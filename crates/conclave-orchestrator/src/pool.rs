//! Warm agent pool
//!
//! Keeps already-spawned agents around per agent type so the coordinator can
//! reuse them instead of paying the spawn cost again. Each type is capped at
//! `max_size`; the pool refuses growth past the cap instead of evicting.

use conclave_core::WorkerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Per-type pool counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub available: usize,
}

#[derive(Debug, Default)]
struct PoolEntry {
    available: Vec<WorkerId>,
    in_use: HashSet<WorkerId>,
}

impl PoolEntry {
    fn total(&self) -> usize {
        self.available.len() + self.in_use.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.in_use.contains(id) || self.available.iter().any(|a| a == id)
    }
}

#[derive(Debug)]
pub struct AgentPool {
    max_size: usize,
    entries: HashMap<String, PoolEntry>,
}

impl AgentPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: HashMap::new(),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Take a warm agent of this type, marking it in use
    pub fn acquire(&mut self, agent_type: &str) -> Option<WorkerId> {
        let entry = self.entries.get_mut(agent_type)?;
        let id = entry.available.pop()?;
        entry.in_use.insert(id.clone());
        debug!("Pool handed out {} agent {}", agent_type, id);
        Some(id)
    }

    /// Offer an agent back to the pool
    ///
    /// An in-use agent becomes available again. An untracked agent is added
    /// only while the type is below capacity. Returns false when the pool
    /// refused the agent; the caller still owns it.
    pub fn release(&mut self, agent_type: &str, id: &str) -> bool {
        let max_size = self.max_size;
        let entry = self.entries.entry(agent_type.to_string()).or_default();

        if entry.in_use.remove(id) {
            entry.available.push(id.to_string());
            return true;
        }
        if entry.contains(id) || entry.total() >= max_size {
            return false;
        }
        entry.available.push(id.to_string());
        true
    }

    /// Forget an agent; no-op if it is not tracked
    pub fn remove(&mut self, agent_type: &str, id: &str) {
        if let Some(entry) = self.entries.get_mut(agent_type) {
            entry.in_use.remove(id);
            entry.available.retain(|a| a != id);
        }
    }

    pub fn stats(&self) -> BTreeMap<String, PoolStats> {
        self.entries
            .iter()
            .map(|(agent_type, entry)| {
                (
                    agent_type.clone(),
                    PoolStats {
                        total: entry.total(),
                        in_use: entry.in_use.len(),
                        available: entry.available.len(),
                    },
                )
            })
            .collect()
    }

    /// Every tracked agent id
    pub fn agent_ids(&self) -> Vec<WorkerId> {
        self.entries
            .values()
            .flat_map(|e| e.available.iter().chain(e.in_use.iter()).cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
