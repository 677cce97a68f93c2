//! Priority task queue
//!
//! Pending tasks are ordered by priority (highest first), then by arrival.
//! Assigned tasks move to a processing set until they are completed or
//! requeued; a requeued task keeps its original priority and arrival slot.

use chrono::{DateTime, Utc};
use conclave_core::{Priority, Task, TaskId, TaskStatus, WorkerId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

/// A task waiting in, or assigned from, the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task: Task,
    pub priority: Priority,
    pub added_at: DateTime<Utc>,
    pub assigned_to: Option<WorkerId>,
    sequence: u64,
}

/// Queue lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Added {
        task_id: TaskId,
        agent_type: String,
        priority: Priority,
    },
    Assigned {
        task_id: TaskId,
        worker_id: WorkerId,
    },
    Completed {
        task_id: TaskId,
    },
    Requeued {
        task_id: TaskId,
    },
}

/// Queued vs processing counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: usize,
}

type QueueKey = (Reverse<Priority>, u64);

pub struct TaskQueue {
    pending: BTreeMap<QueueKey, QueuedTask>,
    processing: HashMap<TaskId, QueuedTask>,
    next_sequence: u64,
    events: broadcast::Sender<QueueEvent>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pending: BTreeMap::new(),
            processing: HashMap::new(),
            next_sequence: 0,
            events,
        }
    }

    /// Receive queue events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Add a task; returns false if a task with the same id is already queued
    /// or processing
    pub fn enqueue(&mut self, task: Task, priority: Priority) -> bool {
        if self.contains(&task.id) {
            return false;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let event = QueueEvent::Added {
            task_id: task.id.clone(),
            agent_type: task.agent_type.clone(),
            priority,
        };
        debug!(
            "Queued task {} ({}) at priority {}",
            task.id, task.agent_type, priority
        );
        self.pending.insert(
            (Reverse(priority), sequence),
            QueuedTask {
                task,
                priority,
                added_at: Utc::now(),
                assigned_to: None,
                sequence,
            },
        );
        self.emit(event);
        true
    }

    /// Remove and return the best pending task of the given agent type
    ///
    /// Tasks of other types stay queued.
    pub fn dequeue(&mut self, agent_type: &str) -> Option<QueuedTask> {
        let key = self
            .pending
            .iter()
            .find(|(_, q)| q.task.agent_type == agent_type && q.assigned_to.is_none())
            .map(|(key, _)| *key)?;
        self.pending.remove(&key)
    }

    /// Up to `n` pending tasks in service order
    pub fn peek(&self, n: usize) -> Vec<&QueuedTask> {
        self.pending.values().take(n).collect()
    }

    /// Move a pending task to processing under `worker_id`
    pub fn assign(&mut self, task_id: &str, worker_id: &str) -> bool {
        let Some(key) = self.pending_key(task_id) else {
            return false;
        };
        let Some(mut queued) = self.pending.remove(&key) else {
            return false;
        };

        queued.assigned_to = Some(worker_id.to_string());
        queued.task.status = TaskStatus::Running;
        queued.task.started_at = Some(Utc::now());
        self.processing.insert(task_id.to_string(), queued);

        self.emit(QueueEvent::Assigned {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
        });
        true
    }

    /// Finish a processing task
    pub fn complete(&mut self, task_id: &str) -> Option<QueuedTask> {
        let mut queued = self.processing.remove(task_id)?;
        queued.task.status = TaskStatus::Completed;
        queued.task.completed_at = Some(Utc::now());
        self.emit(QueueEvent::Completed {
            task_id: task_id.to_string(),
        });
        Some(queued)
    }

    /// Put a processing task back in the pending set at its original position
    pub fn requeue(&mut self, task_id: &str) -> bool {
        let Some(mut queued) = self.processing.remove(task_id) else {
            return false;
        };

        queued.assigned_to = None;
        queued.task.status = TaskStatus::Pending;
        queued.task.started_at = None;
        self.pending.insert((Reverse(queued.priority), queued.sequence), queued);

        self.emit(QueueEvent::Requeued {
            task_id: task_id.to_string(),
        });
        true
    }

    pub fn get(&self, task_id: &str) -> Option<&QueuedTask> {
        self.processing
            .get(task_id)
            .or_else(|| self.pending.values().find(|q| q.task.id == task_id))
    }

    pub fn is_processing(&self, task_id: &str) -> bool {
        self.processing.contains_key(task_id)
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.pending.len(),
            processing: self.processing.len(),
        }
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the pending set is empty; processing tasks are not counted
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.processing.clear();
    }

    fn contains(&self, task_id: &str) -> bool {
        self.processing.contains_key(task_id) || self.pending_key(task_id).is_some()
    }

    fn pending_key(&self, task_id: &str) -> Option<QueueKey> {
        self.pending
            .iter()
            .find(|(_, q)| q.task.id == task_id)
            .map(|(key, _)| *key)
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
