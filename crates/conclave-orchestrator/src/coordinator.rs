//! Hierarchical coordinator
//!
//! Consumes the task queue, grows a set of typed workers up to a per-type cap,
//! and hands tasks out over the message channel. Workers report back with
//! `task:completed`, `task:failed` or `worker:ready`, after which the
//! coordinator tries to assign more work.
//!
//! Worker selection always follows the head of the queue: when the head task
//! cannot be served (no idle worker of its type and the type is at its cap) the
//! coordinator waits for the next trigger rather than skipping ahead.

use conclave_agent::{AgentConfig, AgentSubstrate, SpawnOptions};
use conclave_core::config::ConclaveConfig;
use conclave_core::fail_open::fail_open;
use conclave_core::{
    AgentStatus, ConclaveError, Priority, Result, Task, TaskId, Worker, WorkerId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::communication::{Message, MessageChannel, MessageKind, Subscription};
use crate::pool::AgentPool;
use crate::queue::{QueueStatus, TaskQueue};

/// Agent type of the coordinator's own worker
pub const COORDINATOR_AGENT_TYPE: &str = "coordinator";

/// Configuration for a coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum workers per agent type
    pub max_workers: usize,
    /// Session spawned workers belong to
    pub session_id: Option<String>,
    /// Settings passed to every spawned worker
    pub agent_config: AgentConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            session_id: None,
            agent_config: AgentConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn from_config(config: &ConclaveConfig) -> Self {
        Self::default().with_max_workers(config.coordinator.max_workers)
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent_config(mut self, agent_config: AgentConfig) -> Self {
        self.agent_config = agent_config;
        self
    }
}

/// Snapshot of coordinator load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub running_workers: usize,
    /// Warm agents parked in the pool
    pub pooled_workers: usize,
    pub queue: QueueStatus,
}

pub struct HierarchicalCoordinator {
    config: CoordinatorConfig,
    substrate: Arc<dyn AgentSubstrate>,
    channel: MessageChannel,
    queue: TaskQueue,
    workers: HashMap<WorkerId, Worker>,
    assignments: HashMap<WorkerId, TaskId>,
    pool: Option<AgentPool>,
    parked: HashMap<WorkerId, Worker>,
    coordinator: Option<Worker>,
    subscription: Option<Subscription>,
    inbox: Option<mpsc::UnboundedReceiver<Message>>,
}

impl HierarchicalCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        substrate: Arc<dyn AgentSubstrate>,
        channel: MessageChannel,
    ) -> Self {
        Self {
            config,
            substrate,
            channel,
            queue: TaskQueue::new(),
            workers: HashMap::new(),
            assignments: HashMap::new(),
            pool: None,
            parked: HashMap::new(),
            coordinator: None,
            subscription: None,
            inbox: None,
        }
    }

    /// Reuse warm agents from this pool before spawning new ones
    pub fn with_pool(mut self, pool: AgentPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Id of the coordinator's own worker, once initialized
    pub fn id(&self) -> Option<&str> {
        self.coordinator.as_ref().map(|w| w.id.as_str())
    }

    pub fn channel(&self) -> &MessageChannel {
        &self.channel
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn workers(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values()
    }

    pub fn worker(&self, worker_id: &str) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    /// Task currently assigned to a worker
    pub fn assignment(&self, worker_id: &str) -> Option<&TaskId> {
        self.assignments.get(worker_id)
    }

    pub fn pool(&self) -> Option<&AgentPool> {
        self.pool.as_ref()
    }

    /// Spawn the coordinator worker and start listening on the channel
    pub async fn initialize(&mut self) -> Result<()> {
        if self.coordinator.is_some() {
            return Err(ConclaveError::StateConflict(
                "coordinator is already initialized".to_string(),
            ));
        }

        let options = SpawnOptions::default().with_session(self.config.session_id.clone());
        let worker = self
            .substrate
            .spawn_agent(
                COORDINATOR_AGENT_TYPE,
                options,
                self.config.agent_config.clone(),
            )
            .await?;
        info!("Initializing coordinator {}", worker.id);

        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.channel.subscribe(worker.id.clone(), move |message| {
            tx.send(message.clone()).map_err(|_| {
                ConclaveError::Other("coordinator inbox is closed".to_string())
            })
        });

        self.subscription = Some(subscription);
        self.inbox = Some(rx);
        self.coordinator = Some(worker);
        Ok(())
    }

    /// Queue a task and try to assign it
    pub async fn submit_task(&mut self, task: Task, priority: Priority) -> Result<TaskId> {
        if task.agent_type.trim().is_empty() {
            return Err(ConclaveError::Validation(
                "task agent_type must not be empty".to_string(),
            ));
        }

        let task_id = task.id.clone();
        if !self.queue.enqueue(task, priority) {
            return Err(ConclaveError::StateConflict(format!(
                "task {} is already queued",
                task_id
            )));
        }

        self.assign_pending_tasks().await?;
        Ok(task_id)
    }

    /// Hand pending tasks to workers until the head of the queue cannot be served
    ///
    /// Returns the number of tasks assigned.
    pub async fn assign_pending_tasks(&mut self) -> Result<usize> {
        let mut assigned = 0;

        loop {
            let Some(head) = self.queue.peek(1).into_iter().next() else {
                break;
            };
            let task_id = head.task.id.clone();
            let agent_type = head.task.agent_type.clone();

            let worker_id = match self.idle_worker(&agent_type) {
                Some(id) => id,
                None => {
                    if self.worker_count(&agent_type) >= self.config.max_workers {
                        debug!(
                            "No {} capacity for task {} ({} workers)",
                            agent_type, task_id, self.config.max_workers
                        );
                        break;
                    }
                    self.obtain_worker(&agent_type).await?
                }
            };

            self.dispatch(&task_id, &worker_id).await?;
            assigned += 1;
        }

        Ok(assigned)
    }

    /// Wait for the next worker message and handle it
    ///
    /// Returns `Ok(false)` once the coordinator is not listening (before
    /// `initialize` or after `shutdown`). Hosts drive the coordinator by calling
    /// this in a loop, typically inside `tokio::select!` with their own stop
    /// signal.
    pub async fn handle_next_message(&mut self) -> Result<bool> {
        let message = match self.inbox.as_mut() {
            Some(inbox) => inbox.recv().await,
            None => None,
        };
        let Some(message) = message else {
            return Ok(false);
        };
        self.handle_message(&message).await?;
        Ok(true)
    }

    /// Handle every message that arrived since the last call without waiting
    ///
    /// Messages are only acted on when the host calls this or
    /// [`Self::handle_next_message`].
    pub async fn process_pending_messages(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let message = match self.inbox.as_mut() {
                Some(inbox) => match inbox.try_recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
                None => break,
            };
            self.handle_message(&message).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// React to a worker lifecycle message
    pub async fn handle_message(&mut self, message: &Message) -> Result<()> {
        let worker_id = message
            .payload_str("worker_id")
            .unwrap_or(message.from.as_str())
            .to_string();

        match &message.kind {
            MessageKind::TaskCompleted => {
                let Some(task_id) = self.message_task(message, &worker_id) else {
                    warn!("task:completed from {} names no task", worker_id);
                    return Ok(());
                };
                if self.queue.complete(&task_id).is_none() {
                    warn!("Completed task {} was not processing", task_id);
                }
                info!("Task {} completed by {}", task_id, worker_id);
                self.release_worker(&worker_id, &task_id).await?;
                self.assign_pending_tasks().await?;
            }
            MessageKind::TaskFailed => {
                let Some(task_id) = self.message_task(message, &worker_id) else {
                    warn!("task:failed from {} names no task", worker_id);
                    return Ok(());
                };
                if self.queue.requeue(&task_id) {
                    warn!(
                        "Task {} failed on {}; requeued for retry",
                        task_id, worker_id
                    );
                } else {
                    warn!("Failed task {} was not processing", task_id);
                }
                self.release_worker(&worker_id, &task_id).await?;
                self.assign_pending_tasks().await?;
            }
            MessageKind::WorkerReady => {
                self.mark_idle(&worker_id).await?;
                self.assign_pending_tasks().await?;
            }
            other => {
                debug!("Coordinator ignoring {} from {}", other, message.from);
            }
        }

        Ok(())
    }

    /// Return idle workers to the warm pool
    ///
    /// Workers the pool refuses are stopped. Returns how many were parked.
    pub async fn park_idle_workers(&mut self) -> Result<usize> {
        let Some(pool) = self.pool.as_mut() else {
            return Ok(0);
        };

        let idle: Vec<Worker> = self
            .workers
            .values()
            .filter(|w| w.is_idle())
            .cloned()
            .collect();

        let mut parked = 0;
        let mut refused = Vec::new();
        for worker in idle {
            if pool.release(&worker.agent_type, &worker.id) {
                debug!("Parked {} in the warm pool", worker);
                self.workers.remove(&worker.id);
                self.parked.insert(worker.id.clone(), worker);
                parked += 1;
            } else {
                refused.push(worker);
            }
        }

        // A worker that fails to stop stays tracked so shutdown retries it
        for worker in refused {
            debug!("Pool full for {}; stopping {}", worker.agent_type, worker.id);
            let substrate = Arc::clone(&self.substrate);
            let stopped = fail_open("coordinator::stop_worker", || async {
                substrate.stop_agent(&worker.id).await
            })
            .await;
            if stopped.is_some() {
                self.workers.remove(&worker.id);
            }
        }

        Ok(parked)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let idle_workers = self.workers.values().filter(|w| w.is_idle()).count();
        let running_workers = self
            .workers
            .values()
            .filter(|w| w.status == AgentStatus::Running)
            .count();

        CoordinatorStatus {
            total_workers: self.workers.len(),
            idle_workers,
            running_workers,
            pooled_workers: self.parked.len(),
            queue: self.queue.status(),
        }
    }

    /// Unsubscribe, stop every worker and clear all state
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.inbox = None;

        let mut to_stop: Vec<WorkerId> = self.workers.keys().cloned().collect();
        to_stop.extend(self.parked.keys().cloned());
        if let Some(coordinator) = self.coordinator.take() {
            to_stop.push(coordinator.id);
        }

        info!("Shutting down coordinator, stopping {} workers", to_stop.len());
        for worker_id in &to_stop {
            let substrate = Arc::clone(&self.substrate);
            fail_open("coordinator::stop_worker", || async move {
                substrate.stop_agent(worker_id).await
            })
            .await;
        }

        self.workers.clear();
        self.parked.clear();
        self.assignments.clear();
        self.queue.clear();
        if let Some(pool) = self.pool.as_mut() {
            pool.clear();
        }
        Ok(())
    }

    fn idle_worker(&self, agent_type: &str) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.agent_type == agent_type && w.is_idle())
            .min_by(|a, b| a.created_at.cmp(&b.created_at))
            .map(|w| w.id.clone())
    }

    fn worker_count(&self, agent_type: &str) -> usize {
        self.workers
            .values()
            .filter(|w| w.agent_type == agent_type && w.status != AgentStatus::Stopped)
            .count()
    }

    /// Reuse a warm agent of this type or spawn a new one
    async fn obtain_worker(&mut self, agent_type: &str) -> Result<WorkerId> {
        if let Some(pool) = self.pool.as_mut() {
            while let Some(id) = pool.acquire(agent_type) {
                if let Some(worker) = self.parked.remove(&id) {
                    debug!("Reusing warm {} worker {}", agent_type, id);
                    self.workers.insert(id.clone(), worker);
                    return Ok(id);
                }
                // Not one of ours
                pool.remove(agent_type, &id);
            }
        }

        let options = SpawnOptions::default().with_session(self.config.session_id.clone());
        let worker = self
            .substrate
            .spawn_agent(agent_type, options, self.config.agent_config.clone())
            .await?;
        info!("Spawned worker {} ({})", worker, worker.id);

        let id = worker.id.clone();
        self.workers.insert(id.clone(), worker);
        Ok(id)
    }

    /// Mark the worker running, then move the task into processing
    ///
    /// A failed status update leaves the task pending and the worker idle, so
    /// the next trigger can serve it.
    async fn dispatch(&mut self, task_id: &str, worker_id: &str) -> Result<()> {
        self.substrate
            .update_agent_status(worker_id, AgentStatus::Running)
            .await?;

        if !self.queue.assign(task_id, worker_id) {
            let substrate = Arc::clone(&self.substrate);
            fail_open("coordinator::revert_status", || async move {
                substrate
                    .update_agent_status(worker_id, AgentStatus::Idle)
                    .await
            })
            .await;
            return Err(ConclaveError::StateConflict(format!(
                "task {} is not pending",
                task_id
            )));
        }

        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.status = AgentStatus::Running;
        }
        self.assignments
            .insert(worker_id.to_string(), task_id.to_string());

        let task = self
            .queue
            .get(task_id)
            .map(|q| serde_json::to_value(&q.task))
            .transpose()?;
        let from = self.id().unwrap_or(COORDINATOR_AGENT_TYPE).to_string();
        self.channel.send(
            from,
            worker_id,
            MessageKind::TaskAssign,
            json!({ "task_id": task_id, "task": task }),
        );

        info!("Assigned task {} to {}", task_id, worker_id);
        Ok(())
    }

    fn message_task(&self, message: &Message, worker_id: &str) -> Option<TaskId> {
        message
            .payload_str("task_id")
            .map(str::to_string)
            .or_else(|| self.assignments.get(worker_id).cloned())
    }

    async fn release_worker(&mut self, worker_id: &str, task_id: &str) -> Result<()> {
        if self.assignments.get(worker_id).map(String::as_str) == Some(task_id) {
            self.assignments.remove(worker_id);
        }
        self.mark_idle(worker_id).await
    }

    async fn mark_idle(&mut self, worker_id: &str) -> Result<()> {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            warn!("Message from unknown worker {}", worker_id);
            return Ok(());
        };
        worker.status = AgentStatus::Idle;
        self.substrate
            .update_agent_status(worker_id, AgentStatus::Idle)
            .await
    }
}
