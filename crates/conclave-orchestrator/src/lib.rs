//! # conclave-orchestrator
//!
//! Coordination engine for Conclave.
//!
//! This crate provides:
//! - A FIFO counting semaphore that gates concurrent review loops
//! - A per-type pool of reusable workers
//! - A priority task queue with lifecycle events
//! - A hierarchical coordinator that assigns queued tasks to workers
//! - Producer / adversarial review loops driven by a pure state machine
//! - An in-process message channel between coordinator and workers

mod communication;
mod coordinator;
mod pool;
mod prompt;
mod queue;
mod registry;
mod review_loop;
mod semaphore;
mod state_machine;

pub use communication::{
    Listener, Message, MessageChannel, MessageKind, Subscription, DEFAULT_HISTORY_LIMIT,
};
pub use coordinator::{
    CoordinatorConfig, CoordinatorStatus, HierarchicalCoordinator, COORDINATOR_AGENT_TYPE,
};
pub use pool::{AgentPool, PoolStats};
pub use prompt::{build_fix_prompt, build_generation_prompt, build_review_prompt};
pub use queue::{QueueEvent, QueueStatus, QueuedTask, TaskQueue};
pub use registry::LoopRegistry;
pub use review_loop::{
    ReviewLoopConfig, ReviewLoopCoordinator, ReviewLoopEvent, ReviewLoopRuntime, ReviewLoopState,
    DEFAULT_MAX_CONCURRENT_LOOPS,
};
pub use semaphore::{Semaphore, SemaphoreState};
pub use state_machine::{transition, LoopEvent, ReviewLoopStatus};
