//! Agent substrate abstraction

use async_trait::async_trait;
use conclave_core::{AgentStatus, Result, Worker};

use crate::types::{AgentConfig, AgentResponse, SpawnOptions};

/// Trait for the substrate that actually runs agents (allows mocking in tests)
///
/// Errors are returned as-is by the orchestration layer; it never retries a
/// failed call on its own.
#[async_trait]
pub trait AgentSubstrate: Send + Sync {
    /// Spawn an agent of the given type
    ///
    /// Fails with `UnknownAgentType` or `DuplicateAgentName`.
    async fn spawn_agent(
        &self,
        agent_type: &str,
        options: SpawnOptions,
        config: AgentConfig,
    ) -> Result<Worker>;

    /// Run a prompt through a spawned agent and return its text response
    async fn execute_agent(
        &self,
        worker_id: &str,
        prompt: &str,
        config: &AgentConfig,
    ) -> Result<AgentResponse>;

    /// Record a lifecycle status for an agent
    async fn update_agent_status(&self, worker_id: &str, status: AgentStatus) -> Result<()>;

    /// Stop an agent; returns false if it was not running
    async fn stop_agent(&self, worker_id: &str) -> Result<bool>;
}
