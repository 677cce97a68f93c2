//! Scriptable agent substrate for tests and dry runs

use async_trait::async_trait;
use conclave_core::{AgentStatus, ConclaveError, Result, Worker};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::substrate::AgentSubstrate;
use crate::types::{AgentConfig, AgentResponse, SpawnOptions};

/// A call recorded by [`MockAgentSubstrate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubstrateCall {
    Spawn { agent_type: String, name: String },
    Execute { worker_id: String, agent_type: String, prompt: String },
    UpdateStatus { worker_id: String, status: AgentStatus },
    Stop { worker_id: String },
}

#[derive(Default)]
struct MockState {
    workers: HashMap<String, Worker>,
    names: HashSet<String>,
    scripted: HashMap<String, VecDeque<std::result::Result<String, String>>>,
    defaults: HashMap<String, String>,
    calls: Vec<SubstrateCall>,
    spawn_counter: usize,
    status_failures: usize,
    stop_failures: usize,
}

/// Mock agent substrate
///
/// Responses are scripted per agent type and consumed in order; once a type's
/// script runs out its default response is used. An optional gate holds every
/// `execute_agent` call until the test releases it.
#[derive(Clone, Default)]
pub struct MockAgentSubstrate {
    state: Arc<Mutex<MockState>>,
    known_types: Option<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockAgentSubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept these agent types; others fail with `UnknownAgentType`
    pub fn with_known_types(mut self, types: &[&str]) -> Self {
        self.known_types = Some(types.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Queue a successful response for an agent type
    pub fn with_response(self, agent_type: &str, response: impl Into<String>) -> Self {
        self.push_script(agent_type, Ok(response.into()));
        self
    }

    /// Queue a failing response for an agent type
    pub fn with_failure(self, agent_type: &str, message: impl Into<String>) -> Self {
        self.push_script(agent_type, Err(message.into()));
        self
    }

    /// Response used once the script for an agent type is exhausted
    pub fn with_default_response(self, agent_type: &str, response: impl Into<String>) -> Self {
        self.lock()
            .defaults
            .insert(agent_type.to_string(), response.into());
        self
    }

    /// Fail the next `count` status updates
    pub fn with_status_update_failures(self, count: usize) -> Self {
        self.lock().status_failures = count;
        self
    }

    /// Fail the next `count` stop requests
    pub fn with_stop_failures(self, count: usize) -> Self {
        self.lock().stop_failures = count;
        self
    }

    /// Hold executions until permits are added to the returned gate
    pub fn with_gate(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    /// All calls recorded so far
    pub fn calls(&self) -> Vec<SubstrateCall> {
        self.lock().calls.clone()
    }

    /// Prompts executed against workers of the given type
    pub fn prompts_for(&self, agent_type: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SubstrateCall::Execute {
                    agent_type: t,
                    prompt,
                    ..
                } if t == agent_type => Some(prompt.clone()),
                _ => None,
            })
            .collect()
    }

    /// Workers currently alive (spawned and not stopped)
    pub fn live_workers(&self) -> Vec<Worker> {
        self.lock()
            .workers
            .values()
            .filter(|w| w.status != AgentStatus::Stopped)
            .cloned()
            .collect()
    }

    /// Number of spawn calls that succeeded
    pub fn spawn_count(&self) -> usize {
        self.lock().spawn_counter
    }

    /// Executions currently waiting on the gate or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous executions observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn push_script(&self, agent_type: &str, entry: std::result::Result<String, String>) {
        self.lock()
            .scripted
            .entry(agent_type.to_string())
            .or_default()
            .push_back(entry);
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_response(&self, agent_type: &str) -> Result<String> {
        let mut state = self.lock();
        if let Some(entry) = state
            .scripted
            .get_mut(agent_type)
            .and_then(|queue| queue.pop_front())
        {
            return entry.map_err(ConclaveError::Execution);
        }
        state.defaults.get(agent_type).cloned().ok_or_else(|| {
            ConclaveError::Execution(format!("No mock response for agent type: {}", agent_type))
        })
    }
}

#[async_trait]
impl AgentSubstrate for MockAgentSubstrate {
    async fn spawn_agent(
        &self,
        agent_type: &str,
        options: SpawnOptions,
        _config: AgentConfig,
    ) -> Result<Worker> {
        if let Some(known) = &self.known_types {
            if !known.contains(agent_type) {
                return Err(ConclaveError::UnknownAgentType(agent_type.to_string()));
            }
        }

        let mut state = self.lock();
        let name = options
            .name
            .unwrap_or_else(|| format!("{}-{}", agent_type, state.spawn_counter + 1));
        if state.names.contains(&name) {
            return Err(ConclaveError::DuplicateAgentName(name));
        }

        let worker = Worker::new(agent_type, name.clone());
        debug!("Mock spawned {} ({})", worker, worker.id);

        state.spawn_counter += 1;
        state.names.insert(name.clone());
        state.workers.insert(worker.id.clone(), worker.clone());
        state.calls.push(SubstrateCall::Spawn {
            agent_type: agent_type.to_string(),
            name,
        });
        Ok(worker)
    }

    async fn execute_agent(
        &self,
        worker_id: &str,
        prompt: &str,
        _config: &AgentConfig,
    ) -> Result<AgentResponse> {
        let agent_type = {
            let mut state = self.lock();
            let agent_type = state
                .workers
                .get(worker_id)
                .map(|w| w.agent_type.clone())
                .ok_or_else(|| ConclaveError::AgentNotFound(worker_id.to_string()))?;
            state.calls.push(SubstrateCall::Execute {
                worker_id: worker_id.to_string(),
                agent_type: agent_type.clone(),
                prompt: prompt.to_string(),
            });
            agent_type
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            let acquired = gate.acquire().await;
            if let Ok(permit) = acquired {
                permit.forget();
            }
        }

        let result = self.next_response(&agent_type);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.map(AgentResponse::new)
    }

    async fn update_agent_status(&self, worker_id: &str, status: AgentStatus) -> Result<()> {
        let mut state = self.lock();
        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(ConclaveError::Execution("status update failed".to_string()));
        }
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| ConclaveError::AgentNotFound(worker_id.to_string()))?;
        worker.status = status;
        state.calls.push(SubstrateCall::UpdateStatus {
            worker_id: worker_id.to_string(),
            status,
        });
        Ok(())
    }

    async fn stop_agent(&self, worker_id: &str) -> Result<bool> {
        let mut state = self.lock();
        state.calls.push(SubstrateCall::Stop {
            worker_id: worker_id.to_string(),
        });
        if state.stop_failures > 0 {
            state.stop_failures -= 1;
            return Err(ConclaveError::Execution("stop failed".to_string()));
        }

        let name = match state.workers.get_mut(worker_id) {
            Some(worker) if worker.status != AgentStatus::Stopped => {
                worker.status = AgentStatus::Stopped;
                worker.name.clone()
            }
            _ => return Ok(false),
        };
        state.names.remove(&name);
        Ok(true)
    }
}
