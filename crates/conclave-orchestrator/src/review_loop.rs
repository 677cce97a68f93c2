//! Producer / adversarial review loop
//!
//! A loop owns two workers: a producer that writes code and an adversarial
//! reviewer that tries to break it. The producer generates once, then the
//! reviewer and producer alternate (review, fix, review, ...) until the
//! reviewer approves or `max_iterations` reviews have been rejected.
//!
//! Every run holds one permit of the runtime's shared semaphore for its whole
//! duration, which caps how many loops talk to the agent substrate at once.
//!
//! Aborting is cooperative: an agent call already in flight runs to
//! completion and its result is dropped.

use chrono::{DateTime, Utc};
use conclave_agent::{AgentConfig, AgentSubstrate, SpawnOptions, StateStore, REVIEW_LOOPS};
use conclave_core::config::ConclaveConfig;
use conclave_core::fail_open::fail_open;
use conclave_core::{ConclaveError, Result, Worker};
use conclave_validation::{parse_review_response, ReviewResult, Verdict};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::prompt::{build_fix_prompt, build_generation_prompt, build_review_prompt};
use crate::registry::LoopRegistry;
use crate::semaphore::Semaphore;
use crate::state_machine::{transition, LoopEvent, ReviewLoopStatus};

/// Loops allowed to run at once unless configured otherwise
pub const DEFAULT_MAX_CONCURRENT_LOOPS: usize = 5;

const EVENT_CAPACITY: usize = 256;

/// Review loop lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReviewLoopEvent {
    Transition {
        loop_id: String,
        from: ReviewLoopStatus,
        to: ReviewLoopStatus,
        iteration: usize,
    },
    /// A worker call failed and took the loop down with it
    Failed {
        loop_id: String,
        worker_id: String,
        error: String,
    },
}

/// Configuration for one review loop
#[derive(Debug, Clone)]
pub struct ReviewLoopConfig {
    /// Reviews before giving up
    pub max_iterations: usize,
    /// Agent type that writes and fixes code
    pub producer_type: String,
    /// Agent type that reviews
    pub adversarial_type: String,
    /// Session the workers belong to
    pub session_id: Option<String>,
    pub producer_config: AgentConfig,
    pub adversarial_config: AgentConfig,
}

impl Default for ReviewLoopConfig {
    fn default() -> Self {
        Self::from_config(&ConclaveConfig::default())
    }
}

impl ReviewLoopConfig {
    pub fn from_config(config: &ConclaveConfig) -> Self {
        Self {
            max_iterations: config.review_loop.max_iterations,
            producer_type: config.review_loop.producer_type.clone(),
            adversarial_type: config.review_loop.adversarial_type.clone(),
            session_id: None,
            producer_config: AgentConfig::default(),
            adversarial_config: AgentConfig::default(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_agent_types(
        mut self,
        producer_type: impl Into<String>,
        adversarial_type: impl Into<String>,
    ) -> Self {
        self.producer_type = producer_type.into();
        self.adversarial_type = adversarial_type.into();
        self
    }

    pub fn with_producer_config(mut self, config: AgentConfig) -> Self {
        self.producer_config = config;
        self
    }

    pub fn with_adversarial_config(mut self, config: AgentConfig) -> Self {
        self.adversarial_config = config;
        self
    }
}

/// Everything loops share: the substrate, the admission semaphore, the
/// registry and an optional store
#[derive(Clone)]
pub struct ReviewLoopRuntime {
    substrate: Arc<dyn AgentSubstrate>,
    semaphore: Arc<Semaphore>,
    registry: LoopRegistry,
    store: Option<Arc<dyn StateStore>>,
    events: broadcast::Sender<ReviewLoopEvent>,
}

impl ReviewLoopRuntime {
    pub fn new(substrate: Arc<dyn AgentSubstrate>, max_concurrent_loops: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            substrate,
            semaphore: Arc::new(Semaphore::new(max_concurrent_loops)),
            registry: LoopRegistry::new(),
            store: None,
            events,
        }
    }

    pub fn from_config(substrate: Arc<dyn AgentSubstrate>, config: &ConclaveConfig) -> Self {
        Self::new(substrate, config.review_loop.max_concurrent_loops)
    }

    /// Persist loop state to this store after every transition
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &LoopRegistry {
        &self.registry
    }

    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    /// Receive events from every loop of this runtime, from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ReviewLoopEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ReviewLoopEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create and register a loop
    pub async fn create_loop(
        &self,
        code_input: impl Into<String>,
        config: ReviewLoopConfig,
    ) -> Result<Arc<ReviewLoopCoordinator>> {
        ReviewLoopCoordinator::create(self, code_input, config).await
    }
}

/// Observable state of a review loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewLoopState {
    pub id: String,
    pub session_id: Option<String>,
    pub coder_id: String,
    pub adversarial_id: String,
    /// Reviews run so far
    pub iteration: usize,
    pub max_iterations: usize,
    pub status: ReviewLoopStatus,
    /// Original requirements
    pub code_input: String,
    pub current_code: Option<String>,
    pub reviews: Vec<ReviewResult>,
    pub final_verdict: Option<Verdict>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Error that failed the loop
    pub error: Option<String>,
}

pub struct ReviewLoopCoordinator {
    id: String,
    config: ReviewLoopConfig,
    runtime: ReviewLoopRuntime,
    coder: Worker,
    adversarial: Worker,
    state: Mutex<ReviewLoopState>,
}

impl std::fmt::Debug for ReviewLoopCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewLoopCoordinator")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("coder", &self.coder)
            .field("adversarial", &self.adversarial)
            .finish_non_exhaustive()
    }
}

impl ReviewLoopCoordinator {
    /// Spawn the producer and reviewer workers and register the loop
    pub async fn create(
        runtime: &ReviewLoopRuntime,
        code_input: impl Into<String>,
        config: ReviewLoopConfig,
    ) -> Result<Arc<Self>> {
        let code_input = code_input.into();
        if code_input.trim().is_empty() {
            return Err(ConclaveError::Validation(
                "review loop input must not be empty".to_string(),
            ));
        }
        if config.max_iterations == 0 {
            return Err(ConclaveError::Validation(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        let substrate = &runtime.substrate;
        let options = SpawnOptions::default().with_session(config.session_id.clone());
        let coder = substrate
            .spawn_agent(
                &config.producer_type,
                options.clone(),
                config.producer_config.clone(),
            )
            .await?;
        let adversarial = match substrate
            .spawn_agent(
                &config.adversarial_type,
                options,
                config.adversarial_config.clone(),
            )
            .await
        {
            Ok(worker) => worker,
            Err(e) => {
                fail_open("review_loop::stop_worker", || substrate.stop_agent(&coder.id)).await;
                return Err(e);
            }
        };

        let id = format!("loop-{}", Uuid::new_v4());
        let state = ReviewLoopState {
            id: id.clone(),
            session_id: config.session_id.clone(),
            coder_id: coder.id.clone(),
            adversarial_id: adversarial.id.clone(),
            iteration: 0,
            max_iterations: config.max_iterations,
            status: ReviewLoopStatus::Pending,
            code_input,
            current_code: None,
            reviews: Vec::new(),
            final_verdict: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };

        let review_loop = Arc::new(Self {
            id,
            config,
            runtime: runtime.clone(),
            coder,
            adversarial,
            state: Mutex::new(state.clone()),
        });
        runtime.registry.insert(Arc::clone(&review_loop));
        review_loop.persist(&state).await;

        info!(
            "Created review loop {} ({} vs {})",
            review_loop.id, review_loop.coder, review_loop.adversarial
        );
        Ok(review_loop)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ReviewLoopState {
        self.lock().clone()
    }

    pub fn status(&self) -> ReviewLoopStatus {
        self.lock().status
    }

    /// Run the loop to completion
    ///
    /// Waits for a slot on the shared semaphore first. A worker error fails
    /// the loop and is returned exactly as the substrate produced it.
    pub async fn start(&self) -> Result<ReviewLoopState> {
        let status = self.status();
        if status != ReviewLoopStatus::Pending {
            return Err(ConclaveError::StateConflict(format!(
                "review loop {} is already {}",
                self.id, status
            )));
        }

        self.runtime.semaphore.execute(|| self.run()).await
    }

    /// Stop the loop now, release its workers and leave the registry
    pub async fn abort(&self) -> Result<ReviewLoopState> {
        self.advance(LoopEvent::Abort, |s| s.completed_at = Some(Utc::now()))
            .await?;
        info!("Review loop {} aborted", self.id);
        self.release_resources().await;
        Ok(self.state())
    }

    /// Release workers and leave the registry without changing the status
    pub async fn cleanup(&self) {
        debug!("Cleaning up review loop {}", self.id);
        self.release_resources().await;
    }

    async fn run(&self) -> Result<ReviewLoopState> {
        if !self
            .advance(LoopEvent::Start, |s| s.started_at = Some(Utc::now()))
            .await?
        {
            return Ok(self.state());
        }

        let (requirements, max_iterations) = {
            let state = self.lock();
            (state.code_input.clone(), state.max_iterations)
        };
        info!(
            "Review loop {} started (max {} iterations)",
            self.id, max_iterations
        );

        let prompt = build_generation_prompt(&requirements);
        let Some(mut code) = self
            .call(&self.coder, &prompt, &self.config.producer_config)
            .await?
        else {
            return Ok(self.state());
        };
        let generated = code.clone();
        if !self
            .advance(LoopEvent::CodeGenerated, move |s| {
                s.current_code = Some(generated)
            })
            .await?
        {
            return Ok(self.state());
        }

        let mut iteration = 0;
        while iteration < max_iterations {
            iteration += 1;
            self.set_iteration(iteration);

            let prompt = build_review_prompt(&requirements, &code, iteration, max_iterations);
            let Some(text) = self
                .call(&self.adversarial, &prompt, &self.config.adversarial_config)
                .await?
            else {
                return Ok(self.state());
            };

            let review = parse_review_response(&text);
            info!(
                "Review loop {} iteration {}: {} ({} issues)",
                self.id,
                iteration,
                review.verdict,
                review.issues.len()
            );

            if review.is_approved() {
                self.advance(LoopEvent::Approved, move |s| {
                    s.reviews.push(review);
                    s.final_verdict = Some(Verdict::Approve);
                    s.completed_at = Some(Utc::now());
                })
                .await?;
                return Ok(self.state());
            }

            let can_fix = iteration < max_iterations;
            let issues = review.issues.clone();
            let applied = self
                .advance(LoopEvent::Rejected { can_fix }, move |s| {
                    s.reviews.push(review);
                    if !can_fix {
                        s.final_verdict = Some(Verdict::Reject);
                        s.completed_at = Some(Utc::now());
                    }
                })
                .await?;
            if !applied || !can_fix {
                break;
            }

            let prompt = build_fix_prompt(&requirements, &code, &issues, iteration);
            let Some(fixed) = self
                .call(&self.coder, &prompt, &self.config.producer_config)
                .await?
            else {
                return Ok(self.state());
            };
            code = fixed;

            let applied = code.clone();
            if !self
                .advance(LoopEvent::FixApplied, move |s| {
                    s.current_code = Some(applied)
                })
                .await?
            {
                return Ok(self.state());
            }
        }

        let state = self.state();
        if state.status == ReviewLoopStatus::MaxIterationsReached {
            warn!(
                "Review loop {} exhausted {} iterations without approval",
                self.id, max_iterations
            );
        }
        Ok(state)
    }

    /// Run a prompt through a worker
    ///
    /// Returns `None` when the loop was aborted while the call was in flight.
    async fn call(
        &self,
        worker: &Worker,
        prompt: &str,
        config: &AgentConfig,
    ) -> Result<Option<String>> {
        let result = self
            .runtime
            .substrate
            .execute_agent(&worker.id, prompt, config)
            .await;

        if self.status() == ReviewLoopStatus::Aborted {
            debug!(
                "Review loop {} aborted; discarding result from {}",
                self.id, worker
            );
            return Ok(None);
        }

        match result {
            Ok(response) => Ok(Some(response.response)),
            Err(e) => {
                warn!("Review loop {} failed on {}: {}", self.id, worker, e);
                let message = e.to_string();
                let error = message.clone();
                match self
                    .advance(LoopEvent::Error, move |s| {
                        s.error = Some(error);
                        s.completed_at = Some(Utc::now());
                    })
                    .await
                {
                    Ok(true) => self.runtime.emit(ReviewLoopEvent::Failed {
                        loop_id: self.id.clone(),
                        worker_id: worker.id.clone(),
                        error: message,
                    }),
                    Ok(false) => {}
                    Err(conflict) => debug!("Could not mark loop failed: {}", conflict),
                }
                Err(e)
            }
        }
    }

    /// Apply a transition, persist the result and announce it to subscribers
    ///
    /// Returns `Ok(false)` without touching anything when the loop has been
    /// aborted, and a state conflict for any other illegal move.
    async fn advance(
        &self,
        event: LoopEvent,
        update: impl FnOnce(&mut ReviewLoopState),
    ) -> Result<bool> {
        let (from, snapshot) = {
            let mut state = self.lock();
            if state.status == ReviewLoopStatus::Aborted && event != LoopEvent::Abort {
                return Ok(false);
            }
            let Some(next) = transition(state.status, event) else {
                return Err(ConclaveError::StateConflict(format!(
                    "review loop {} cannot handle {:?} while {}",
                    self.id, event, state.status
                )));
            };

            debug!("Review loop {}: {} -> {}", self.id, state.status, next);
            let from = state.status;
            state.status = next;
            update(&mut *state);
            (from, state.clone())
        };

        self.persist(&snapshot).await;
        self.runtime.emit(ReviewLoopEvent::Transition {
            loop_id: self.id.clone(),
            from,
            to: snapshot.status,
            iteration: snapshot.iteration,
        });
        Ok(true)
    }

    fn set_iteration(&self, iteration: usize) {
        self.lock().iteration = iteration;
    }

    async fn release_resources(&self) {
        let substrate = &self.runtime.substrate;
        for worker in [&self.coder, &self.adversarial] {
            fail_open("review_loop::stop_worker", || substrate.stop_agent(&worker.id)).await;
        }
        self.runtime.registry.remove(&self.id);
    }

    async fn persist(&self, state: &ReviewLoopState) {
        let Some(store) = &self.runtime.store else {
            return;
        };
        fail_open("review_loop::persist", || async {
            let value = serde_json::to_value(state)?;
            store.save(REVIEW_LOOPS, &state.id, &value).await
        })
        .await;
    }

    fn lock(&self) -> MutexGuard<'_, ReviewLoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_agent::{MemoryStore, MockAgentSubstrate};

    const CODE: &str = "fn limit() {}";
    const REJECT: &str = "[SEVERITY: HIGH] - Unchecked input\nLocation: limit()\nRequired Fix: validate input\n\n**VERDICT: REJECT**";
    const APPROVE: &str = "Nothing left to break.\n\n**VERDICT: APPROVE**";

    fn runtime(substrate: &MockAgentSubstrate, max_concurrent: usize) -> ReviewLoopRuntime {
        ReviewLoopRuntime::new(Arc::new(substrate.clone()), max_concurrent)
    }

    #[tokio::test]
    async fn test_approval_after_one_fix() {
        let substrate = MockAgentSubstrate::new()
            .with_response("coder", CODE)
            .with_response("coder", "fn limit(n: u32) {}")
            .with_response("adversarial", REJECT)
            .with_response("adversarial", APPROVE);
        let runtime = runtime(&substrate, 5);

        let review_loop = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap();
        assert_eq!(runtime.registry().len(), 1);

        let state = review_loop.start().await.unwrap();
        assert_eq!(state.status, ReviewLoopStatus::Approved);
        assert_eq!(state.iteration, 2);
        assert_eq!(state.final_verdict, Some(Verdict::Approve));
        assert_eq!(state.reviews.len(), 2);
        assert_eq!(state.current_code.as_deref(), Some("fn limit(n: u32) {}"));
        assert!(state.completed_at.is_some());

        let coder_prompts = substrate.prompts_for("coder");
        assert_eq!(coder_prompts.len(), 2);
        assert!(coder_prompts[1].contains("Unchecked input"));
        assert!(coder_prompts[1].contains("validate input"));

        let review_prompts = substrate.prompts_for("adversarial");
        assert!(review_prompts[1].contains("fn limit(n: u32) {}"));

        review_loop.cleanup().await;
        assert!(runtime.registry().is_empty());
        assert!(substrate.live_workers().is_empty());
        assert_eq!(review_loop.status(), ReviewLoopStatus::Approved);
    }

    #[tokio::test]
    async fn test_always_rejected_reaches_max_iterations() {
        let substrate = MockAgentSubstrate::new()
            .with_default_response("coder", CODE)
            .with_default_response("adversarial", "Still unsafe.\n\n**VERDICT: REJECT**");
        let runtime = runtime(&substrate, 5);

        let review_loop = runtime
            .create_loop(
                "Write a rate limiter",
                ReviewLoopConfig::default().with_max_iterations(2),
            )
            .await
            .unwrap();
        let state = review_loop.start().await.unwrap();

        assert_eq!(state.status, ReviewLoopStatus::MaxIterationsReached);
        assert_eq!(state.iteration, 2);
        assert_eq!(state.final_verdict, Some(Verdict::Reject));
        // Generate, fix after review 1, no fix after the last review
        assert_eq!(substrate.prompts_for("coder").len(), 2);
        assert_eq!(state.reviews[0].issues.len(), 1);
    }

    #[tokio::test]
    async fn test_worker_error_fails_loop_and_propagates() {
        let substrate = MockAgentSubstrate::new().with_failure("coder", "provider timeout");
        let runtime = runtime(&substrate, 2);

        let review_loop = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap();
        let err = review_loop.start().await.unwrap_err();

        assert!(matches!(err, ConclaveError::Execution(ref m) if m == "provider timeout"));
        let state = review_loop.state();
        assert_eq!(state.status, ReviewLoopStatus::Failed);
        assert!(state.error.unwrap().contains("provider timeout"));
        assert_eq!(runtime.semaphore().state().available, 2);
    }

    #[tokio::test]
    async fn test_worker_error_is_broadcast() {
        let substrate = MockAgentSubstrate::new().with_failure("coder", "provider timeout");
        let runtime = runtime(&substrate, 1);
        let mut events = runtime.subscribe();

        let review_loop = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap();
        review_loop.start().await.unwrap_err();

        let loop_id = review_loop.id().to_string();
        assert_eq!(
            events.recv().await.unwrap(),
            ReviewLoopEvent::Transition {
                loop_id: loop_id.clone(),
                from: ReviewLoopStatus::Pending,
                to: ReviewLoopStatus::Coding,
                iteration: 0,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ReviewLoopEvent::Transition {
                loop_id: loop_id.clone(),
                from: ReviewLoopStatus::Coding,
                to: ReviewLoopStatus::Failed,
                iteration: 0,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ReviewLoopEvent::Failed {
                loop_id,
                worker_id: review_loop.state().coder_id,
                error: "Agent execution failed: provider timeout".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast_in_order() {
        let substrate = MockAgentSubstrate::new()
            .with_default_response("coder", CODE)
            .with_response("adversarial", REJECT)
            .with_response("adversarial", APPROVE);
        let runtime = runtime(&substrate, 1);
        let mut events = runtime.subscribe();

        let review_loop = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap();
        review_loop.start().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ReviewLoopEvent::Transition { to, iteration, .. } = event {
                seen.push((to, iteration));
            }
        }
        assert_eq!(
            seen,
            vec![
                (ReviewLoopStatus::Coding, 0),
                (ReviewLoopStatus::Reviewing, 0),
                (ReviewLoopStatus::Fixing, 1),
                (ReviewLoopStatus::Reviewing, 1),
                (ReviewLoopStatus::Approved, 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_twice_conflicts() {
        let substrate = MockAgentSubstrate::new()
            .with_default_response("coder", CODE)
            .with_default_response("adversarial", APPROVE);
        let runtime = runtime(&substrate, 1);

        let review_loop = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap();
        review_loop.start().await.unwrap();

        let err = review_loop.start().await.unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[tokio::test]
    async fn test_create_validation() {
        let substrate = MockAgentSubstrate::new();
        let runtime = runtime(&substrate, 1);

        let err = runtime
            .create_loop("   ", ReviewLoopConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Validation(_)));

        let err = runtime
            .create_loop("x", ReviewLoopConfig::default().with_max_iterations(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::Validation(_)));
        assert_eq!(substrate.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_reviewer_spawn_failure_stops_producer() {
        let substrate = MockAgentSubstrate::new().with_known_types(&["coder"]);
        let runtime = runtime(&substrate, 1);

        let err = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConclaveError::UnknownAgentType(_)));
        assert!(substrate.live_workers().is_empty());
        assert!(runtime.registry().is_empty());
    }

    #[tokio::test]
    async fn test_abort_discards_in_flight_result() {
        let (substrate, gate) = MockAgentSubstrate::new()
            .with_default_response("coder", CODE)
            .with_default_response("adversarial", APPROVE)
            .with_gate();
        let runtime = runtime(&substrate, 1);

        let review_loop = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap();
        let running = Arc::clone(&review_loop);
        let handle = tokio::spawn(async move { running.start().await });

        while substrate.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let aborted = runtime.registry().abort(review_loop.id()).await.unwrap();
        assert_eq!(aborted.status, ReviewLoopStatus::Aborted);
        assert!(runtime.registry().is_empty());
        assert!(substrate.live_workers().is_empty());

        gate.add_permits(1);
        let state = handle.await.unwrap().unwrap();
        assert_eq!(state.status, ReviewLoopStatus::Aborted);
        assert!(state.current_code.is_none());
        assert_eq!(runtime.semaphore().state().available, 1);

        let err = review_loop.abort().await.unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[tokio::test]
    async fn test_abort_unknown_loop_is_not_found() {
        let runtime = runtime(&MockAgentSubstrate::new(), 1);
        let err = runtime.registry().abort("loop-missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_semaphore_bounds_running_loops() {
        let (substrate, gate) = MockAgentSubstrate::new()
            .with_default_response("coder", CODE)
            .with_default_response("adversarial", APPROVE)
            .with_gate();
        let runtime = runtime(&substrate, 2);

        let mut handles = Vec::new();
        for n in 0..3 {
            let review_loop = runtime
                .create_loop(format!("Task {}", n), ReviewLoopConfig::default())
                .await
                .unwrap();
            handles.push(tokio::spawn(async move { review_loop.start().await }));
        }

        while !(substrate.in_flight() == 2 && runtime.semaphore().state().queued == 1) {
            tokio::task::yield_now().await;
        }
        assert_eq!(runtime.registry().len(), 3);

        // Generation plus one approving review per loop
        gate.add_permits(6);
        for handle in handles {
            let state = handle.await.unwrap().unwrap();
            assert_eq!(state.status, ReviewLoopStatus::Approved);
        }

        assert_eq!(substrate.max_in_flight(), 2);
        assert_eq!(runtime.semaphore().state().available, 2);
    }

    #[tokio::test]
    async fn test_state_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let substrate = MockAgentSubstrate::new()
            .with_default_response("coder", CODE)
            .with_default_response("adversarial", APPROVE);
        let runtime = runtime(&substrate, 1).with_store(store.clone());

        let review_loop = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap();
        review_loop.start().await.unwrap();

        let saved = store
            .load(REVIEW_LOOPS, review_loop.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved["status"], "approved");
        assert_eq!(saved["final_verdict"], "APPROVE");
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_fatal() {
        let substrate = MockAgentSubstrate::new()
            .with_default_response("coder", CODE)
            .with_default_response("adversarial", APPROVE);
        let runtime = runtime(&substrate, 1).with_store(Arc::new(MemoryStore::failing()));

        let review_loop = runtime
            .create_loop("Write a rate limiter", ReviewLoopConfig::default())
            .await
            .unwrap();
        let state = review_loop.start().await.unwrap();
        assert_eq!(state.status, ReviewLoopStatus::Approved);
    }
}
