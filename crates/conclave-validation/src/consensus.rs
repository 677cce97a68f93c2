//! Consensus checkpoint service
//!
//! Proposed subtasks above a risk threshold are held behind a checkpoint
//! until a reviewer approves or rejects them, or until the checkpoint expires.
//!
//! ## Lifecycle
//!
//! ```text
//! pending ──approve──► approved
//!    │ ────reject───► rejected
//!    └─────expire───► expired
//! ```
//!
//! Terminal checkpoints are immutable. Every transition appends to the
//! checkpoint's audit log and is persisted best-effort.

use chrono::{DateTime, Utc};
use conclave_agent::{AgentConfig, StateStore, CHECKPOINTS};
use conclave_core::config::ConsensusSettings;
use conclave_core::fail_open::fail_open;
use conclave_core::{ConclaveError, Result, ReviewerStrategy, RiskLevel};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{
    AuditEvent, AuditEventKind, CheckpointRecord, CheckpointStatus, ConsensusCheck,
    ConsensusCheckpoint, ConsensusDecision, CreateCheckpointRequest, ProposedSubtask,
    ReviewerConfig, ReviewerType,
};
use crate::review::{review_format_instructions, ReviewResult, Verdict};

/// Upper bound on checkpoint lifetime (ten years)
const MAX_TIMEOUT_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Actor recorded for automatic transitions
const SYSTEM_ACTOR: &str = "system";

/// Shortest period the expiry sweeper runs at
pub const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Consensus policy
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// When false nothing requires consensus
    pub enabled: bool,
    /// Risk levels that must pass a checkpoint
    pub require_for_risk_levels: Vec<RiskLevel>,
    /// Seconds before a pending checkpoint may be expired
    pub timeout_secs: u64,
    /// Who reviews checkpoints
    pub reviewer_strategy: ReviewerStrategy,
    /// Model used by the `different-model` strategy
    pub reviewer_model: Option<String>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self::from(&ConsensusSettings::default())
    }
}

impl From<&ConsensusSettings> for ConsensusConfig {
    fn from(settings: &ConsensusSettings) -> Self {
        Self {
            enabled: settings.enabled,
            require_for_risk_levels: settings.require_for_risk_levels.clone(),
            timeout_secs: settings.timeout_secs,
            reviewer_strategy: settings.reviewer_strategy,
            reviewer_model: None,
        }
    }
}

impl ConsensusConfig {
    pub fn with_risk_levels(mut self, levels: Vec<RiskLevel>) -> Self {
        self.require_for_risk_levels = levels;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_reviewer_strategy(mut self, strategy: ReviewerStrategy) -> Self {
        self.reviewer_strategy = strategy;
        self
    }

    pub fn with_reviewer_model(mut self, model: impl Into<String>) -> Self {
        self.reviewer_model = Some(model.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether a subtask at this risk level must pass a checkpoint
    pub fn requires_consensus(&self, risk_level: RiskLevel) -> bool {
        self.enabled && self.require_for_risk_levels.contains(&risk_level)
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_secs.min(MAX_TIMEOUT_SECS) as i64)
    }
}

#[derive(Default)]
struct ServiceState {
    checkpoints: HashMap<String, ConsensusCheckpoint>,
    audit: HashMap<String, Vec<AuditEvent>>,
}

impl ServiceState {
    fn record(&self, id: &str) -> Option<CheckpointRecord> {
        self.checkpoints.get(id).map(|checkpoint| CheckpointRecord {
            checkpoint: checkpoint.clone(),
            audit: self.audit.get(id).cloned().unwrap_or_default(),
        })
    }

    fn append(
        &mut self,
        id: &str,
        kind: AuditEventKind,
        actor: &str,
        details: Option<serde_json::Value>,
    ) {
        self.audit.entry(id.to_string()).or_default().push(AuditEvent {
            checkpoint_id: id.to_string(),
            kind,
            actor: actor.to_string(),
            timestamp: Utc::now(),
            details,
        });
    }

    /// Fetch a checkpoint that must still be pending
    fn pending_mut(&mut self, id: &str) -> Result<&mut ConsensusCheckpoint> {
        let checkpoint = self
            .checkpoints
            .get_mut(id)
            .ok_or_else(|| ConclaveError::NotFound(format!("checkpoint {}", id)))?;
        if checkpoint.status.is_terminal() {
            return Err(ConclaveError::StateConflict(format!(
                "checkpoint {} is already {}",
                id, checkpoint.status
            )));
        }
        Ok(checkpoint)
    }
}

/// Risk-based approval gate for proposed subtasks
pub struct ConsensusCheckpointService {
    config: ConsensusConfig,
    state: Mutex<ServiceState>,
    store: Option<Arc<dyn StateStore>>,
}

impl ConsensusCheckpointService {
    pub fn new(config: ConsensusConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServiceState::default()),
            store: None,
        }
    }

    /// Persist checkpoints to the given store
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Rebuild the service from checkpoints persisted in `store`
    pub async fn restore(store: Arc<dyn StateStore>, config: ConsensusConfig) -> Result<Self> {
        let mut state = ServiceState::default();
        for (id, value) in store.load_all(CHECKPOINTS).await? {
            let record: CheckpointRecord = serde_json::from_value(value)?;
            if record.checkpoint.id != id {
                warn!(
                    "Checkpoint record {} carries id {}; using record key",
                    id, record.checkpoint.id
                );
            }
            state.audit.insert(id.clone(), record.audit);
            let mut checkpoint = record.checkpoint;
            checkpoint.id = id.clone();
            state.checkpoints.insert(id, checkpoint);
        }
        debug!("Restored {} checkpoints", state.checkpoints.len());

        Ok(Self {
            config,
            state: Mutex::new(state),
            store: Some(store),
        })
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Whether a subtask at this risk level must pass a checkpoint
    pub fn requires_consensus(&self, risk_level: RiskLevel) -> bool {
        self.config.requires_consensus(risk_level)
    }

    /// Evaluate a batch of proposed subtasks against the policy
    pub fn check(&self, subtasks: &[ProposedSubtask]) -> ConsensusCheck {
        let requires_consensus = subtasks
            .iter()
            .any(|s| self.requires_consensus(s.estimated_risk_level));
        let risk_level = subtasks
            .iter()
            .map(|s| s.estimated_risk_level)
            .max()
            .unwrap_or(RiskLevel::Low);

        ConsensusCheck {
            requires_consensus,
            risk_level,
        }
    }

    /// Open a pending checkpoint over the proposed subtasks
    pub async fn create_checkpoint(
        &self,
        request: CreateCheckpointRequest,
    ) -> Result<ConsensusCheckpoint> {
        validate_request(&request)?;

        let now = Utc::now();
        let checkpoint = ConsensusCheckpoint {
            id: format!("checkpoint-{}", Uuid::new_v4()),
            task_id: request.task_id,
            parent_task_id: request.parent_task_id,
            proposed_subtasks: request.proposed_subtasks,
            risk_level: request.risk_level,
            status: CheckpointStatus::Pending,
            reviewer_strategy: self.config.reviewer_strategy,
            reviewer_id: None,
            reviewer_type: None,
            decision: None,
            created_at: now,
            expires_at: now + self.config.timeout(),
            decided_at: None,
        };

        let record = {
            let mut state = self.lock();
            state
                .checkpoints
                .insert(checkpoint.id.clone(), checkpoint.clone());
            state.append(
                &checkpoint.id,
                AuditEventKind::Created,
                SYSTEM_ACTOR,
                Some(serde_json::json!({
                    "task_id": checkpoint.task_id,
                    "risk_level": checkpoint.risk_level,
                    "subtasks": checkpoint.proposed_subtasks.len(),
                })),
            );
            state.record(&checkpoint.id)
        };

        info!(
            "Created checkpoint {} for task {} ({} risk, expires {})",
            checkpoint.id, checkpoint.task_id, checkpoint.risk_level, checkpoint.expires_at
        );
        self.persist(record).await;
        Ok(checkpoint)
    }

    /// Approve a pending checkpoint on behalf of the configured reviewer kind
    pub async fn approve_checkpoint(
        &self,
        id: &str,
        reviewed_by: &str,
        feedback: Option<String>,
    ) -> Result<ConsensusCheckpoint> {
        let reviewer_type = self.config.reviewer_strategy.into();
        self.approve_checkpoint_as(id, reviewed_by, reviewer_type, feedback)
            .await
    }

    /// Approve a pending checkpoint, recording which kind of reviewer decided
    pub async fn approve_checkpoint_as(
        &self,
        id: &str,
        reviewed_by: &str,
        reviewer_type: ReviewerType,
        feedback: Option<String>,
    ) -> Result<ConsensusCheckpoint> {
        self.decide(id, reviewed_by, reviewer_type, true, feedback, None)
            .await
    }

    /// Reject a pending checkpoint, optionally naming the refused subtasks
    pub async fn reject_checkpoint(
        &self,
        id: &str,
        reviewed_by: &str,
        feedback: Option<String>,
        rejected_subtask_ids: Option<Vec<String>>,
    ) -> Result<ConsensusCheckpoint> {
        let reviewer_type = self.config.reviewer_strategy.into();
        self.reject_checkpoint_as(id, reviewed_by, reviewer_type, feedback, rejected_subtask_ids)
            .await
    }

    /// Reject a pending checkpoint with an explicit reviewer kind
    pub async fn reject_checkpoint_as(
        &self,
        id: &str,
        reviewed_by: &str,
        reviewer_type: ReviewerType,
        feedback: Option<String>,
        rejected_subtask_ids: Option<Vec<String>>,
    ) -> Result<ConsensusCheckpoint> {
        self.decide(
            id,
            reviewed_by,
            reviewer_type,
            false,
            feedback,
            rejected_subtask_ids,
        )
        .await
    }

    /// Decide a checkpoint from a parsed agent review
    ///
    /// REJECT refuses every proposed subtask.
    pub async fn apply_review(
        &self,
        id: &str,
        reviewer_id: &str,
        review: &ReviewResult,
    ) -> Result<ConsensusCheckpoint> {
        let feedback = Some(review_feedback(review));
        match review.verdict {
            Verdict::Approve => {
                self.decide(id, reviewer_id, ReviewerType::Agent, true, feedback, None)
                    .await
            }
            Verdict::Reject => {
                let rejected = self.get(id).map(|cp| {
                    cp.proposed_subtasks
                        .iter()
                        .map(|s| s.id.clone())
                        .collect::<Vec<_>>()
                });
                self.decide(
                    id,
                    reviewer_id,
                    ReviewerType::Agent,
                    false,
                    feedback,
                    rejected,
                )
                .await
            }
        }
    }

    /// Describe who should review a pending checkpoint
    ///
    /// Does not run the reviewer; the caller executes it and reports back
    /// through approve/reject or [`Self::apply_review`].
    pub async fn start_review(&self, id: &str) -> Result<ReviewerConfig> {
        let (reviewer, record) = {
            let mut state = self.lock();
            let checkpoint = state.pending_mut(id)?.clone();
            let reviewer = self.reviewer_for(&checkpoint);
            state.append(
                id,
                AuditEventKind::ReviewStarted,
                SYSTEM_ACTOR,
                Some(serde_json::json!({
                    "strategy": reviewer.strategy,
                    "agent_type": reviewer.agent_type,
                })),
            );
            (reviewer, state.record(id))
        };

        debug!(
            "Review started for checkpoint {} ({})",
            id, reviewer.strategy
        );
        self.persist(record).await;
        Ok(reviewer)
    }

    /// Expire every pending checkpoint past its expiry time
    pub async fn expire_stale_pending(&self) -> usize {
        self.expire_stale_pending_at(Utc::now()).await
    }

    /// Expire every pending checkpoint whose expiry is before `now`
    pub async fn expire_stale_pending_at(&self, now: DateTime<Utc>) -> usize {
        let records: Vec<_> = {
            let mut state = self.lock();
            let stale: Vec<String> = state
                .checkpoints
                .values()
                .filter(|cp| cp.is_stale(now))
                .map(|cp| cp.id.clone())
                .collect();

            for id in &stale {
                if let Some(checkpoint) = state.checkpoints.get_mut(id) {
                    checkpoint.status = CheckpointStatus::Expired;
                    checkpoint.decided_at = Some(now);
                }
                state.append(id, AuditEventKind::Expired, SYSTEM_ACTOR, None);
            }

            stale.iter().filter_map(|id| state.record(id)).collect()
        };

        let count = records.len();
        if count > 0 {
            info!("Expired {} stale checkpoints", count);
        }
        for record in records {
            self.persist(Some(record)).await;
        }
        count
    }

    pub fn get(&self, id: &str) -> Option<ConsensusCheckpoint> {
        self.lock().checkpoints.get(id).cloned()
    }

    /// Pending checkpoints, oldest first
    pub fn list_pending(&self) -> Vec<ConsensusCheckpoint> {
        self.list_where(|cp| cp.is_pending())
    }

    /// All checkpoints, oldest first
    pub fn list(&self) -> Vec<ConsensusCheckpoint> {
        self.list_where(|_| true)
    }

    /// Checkpoints opened for a task, oldest first
    pub fn list_for_task(&self, task_id: &str) -> Vec<ConsensusCheckpoint> {
        self.list_where(|cp| cp.task_id == task_id)
    }

    /// Full audit log of a checkpoint in append order
    pub fn audit_log(&self, id: &str) -> Result<Vec<AuditEvent>> {
        let state = self.lock();
        if !state.checkpoints.contains_key(id) {
            return Err(ConclaveError::NotFound(format!("checkpoint {}", id)));
        }
        Ok(state.audit.get(id).cloned().unwrap_or_default())
    }

    async fn decide(
        &self,
        id: &str,
        reviewed_by: &str,
        reviewer_type: ReviewerType,
        approved: bool,
        feedback: Option<String>,
        rejected_subtask_ids: Option<Vec<String>>,
    ) -> Result<ConsensusCheckpoint> {
        if reviewed_by.trim().is_empty() {
            return Err(ConclaveError::Validation(
                "reviewer id must not be empty".to_string(),
            ));
        }

        let (checkpoint, record) = {
            let mut state = self.lock();
            let checkpoint = state.pending_mut(id)?;

            checkpoint.status = if approved {
                CheckpointStatus::Approved
            } else {
                CheckpointStatus::Rejected
            };
            checkpoint.reviewer_id = Some(reviewed_by.to_string());
            checkpoint.reviewer_type = Some(reviewer_type);
            checkpoint.decided_at = Some(Utc::now());
            checkpoint.decision = Some(ConsensusDecision {
                approved,
                rejected_subtask_ids,
                feedback,
                reviewed_by: reviewed_by.to_string(),
                reviewer_type,
            });
            let checkpoint = checkpoint.clone();

            let kind = if approved {
                AuditEventKind::Approved
            } else {
                AuditEventKind::Rejected
            };
            state.append(
                id,
                kind,
                reviewed_by,
                checkpoint
                    .decision
                    .as_ref()
                    .and_then(|d| serde_json::to_value(d).ok()),
            );
            (checkpoint, state.record(id))
        };

        info!("Checkpoint {} {} by {}", id, checkpoint.status, reviewed_by);
        self.persist(record).await;
        Ok(checkpoint)
    }

    fn reviewer_for(&self, checkpoint: &ConsensusCheckpoint) -> ReviewerConfig {
        let (agent_type, agent_config) = match checkpoint.reviewer_strategy {
            ReviewerStrategy::Adversarial => {
                (Some("adversarial".to_string()), AgentConfig::default())
            }
            ReviewerStrategy::DifferentModel => {
                let config = match &self.config.reviewer_model {
                    Some(model) => AgentConfig::default().with_model(model.clone()),
                    None => AgentConfig::default(),
                };
                (Some("reviewer".to_string()), config)
            }
            ReviewerStrategy::Human => (None, AgentConfig::default()),
        };

        ReviewerConfig {
            checkpoint_id: checkpoint.id.clone(),
            strategy: checkpoint.reviewer_strategy,
            agent_type,
            agent_config,
            prompt: checkpoint_review_prompt(checkpoint),
        }
    }

    fn list_where(&self, keep: impl Fn(&ConsensusCheckpoint) -> bool) -> Vec<ConsensusCheckpoint> {
        let mut checkpoints: Vec<_> = self
            .lock()
            .checkpoints
            .values()
            .filter(|cp| keep(cp))
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        checkpoints
    }

    async fn persist(&self, record: Option<CheckpointRecord>) {
        let (Some(store), Some(record)) = (&self.store, record) else {
            return;
        };
        let id = record.checkpoint.id.clone();
        fail_open("consensus::persist", || async {
            let value = serde_json::to_value(&record)?;
            store.save(CHECKPOINTS, &id, &value).await
        })
        .await;
    }

    fn lock(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run `expire_stale_pending` every `period` until the handle is aborted
///
/// Periods below [`MIN_SWEEP_PERIOD`] are raised to it.
pub fn spawn_expiry_sweeper(
    service: Arc<ConsensusCheckpointService>,
    period: Duration,
) -> JoinHandle<()> {
    let period = if period < MIN_SWEEP_PERIOD {
        warn!(
            "Expiry sweep period {:?} is too short, using {:?}",
            period, MIN_SWEEP_PERIOD
        );
        MIN_SWEEP_PERIOD
    } else {
        period
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let expired = service.expire_stale_pending().await;
            if expired > 0 {
                debug!("Expiry sweep transitioned {} checkpoints", expired);
            }
        }
    })
}

fn validate_request(request: &CreateCheckpointRequest) -> Result<()> {
    if request.task_id.trim().is_empty() {
        return Err(ConclaveError::Validation(
            "task_id must not be empty".to_string(),
        ));
    }
    if request.proposed_subtasks.is_empty() {
        return Err(ConclaveError::Validation(
            "a checkpoint needs at least one proposed subtask".to_string(),
        ));
    }
    for subtask in &request.proposed_subtasks {
        if subtask.id.trim().is_empty() || subtask.agent_type.trim().is_empty() {
            return Err(ConclaveError::Validation(format!(
                "proposed subtask {:?} needs an id and an agent type",
                subtask.id
            )));
        }
    }
    Ok(())
}

fn review_feedback(review: &ReviewResult) -> String {
    if review.issues.is_empty() {
        return format!("Verdict: {}", review.verdict);
    }
    let issues: Vec<String> = review
        .issues
        .iter()
        .map(|i| format!("[{}] {}: {}", i.severity, i.title, i.required_fix))
        .collect();
    format!("Verdict: {}\n{}", review.verdict, issues.join("\n"))
}

fn checkpoint_review_prompt(checkpoint: &ConsensusCheckpoint) -> String {
    let subtasks: Vec<String> = checkpoint
        .proposed_subtasks
        .iter()
        .map(|s| {
            format!(
                "- {} ({} agent, {} risk)\n  Input: {}",
                s.id, s.agent_type, s.estimated_risk_level, s.input
            )
        })
        .collect();

    format!(
        r#"You are reviewing a request to spawn subtasks before any of them run.

## CHECKPOINT
ID: {id}
Task: {task}
Overall risk: {risk}

## PROPOSED SUBTASKS
{subtasks}

Approve only if every subtask is necessary, correctly scoped and safe to run
without further human input. Treat anything destructive, irreversible or
security-sensitive as a reason to reject.

{format}"#,
        id = checkpoint.id,
        task = checkpoint.task_id,
        risk = checkpoint.risk_level,
        subtasks = subtasks.join("\n"),
        format = review_format_instructions(),
    )
}
