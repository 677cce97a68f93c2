//! Consensus checkpoint data model

use chrono::{DateTime, Utc};
use conclave_agent::AgentConfig;
use conclave_core::{ReviewerStrategy, RiskLevel, TaskId};
use serde::{Deserialize, Serialize};

/// Checkpoint lifecycle status
///
/// Only `Pending` may change; every other status is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl CheckpointStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// Kind of reviewer that made a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewerType {
    Agent,
    Human,
}

impl From<ReviewerStrategy> for ReviewerType {
    fn from(strategy: ReviewerStrategy) -> Self {
        match strategy {
            ReviewerStrategy::Human => Self::Human,
            ReviewerStrategy::Adversarial | ReviewerStrategy::DifferentModel => Self::Agent,
        }
    }
}

impl std::fmt::Display for ReviewerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Human => write!(f, "human"),
        }
    }
}

/// A subtask a parent task wants to spawn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedSubtask {
    pub id: String,
    pub agent_type: String,
    pub input: serde_json::Value,
    pub estimated_risk_level: RiskLevel,
    pub parent_task_id: Option<TaskId>,
}

impl ProposedSubtask {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        estimated_risk_level: RiskLevel,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            input: serde_json::Value::Null,
            estimated_risk_level,
            parent_task_id: None,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }
}

/// Outcome recorded when a checkpoint is approved or rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_subtask_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub reviewed_by: String,
    pub reviewer_type: ReviewerType,
}

/// A pending-approval gate over a set of proposed subtasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusCheckpoint {
    pub id: String,
    pub task_id: TaskId,
    pub parent_task_id: Option<TaskId>,
    pub proposed_subtasks: Vec<ProposedSubtask>,
    pub risk_level: RiskLevel,
    pub status: CheckpointStatus,
    pub reviewer_strategy: ReviewerStrategy,
    pub reviewer_id: Option<String>,
    pub reviewer_type: Option<ReviewerType>,
    pub decision: Option<ConsensusDecision>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ConsensusCheckpoint {
    pub fn is_pending(&self) -> bool {
        self.status == CheckpointStatus::Pending
    }

    /// Pending and past its expiry time
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at < now
    }
}

/// Input for creating a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCheckpointRequest {
    pub task_id: TaskId,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    pub proposed_subtasks: Vec<ProposedSubtask>,
    pub risk_level: RiskLevel,
}

impl CreateCheckpointRequest {
    pub fn new(
        task_id: impl Into<String>,
        proposed_subtasks: Vec<ProposedSubtask>,
        risk_level: RiskLevel,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            parent_task_id: None,
            proposed_subtasks,
            risk_level,
        }
    }

    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }
}

/// Audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventKind {
    Created,
    ReviewStarted,
    Approved,
    Rejected,
    Expired,
}

impl std::fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::ReviewStarted => write!(f, "review-started"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// One entry in a checkpoint's append-only audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub checkpoint_id: String,
    pub kind: AuditEventKind,
    /// Who caused the event (`system` for automatic transitions)
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Persisted form of a checkpoint together with its audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint: ConsensusCheckpoint,
    pub audit: Vec<AuditEvent>,
}

/// Answer to "does this batch of subtasks need consensus?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusCheck {
    pub requires_consensus: bool,
    /// Highest estimated risk among the subtasks
    pub risk_level: RiskLevel,
}

/// Who should review a checkpoint and with what prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerConfig {
    pub checkpoint_id: String,
    pub strategy: ReviewerStrategy,
    /// Agent type to spawn; `None` when a human decides
    pub agent_type: Option<String>,
    pub agent_config: AgentConfig,
    pub prompt: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn checkpoint(expires_in: Duration) -> ConsensusCheckpoint {
        let now = Utc::now();
        ConsensusCheckpoint {
            id: "cp-1".to_string(),
            task_id: "task-1".to_string(),
            parent_task_id: None,
            proposed_subtasks: vec![ProposedSubtask::new("st-1", "coder", RiskLevel::High)],
            risk_level: RiskLevel::High,
            status: CheckpointStatus::Pending,
            reviewer_strategy: ReviewerStrategy::Adversarial,
            reviewer_id: None,
            reviewer_type: None,
            decision: None,
            created_at: now,
            expires_at: now + expires_in,
            decided_at: None,
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CheckpointStatus::Pending.is_terminal());
        assert!(CheckpointStatus::Approved.is_terminal());
        assert!(CheckpointStatus::Rejected.is_terminal());
        assert!(CheckpointStatus::Expired.is_terminal());
    }

    #[test]
    fn test_stale_only_when_pending_and_past_expiry() {
        let now = Utc::now();
        let mut cp = checkpoint(Duration::seconds(-1));
        assert!(cp.is_stale(now));

        cp.status = CheckpointStatus::Approved;
        assert!(!cp.is_stale(now));

        assert!(!checkpoint(Duration::seconds(60)).is_stale(now));
    }

    #[test]
    fn test_reviewer_type_from_strategy() {
        assert_eq!(ReviewerType::from(ReviewerStrategy::Human), ReviewerType::Human);
        assert_eq!(
            ReviewerType::from(ReviewerStrategy::DifferentModel),
            ReviewerType::Agent
        );
    }

    #[test]
    fn test_audit_kind_serde() {
        let json = serde_json::to_string(&AuditEventKind::ReviewStarted).unwrap();
        assert_eq!(json, "\"review-started\"");
    }
}
