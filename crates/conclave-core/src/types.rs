//! Core type definitions for Conclave orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task priority. Higher values are served first.
pub type Priority = i32;

/// Task identifier
pub type TaskId = String;

/// Worker (spawned agent) identifier
pub type WorkerId = String;

/// Task status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Lifecycle status of a spawned agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Risk classification of a proposed task
///
/// Ordered so that `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid risk level: {}", s)),
        }
    }
}

/// Who reviews a consensus checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewerStrategy {
    /// An adversarial agent challenges the proposal
    #[default]
    Adversarial,
    /// A reviewer agent backed by a different model
    DifferentModel,
    /// A human operator decides
    Human,
}

impl std::fmt::Display for ReviewerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adversarial => write!(f, "adversarial"),
            Self::DifferentModel => write!(f, "different-model"),
            Self::Human => write!(f, "human"),
        }
    }
}

impl std::str::FromStr for ReviewerStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "adversarial" => Ok(Self::Adversarial),
            "different-model" | "different_model" => Ok(Self::DifferentModel),
            "human" => Ok(Self::Human),
            _ => Err(format!("Invalid reviewer strategy: {}", s)),
        }
    }
}

/// A unit of work handed to an agent worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier
    pub id: TaskId,
    /// Session this task belongs to
    pub session_id: Option<String>,
    /// Agent type that must run this task
    pub agent_type: String,
    /// Current status
    pub status: TaskStatus,
    /// Task input (prompt and parameters)
    pub input: Option<serde_json::Value>,
    /// Task output once completed
    pub output: Option<serde_json::Value>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When a worker picked the task up
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Risk classification, if assessed
    pub risk_level: Option<RiskLevel>,
    /// Parent task for decomposed work
    pub parent_task_id: Option<TaskId>,
    /// Depth in the decomposition tree
    pub depth: Option<u32>,
    /// Checkpoint gating this task, if any
    pub consensus_checkpoint_id: Option<String>,
}

impl Task {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self::with_id(format!("task-{}", Uuid::new_v4()), agent_type)
    }

    pub fn with_id(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: None,
            agent_type: agent_type.into(),
            status: TaskStatus::Pending,
            input: None,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            risk_level: None,
            parent_task_id: None,
            depth: None,
            consensus_checkpoint_id: None,
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = Some(risk_level);
        self
    }

    pub fn with_parent(mut self, parent_task_id: impl Into<String>, depth: u32) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self.depth = Some(depth);
        self
    }
}

/// A spawned agent worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    /// Worker identifier
    pub id: WorkerId,
    /// Agent type (coder, tester, adversarial, ...)
    pub agent_type: String,
    /// Human-readable name
    pub name: String,
    /// Lifecycle status
    pub status: AgentStatus,
    /// Spawn timestamp
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(agent_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: format!("agent-{}", Uuid::new_v4()),
            agent_type: agent_type.into(),
            name: name.into(),
            status: AgentStatus::Idle,
            created_at: Utc::now(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

impl std::fmt::Display for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.agent_type, self.name)
    }
}
