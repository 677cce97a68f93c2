//! # conclave-validation
//!
//! Quality and safety gates for Conclave orchestration.
//!
//! This crate provides:
//! - The adversarial review micro-grammar (verdict and issue parsing)
//! - Consensus checkpoints that hold risky subtasks until they are approved
//! - An append-only audit log per checkpoint

mod checkpoint;
mod consensus;
mod review;

pub use checkpoint::{
    AuditEvent, AuditEventKind, CheckpointRecord, CheckpointStatus, ConsensusCheck,
    ConsensusCheckpoint, ConsensusDecision, CreateCheckpointRequest, ProposedSubtask,
    ReviewerConfig, ReviewerType,
};
pub use consensus::{
    spawn_expiry_sweeper, ConsensusCheckpointService, ConsensusConfig, MIN_SWEEP_PERIOD,
};
pub use review::{
    parse_issues, parse_review_response, parse_verdict, review_format_instructions,
    ReviewIssue, ReviewResult, Severity, Verdict, DEFAULT_REQUIRED_FIX,
};
