//! Pure state machine for review loop control flow
//!
//! No I/O, no async. The review loop coordinator asks this module whether a
//! move is legal before it mutates anything.
//!
//! ```text
//! pending ─► coding ─► reviewing ─┬─► approved
//!                        ▲        ├─► fixing ─┐
//!                        └────────┼───────────┘
//!                                 └─► max_iterations_reached
//! ```
//!
//! `failed` is reachable from every in-progress status, `aborted` from every
//! non-terminal one. Terminal statuses accept no events.

use serde::{Deserialize, Serialize};

/// Review loop status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewLoopStatus {
    #[default]
    Pending,
    Coding,
    Reviewing,
    Fixing,
    Approved,
    MaxIterationsReached,
    Failed,
    Aborted,
}

impl ReviewLoopStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::MaxIterationsReached | Self::Failed | Self::Aborted
        )
    }

    /// Generating, reviewing or fixing
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Coding | Self::Reviewing | Self::Fixing)
    }
}

impl std::fmt::Display for ReviewLoopStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Coding => write!(f, "coding"),
            Self::Reviewing => write!(f, "reviewing"),
            Self::Fixing => write!(f, "fixing"),
            Self::Approved => write!(f, "approved"),
            Self::MaxIterationsReached => write!(f, "max_iterations_reached"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Events that drive a review loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    /// `start()` was called
    Start,
    /// The producer returned the initial code
    CodeGenerated,
    /// The reviewer approved
    Approved,
    /// The reviewer rejected; `can_fix` is false on the last iteration
    Rejected { can_fix: bool },
    /// The producer returned fixed code
    FixApplied,
    /// A worker call failed
    Error,
    /// `abort()` was called
    Abort,
}

/// Pure state transition function
///
/// Returns the next status, or `None` if the event is not legal in `status`.
pub fn transition(status: ReviewLoopStatus, event: LoopEvent) -> Option<ReviewLoopStatus> {
    use ReviewLoopStatus as S;

    match (status, event) {
        (S::Pending, LoopEvent::Start) => Some(S::Coding),
        (S::Coding, LoopEvent::CodeGenerated) => Some(S::Reviewing),
        (S::Reviewing, LoopEvent::Approved) => Some(S::Approved),
        (S::Reviewing, LoopEvent::Rejected { can_fix: true }) => Some(S::Fixing),
        (S::Reviewing, LoopEvent::Rejected { can_fix: false }) => Some(S::MaxIterationsReached),
        (S::Fixing, LoopEvent::FixApplied) => Some(S::Reviewing),

        (s, LoopEvent::Error) if s.is_in_progress() => Some(S::Failed),
        (s, LoopEvent::Abort) if !s.is_terminal() => Some(S::Aborted),

        _ => None,
    }
}
