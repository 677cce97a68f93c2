//! # conclave-core
//!
//! Core types for the Conclave orchestration and gating engine.
//!
//! Conclave runs work across a pool of LLM-backed agent workers and holds risky
//! work behind review gates before it is allowed to proceed.
//!
//! ## Core Paradigm
//!
//! - Tasks are queued by priority and handed to typed workers
//! - Concurrent review loops are capped by a shared semaphore
//! - Producer output is challenged by an adversarial reviewer
//! - Risky subtasks wait at a consensus checkpoint until someone signs off

mod error;
mod types;

pub mod config;
pub mod fail_open;

pub use config::ConclaveConfig;
pub use error::{ConclaveError, Result};
pub use types::*;
