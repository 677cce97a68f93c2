//! # conclave-agent
//!
//! Contracts for the collaborators the orchestration core drives but does not
//! implement:
//!
//! - [`AgentSubstrate`]: spawns agents, runs prompts through them, stops them
//! - [`StateStore`]: durable, best-effort persistence of loop and checkpoint state
//!
//! Both are traits so the core can be driven by a real provider in production
//! and by [`MockAgentSubstrate`] / [`MemoryStore`] in tests.

mod mock;
mod store;
mod substrate;
mod types;

pub use mock::{MockAgentSubstrate, SubstrateCall};
pub use store::{FileStore, MemoryStore, StateStore, CHECKPOINTS, REVIEW_LOOPS};
pub use substrate::AgentSubstrate;
pub use types::*;
