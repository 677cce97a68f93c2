//! Type definitions for agent substrate interactions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Options for spawning an agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Requested name; must be unique among live agents
    pub name: Option<String>,
    /// Session the agent works for
    pub session_id: Option<String>,
}

impl SpawnOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// Execution settings passed through to the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model override
    pub model: Option<String>,
    /// Maximum tokens for the response
    pub max_tokens: Option<usize>,
    /// System prompt override
    pub system_prompt: Option<String>,
}

impl AgentConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Result from a single agent invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// The agent's output text
    pub response: String,
    /// When this result was generated
    pub timestamp: DateTime<Utc>,
    /// Token usage if available
    pub usage: Option<Usage>,
}

impl AgentResponse {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            timestamp: Utc::now(),
            usage: None,
        }
    }
}
