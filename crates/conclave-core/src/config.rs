//! Configuration management for Conclave
//!
//! Repository-level settings for the coordinator, review loops, consensus
//! checkpoints, the warm agent pool and state storage.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{ConclaveError, Result, ReviewerStrategy, RiskLevel};

/// Repository-level Conclave configuration
///
/// Loaded from `.conclave/config.toml` in the repo root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConclaveConfig {
    /// Hierarchical coordinator settings
    #[serde(default)]
    pub coordinator: CoordinatorSettings,

    /// Review loop settings
    #[serde(default)]
    pub review_loop: ReviewLoopSettings,

    /// Consensus checkpoint policy
    #[serde(default)]
    pub consensus: ConsensusSettings,

    /// Warm agent pool
    #[serde(default)]
    pub pool: PoolSettings,

    /// State persistence
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Maximum workers per agent type
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewLoopSettings {
    /// Review/fix rounds before giving up
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Review loops allowed to run at once
    #[serde(default = "default_max_concurrent_loops")]
    pub max_concurrent_loops: usize,

    /// Agent type that writes and fixes code
    #[serde(default = "default_producer_type")]
    pub producer_type: String,

    /// Agent type that attacks the code
    #[serde(default = "default_adversarial_type")]
    pub adversarial_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSettings {
    /// Master switch; when false nothing requires consensus
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Risk levels that must pass a checkpoint
    #[serde(default = "default_require_for_risk_levels")]
    pub require_for_risk_levels: Vec<RiskLevel>,

    /// Seconds a checkpoint stays pending before it may be expired
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Who reviews checkpoints
    #[serde(default)]
    pub reviewer_strategy: ReviewerStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Warm agents kept per agent type
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory for persisted loop and checkpoint state, relative to the repo root
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

// Default value providers
fn default_max_workers() -> usize {
    4
}

fn default_max_iterations() -> usize {
    3
}

fn default_max_concurrent_loops() -> usize {
    5
}

fn default_producer_type() -> String {
    "coder".to_string()
}

fn default_adversarial_type() -> String {
    "adversarial".to_string()
}

fn default_true() -> bool {
    true
}

fn default_require_for_risk_levels() -> Vec<RiskLevel> {
    vec![RiskLevel::High, RiskLevel::Medium]
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_pool_max_size() -> usize {
    5
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".conclave/state")
}

impl ConclaveConfig {
    /// Load configuration from `.conclave/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(".conclave/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ConclaveError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConclaveError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Write default configuration to `.conclave/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_dir = repo_root.join(".conclave");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        std::fs::write(&config_path, Self::default().to_toml()?)?;
        Ok(config_path)
    }

    /// State directory resolved against the repo root
    pub fn state_dir(&self, repo_root: &Path) -> PathBuf {
        if self.storage.state_dir.is_absolute() {
            self.storage.state_dir.clone()
        } else {
            repo_root.join(&self.storage.state_dir)
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

impl Default for ReviewLoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_concurrent_loops: default_max_concurrent_loops(),
            producer_type: default_producer_type(),
            adversarial_type: default_adversarial_type(),
        }
    }
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            require_for_risk_levels: default_require_for_risk_levels(),
            timeout_secs: default_timeout_secs(),
            reviewer_strategy: ReviewerStrategy::default(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ConclaveConfig::default();
        assert_eq!(config.coordinator.max_workers, 4);
        assert_eq!(config.review_loop.max_iterations, 3);
        assert_eq!(config.review_loop.max_concurrent_loops, 5);
        assert_eq!(
            config.consensus.require_for_risk_levels,
            vec![RiskLevel::High, RiskLevel::Medium]
        );
        assert_eq!(config.consensus.timeout_secs, 300);
        assert!(config.consensus.enabled);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ConclaveConfig::from_toml(
            r#"
[consensus]
require_for_risk_levels = ["high"]
reviewer_strategy = "human"

[review_loop]
max_iterations = 5
"#,
        )
        .unwrap();

        assert_eq!(config.consensus.require_for_risk_levels, vec![RiskLevel::High]);
        assert_eq!(config.consensus.reviewer_strategy, ReviewerStrategy::Human);
        assert_eq!(config.consensus.timeout_secs, 300);
        assert_eq!(config.review_loop.max_iterations, 5);
        assert_eq!(config.review_loop.producer_type, "coder");
        assert_eq!(config.coordinator.max_workers, 4);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = ConclaveConfig::from_toml("[consensus]\ntimeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, ConclaveError::Config(_)));
    }

    #[test]
    fn test_write_and_load_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = ConclaveConfig::write_default(temp_dir.path()).unwrap();
        assert!(path.exists());

        let loaded = ConclaveConfig::load_or_default(temp_dir.path()).unwrap();
        assert_eq!(loaded.pool.max_size, 5);
        assert_eq!(
            loaded.state_dir(temp_dir.path()),
            temp_dir.path().join(".conclave/state")
        );
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConclaveConfig::load_or_default(temp_dir.path()).unwrap();
        assert_eq!(config.review_loop.adversarial_type, "adversarial");
    }
}
