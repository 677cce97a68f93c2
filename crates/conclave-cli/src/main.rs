//! Conclave CLI - agent orchestration and consensus gating
//!
//! Usage:
//!   conclave init                     Write a default config
//!   conclave config                   Show the effective config
//!   conclave risk <level>             Check whether a risk level is gated
//!   conclave parse-review <file>      Parse a reviewer response
//!   conclave checkpoint list          List consensus checkpoints
//!   conclave checkpoint approve <id>  Approve a pending checkpoint
//!   conclave simulate <requirements>  Dry-run a review loop on a mock substrate

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conclave_agent::{FileStore, MockAgentSubstrate, StateStore};
use conclave_core::{ConclaveConfig, RiskLevel};
use conclave_orchestrator::{ReviewLoopConfig, ReviewLoopRuntime};
use conclave_validation::{
    parse_review_response, ConsensusCheckpoint, ConsensusCheckpointService, ConsensusConfig,
    ReviewerType,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "conclave")]
#[command(author, version, about = "Agent orchestration with adversarial review and consensus gating")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root holding .conclave/
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .conclave/config.toml
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Config,

    /// Check whether subtasks of a risk level need consensus
    Risk {
        /// Risk level (low, medium, high)
        level: String,
    },

    /// Parse a reviewer response file into a review result
    ParseReview {
        /// File containing the raw reviewer output
        file: PathBuf,
    },

    /// Consensus checkpoint management
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointCommands,
    },

    /// Run a review loop against a scripted mock substrate
    Simulate {
        /// Requirements handed to the producer
        requirements: String,

        /// Reviews the adversarial worker rejects before approving
        #[arg(long, default_value = "1")]
        rejections: usize,

        /// Override the configured iteration limit
        #[arg(short = 'n', long)]
        max_iterations: Option<usize>,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// List checkpoints
    List {
        /// Show only pending checkpoints
        #[arg(long)]
        pending: bool,

        /// Only checkpoints for this task
        #[arg(long)]
        task: Option<String>,
    },

    /// Show one checkpoint
    Show {
        /// Checkpoint ID
        id: String,
    },

    /// Approve a pending checkpoint
    Approve {
        /// Checkpoint ID
        id: String,

        /// Reviewer identity recorded in the decision
        #[arg(long)]
        by: String,

        #[arg(long)]
        feedback: Option<String>,
    },

    /// Reject a pending checkpoint
    Reject {
        /// Checkpoint ID
        id: String,

        /// Reviewer identity recorded in the decision
        #[arg(long)]
        by: String,

        #[arg(long)]
        feedback: Option<String>,

        /// Subtask refused by the reviewer (repeatable)
        #[arg(long = "subtask")]
        subtasks: Vec<String>,
    },

    /// Expire pending checkpoints past their deadline
    Expire,

    /// Show the audit trail of a checkpoint
    Audit {
        /// Checkpoint ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.repo, force),
        Commands::Config => cmd_config(&cli.repo),
        Commands::Risk { level } => cmd_risk(&cli.repo, &level),
        Commands::ParseReview { file } => cmd_parse_review(&file).await,
        Commands::Checkpoint { action } => cmd_checkpoint(&cli.repo, action).await,
        Commands::Simulate {
            requirements,
            rejections,
            max_iterations,
        } => cmd_simulate(&cli.repo, requirements, rejections, max_iterations).await,
    }
}

fn load_config(repo: &Path) -> Result<ConclaveConfig> {
    ConclaveConfig::load_or_default(repo)
        .with_context(|| format!("Failed to load config from {:?}", repo))
}

fn cmd_init(repo: &Path, force: bool) -> Result<()> {
    let existing = repo.join(".conclave/config.toml");
    if existing.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", existing);
    }

    let path = ConclaveConfig::write_default(repo).context("Failed to write config")?;
    info!("Initialized Conclave in {:?}", repo);
    println!("Created {}", path.display());
    Ok(())
}

fn cmd_config(repo: &Path) -> Result<()> {
    let config = load_config(repo)?;
    print!("{}", config.to_toml()?);
    println!("# state dir: {}", config.state_dir(repo).display());
    Ok(())
}

fn cmd_risk(repo: &Path, level: &str) -> Result<()> {
    let level: RiskLevel = level.parse().map_err(anyhow::Error::msg)?;
    let config = ConsensusConfig::from(&load_config(repo)?.consensus);

    if config.requires_consensus(level) {
        println!(
            "{} risk requires consensus ({} review, {}s timeout)",
            level, config.reviewer_strategy, config.timeout_secs
        );
    } else {
        println!("{} risk proceeds without consensus", level);
    }
    Ok(())
}

async fn cmd_parse_review(file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read review file {:?}", file))?;
    let review = parse_review_response(&content);
    debug!(
        "Parsed {} issues from {:?} ({})",
        review.issues.len(),
        file,
        review.verdict
    );
    println!("{}", serde_json::to_string_pretty(&review)?);
    Ok(())
}

async fn open_checkpoints(repo: &Path) -> Result<ConsensusCheckpointService> {
    let config = load_config(repo)?;
    let state_dir = config.state_dir(repo);
    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(&state_dir));
    ConsensusCheckpointService::restore(store, ConsensusConfig::from(&config.consensus))
        .await
        .with_context(|| format!("Failed to load checkpoints from {:?}", state_dir))
}

fn print_checkpoint_line(checkpoint: &ConsensusCheckpoint) {
    println!(
        "{}  {:<9} {:<6} task={} subtasks={} expires={}",
        checkpoint.id,
        checkpoint.status,
        checkpoint.risk_level,
        checkpoint.task_id,
        checkpoint.proposed_subtasks.len(),
        checkpoint.expires_at.format("%Y-%m-%d %H:%M:%S")
    );
}

async fn cmd_checkpoint(repo: &Path, action: CheckpointCommands) -> Result<()> {
    let service = open_checkpoints(repo).await?;

    match action {
        CheckpointCommands::List { pending, task } => {
            let checkpoints: Vec<ConsensusCheckpoint> = match (pending, task) {
                (_, Some(task)) => service
                    .list_for_task(&task)
                    .into_iter()
                    .filter(|cp| !pending || cp.is_pending())
                    .collect(),
                (true, None) => service.list_pending(),
                (false, None) => service.list(),
            };

            if checkpoints.is_empty() {
                println!("No checkpoints");
            }
            for checkpoint in &checkpoints {
                print_checkpoint_line(checkpoint);
            }
        }
        CheckpointCommands::Show { id } => {
            let checkpoint = service
                .get(&id)
                .with_context(|| format!("Checkpoint {} not found", id))?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        }
        CheckpointCommands::Approve { id, by, feedback } => {
            // Decisions made here always come from a person
            let checkpoint = service
                .approve_checkpoint_as(&id, &by, ReviewerType::Human, feedback)
                .await?;
            println!("Approved {}", checkpoint.id);
        }
        CheckpointCommands::Reject {
            id,
            by,
            feedback,
            subtasks,
        } => {
            let rejected = (!subtasks.is_empty()).then_some(subtasks);
            let checkpoint = service
                .reject_checkpoint_as(&id, &by, ReviewerType::Human, feedback, rejected)
                .await?;
            println!("Rejected {}", checkpoint.id);
        }
        CheckpointCommands::Expire => {
            let expired = service.expire_stale_pending().await;
            println!("Expired {} checkpoint(s)", expired);
        }
        CheckpointCommands::Audit { id } => {
            for event in service.audit_log(&id)? {
                println!(
                    "{}  {:<13} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.kind,
                    event.actor
                );
            }
        }
    }

    Ok(())
}

async fn cmd_simulate(
    repo: &Path,
    requirements: String,
    rejections: usize,
    max_iterations: Option<usize>,
) -> Result<()> {
    let config = load_config(repo)?;
    let mut loop_config = ReviewLoopConfig::from_config(&config).with_session("simulate");
    if let Some(max) = max_iterations {
        loop_config = loop_config.with_max_iterations(max);
    }

    let mut substrate = MockAgentSubstrate::new()
        .with_default_response(&loop_config.producer_type, "fn solution() {}")
        .with_default_response(
            &loop_config.adversarial_type,
            "No remaining issues.\n\n**VERDICT: APPROVE**",
        );
    for n in 0..rejections {
        substrate = substrate.with_response(
            &loop_config.adversarial_type,
            format!(
                "[SEVERITY: MEDIUM] - Simulated finding {}\nRequired Fix: address finding {}\n\n**VERDICT: REJECT**",
                n + 1,
                n + 1
            ),
        );
    }

    let runtime = ReviewLoopRuntime::from_config(Arc::new(substrate), &config);
    let review_loop = runtime.create_loop(requirements, loop_config).await?;
    let state = review_loop.start().await?;
    review_loop.cleanup().await;

    println!("Loop {} finished: {}", state.id, state.status);
    for (n, review) in state.reviews.iter().enumerate() {
        println!(
            "  review {}: {} ({} issues)",
            n + 1,
            review.verdict,
            review.issues.len()
        );
    }
    Ok(())
}
