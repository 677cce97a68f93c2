//! End-to-end flows across coordinator, review loops and consensus gating

use conclave_agent::{
    AgentSubstrate, FileStore, MockAgentSubstrate, SpawnOptions, StateStore, REVIEW_LOOPS,
};
use conclave_core::{AgentStatus, RiskLevel, Task};
use conclave_orchestrator::{
    CoordinatorConfig, HierarchicalCoordinator, MessageChannel, MessageKind, ReviewLoopConfig,
    ReviewLoopRuntime, ReviewLoopStatus,
};
use conclave_validation::{
    parse_review_response, CheckpointStatus, ConsensusCheckpointService, ConsensusConfig,
    CreateCheckpointRequest, ProposedSubtask, Verdict,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn assigned_task(channel: &MessageChannel, worker_id: &str) -> Option<String> {
    channel
        .history()
        .iter()
        .rev()
        .find(|m| m.kind == MessageKind::TaskAssign && m.to == worker_id)
        .and_then(|m| m.payload_str("task_id").map(str::to_string))
}

#[tokio::test]
async fn test_single_worker_round_trip() {
    let substrate = MockAgentSubstrate::new();
    let channel = MessageChannel::new();
    let mut coordinator = HierarchicalCoordinator::new(
        CoordinatorConfig::default().with_max_workers(1),
        Arc::new(substrate.clone()),
        channel.clone(),
    );
    coordinator.initialize().await.unwrap();

    let task_id = coordinator
        .submit_task(Task::new("coder"), 5)
        .await
        .unwrap();

    // Coordinator plus exactly one coder
    assert_eq!(substrate.spawn_count(), 2);
    let worker = coordinator.workers().next().cloned().unwrap();
    assert_eq!(worker.agent_type, "coder");
    assert_eq!(worker.status, AgentStatus::Running);
    assert_eq!(assigned_task(&channel, &worker.id), Some(task_id.clone()));

    let coordinator_id = coordinator.id().unwrap().to_string();
    channel.send(
        worker.id.clone(),
        coordinator_id,
        MessageKind::TaskCompleted,
        json!({ "task_id": task_id }),
    );
    assert_eq!(coordinator.process_pending_messages().await.unwrap(), 1);

    let status = coordinator.status();
    assert_eq!(status.idle_workers, 1);
    assert_eq!(status.queue.queued, 0);
    assert_eq!(status.queue.processing, 0);
    assert!(coordinator.queue().is_empty());

    coordinator.shutdown().await.unwrap();
    assert!(substrate.live_workers().is_empty());
}

#[tokio::test]
async fn test_review_loop_exhausts_and_persists() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(FileStore::new(dir.path()));
    let substrate = MockAgentSubstrate::new()
        .with_default_response("coder", "fn handler() {}")
        .with_default_response(
            "adversarial",
            "[SEVERITY: CRITICAL] - SQL injection\nAttack Vector: crafted id\n\n**VERDICT: REJECT**",
        );
    let runtime = ReviewLoopRuntime::new(Arc::new(substrate.clone()), 2).with_store(store.clone());

    let review_loop = runtime
        .create_loop(
            "Write a request handler",
            ReviewLoopConfig::default()
                .with_max_iterations(2)
                .with_session("session-e2e"),
        )
        .await
        .unwrap();
    let state = review_loop.start().await.unwrap();

    assert_eq!(state.status, ReviewLoopStatus::MaxIterationsReached);
    assert_eq!(state.iteration, 2);
    assert_eq!(state.final_verdict, Some(Verdict::Reject));
    assert!(state.reviews.iter().all(|r| r.issues[0].title == "SQL injection"));

    let saved = store
        .load(REVIEW_LOOPS, review_loop.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved["status"], "max_iterations_reached");
    assert_eq!(saved["session_id"], "session-e2e");

    review_loop.cleanup().await;
    assert!(runtime.registry().is_empty());
}

#[tokio::test]
async fn test_loops_share_one_slot() {
    let substrate = MockAgentSubstrate::new()
        .with_default_response("coder", "fn f() {}")
        .with_default_response("adversarial", "**VERDICT: APPROVE**");
    let runtime = ReviewLoopRuntime::new(Arc::new(substrate.clone()), 1);

    let mut handles = Vec::new();
    for n in 0..3 {
        let review_loop = runtime
            .create_loop(format!("Task {}", n), ReviewLoopConfig::default())
            .await
            .unwrap();
        handles.push(tokio::spawn(async move { review_loop.start().await }));
    }
    for handle in handles {
        let state = handle.await.unwrap().unwrap();
        assert_eq!(state.status, ReviewLoopStatus::Approved);
    }

    assert_eq!(substrate.max_in_flight(), 1);
    assert_eq!(runtime.registry().list().len(), 3);
}

#[tokio::test]
async fn test_gated_subtasks_reach_coordinator_after_review() {
    let substrate = MockAgentSubstrate::new()
        .with_default_response("adversarial", "Decomposition is sound.\n\n**VERDICT: APPROVE**");
    let consensus = ConsensusCheckpointService::new(ConsensusConfig::default());

    let subtasks = vec![
        ProposedSubtask::new("sub-1", "coder", RiskLevel::Low),
        ProposedSubtask::new("sub-2", "coder", RiskLevel::High),
    ];
    let check = consensus.check(&subtasks);
    assert!(check.requires_consensus);
    assert_eq!(check.risk_level, RiskLevel::High);

    let checkpoint = consensus
        .create_checkpoint(CreateCheckpointRequest::new(
            "parent-1",
            subtasks.clone(),
            check.risk_level,
        ))
        .await
        .unwrap();

    // Run the reviewer the service asks for
    let reviewer_config = consensus.start_review(&checkpoint.id).await.unwrap();
    let agent_type = reviewer_config.agent_type.clone().unwrap();
    let reviewer = substrate
        .spawn_agent(
            &agent_type,
            SpawnOptions::default(),
            reviewer_config.agent_config.clone(),
        )
        .await
        .unwrap();
    let response = substrate
        .execute_agent(&reviewer.id, &reviewer_config.prompt, &reviewer_config.agent_config)
        .await
        .unwrap();
    let decided = consensus
        .apply_review(&checkpoint.id, &reviewer.id, &parse_review_response(&response.response))
        .await
        .unwrap();
    assert_eq!(decided.status, CheckpointStatus::Approved);
    assert!(substrate.prompts_for(&agent_type)[0].contains("sub-2"));

    let mut coordinator = HierarchicalCoordinator::new(
        CoordinatorConfig::default().with_max_workers(2),
        Arc::new(substrate.clone()),
        MessageChannel::new(),
    );
    coordinator.initialize().await.unwrap();
    for subtask in &decided.proposed_subtasks {
        coordinator
            .submit_task(Task::with_id(subtask.id.clone(), subtask.agent_type.clone()), 1)
            .await
            .unwrap();
    }

    let status = coordinator.status();
    assert_eq!(status.running_workers, 2);
    assert_eq!(status.queue.processing, 2);
    assert_eq!(consensus.audit_log(&checkpoint.id).unwrap().len(), 3);
}
