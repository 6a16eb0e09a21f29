#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use agentrun_core::ClassifiedError;
use agentrun_core::ErrorKind;
use agentrun_orchestrator::DEFAULT_SYNTHESIS_INSTRUCTIONS;
use agentrun_orchestrator::EventEmitter;
use agentrun_orchestrator::MultiRunCoordinator;
use agentrun_orchestrator::OrchestratorErr;
use agentrun_orchestrator::OrchestratorEvent;
use agentrun_protocol::CreateRunRequest;
use agentrun_protocol::MultiRunRequest;
use agentrun_protocol::RunId;
use agentrun_protocol::RunStatus;
use assert_matches::assert_matches;
use core_test_support::gateway::Call;
use core_test_support::gateway::RunPlan;
use core_test_support::gateway::ScriptedGateway;
use core_test_support::test_config;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn coordinator(gateway: &Arc<ScriptedGateway>) -> MultiRunCoordinator {
    MultiRunCoordinator::new(gateway.clone(), &test_config("http://localhost"))
}

fn role(request: &CreateRunRequest) -> Option<&str> {
    request.metadata.get("role").and_then(Value::as_str)
}

fn synthesis_requests(gateway: &ScriptedGateway) -> Vec<CreateRunRequest> {
    gateway
        .created()
        .into_iter()
        .filter(|request| role(request) == Some("synthesis"))
        .collect()
}

/// Run id the scripted gateway assigned to candidate `index`.
fn run_id_of_candidate(gateway: &ScriptedGateway, index: u64) -> RunId {
    let position = gateway
        .created()
        .iter()
        .position(|request| {
            role(request) == Some("candidate")
                && request.metadata.get("batch_index").and_then(Value::as_u64) == Some(index)
        })
        .unwrap();
    RunId::from(1001 + position as i64)
}

fn gets(gateway: &ScriptedGateway) -> usize {
    gateway
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Get(_)))
        .count()
}

#[tokio::test(start_paused = true)]
async fn successful_batch_spawns_n_plus_one_runs() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_candidate(0, RunPlan::completes(40, "alpha"))
            .plan_candidate(1, RunPlan::completes(80, "beta"))
            .plan_candidate(2, RunPlan::completes(120, "gamma"))
            .plan_synthesis(RunPlan::completes(60, "merged answer")),
    );

    let result = coordinator(&gateway)
        .run(&MultiRunRequest::new("write a changelog", 3, 60.0))
        .await
        .unwrap();

    assert_eq!(result.final_output, "merged answer");
    assert_eq!(result.candidates, vec!["alpha", "beta", "gamma"]);
    assert_eq!(result.agent_runs.len(), 4);
    assert_eq!(result.agent_runs[3].status, RunStatus::Completed);
    assert_eq!(result.agent_runs[3].result.as_deref(), Some("merged answer"));
    assert_eq!(synthesis_requests(&gateway).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn candidates_follow_completion_order_and_runs_follow_spawn_order() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_candidate(0, RunPlan::completes(300, "A"))
            .plan_candidate(1, RunPlan::completes(100, "B"))
            .plan_candidate(2, RunPlan::completes(200, "C"))
            .plan_synthesis(RunPlan::completes(20, "final")),
    );

    let result = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 3, 60.0))
        .await
        .unwrap();

    assert_eq!(result.candidates, vec!["B", "C", "A"]);
    let spawn_order: Vec<RunId> = result.agent_runs[..3]
        .iter()
        .map(|handle| handle.run_id.clone())
        .collect();
    assert_eq!(
        spawn_order,
        vec![
            run_id_of_candidate(&gateway, 0),
            run_id_of_candidate(&gateway, 1),
            run_id_of_candidate(&gateway, 2),
        ]
    );

    let synthesis = synthesis_requests(&gateway).remove(0);
    let b = synthesis.prompt.find("Candidate 1:\nB").unwrap();
    let c = synthesis.prompt.find("Candidate 2:\nC").unwrap();
    let a = synthesis.prompt.find("Candidate 3:\nA").unwrap();
    assert!(b < c && c < a);
}

#[tokio::test(start_paused = true)]
async fn synthesis_waits_for_every_candidate() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_candidate(0, RunPlan::completes(50, "fast"))
            .plan_candidate(1, RunPlan::fails(400, "slow failure"))
            .plan_synthesis(RunPlan::completes(20, "final")),
    );
    let started = Instant::now();

    coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 2, 60.0))
        .await
        .unwrap();

    let calls = gateway.calls();
    let synthesis_at = calls
        .iter()
        .position(|call| matches!(call, Call::Create(request) if role(request) == Some("synthesis")))
        .unwrap();
    let slow_run = run_id_of_candidate(&gateway, 1);
    let last_slow_poll = calls
        .iter()
        .rposition(|call| matches!(call, Call::Get(id) if *id == slow_run))
        .unwrap();
    assert!(last_slow_poll < synthesis_at);
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test(start_paused = true)]
async fn partial_failure_still_synthesizes() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_candidate(0, RunPlan::completes(50, "one"))
            .plan_candidate(1, RunPlan::fails(60, "sandbox crashed"))
            .plan_candidate(2, RunPlan::cancelled(70))
            .plan_candidate(3, RunPlan::completes(80, "four"))
            .plan_synthesis(RunPlan::completes(10, "final")),
    );

    let result = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 4, 60.0))
        .await
        .unwrap();

    assert_eq!(result.candidates, vec!["one", "four"]);
    assert_eq!(result.agent_runs.len(), 5);
    let statuses: Vec<RunStatus> = result.agent_runs.iter().map(|run| run.status).collect();
    assert_eq!(
        statuses,
        vec![
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Completed,
            RunStatus::Completed,
        ]
    );

    let synthesis = synthesis_requests(&gateway).remove(0);
    assert!(synthesis.prompt.contains("Candidate 2:\nfour"));
    assert!(!synthesis.prompt.contains("Candidate 3:"));
    assert_eq!(synthesis.metadata["candidate_count"], Value::from(2));
}

#[tokio::test(start_paused = true)]
async fn failed_create_is_tolerated() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .fail_create(0, ClassifiedError::new(ErrorKind::Server, "overloaded"))
            .plan_candidate(1, RunPlan::completes(30, "survivor"))
            .plan_synthesis(RunPlan::completes(10, "final")),
    );

    let result = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 2, 60.0))
        .await
        .unwrap();

    assert_eq!(result.candidates, vec!["survivor"]);
    // Only runs that exist remotely are reported.
    assert_eq!(result.agent_runs.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn transport_timeout_on_one_candidate_does_not_fail_the_batch() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_default(RunPlan::completes(500, "answer"))
            .plan_synthesis(RunPlan::completes(10, "final"))
            .fail_get(
                &RunId::from(1001),
                ClassifiedError::new(ErrorKind::Timeout, "HTTP 408"),
            ),
    );

    let result = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 3, 60.0))
        .await
        .unwrap();

    assert_eq!(result.final_output, "final");
    assert_eq!(result.candidates, vec!["answer", "answer"]);
    // The timed-out run still exists remotely and is reported.
    assert_eq!(result.agent_runs.len(), 4);
    assert!(
        result
            .agent_runs
            .iter()
            .any(|run| run.run_id == RunId::from(1001))
    );
}

#[tokio::test(start_paused = true)]
async fn empty_results_are_not_candidates() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_candidate(0, RunPlan::empty(20))
            .plan_candidate(1, RunPlan::completes(40, "   "))
            .plan_candidate(2, RunPlan::completes(60, "real"))
            .plan_synthesis(RunPlan::completes(10, "final")),
    );

    let result = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 3, 60.0))
        .await
        .unwrap();

    assert_eq!(result.candidates, vec!["real"]);
    assert_eq!(result.agent_runs.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn all_candidates_failing_skips_synthesis() {
    let gateway = Arc::new(ScriptedGateway::new().plan_default(RunPlan::fails(30, "boom")));

    let err = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 3, 60.0))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Server);
    assert_matches!(
        &err,
        OrchestratorErr::NoSuccessfulCandidates { attempted: 3, last_error: Some(_), agent_runs }
            if agent_runs.len() == 3
    );
    assert!(err.to_string().contains("boom"));
    assert!(synthesis_requests(&gateway).is_empty());
}

#[tokio::test(start_paused = true)]
async fn batch_deadline_fails_with_timeout_and_stops_polling() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_candidate(0, RunPlan::completes(50, "quick"))
            .plan_candidate(1, RunPlan::hangs())
            .plan_candidate(2, RunPlan::hangs()),
    );
    let deadline = Instant::now() + Duration::from_millis(500);

    let err = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 3, 0.5))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_matches!(err, OrchestratorErr::Remote(ClassifiedError { retryable: false, .. }));
    assert!(gateway.last_get_at().unwrap() <= deadline);
    assert!(synthesis_requests(&gateway).is_empty());

    let polls = gets(&gateway);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(gets(&gateway), polls);
}

#[tokio::test(start_paused = true)]
async fn synthesis_runs_under_the_remaining_budget() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_default(RunPlan::completes(300, "candidate"))
            .plan_synthesis(RunPlan::hangs()),
    );
    let started = Instant::now();

    let err = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 2, 1.0))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(synthesis_requests(&gateway).len(), 1);
    assert!(started.elapsed() <= Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn failed_synthesis_is_fatal() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_default(RunPlan::completes(30, "candidate"))
            .plan_synthesis(RunPlan::fails(30, "model refused")),
    );

    let err = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 2, 60.0))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Server);
    assert_matches!(
        err,
        OrchestratorErr::SynthesisFailed { status: RunStatus::Failed, reason, .. }
            if reason == "model refused"
    );
}

#[tokio::test(start_paused = true)]
async fn empty_synthesis_result_is_fatal() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_default(RunPlan::completes(30, "candidate"))
            .plan_synthesis(RunPlan::empty(30)),
    );

    let err = coordinator(&gateway)
        .run(&MultiRunRequest::new("task", 1, 60.0))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        OrchestratorErr::SynthesisFailed { status: RunStatus::Completed, .. }
    );
}

#[tokio::test(start_paused = true)]
async fn synthesis_request_uses_custom_instructions_and_temperature() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_default(RunPlan::completes(30, "candidate text"))
            .plan_synthesis(RunPlan::completes(30, "final")),
    );
    let request = MultiRunRequest::new("refactor the parser", 2, 60.0)
        .with_model("large")
        .with_temperature(0.7)
        .with_synthesis_temperature(0.1)
        .with_synthesis_prompt("Pick the most conservative change.")
        .with_metadata("ticket", Value::from("ENG-42"));

    coordinator(&gateway).run(&request).await.unwrap();

    let candidates: Vec<CreateRunRequest> = gateway
        .created()
        .into_iter()
        .filter(|request| role(request) == Some("candidate"))
        .collect();
    assert_eq!(candidates.len(), 2);
    for candidate in &candidates {
        assert_eq!(candidate.prompt, "refactor the parser");
        assert_eq!(candidate.temperature, Some(0.7));
        assert_eq!(candidate.metadata["ticket"], Value::from("ENG-42"));
        assert_eq!(candidate.metadata["batch_size"], Value::from(2));
    }
    assert_eq!(
        candidates[0].metadata["batch_id"],
        candidates[1].metadata["batch_id"]
    );

    let synthesis = synthesis_requests(&gateway).remove(0);
    assert_eq!(synthesis.temperature, Some(0.1));
    assert_eq!(synthesis.model.as_deref(), Some("large"));
    assert_eq!(synthesis.metadata["batch_id"], candidates[0].metadata["batch_id"]);
    assert!(
        synthesis
            .prompt
            .starts_with("Pick the most conservative change.\n\nOriginal task:\nrefactor the parser")
    );
    assert!(!synthesis.prompt.contains(DEFAULT_SYNTHESIS_INSTRUCTIONS));
    assert!(synthesis.prompt.contains("Candidate 1:\ncandidate text"));
    assert!(synthesis.prompt.contains("Candidate 2:\ncandidate text"));
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_never_reach_the_service() {
    let gateway = Arc::new(ScriptedGateway::new());
    let coordinator = coordinator(&gateway);

    for request in [
        MultiRunRequest::new("task", 0, 60.0),
        MultiRunRequest::new("task", 9, 60.0),
        MultiRunRequest::new("task", 2, 0.0),
        MultiRunRequest::new("", 2, 60.0),
        MultiRunRequest::new("task", 2, 60.0).with_temperature(2.0),
    ] {
        let err = coordinator.run(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert!(gateway.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn outer_cancellation_aborts_the_batch() {
    let gateway = Arc::new(ScriptedGateway::new().plan_default(RunPlan::hangs()));
    let cancel = CancellationToken::new();
    let coordinator = coordinator(&gateway).with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });
    let started = Instant::now();

    let err = coordinator
        .run(&MultiRunRequest::new("task", 2, 600.0))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn events_trace_the_batch() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .plan_candidate(0, RunPlan::completes(60, "late"))
            .plan_candidate(1, RunPlan::completes(20, "early"))
            .plan_synthesis(RunPlan::completes(20, "final")),
    );
    let (events, rx) = EventEmitter::channel();

    coordinator(&gateway)
        .with_events(events)
        .run(&MultiRunRequest::new("task", 2, 60.0))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }

    let positions: Vec<usize> = seen
        .iter()
        .filter_map(|event| match event {
            OrchestratorEvent::CandidateCollected { position, .. } => Some(*position),
            _ => None,
        })
        .collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(
        seen.iter()
            .filter(|event| matches!(event, OrchestratorEvent::RunSpawned { .. }))
            .count(),
        3
    );
    assert_matches!(
        seen.iter().find(|event| matches!(event, OrchestratorEvent::SynthesisStarted { .. })),
        Some(OrchestratorEvent::SynthesisStarted { candidates: 2, .. })
    );
    assert_matches!(
        seen.last(),
        Some(OrchestratorEvent::BatchCompleted { candidates: 2, runs: 3, .. })
    );
}

#[tokio::test(start_paused = true)]
async fn failed_batch_emits_batch_failed() {
    let gateway = Arc::new(ScriptedGateway::new().plan_default(RunPlan::fails(10, "nope")));
    let (events, rx) = EventEmitter::channel();

    let _ = coordinator(&gateway)
        .with_events(events)
        .run(&MultiRunRequest::new("task", 1, 60.0))
        .await;

    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    assert_matches!(
        last,
        Some(OrchestratorEvent::BatchFailed { kind: ErrorKind::Server, .. })
    );
}
