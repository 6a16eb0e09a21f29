#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use agentrun_core::ClassifiedError;
use agentrun_core::ErrorKind;
use agentrun_orchestrator::ChildRunSpawner;
use agentrun_orchestrator::EventEmitter;
use agentrun_orchestrator::OrchestrationLinkRegistry;
use agentrun_orchestrator::OrchestratorErr;
use agentrun_orchestrator::OrchestratorEvent;
use agentrun_orchestrator::RunRole;
use agentrun_protocol::CreateRunRequest;
use agentrun_protocol::RunId;
use assert_matches::assert_matches;
use core_test_support::gateway::ScriptedGateway;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn child_with_parent_is_linked() {
    let gateway = Arc::new(ScriptedGateway::new());
    let registry = Arc::new(OrchestrationLinkRegistry::new());
    let (events, rx) = EventEmitter::channel();
    let spawner = ChildRunSpawner::new(gateway.clone(), registry.clone()).with_events(events);
    let parent = RunId::new("orchestrator");

    let child = spawner
        .spawn_child(
            &CreateRunRequest::new("write the migration"),
            Some(&parent),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(registry.lookup_parent(&child.run_id), Some(parent.clone()));
    assert_eq!(gateway.created().len(), 1);
    assert_eq!(
        rx.try_recv().unwrap(),
        OrchestratorEvent::RunSpawned {
            run_id: child.run_id,
            role: RunRole::Child,
            batch_id: None,
            parent_run_id: Some(parent),
        }
    );
}

#[tokio::test]
async fn child_without_parent_is_untracked() {
    let gateway = Arc::new(ScriptedGateway::new());
    let registry = Arc::new(OrchestrationLinkRegistry::new());
    let spawner = ChildRunSpawner::new(gateway, registry.clone());

    spawner
        .spawn_child(
            &CreateRunRequest::new("standalone"),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(registry.is_empty());
}

#[tokio::test]
async fn create_failure_leaves_no_link() {
    let gateway = Arc::new(
        ScriptedGateway::new().fail_create(0, ClassifiedError::new(ErrorKind::Auth, "bad token")),
    );
    let registry = Arc::new(OrchestrationLinkRegistry::new());
    let spawner = ChildRunSpawner::new(gateway, registry.clone());
    // Scripted create failures are keyed by batch index.
    let mut request = CreateRunRequest::new("task");
    request
        .metadata
        .insert("batch_index".to_string(), serde_json::Value::from(0));

    let err = spawner
        .spawn_child(&request, Some(&RunId::new("p")), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_matches!(err, OrchestratorErr::Remote(_));
    assert!(registry.is_empty());
}
