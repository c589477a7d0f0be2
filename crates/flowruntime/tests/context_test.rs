use flowcore::{
    EventBus, ExecutionError, ExecutionEvent, ExecutionStatus, FlowError, FlowErrorKind,
    NodeExecutionStatus, PortData, SkipReason, Value, WorkflowId, MAIN_PORT,
};
use flowruntime::{
    DurationHistory, ExecutionContextManager, ExecutionStore, InMemoryExecutionStore, Transition,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn manager() -> ExecutionContextManager {
    ExecutionContextManager::new(Arc::new(EventBus::new(256)))
}

fn nodes(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn output(item: &str) -> PortData {
    let mut data = PortData::new();
    data.insert(MAIN_PORT.to_string(), vec![Value::from(item)]);
    data
}

async fn run_node(manager: &ExecutionContextManager, execution_id: &str, node_id: &str) {
    manager.set_node_queued(execution_id, node_id).await.unwrap();
    manager.set_node_running(execution_id, node_id).await.unwrap();
}

#[tokio::test]
async fn test_contexts_are_isolated() {
    let manager = manager();
    let wf = WorkflowId::new_v4();
    manager
        .start_execution("e1", wf, "T1", nodes(&["T1", "S"]))
        .await
        .unwrap();
    manager
        .start_execution("e2", wf, "T2", nodes(&["T2", "S"]))
        .await
        .unwrap();

    run_node(&manager, "e1", "S").await;
    manager
        .set_node_completed("e1", "S", output("one"), 5, 1)
        .await
        .unwrap();

    assert_eq!(
        manager.node_status("e1", "S").await,
        Some(NodeExecutionStatus::Completed)
    );
    assert_eq!(
        manager.node_status("e2", "S").await,
        Some(NodeExecutionStatus::Idle)
    );
    assert_eq!(
        manager.executions_for_node("S").await,
        vec!["e1".to_string(), "e2".to_string()]
    );
    assert_eq!(manager.len().await, 2);
}

#[tokio::test]
async fn test_invalid_transitions_are_rejected() {
    let manager = manager();
    manager
        .start_execution("e1", WorkflowId::nil(), "T", nodes(&["T", "A"]))
        .await
        .unwrap();

    let err = manager
        .set_node_completed("e1", "A", PortData::new(), 0, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::InvalidNodeTransition {
            from: NodeExecutionStatus::Idle,
            to: NodeExecutionStatus::Completed,
            ..
        }
    ));

    assert!(manager.set_node_queued("e1", "outsider").await.is_err());
    assert!(matches!(
        manager.set_node_queued("nope", "A").await,
        Err(FlowError::ExecutionNotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_clears_active_sets_and_discards_late_results() {
    let manager = manager();
    manager
        .start_execution("e1", WorkflowId::nil(), "T", nodes(&["T", "A", "B"]))
        .await
        .unwrap();
    run_node(&manager, "e1", "A").await;
    manager.set_node_queued("e1", "B").await.unwrap();
    let token = manager.cancellation_token("e1").await.unwrap();

    let reason = ExecutionError::new(FlowErrorKind::ExecutionTimeout, "too slow");
    assert!(manager.cancel_execution("e1", Some(reason)).await.unwrap());
    assert!(!manager.cancel_execution("e1", None).await.unwrap());
    assert!(token.is_cancelled());

    assert_eq!(
        manager.node_status("e1", "A").await,
        Some(NodeExecutionStatus::Idle)
    );
    assert_eq!(
        manager.node_status("e1", "B").await,
        Some(NodeExecutionStatus::Idle)
    );
    assert_eq!(
        manager.status("e1").await,
        Some(ExecutionStatus::Cancelled)
    );

    let late = manager
        .set_node_completed("e1", "A", output("late"), 10, 1)
        .await
        .unwrap();
    assert_eq!(late, Transition::Discarded);
    let errors = manager.read("e1", |ctx| ctx.errors().to_vec()).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, FlowErrorKind::ExecutionTimeout);
}

#[tokio::test]
async fn test_pause_and_resume_follow_status_rules() {
    let manager = manager();
    manager
        .start_execution("e1", WorkflowId::nil(), "T", nodes(&["T"]))
        .await
        .unwrap();
    let mut status = manager.watch_status("e1").await.unwrap();

    assert!(matches!(
        manager.resume_execution("e1").await,
        Err(FlowError::InvalidFlowState { operation: "resume", .. })
    ));
    manager.pause_execution("e1").await.unwrap();
    assert_eq!(*status.borrow_and_update(), ExecutionStatus::Paused);
    manager.resume_execution("e1").await.unwrap();
    assert_eq!(*status.borrow_and_update(), ExecutionStatus::Running);

    manager
        .finish_execution("e1", ExecutionStatus::Completed)
        .await
        .unwrap();
    assert!(matches!(
        manager.pause_execution("e1").await,
        Err(FlowError::InvalidFlowState {
            status: ExecutionStatus::Completed,
            ..
        })
    ));
    assert_eq!(
        manager
            .finish_execution("e1", ExecutionStatus::Failed)
            .await
            .unwrap(),
        Transition::Discarded
    );
}

#[tokio::test]
async fn test_skip_pending_leaves_running_nodes_alone() {
    let manager = manager();
    manager
        .start_execution("e1", WorkflowId::nil(), "T", nodes(&["T", "A", "B", "C"]))
        .await
        .unwrap();
    run_node(&manager, "e1", "A").await;
    manager.set_node_queued("e1", "B").await.unwrap();

    let skipped = manager
        .skip_pending("e1", SkipReason::WorkflowStopped)
        .await
        .unwrap();
    assert_eq!(skipped, vec!["B".to_string(), "C".to_string(), "T".to_string()]);
    assert_eq!(
        manager.node_status("e1", "A").await,
        Some(NodeExecutionStatus::Running)
    );
    let reason = manager
        .read("e1", |ctx| ctx.node_result("B").and_then(|r| r.skip_reason))
        .await
        .flatten();
    assert_eq!(reason, Some(SkipReason::WorkflowStopped));
}

#[tokio::test]
async fn test_clear_execution_only_drops_finished_contexts() {
    let manager = manager();
    manager
        .start_execution("e1", WorkflowId::nil(), "T", nodes(&["T", "S"]))
        .await
        .unwrap();

    assert!(!manager.clear_execution("e1").await);
    assert_eq!(manager.active_executions().await, vec!["e1".to_string()]);

    manager
        .finish_execution("e1", ExecutionStatus::Completed)
        .await
        .unwrap();
    assert!(manager.active_executions().await.is_empty());
    assert!(manager.clear_execution("e1").await);
    assert!(!manager.contains("e1").await);
    assert!(manager.executions_for_node("S").await.is_empty());
    assert!(manager.is_empty().await);
    assert!(!manager.clear_execution("e1").await);
}

#[tokio::test]
async fn test_clear_inactive_executions_respects_age() {
    let manager = manager();
    manager
        .start_execution("done", WorkflowId::nil(), "T", nodes(&["T"]))
        .await
        .unwrap();
    manager
        .start_execution("live", WorkflowId::nil(), "T", nodes(&["T"]))
        .await
        .unwrap();
    manager
        .finish_execution("done", ExecutionStatus::Completed)
        .await
        .unwrap();

    assert_eq!(
        manager
            .clear_inactive_executions(Duration::from_secs(3600))
            .await,
        0
    );
    assert_eq!(manager.clear_inactive_executions(Duration::ZERO).await, 1);
    assert!(manager.contains("live").await);
    assert!(!manager.contains("done").await);
}

#[tokio::test]
async fn test_assigned_id_resolves_alongside_the_original() {
    let manager = manager();
    manager
        .start_execution("local-1", WorkflowId::nil(), "T", nodes(&["T"]))
        .await
        .unwrap();
    manager
        .assign_execution_id("local-1", "server-42")
        .await
        .unwrap();

    assert!(manager.contains("local-1").await);
    assert!(manager.contains("server-42").await);
    let id = manager
        .read("local-1", |ctx| ctx.execution_id().clone())
        .await
        .unwrap();
    assert_eq!(id, "server-42");

    manager
        .start_execution("other", WorkflowId::nil(), "T", nodes(&["T"]))
        .await
        .unwrap();
    assert!(manager
        .assign_execution_id("other", "server-42")
        .await
        .is_err());
}

#[tokio::test]
async fn test_current_execution_focus() {
    let manager = manager();
    manager
        .start_execution("e1", WorkflowId::nil(), "T", nodes(&["T", "A"]))
        .await
        .unwrap();
    manager
        .start_execution("e2", WorkflowId::nil(), "T", nodes(&["T", "A"]))
        .await
        .unwrap();
    run_node(&manager, "e2", "A").await;

    assert!(!manager.is_node_executing_in_current("A").await);
    manager.set_current_execution(Some("e1")).await.unwrap();
    assert_eq!(manager.current_execution().await, Some("e1".to_string()));
    assert!(!manager.is_node_executing_in_current("A").await);
    assert!(manager.is_node_executing_in("e2", "A").await);

    manager.set_current_execution(Some("e2")).await.unwrap();
    assert!(manager.is_node_executing_in_current("A").await);

    // a paused execution is not executing anything
    manager.pause_execution("e2").await.unwrap();
    assert!(!manager.is_node_executing_in_current("A").await);

    manager.set_current_execution(None).await.unwrap();
    assert_eq!(manager.current_execution().await, None);
    assert!(manager.set_current_execution(Some("nope")).await.is_err());
}

#[tokio::test]
async fn test_conflicts_only_count_busy_nodes() {
    let manager = manager();
    manager
        .start_execution("e1", WorkflowId::nil(), "T1", nodes(&["T1", "S"]))
        .await
        .unwrap();

    assert_eq!(manager.find_conflict(&nodes(&["S"])).await, None);
    run_node(&manager, "e1", "S").await;
    assert_eq!(
        manager.find_conflict(&nodes(&["T2", "S"])).await,
        Some(("S".to_string(), "e1".to_string()))
    );
}

#[tokio::test]
async fn test_transitions_emit_events() {
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();
    let manager = ExecutionContextManager::new(bus);
    manager
        .start_execution("e1", WorkflowId::nil(), "T", nodes(&["T"]))
        .await
        .unwrap();
    run_node(&manager, "e1", "T").await;
    manager
        .set_node_failed(
            "e1",
            "T",
            ExecutionError::new(FlowErrorKind::NodeExecutionFailed, "broken"),
            3,
            1,
        )
        .await
        .unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        ExecutionEvent::ExecutionStarted { affected_nodes: 1, .. }
    ));
    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    match last {
        Some(ExecutionEvent::NodeStatusChanged { status, error, .. }) => {
            assert_eq!(status, NodeExecutionStatus::Failed);
            assert_eq!(error.as_deref(), Some("broken"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_snapshot_restores_interrupted_nodes_as_queued() {
    let manager = manager();
    manager
        .start_execution("e1", WorkflowId::nil(), "T", nodes(&["T", "A", "B"]))
        .await
        .unwrap();
    run_node(&manager, "e1", "T").await;
    manager
        .set_node_completed("e1", "T", output("seed"), 0, 1)
        .await
        .unwrap();
    run_node(&manager, "e1", "A").await;

    let store = InMemoryExecutionStore::new();
    let snapshot = manager.snapshot("e1").await.unwrap();
    store.save(&snapshot).await.unwrap();
    assert_eq!(store.list_recoverable().await.unwrap().len(), 1);

    let json = serde_json::to_string(&snapshot).unwrap();
    let restored: flowruntime::ExecutionSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.running, vec!["A".to_string()]);

    let other = ExecutionContextManager::new(Arc::new(EventBus::new(16)));
    other.restore_execution(restored).await.unwrap();
    assert_eq!(
        other.node_status("e1", "A").await,
        Some(NodeExecutionStatus::Queued)
    );
    assert_eq!(
        other.node_status("e1", "T").await,
        Some(NodeExecutionStatus::Completed)
    );
    assert_eq!(
        other
            .read("e1", |ctx| ctx.execution_path().to_vec())
            .await
            .unwrap(),
        vec!["T".to_string()]
    );

    manager
        .finish_execution("e1", ExecutionStatus::Failed)
        .await
        .unwrap();
    store
        .save(&manager.snapshot("e1").await.unwrap())
        .await
        .unwrap();
    assert!(store.list_recoverable().await.unwrap().is_empty());
    store.remove("e1").await.unwrap();
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_duration_history_estimates() {
    let history = DurationHistory::with_window(2);
    let wf = WorkflowId::new_v4();
    let a = "A".to_string();
    let b = "B".to_string();

    assert_eq!(history.estimate_remaining_ms(wf, [&a]).await, None);
    assert_eq!(history.estimate_remaining_ms(wf, Vec::<&String>::new()).await, Some(0));

    history.record(wf, "A", 100).await;
    history.record(wf, "A", 200).await;
    history.record(wf, "A", 300).await;
    // only the last two samples count
    assert_eq!(history.average_ms(wf, "A").await, Some(250.0));

    // unknown nodes cost the mean of the known ones
    assert_eq!(history.estimate_remaining_ms(wf, [&a, &b]).await, Some(500));
    assert_eq!(
        history
            .estimate_remaining_ms(WorkflowId::new_v4(), [&a])
            .await,
        None
    );
}
