use flowcore::{
    ErrorHandling, EventBus, ExecutionError, ExecutionEvent, ExecutionStatus, FlowError,
    FlowErrorKind, NodeError, NodeEvent, NodeExecutionStatus, NodeOutput, NodeSpec, RetryPolicy,
    SkipReason, Value, Workflow, WorkflowError, MAIN_PORT,
};
use std::time::Duration;

#[tokio::test]
async fn test_event_bus_fans_out_to_every_subscriber() {
    let bus = EventBus::new(16);
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();

    let emitter = bus.create_emitter("exec-1".to_string(), "node-1".to_string());
    emitter.info("hello");
    emitter.progress(50.0, Some("half".to_string()));

    for rx in [&mut first, &mut second] {
        match rx.recv().await.unwrap() {
            ExecutionEvent::NodeEvent {
                execution_id,
                node_id,
                event: NodeEvent::Info { message },
                ..
            } => {
                assert_eq!(execution_id, "exec-1");
                assert_eq!(node_id, "node-1");
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            ExecutionEvent::NodeEvent {
                event: NodeEvent::Progress { .. },
                ..
            }
        ));
    }
}

#[test]
fn test_emit_without_subscribers_is_dropped() {
    let bus = EventBus::new(4);
    bus.emit(ExecutionEvent::ExecutionFinished {
        execution_id: "gone".to_string(),
        status: ExecutionStatus::Completed,
        duration_ms: 1,
        timestamp: chrono::Utc::now(),
    });
}

#[test]
fn test_events_serialize_with_type_tag() {
    let event = ExecutionEvent::NodeStatusChanged {
        execution_id: "e".to_string(),
        node_id: "n".to_string(),
        status: NodeExecutionStatus::Skipped,
        timestamp: chrono::Utc::now(),
        data: None,
        error: None,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "NodeStatusChanged");
    assert_eq!(json["status"], "skipped");
    assert!(json.get("error").is_none());
    assert_eq!(event.execution_id(), "e");
}

#[test]
fn test_values_read_plain_json() {
    let value: Value =
        serde_json::from_str(r#"{"name": "a", "count": 2, "tags": ["x"], "ok": true, "none": null}"#)
            .unwrap();

    assert_eq!(value.get("name").and_then(Value::as_str), Some("a"));
    assert_eq!(value.get("count").and_then(Value::as_f64), Some(2.0));
    assert_eq!(value.get("ok").and_then(Value::as_bool), Some(true));
    assert!(value.get("none").unwrap().is_null());
    assert_eq!(
        value.get("tags"),
        Some(&Value::Array(vec![Value::from("x")]))
    );

    let json = serde_json::json!({"nested": {"n": 1.5}});
    assert_eq!(Value::from(json.clone()).to_json(), json);
    assert_eq!(Value::Number(f64::NAN).to_json(), serde_json::Value::Null);
}

#[test]
fn test_truthiness() {
    assert!(!Value::Null.is_truthy());
    assert!(!Value::from(0i64).is_truthy());
    assert!(!Value::from("").is_truthy());
    assert!(!Value::Array(Vec::new()).is_truthy());
    assert!(Value::from("no").is_truthy());
    assert!(Value::from(true).is_truthy());
}

#[test]
fn test_error_kinds_use_screaming_snake_case() {
    assert_eq!(
        serde_json::to_value(FlowErrorKind::ConcurrentExecutionConflict).unwrap(),
        "CONCURRENT_EXECUTION_CONFLICT"
    );
    assert_eq!(FlowErrorKind::ExecutionTimeout.to_string(), "EXECUTION_TIMEOUT");

    let error = ExecutionError::new(FlowErrorKind::NodeExecutionFailed, "boom").with_node("A");
    assert_eq!(error.to_string(), "[NODE_EXECUTION_FAILED] A: boom");
    assert_eq!(
        error.suggested_resolution,
        FlowErrorKind::NodeExecutionFailed.suggested_resolution()
    );
}

#[test]
fn test_flow_errors_map_onto_the_taxonomy() {
    let timeout = FlowError::Node(NodeError::Timeout { millis: 10 });
    assert_eq!(timeout.kind(), Some(FlowErrorKind::ExecutionTimeout));

    let cycle = FlowError::Workflow(WorkflowError::CyclicDependency {
        cycle: vec!["A".to_string(), "B".to_string()],
    });
    assert_eq!(cycle.kind(), Some(FlowErrorKind::CircularDependency));
    assert_eq!(
        ExecutionError::from_flow_error(&cycle).kind,
        FlowErrorKind::CircularDependency
    );

    let state = FlowError::InvalidFlowState {
        execution_id: "e".to_string(),
        status: ExecutionStatus::Completed,
        operation: "pause",
    };
    assert_eq!(state.kind(), Some(FlowErrorKind::InvalidFlowState));
    assert_eq!(
        state.to_string(),
        "Cannot pause execution e while it is completed"
    );

    let store = FlowError::Store("disk full".to_string());
    assert_eq!(store.kind(), None);
    assert_eq!(
        ExecutionError::from_flow_error(&store).kind,
        FlowErrorKind::NodeExecutionFailed
    );
}

#[test]
fn test_status_helpers() {
    assert!(ExecutionStatus::Paused.is_active());
    assert!(!ExecutionStatus::Paused.is_terminal());
    assert!(ExecutionStatus::Partial.is_terminal());
    assert!(NodeExecutionStatus::Skipped.is_settled());
    assert!(!NodeExecutionStatus::Running.is_settled());

    assert!(SkipReason::BranchNotTaken.satisfies_dependents());
    assert!(SkipReason::Disabled.satisfies_dependents());
    assert!(!SkipReason::UpstreamFailed.satisfies_dependents());
    assert!(!SkipReason::WorkflowStopped.satisfies_dependents());
}

#[test]
fn test_retry_delay_backs_off() {
    let policy = RetryPolicy {
        max_attempts: 4,
        delay_ms: 100,
        backoff_multiplier: 2.0,
    };
    assert_eq!(policy.delay_after(1), Duration::from_millis(100));
    assert_eq!(policy.delay_after(2), Duration::from_millis(200));
    assert_eq!(policy.delay_after(3), Duration::from_millis(400));
}

#[test]
fn test_workflow_json_round_trip_keeps_settings_defaults() {
    let json = r#"{
        "id": "6f1c7c1e-3f55-4a87-9a38-6a1f1b1f9e01",
        "name": "from json",
        "nodes": [
            {"id": "start", "node_type": "trigger.manual"},
            {"id": "check", "node_type": "logic.if", "config": {"field": "active"}}
        ],
        "connections": [
            {"from_node": "start", "from_port": "main", "to_node": "check", "to_port": "main"}
        ]
    }"#;
    let workflow: Workflow = serde_json::from_str(json).unwrap();

    assert_eq!(workflow.settings.on_error, ErrorHandling::ContainBranch);
    assert!(workflow.nodes[0].is_trigger());
    assert!(!workflow.nodes[1].is_trigger());
    assert_eq!(
        workflow.find_node("check").unwrap().config["field"],
        Value::from("active")
    );
}

#[test]
fn test_node_output_fired_ports() {
    let output = NodeOutput::new()
        .with_output("true", 1i64)
        .with_items("false", Vec::new())
        .with_output(MAIN_PORT, "x");
    let mut fired: Vec<&str> = output.fired_ports().collect();
    fired.sort();
    assert_eq!(fired, vec!["main", "true"]);

    let spec = NodeSpec::new("a", "test").with_retry(3, 10).disabled();
    assert!(spec.disabled);
    assert_eq!(spec.retry_policy.unwrap().max_attempts, 3);
}
