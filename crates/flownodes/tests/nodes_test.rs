use flowcore::{
    EventBus, ExecutionEvent, ExecutionStatus, FlowError, NodeContext, NodeError, NodeSpec,
    PortData, SkipReason, Value, Workflow, WorkflowError, MAIN_PORT,
};
use flownodes::{standard_registry, FALSE_PORT, TRUE_PORT};
use flowruntime::{FlowRuntime, RuntimeConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn context(bus: &EventBus, node_type: &str, items: Vec<Value>) -> NodeContext {
    let mut ctx = NodeContext::new(
        "exec".to_string(),
        "node",
        node_type,
        bus.create_emitter("exec".to_string(), "node".to_string()),
    );
    let mut inputs = PortData::new();
    inputs.insert(MAIN_PORT.to_string(), items);
    ctx.inputs = inputs;
    ctx
}

fn config(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn object(pairs: &[(&str, Value)]) -> Value {
    Value::Object(config(pairs))
}

#[tokio::test]
async fn test_if_routes_items_by_field() {
    let bus = EventBus::new(16);
    let node = standard_registry()
        .create_node("logic.if", &config(&[("field", Value::from("active"))]))
        .unwrap();

    let yes = object(&[("active", Value::from(true))]);
    let no = object(&[("active", Value::from(false))]);
    let missing = object(&[]);
    let output = node
        .execute(context(&bus, "logic.if", vec![yes.clone(), no.clone(), missing.clone()]))
        .await
        .unwrap();

    assert_eq!(output.outputs[TRUE_PORT], vec![yes]);
    assert_eq!(output.outputs[FALSE_PORT], vec![no, missing]);
}

#[tokio::test]
async fn test_if_only_fires_ports_with_items() {
    let bus = EventBus::new(16);
    let node = standard_registry()
        .create_node("logic.if", &config(&[("equals", Value::from("go"))]))
        .unwrap();

    let output = node
        .execute(context(&bus, "logic.if", vec![Value::from("go")]))
        .await
        .unwrap();
    let fired: Vec<&str> = output.fired_ports().collect();
    assert_eq!(fired, vec![TRUE_PORT]);
    assert!(!output.outputs.contains_key(FALSE_PORT));
}

#[test]
fn test_if_rejects_non_string_field() {
    let result = standard_registry().create_node("logic.if", &config(&[("field", Value::from(3i64))]));
    assert!(result.is_err());
}

#[tokio::test]
async fn test_json_parse_reads_strings_and_fields() {
    let bus = EventBus::new(16);
    let registry = standard_registry();
    let node = registry
        .create_node("transform.json_parse", &HashMap::new())
        .unwrap();

    let items = vec![
        Value::from(r#"{"a": 1}"#),
        object(&[("json", Value::from("[true]"))]),
    ];
    let output = node
        .execute(context(&bus, "transform.json_parse", items))
        .await
        .unwrap();
    assert_eq!(
        output.outputs[MAIN_PORT],
        vec![
            object(&[("a", Value::from(1i64))]),
            Value::Array(vec![Value::from(true)])
        ]
    );

    let err = node
        .execute(context(
            &bus,
            "transform.json_parse",
            vec![object(&[("json", Value::from(5i64))])],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::InvalidInputType { ref actual, .. } if actual == "number"));

    let err = node
        .execute(context(&bus, "transform.json_parse", vec![Value::from("{oops")]))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ExecutionFailed(_)));

    let err = node
        .execute(context(&bus, "transform.json_parse", Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::MissingInput(_)));
}

#[tokio::test]
async fn test_json_stringify_renders_items() {
    let bus = EventBus::new(16);
    let node = standard_registry()
        .create_node("transform.json_stringify", &HashMap::new())
        .unwrap();

    let output = node
        .execute(context(
            &bus,
            "transform.json_stringify",
            vec![object(&[("n", Value::from(2.5))])],
        ))
        .await
        .unwrap();
    assert_eq!(output.outputs[MAIN_PORT], vec![Value::from(r#"{"n":2.5}"#)]);
}

#[tokio::test]
async fn test_delay_passes_items_and_observes_cancellation() {
    let bus = EventBus::new(16);
    let registry = standard_registry();

    let quick = registry
        .create_node("time.delay", &config(&[("delay_ms", Value::from(5i64))]))
        .unwrap();
    let output = quick
        .execute(context(&bus, "time.delay", vec![Value::from("x")]))
        .await
        .unwrap();
    assert_eq!(output.outputs[MAIN_PORT], vec![Value::from("x")]);

    let slow = registry
        .create_node("time.delay", &config(&[("delay_ms", Value::from(60_000i64))]))
        .unwrap();
    let ctx = context(&bus, "time.delay", Vec::new());
    let token = ctx.cancellation.clone();
    let task = tokio::spawn(async move { slow.execute(ctx).await });
    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("delay stops on cancel")
        .unwrap();
    assert!(matches!(result, Err(NodeError::Cancelled)));
}

#[test]
fn test_delay_config_validation() {
    let registry = standard_registry();
    let node = registry.create_node("time.delay", &HashMap::new()).unwrap();
    assert!(node
        .validate_config(&config(&[("delay_ms", Value::from(-1i64))]))
        .is_err());
    assert!(node
        .validate_config(&config(&[("delay_ms", Value::from("soon"))]))
        .is_err());
    assert!(node
        .validate_config(&config(&[("delay_ms", Value::from(10i64))]))
        .is_ok());
}

#[tokio::test]
async fn test_manual_trigger_forwards_or_emits_empty_object() {
    let bus = EventBus::new(16);
    let node = standard_registry()
        .create_node("trigger.manual", &HashMap::new())
        .unwrap();

    let output = node
        .execute(context(&bus, "trigger.manual", Vec::new()))
        .await
        .unwrap();
    assert_eq!(output.outputs[MAIN_PORT], vec![object(&[])]);

    let output = node
        .execute(context(&bus, "trigger.manual", vec![Value::from(1i64)]))
        .await
        .unwrap();
    assert_eq!(output.outputs[MAIN_PORT], vec![Value::from(1i64)]);
}

#[tokio::test]
async fn test_debug_node_reports_through_events() {
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let node = standard_registry()
        .create_node("debug.log", &HashMap::new())
        .unwrap();

    let mut ctx = context(&bus, "debug.log", vec![Value::from("seen")]);
    ctx.config = config(&[("label", Value::from("probe"))]);
    let output = node.execute(ctx).await.unwrap();

    assert_eq!(output.outputs[MAIN_PORT], vec![Value::from("seen")]);
    match events.recv().await.unwrap() {
        ExecutionEvent::NodeEvent { event, .. } => {
            let rendered = serde_json::to_string(&event).unwrap();
            assert!(rendered.contains("probe"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_standard_registry_lists_every_node() {
    let registry = standard_registry();
    assert_eq!(
        registry.list_node_types(),
        vec![
            "debug.log",
            "logic.if",
            "time.delay",
            "transform.json_parse",
            "transform.json_stringify",
            "trigger.manual",
        ]
    );
    let metadata = registry.get_metadata("logic.if").unwrap();
    let ports: Vec<&str> = metadata.outputs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(ports, vec![TRUE_PORT, FALSE_PORT]);
}

fn branching_workflow() -> Workflow {
    let mut wf = Workflow::new("branching");
    wf.add_node(NodeSpec::new("start", "trigger.manual"));
    wf.add_node(NodeSpec::new("check", "logic.if").with_config("field", "active"));
    wf.add_node(NodeSpec::new("active", "debug.log"));
    wf.add_node(NodeSpec::new("inactive", "debug.log"));
    wf.add_node(NodeSpec::new("render", "transform.json_stringify"));
    wf.connect_main("start", "check");
    wf.connect("check", TRUE_PORT, "active", MAIN_PORT);
    wf.connect("check", FALSE_PORT, "inactive", MAIN_PORT);
    wf.connect_main("inactive", "render");
    wf
}

#[tokio::test]
async fn test_branching_workflow_end_to_end() {
    let runtime = FlowRuntime::with_registry(Arc::new(standard_registry()), RuntimeConfig::default());
    let id = runtime.register_workflow(branching_workflow()).await.unwrap();

    let data = Value::from(serde_json::json!([
        {"name": "a", "active": true},
        {"name": "b", "active": true}
    ]));
    let result = runtime.execute_from_trigger(id, "start", data).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.output("active", MAIN_PORT).len(), 2);
    assert_eq!(result.skip_reason("inactive"), Some(SkipReason::BranchNotTaken));
    assert_eq!(result.skip_reason("render"), Some(SkipReason::BranchNotTaken));
}

#[tokio::test]
async fn test_registration_validates_node_parameters() {
    let runtime = FlowRuntime::with_registry(Arc::new(standard_registry()), RuntimeConfig::default());

    let mut wf = Workflow::new("bad delay");
    wf.add_node(NodeSpec::new("start", "trigger.manual"));
    wf.add_node(NodeSpec::new("wait", "time.delay").with_config("delay_ms", -5i64));
    wf.connect_main("start", "wait");

    assert!(matches!(
        runtime.register_workflow(wf).await,
        Err(FlowError::Workflow(WorkflowError::Invalid(_)))
    ));
}
