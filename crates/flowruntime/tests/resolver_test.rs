mod common;

use common::{graph, node, trigger, workflow};
use flowcore::{Connection, FlowErrorKind, MAIN_PORT};
use flowruntime::{
    detect_circular_dependencies, get_executable_nodes, validate_execution_path,
    DependencyResolver,
};
use std::collections::HashSet;

fn set(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

fn main_conn(from: &str, to: &str) -> Connection {
    Connection {
        from_node: from.to_string(),
        from_port: MAIN_PORT.to_string(),
        to_node: to.to_string(),
        to_port: MAIN_PORT.to_string(),
    }
}

#[test]
fn test_three_node_loop_is_reported_once() {
    let wf = workflow(
        vec![node("A"), node("B"), node("C")],
        &[("A", "B"), ("B", "C"), ("C", "A")],
    );
    let graph = graph(&wf);
    let resolver = DependencyResolver::new(&graph);

    let cycles = resolver.detect_circular_dependencies();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].cycle.len(), 3);
    for id in ["A", "B", "C"] {
        assert!(cycles[0].contains(id));
    }
    assert!(resolver.has_cycle());
    assert!(resolver.topological_order().is_err());
}

#[test]
fn test_two_node_loop_makes_workflow_invalid() {
    let wf = workflow(
        vec![trigger("T"), node("A"), node("B")],
        &[("T", "A"), ("A", "B"), ("B", "A")],
    );
    let result = validate_execution_path(&wf.nodes, &wf.connections);

    assert!(!result.is_valid);
    assert_eq!(result.circular_dependencies.len(), 1);
    let issue = result
        .errors
        .iter()
        .find(|e| e.kind == FlowErrorKind::CircularDependency)
        .expect("cycle error");
    assert!(issue.message.contains("->"));
    assert!(!issue.suggested_resolution.is_empty());
    assert_eq!(
        issue.node_ids.iter().cloned().collect::<HashSet<_>>(),
        set(&["A", "B"])
    );
}

#[test]
fn test_dag_has_no_cycles_and_a_topological_order() {
    let wf = workflow(
        vec![trigger("T"), node("A"), node("B"), node("C")],
        &[("T", "A"), ("T", "B"), ("A", "C"), ("B", "C")],
    );
    let graph = graph(&wf);
    let resolver = DependencyResolver::new(&graph);

    assert!(resolver.detect_circular_dependencies().is_empty());
    let order = resolver.topological_order().unwrap();
    let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
    assert!(pos("T") < pos("A"));
    assert!(pos("A") < pos("C"));
    assert!(pos("B") < pos("C"));

    let result = resolver.validate_execution_path();
    assert!(result.is_valid);
    assert!(result.warnings.is_empty());
}

#[test]
fn test_orphaned_and_unreachable_nodes_are_warnings() {
    let wf = workflow(
        vec![trigger("T"), node("A"), node("lonely"), node("X"), node("Y")],
        &[("T", "A"), ("X", "Y")],
    );
    let result = validate_execution_path(&wf.nodes, &wf.connections);

    assert!(result.is_valid);
    assert_eq!(result.orphaned_nodes, vec!["lonely".to_string()]);
    assert_eq!(
        result.unreachable_nodes.iter().cloned().collect::<HashSet<_>>(),
        set(&["X", "Y"])
    );
    assert_eq!(result.warnings.len(), 2);
}

#[test]
fn test_connection_to_unknown_node_is_missing_dependency() {
    let nodes = vec![trigger("T")];
    let connections = vec![main_conn("T", "ghost")];
    let result = validate_execution_path(&nodes, &connections);

    assert!(!result.is_valid);
    assert_eq!(result.errors[0].kind, FlowErrorKind::MissingDependency);
    assert_eq!(result.errors[0].node_ids, vec!["ghost".to_string()]);
}

#[test]
fn test_duplicate_ids_are_reported() {
    let nodes = vec![trigger("T"), node("A"), node("A")];
    let connections = vec![main_conn("T", "A")];
    let result = validate_execution_path(&nodes, &connections);

    assert!(result
        .warnings
        .iter()
        .any(|w| w.node_ids == vec!["A".to_string()]));
}

#[test]
fn test_fan_in_is_executable_only_after_every_dependency() {
    let wf = workflow(
        vec![trigger("T"), node("A"), node("B"), node("J")],
        &[("T", "A"), ("T", "B"), ("A", "J"), ("B", "J")],
    );
    let graph = graph(&wf);
    let resolver = DependencyResolver::new(&graph);
    let candidates = set(&["A", "B", "J"]);

    assert_eq!(
        resolver.get_executable_nodes(&candidates, &set(&["T"])),
        set(&["A", "B"])
    );
    assert_eq!(
        resolver.get_executable_nodes(&set(&["J"]), &set(&["T", "A"])),
        HashSet::new()
    );
    assert_eq!(
        resolver.get_executable_nodes(&set(&["J"]), &set(&["T", "A", "B"])),
        set(&["J"])
    );
    assert_eq!(resolver.get_dependencies("J"), set(&["A", "B"]));
}

#[test]
fn test_disabled_nodes_are_never_executable() {
    let wf = workflow(
        vec![trigger("T"), node("A").disabled()],
        &[("T", "A")],
    );
    let executable = get_executable_nodes(&wf.nodes, &wf.connections, &set(&["T"]));
    assert!(executable.is_empty());
}

#[test]
fn test_triggered_downstream_follows_fired_ports() {
    let mut wf = workflow(vec![node("IF"), node("Y"), node("N")], &[]);
    wf.connect("IF", "true", "Y", MAIN_PORT);
    wf.connect("IF", "false", "N", MAIN_PORT);
    let graph = graph(&wf);
    let resolver = DependencyResolver::new(&graph);

    assert_eq!(resolver.get_downstream_nodes("IF"), set(&["Y", "N"]));
    assert_eq!(
        resolver.get_triggered_downstream("IF", &set(&["true"])),
        set(&["Y"])
    );
    assert!(resolver
        .get_triggered_downstream("IF", &HashSet::new())
        .is_empty());
}

#[test]
fn test_downstream_closure_includes_start() {
    let wf = workflow(
        vec![trigger("T"), node("A"), node("B"), node("C")],
        &[("T", "A"), ("A", "B"), ("T", "C")],
    );
    let graph = graph(&wf);
    let resolver = DependencyResolver::new(&graph);

    assert_eq!(resolver.get_downstream_closure("A"), set(&["A", "B"]));
    assert_eq!(resolver.entry_points(), vec!["T".to_string()]);
}

#[test]
fn test_cycle_detection_over_bare_connections() {
    let connections = vec![main_conn("A", "B"), main_conn("B", "A"), main_conn("B", "C")];
    let cycles = detect_circular_dependencies(&connections);
    assert_eq!(cycles.len(), 1);
    assert!(cycles[0].describe().starts_with(&cycles[0].cycle[0]));
    assert!(detect_circular_dependencies(&[main_conn("A", "B")]).is_empty());
}
