//! Dependency analysis over a [`WorkflowGraph`].
//!
//! Everything here is pure: the resolver borrows a graph snapshot and never
//! mutates it. Structural questions (dependencies, cycles, reachability)
//! consider every connection; [`DependencyResolver::get_triggered_downstream`]
//! is the port-aware variant used for cascading after a node ran.

use crate::graph::WorkflowGraph;
use flowcore::{Connection, FlowErrorKind, NodeId, NodeSpec, WorkflowError};
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One directed loop, listed in edge order (`cycle[i] -> cycle[i + 1]`,
/// last back to first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircularDependency {
    pub cycle: Vec<NodeId>,
    pub severity: Severity,
}

impl CircularDependency {
    pub fn contains(&self, node_id: &str) -> bool {
        self.cycle.iter().any(|n| n == node_id)
    }

    pub fn describe(&self) -> String {
        let mut path = self.cycle.clone();
        if let Some(first) = self.cycle.first() {
            path.push(first.clone());
        }
        path.join(" -> ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: FlowErrorKind,
    pub message: String,
    pub node_ids: Vec<NodeId>,
    pub suggested_resolution: String,
}

impl ValidationIssue {
    fn new(kind: FlowErrorKind, message: String, node_ids: Vec<NodeId>) -> Self {
        Self {
            kind,
            message,
            node_ids,
            suggested_resolution: kind.suggested_resolution().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub message: String,
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationWarning>,
    pub circular_dependencies: Vec<CircularDependency>,
    pub unreachable_nodes: Vec<NodeId>,
    pub orphaned_nodes: Vec<NodeId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

struct Frame {
    node: NodeIndex,
    successors: Vec<NodeIndex>,
    next: usize,
}

pub struct DependencyResolver<'g> {
    graph: &'g WorkflowGraph,
}

impl<'g> DependencyResolver<'g> {
    pub fn new(graph: &'g WorkflowGraph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &'g WorkflowGraph {
        self.graph
    }

    /// Nodes with a connection into `node_id`
    pub fn get_dependencies(&self, node_id: &str) -> HashSet<NodeId> {
        self.graph.predecessors(node_id)
    }

    /// Nodes with a connection out of `node_id`, regardless of port
    pub fn get_downstream_nodes(&self, node_id: &str) -> HashSet<NodeId> {
        self.graph.successors(node_id)
    }

    /// Downstream nodes connected to one of the ports that actually fired
    pub fn get_triggered_downstream(
        &self,
        node_id: &str,
        fired_ports: &HashSet<String>,
    ) -> HashSet<NodeId> {
        self.graph
            .outgoing(node_id)
            .into_iter()
            .filter(|conn| fired_ports.contains(&conn.from_port))
            .map(|conn| conn.to_node.clone())
            .collect()
    }

    /// `node_id` and its transitive downstream closure
    pub fn get_downstream_closure(&self, node_id: &str) -> HashSet<NodeId> {
        self.graph.reachable_from(node_id)
    }

    /// Fan-in rule: a node is executable once it is not completed, not
    /// disabled, and every dependency is in `completed`.
    ///
    /// Callers exclude nodes that are already queued, running, failed or
    /// skipped from `nodes`.
    pub fn get_executable_nodes(
        &self,
        nodes: &HashSet<NodeId>,
        completed: &HashSet<NodeId>,
    ) -> HashSet<NodeId> {
        nodes
            .iter()
            .filter(|id| self.graph.contains(id))
            .filter(|id| !completed.contains(*id))
            .filter(|id| !self.graph.is_disabled(id))
            .filter(|id| {
                self.get_dependencies(id)
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    pub fn has_cycle(&self) -> bool {
        toposort(self.graph.petgraph(), None).is_err()
    }

    /// Dependency order of all nodes, or the first loop found
    pub fn topological_order(&self) -> Result<Vec<NodeId>, WorkflowError> {
        let graph = self.graph.petgraph();
        match toposort(graph, None) {
            Ok(order) => Ok(order.into_iter().map(|idx| graph[idx].clone()).collect()),
            Err(_) => {
                let cycle = self
                    .detect_circular_dependencies()
                    .into_iter()
                    .next()
                    .map(|c| c.cycle)
                    .unwrap_or_default();
                Err(WorkflowError::CyclicDependency { cycle })
            }
        }
    }

    /// Every loop closed by a back edge of a depth-first walk.
    ///
    /// Iterative three-colour DFS rooted at each node in declaration order,
    /// so it terminates on any finite graph and reports self-loops as
    /// one-node cycles.
    pub fn detect_circular_dependencies(&self) -> Vec<CircularDependency> {
        let graph = self.graph.petgraph();
        let mut marks = vec![Mark::Unvisited; graph.node_count()];
        let mut seen: HashSet<Vec<NodeIndex>> = HashSet::new();
        let mut cycles = Vec::new();

        let successors = |idx: NodeIndex| {
            let mut next: Vec<NodeIndex> = graph.neighbors(idx).collect();
            next.sort_unstable();
            next.dedup();
            next
        };

        for root in graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }

            let mut path = vec![root];
            let mut stack = vec![Frame {
                node: root,
                successors: successors(root),
                next: 0,
            }];
            marks[root.index()] = Mark::InProgress;

            while let Some(frame) = stack.last_mut() {
                let node = frame.node;
                let next = frame.successors.get(frame.next).copied();
                frame.next += 1;

                match next {
                    Some(succ) => match marks[succ.index()] {
                        Mark::Unvisited => {
                            marks[succ.index()] = Mark::InProgress;
                            path.push(succ);
                            stack.push(Frame {
                                node: succ,
                                successors: successors(succ),
                                next: 0,
                            });
                        }
                        Mark::InProgress => {
                            let Some(start) = path.iter().position(|n| *n == succ) else {
                                continue;
                            };
                            let loop_nodes = path[start..].to_vec();
                            if seen.insert(canonical_rotation(&loop_nodes)) {
                                cycles.push(CircularDependency {
                                    cycle: loop_nodes.iter().map(|i| graph[*i].clone()).collect(),
                                    severity: Severity::Error,
                                });
                            }
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }

        cycles
    }

    /// Cycle detection plus reachability analysis.
    ///
    /// Errors: loops and connections to unknown nodes. Warnings: orphaned
    /// non-trigger nodes and nodes no entry point can reach.
    pub fn validate_execution_path(&self) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for conn in self.graph.connections() {
            let missing: Vec<NodeId> = [&conn.from_node, &conn.to_node]
                .into_iter()
                .filter(|id| !self.graph.contains(id))
                .cloned()
                .collect();
            if !missing.is_empty() {
                errors.push(ValidationIssue::new(
                    FlowErrorKind::MissingDependency,
                    format!(
                        "Connection {}:{} -> {}:{} references unknown node(s) {}",
                        conn.from_node,
                        conn.from_port,
                        conn.to_node,
                        conn.to_port,
                        missing.join(", ")
                    ),
                    missing,
                ));
            }
        }

        let circular_dependencies = self.detect_circular_dependencies();
        for cycle in &circular_dependencies {
            errors.push(ValidationIssue::new(
                FlowErrorKind::CircularDependency,
                format!("Circular dependency: {}", cycle.describe()),
                cycle.cycle.clone(),
            ));
        }

        let orphaned_nodes: Vec<NodeId> = self
            .graph
            .nodes()
            .iter()
            .filter(|n| !n.is_trigger())
            .filter(|n| self.graph.predecessors(&n.id).is_empty())
            .filter(|n| self.graph.successors(&n.id).is_empty())
            .map(|n| n.id.clone())
            .collect();
        if !orphaned_nodes.is_empty() {
            warnings.push(ValidationWarning {
                message: format!("Nodes without connections: {}", orphaned_nodes.join(", ")),
                node_ids: orphaned_nodes.clone(),
            });
        }

        let entry_points = self.entry_points();
        if entry_points.is_empty() && !self.graph.is_empty() {
            warnings.push(ValidationWarning {
                message: "Workflow has no entry point".to_string(),
                node_ids: Vec::new(),
            });
        }

        let mut reachable = HashSet::new();
        for entry in &entry_points {
            reachable.extend(self.graph.reachable_from(entry));
        }
        let orphans: HashSet<&NodeId> = orphaned_nodes.iter().collect();
        let unreachable_nodes: Vec<NodeId> = self
            .graph
            .nodes()
            .iter()
            .map(|n| &n.id)
            .filter(|id| !reachable.contains(*id) && !orphans.contains(id))
            .cloned()
            .collect();
        if !unreachable_nodes.is_empty() {
            warnings.push(ValidationWarning {
                message: format!(
                    "Nodes unreachable from any entry point: {}",
                    unreachable_nodes.join(", ")
                ),
                node_ids: unreachable_nodes.clone(),
            });
        }

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            circular_dependencies,
            unreachable_nodes,
            orphaned_nodes,
        }
    }

    /// Trigger nodes, or every node without dependencies if there are none
    pub fn entry_points(&self) -> Vec<NodeId> {
        let triggers: Vec<NodeId> = self
            .graph
            .nodes()
            .iter()
            .filter(|n| n.is_trigger())
            .map(|n| n.id.clone())
            .collect();
        if !triggers.is_empty() {
            return triggers;
        }
        self.graph
            .nodes()
            .iter()
            .filter(|n| self.graph.predecessors(&n.id).is_empty())
            .map(|n| n.id.clone())
            .collect()
    }
}

fn canonical_rotation(cycle: &[NodeIndex]) -> Vec<NodeIndex> {
    let pivot = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, idx)| **idx)
        .map(|(pos, _)| pos)
        .unwrap_or(0);
    cycle[pivot..].iter().chain(&cycle[..pivot]).copied().collect()
}

/// [`DependencyResolver::get_executable_nodes`] over raw workflow parts
pub fn get_executable_nodes(
    nodes: &[NodeSpec],
    connections: &[Connection],
    completed: &HashSet<NodeId>,
) -> HashSet<NodeId> {
    let graph = WorkflowGraph::lenient(nodes, connections);
    let candidates = nodes.iter().map(|n| n.id.clone()).collect();
    DependencyResolver::new(&graph).get_executable_nodes(&candidates, completed)
}

/// Cycle detection over a bare connection list
pub fn detect_circular_dependencies(connections: &[Connection]) -> Vec<CircularDependency> {
    let mut ids: Vec<NodeId> = Vec::new();
    let mut seen = HashSet::new();
    for conn in connections {
        for id in [&conn.from_node, &conn.to_node] {
            if seen.insert(id.clone()) {
                ids.push(id.clone());
            }
        }
    }
    let nodes: Vec<NodeSpec> = ids.into_iter().map(|id| NodeSpec::new(id, "")).collect();
    let graph = WorkflowGraph::lenient(&nodes, connections);
    DependencyResolver::new(&graph).detect_circular_dependencies()
}

/// [`DependencyResolver::validate_execution_path`] over raw workflow parts.
///
/// Also warns about duplicate node ids (later declarations are ignored).
pub fn validate_execution_path(nodes: &[NodeSpec], connections: &[Connection]) -> ValidationResult {
    let graph = WorkflowGraph::lenient(nodes, connections);
    let mut result = DependencyResolver::new(&graph).validate_execution_path();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for node in nodes {
        *counts.entry(node.id.as_str()).or_default() += 1;
    }
    let mut duplicates: Vec<NodeId> = counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(id, _)| id.to_string())
        .collect();
    if !duplicates.is_empty() {
        duplicates.sort();
        result.warnings.push(ValidationWarning {
            message: format!("Duplicate node ids: {}", duplicates.join(", ")),
            node_ids: duplicates,
        });
    }

    result
}
