//! Immutable graph view of a workflow, shared read-only by executions

use flowcore::{Connection, NodeId, NodeSpec, Workflow, WorkflowError, WorkflowId, WorkflowSettings};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// Read-only snapshot of a workflow's nodes and port connections.
///
/// Edge weights are indices into `connections`, so several connections
/// between the same pair of nodes (different ports) stay distinguishable.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    workflow_id: WorkflowId,
    settings: WorkflowSettings,
    nodes: Vec<NodeSpec>,
    connections: Vec<Connection>,
    graph: DiGraph<NodeId, usize>,
    node_to_index: HashMap<NodeId, NodeIndex>,
}

impl WorkflowGraph {
    /// Build a graph, rejecting duplicate ids, dangling endpoints and self-loops
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, WorkflowError> {
        let mut seen = HashSet::new();
        for node in &workflow.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
        }

        for conn in &workflow.connections {
            for endpoint in [&conn.from_node, &conn.to_node] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(WorkflowError::NodeNotFound(endpoint.clone()));
                }
            }
            if conn.from_node == conn.to_node {
                return Err(WorkflowError::InvalidConnection(format!(
                    "self-loop on node {}",
                    conn.from_node
                )));
            }
        }

        Ok(Self::build(
            workflow.id,
            workflow.settings.clone(),
            workflow.nodes.clone(),
            workflow.connections.clone(),
        ))
    }

    /// Build a graph from raw parts without validation.
    ///
    /// Connections whose endpoints do not exist are dropped from adjacency
    /// (but kept in `connections()`), duplicate node ids keep the first
    /// declaration. Used to report problems instead of refusing them.
    pub fn lenient(nodes: &[NodeSpec], connections: &[Connection]) -> Self {
        let mut unique = Vec::with_capacity(nodes.len());
        let mut seen = HashSet::new();
        for node in nodes {
            if seen.insert(node.id.clone()) {
                unique.push(node.clone());
            }
        }
        Self::build(
            WorkflowId::nil(),
            WorkflowSettings::default(),
            unique,
            connections.to_vec(),
        )
    }

    fn build(
        workflow_id: WorkflowId,
        settings: WorkflowSettings,
        nodes: Vec<NodeSpec>,
        connections: Vec<Connection>,
    ) -> Self {
        let mut graph = DiGraph::new();
        let mut node_to_index = HashMap::new();

        for node in &nodes {
            let idx = graph.add_node(node.id.clone());
            node_to_index.insert(node.id.clone(), idx);
        }

        for (position, conn) in connections.iter().enumerate() {
            if let (Some(from), Some(to)) = (
                node_to_index.get(&conn.from_node),
                node_to_index.get(&conn.to_node),
            ) {
                graph.add_edge(*from, *to, position);
            }
        }

        Self {
            workflow_id,
            settings,
            nodes,
            connections,
            graph,
            node_to_index,
        }
    }

    /// Restrict the graph to `keep` and the connections between those nodes
    pub fn subgraph(&self, keep: &HashSet<NodeId>) -> Self {
        let nodes = self
            .nodes
            .iter()
            .filter(|n| keep.contains(&n.id))
            .cloned()
            .collect();
        let connections = self
            .connections
            .iter()
            .filter(|c| keep.contains(&c.from_node) && keep.contains(&c.to_node))
            .cloned()
            .collect();
        Self::build(self.workflow_id, self.settings.clone(), nodes, connections)
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        // graph indices follow declaration order
        self.node_to_index.get(id).map(|idx| &self.nodes[idx.index()])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node_to_index.contains_key(id)
    }

    pub fn is_disabled(&self, id: &str) -> bool {
        self.node(id).map(|n| n.disabled).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Connections ending at `id`, in declaration order
    pub fn incoming(&self, id: &str) -> Vec<&Connection> {
        self.edges(id, Direction::Incoming)
    }

    /// Connections starting at `id`, in declaration order
    pub fn outgoing(&self, id: &str) -> Vec<&Connection> {
        self.edges(id, Direction::Outgoing)
    }

    fn edges(&self, id: &str, direction: Direction) -> Vec<&Connection> {
        let Some(idx) = self.node_to_index.get(id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self
            .graph
            .edges_directed(*idx, direction)
            .map(|edge| *edge.weight())
            .collect();
        positions.sort_unstable();
        positions.into_iter().map(|p| &self.connections[p]).collect()
    }

    pub fn predecessors(&self, id: &str) -> HashSet<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn successors(&self, id: &str) -> HashSet<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> HashSet<NodeId> {
        match self.node_to_index.get(id) {
            Some(idx) => self
                .graph
                .neighbors_directed(*idx, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => HashSet::new(),
        }
    }

    /// `id` plus every node reachable forward from it
    pub fn reachable_from(&self, id: &str) -> HashSet<NodeId> {
        let mut reached = HashSet::new();
        if let Some(start) = self.node_to_index.get(id) {
            let mut dfs = Dfs::new(&self.graph, *start);
            while let Some(idx) = dfs.next(&self.graph) {
                reached.insert(self.graph[idx].clone());
            }
        }
        reached
    }

    pub(crate) fn petgraph(&self) -> &DiGraph<NodeId, usize> {
        &self.graph
    }
}
