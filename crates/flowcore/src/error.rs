use crate::{ExecutionId, ExecutionStatus, NodeExecutionStatus, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("Cannot {operation} execution {execution_id} while it is {status}")]
    InvalidFlowState {
        execution_id: ExecutionId,
        status: ExecutionStatus,
        operation: &'static str,
    },

    #[error("Node {node_id} in execution {execution_id} cannot move from {from} to {to}")]
    InvalidNodeTransition {
        execution_id: ExecutionId,
        node_id: NodeId,
        from: NodeExecutionStatus,
        to: NodeExecutionStatus,
    },

    #[error("Node {node_id} is already claimed by execution {other_execution}")]
    ConcurrentExecutionConflict {
        node_id: NodeId,
        other_execution: ExecutionId,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Classify the error, if it belongs to the user-visible taxonomy
    pub fn kind(&self) -> Option<FlowErrorKind> {
        match self {
            FlowError::Node(NodeError::Timeout { .. }) => Some(FlowErrorKind::ExecutionTimeout),
            FlowError::Node(_) => Some(FlowErrorKind::NodeExecutionFailed),
            FlowError::Workflow(WorkflowError::CyclicDependency { .. }) => {
                Some(FlowErrorKind::CircularDependency)
            }
            FlowError::Workflow(WorkflowError::NodeNotFound(_)) => {
                Some(FlowErrorKind::MissingDependency)
            }
            FlowError::InvalidFlowState { .. } => Some(FlowErrorKind::InvalidFlowState),
            FlowError::ConcurrentExecutionConflict { .. } => {
                Some(FlowErrorKind::ConcurrentExecutionConflict)
            }
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<NodeId> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
}

/// User-visible error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowErrorKind {
    CircularDependency,
    MissingDependency,
    ExecutionTimeout,
    NodeExecutionFailed,
    InvalidFlowState,
    ConcurrentExecutionConflict,
}

impl FlowErrorKind {
    pub fn suggested_resolution(&self) -> &'static str {
        match self {
            FlowErrorKind::CircularDependency => {
                "Remove one of the connections forming the loop so the workflow becomes acyclic"
            }
            FlowErrorKind::MissingDependency => {
                "Reconnect or delete connections that reference nodes which no longer exist"
            }
            FlowErrorKind::ExecutionTimeout => {
                "Increase the configured timeout or reduce the work done by slow nodes"
            }
            FlowErrorKind::NodeExecutionFailed => {
                "Inspect the failing node's input and parameters, then re-run from that node"
            }
            FlowErrorKind::InvalidFlowState => {
                "Check the execution status before pausing, resuming or cancelling it"
            }
            FlowErrorKind::ConcurrentExecutionConflict => {
                "Wait for the other execution to finish or allow concurrent executions"
            }
        }
    }
}

impl fmt::Display for FlowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowErrorKind::CircularDependency => "CIRCULAR_DEPENDENCY",
            FlowErrorKind::MissingDependency => "MISSING_DEPENDENCY",
            FlowErrorKind::ExecutionTimeout => "EXECUTION_TIMEOUT",
            FlowErrorKind::NodeExecutionFailed => "NODE_EXECUTION_FAILED",
            FlowErrorKind::InvalidFlowState => "INVALID_FLOW_STATE",
            FlowErrorKind::ConcurrentExecutionConflict => "CONCURRENT_EXECUTION_CONFLICT",
        };
        f.write_str(s)
    }
}

/// Error record attached to an execution result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionError {
    pub kind: FlowErrorKind,
    pub message: String,
    pub node_id: Option<NodeId>,
    pub affected_nodes: Vec<NodeId>,
    /// Nodes settled before the error was recorded, in completion order
    pub execution_path: Vec<NodeId>,
    pub suggested_resolution: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn new(kind: FlowErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            node_id: None,
            affected_nodes: Vec::new(),
            execution_path: Vec::new(),
            suggested_resolution: kind.suggested_resolution().to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_affected_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.affected_nodes = nodes.into_iter().collect();
        self
    }

    pub fn with_execution_path(mut self, path: Vec<NodeId>) -> Self {
        self.execution_path = path;
        self
    }

    /// Build from an engine-side error; unclassified errors count as node failures
    pub fn from_flow_error(error: &FlowError) -> Self {
        let kind = error.kind().unwrap_or(FlowErrorKind::NodeExecutionFailed);
        Self::new(kind, error.to_string())
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "[{}] {}: {}", self.kind, node, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}
