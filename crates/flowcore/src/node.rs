use crate::{events::EventEmitter, ExecutionId, NodeError, NodeId, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Items per named port
pub type PortData = HashMap<String, Vec<Value>>;

/// Core trait that all executable nodes implement
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "logic.if", "transform.json_parse")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;

    /// Optional: Initialize stateful resources (DB connections, etc.)
    async fn initialize(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Optional: Cleanup resources
    async fn shutdown(&mut self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Optional: Validate configuration at workflow load time
    fn validate_config(&self, _config: &HashMap<String, Value>) -> Result<(), NodeError> {
        Ok(())
    }
}

/// Runs any node of a workflow on behalf of the engine.
///
/// The engine treats implementations as opaque: it hands over merged input
/// items and parameters and gets back items per output port, or an error.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub execution_id: ExecutionId,

    pub node_id: NodeId,

    pub node_type: String,

    /// Input items per input port, merged from all upstream connections
    pub inputs: PortData,

    /// Static configuration (parameters) for this node
    pub config: HashMap<String, Value>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Signalled when the execution is cancelled; observing it is up to the node
    pub cancellation: tokio_util::sync::CancellationToken,
}

impl NodeContext {
    pub fn new(
        execution_id: ExecutionId,
        node_id: impl Into<NodeId>,
        node_type: impl Into<String>,
        events: EventEmitter,
    ) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            node_type: node_type.into(),
            inputs: HashMap::new(),
            config: HashMap::new(),
            events,
            cancellation: tokio_util::sync::CancellationToken::new(),
        }
    }

    /// Items received on an input port (empty if nothing arrived)
    pub fn input_items(&self, port: &str) -> &[Value] {
        self.inputs.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get required input or return error
    pub fn require_input(&self, port: &str) -> Result<&[Value], NodeError> {
        match self.inputs.get(port) {
            Some(items) if !items.is_empty() => Ok(items),
            _ => Err(NodeError::MissingInput(port.to_string())),
        }
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    /// Get config with default
    pub fn get_config_or(&self, name: &str, default: Value) -> Value {
        self.config.get(name).cloned().unwrap_or(default)
    }
}

/// Output from node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    /// Items per output port. Only ports with at least one item trigger
    /// their downstream connections.
    pub outputs: PortData,

    /// Execution metadata
    pub metadata: NodeMetadata,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one item to an output port
    pub fn with_output(mut self, port: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.entry(port.into()).or_default().push(value.into());
        self
    }

    /// Append several items to an output port
    pub fn with_items(mut self, port: impl Into<String>, items: Vec<Value>) -> Self {
        self.outputs.entry(port.into()).or_default().extend(items);
        self
    }

    /// Ports that produced at least one item
    pub fn fired_ports(&self) -> impl Iterator<Item = &str> {
        self.outputs
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(port, _)| port.as_str())
    }
}

/// Metadata about node execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub execution_time_ms: u64,
    pub custom: HashMap<String, Value>,
}
