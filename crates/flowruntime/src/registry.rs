use async_trait::async_trait;
use flowcore::{
    Node, NodeContext, NodeError, NodeExecutor, NodeOutput, Value, Workflow, WorkflowError,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Optional: Get node metadata (description, ports, etc.)
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Registry of available node types.
///
/// Also the default [`NodeExecutor`]: every dispatch creates a fresh node
/// instance from the node spec's parameters, so instances never share state
/// across executions.
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::debug!("Registering node type: {}", node_type);
        self.factories.insert(node_type, factory);
    }

    /// Create a node instance from a node type and config
    pub fn create_node(
        &self,
        node_type: &str,
        config: &HashMap<String, Value>,
    ) -> Result<Box<dyn Node>, WorkflowError> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| WorkflowError::UnknownNodeType(node_type.to_string()))?;

        factory
            .create(config)
            .map_err(|e| WorkflowError::Invalid(format!("Failed to create node: {}", e)))
    }

    /// Check that every node type is known and its parameters are accepted
    pub fn validate_workflow(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        for spec in &workflow.nodes {
            let node = self.create_node(&spec.node_type, &spec.config)?;
            node.validate_config(&spec.config).map_err(|e| {
                WorkflowError::Invalid(format!("node {}: {}", spec.id, e))
            })?;
        }
        Ok(())
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for NodeRegistry {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let factory = self.factories.get(&ctx.node_type).ok_or_else(|| {
            NodeError::Configuration(format!("Unknown node type: {}", ctx.node_type))
        })?;
        let mut node = factory.create(&ctx.config)?;

        if let Err(e) = node.initialize().await {
            tracing::error!("Failed to initialize node {}: {}", ctx.node_id, e);
            return Err(e);
        }

        let node_id = ctx.node_id.clone();
        let result = node.execute(ctx).await;

        if let Err(e) = node.shutdown().await {
            tracing::warn!("Failed to shut down node {}: {}", node_id, e);
        }
        result
    }
}
