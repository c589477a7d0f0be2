use crate::context::ExecutionContextManager;
use crate::engine::{
    EngineConfig, ExecuteOptions, ExecutionFlowStatus, ExecutionHandle, FlowExecutionEngine,
    FlowExecutionResult,
};
use crate::graph::WorkflowGraph;
use crate::registry::NodeRegistry;
use crate::resolver::DependencyResolver;
use crate::store::{ExecutionStore, InMemoryExecutionStore};
use flowcore::{
    EventBus, ExecutionEvent, ExecutionId, FlowError, Value, Workflow, WorkflowError, WorkflowId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<NodeRegistry>,
    engine: FlowExecutionEngine,
    event_bus: Arc<EventBus>,
    store: Arc<dyn ExecutionStore>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Arc<WorkflowGraph>>>>,
    config: RuntimeConfig,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        Self::with_registry(registry, config)
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: Arc<NodeRegistry>, config: RuntimeConfig) -> Self {
        Self::with_store(registry, config, Arc::new(InMemoryExecutionStore::new()))
    }

    /// Create a new runtime persisting snapshots to `store`
    pub fn with_store(
        registry: Arc<NodeRegistry>,
        config: RuntimeConfig,
        store: Arc<dyn ExecutionStore>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let contexts = Arc::new(ExecutionContextManager::new(event_bus.clone()));
        let engine = FlowExecutionEngine::new(registry.clone(), contexts, config.engine_config())
            .with_store(store.clone());

        Self {
            registry,
            engine,
            event_bus,
            store,
            workflows: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get access to the node registry
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &FlowExecutionEngine {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a workflow after checking its structure and node types.
    ///
    /// Cycles are accepted here; executions that reach one fail with a
    /// circular dependency error before any node runs.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<WorkflowId, FlowError> {
        let graph = WorkflowGraph::from_workflow(&workflow)?;
        self.registry.validate_workflow(&workflow)?;

        let validation = DependencyResolver::new(&graph).validate_execution_path();
        for warning in &validation.warnings {
            tracing::warn!("Workflow {}: {}", workflow.name, warning.message);
        }
        for cycle in &validation.circular_dependencies {
            tracing::warn!("Workflow {} contains a cycle: {}", workflow.name, cycle.describe());
        }

        let id = workflow.id;
        tracing::info!("Registered workflow {} ({})", workflow.name, id);
        self.workflows.write().await.insert(id, Arc::new(graph));
        Ok(id)
    }

    pub async fn workflow(&self, workflow_id: WorkflowId) -> Option<Arc<WorkflowGraph>> {
        self.workflows.read().await.get(&workflow_id).cloned()
    }

    async fn graph(&self, workflow_id: WorkflowId) -> Result<Arc<WorkflowGraph>, FlowError> {
        self.workflow(workflow_id)
            .await
            .ok_or_else(|| FlowError::Workflow(WorkflowError::NotFound(workflow_id.to_string())))
    }

    /// Run the cascade below a trigger of a registered workflow
    pub async fn execute_from_trigger(
        &self,
        workflow_id: WorkflowId,
        trigger_node_id: &str,
        trigger_data: Value,
    ) -> Result<FlowExecutionResult, FlowError> {
        let handle = self
            .start_from_trigger(workflow_id, trigger_node_id, trigger_data, ExecuteOptions::default())
            .await?;
        Ok(handle.wait().await)
    }

    /// Re-run a node of a registered workflow and everything after it
    pub async fn execute_from_node(
        &self,
        workflow_id: WorkflowId,
        node_id: &str,
        options: ExecuteOptions,
    ) -> Result<FlowExecutionResult, FlowError> {
        let handle = self.start_from_node(workflow_id, node_id, options).await?;
        Ok(handle.wait().await)
    }

    pub async fn start_from_trigger(
        &self,
        workflow_id: WorkflowId,
        trigger_node_id: &str,
        trigger_data: Value,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, FlowError> {
        let graph = self.graph(workflow_id).await?;
        Ok(self
            .engine
            .start_from_trigger(graph, trigger_node_id, trigger_data, options)
            .await)
    }

    pub async fn start_from_node(
        &self,
        workflow_id: WorkflowId,
        node_id: &str,
        options: ExecuteOptions,
    ) -> Result<ExecutionHandle, FlowError> {
        let graph = self.graph(workflow_id).await?;
        Ok(self.engine.start_from_node(graph, node_id, options).await)
    }

    /// Execute a workflow directly (without registration).
    ///
    /// Starts from `trigger_node_id`, or from the first trigger node when
    /// none is given.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        trigger_node_id: Option<&str>,
        trigger_data: Value,
    ) -> Result<FlowExecutionResult, FlowError> {
        let graph = Arc::new(WorkflowGraph::from_workflow(workflow)?);
        let trigger = match trigger_node_id {
            Some(id) => id.to_string(),
            None => graph
                .nodes()
                .iter()
                .find(|n| n.is_trigger())
                .map(|n| n.id.clone())
                .ok_or_else(|| {
                    WorkflowError::Invalid(format!("workflow {} has no trigger node", workflow.name))
                })?,
        };
        Ok(self
            .engine
            .execute_from_trigger(graph, &trigger, trigger_data, ExecuteOptions::default())
            .await)
    }

    pub async fn cancel_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        self.engine.cancel_execution(execution_id).await
    }

    pub async fn pause_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        self.engine.pause_execution(execution_id).await
    }

    pub async fn resume_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        self.engine.resume_execution(execution_id).await
    }

    pub async fn get_execution_status(&self, execution_id: &str) -> Option<ExecutionFlowStatus> {
        self.engine.get_execution_status(execution_id).await
    }

    /// Pick up executions persisted by a previous process.
    ///
    /// Workflows must be registered first; snapshots of unknown workflows
    /// are left in the store.
    pub async fn recover_executions(&self) -> Result<RecoveryReport, FlowError> {
        let mut report = RecoveryReport::default();
        for snapshot in self.store.list_recoverable().await? {
            let execution_id = snapshot.execution_id.clone();
            if self.engine.contexts().contains(&execution_id).await {
                continue;
            }
            let Some(graph) = self.workflow(snapshot.workflow_id).await else {
                tracing::warn!(
                    "Cannot recover execution {}: workflow {} is not registered",
                    execution_id,
                    snapshot.workflow_id
                );
                report.unknown_workflow.push(execution_id);
                continue;
            };

            match self.config.recovery_mode {
                RecoveryMode::Resume => {
                    let timeout = self.config.default_timeout_ms.map(Duration::from_millis);
                    let handle = self.engine.restore_execution(graph, snapshot, timeout).await?;
                    report.resumed.push(handle);
                }
                RecoveryMode::MarkFailed => {
                    self.engine
                        .abandon_execution(snapshot, "execution interrupted by a restart")
                        .await?;
                    report.failed.push(execution_id);
                }
            }
        }
        if !report.is_empty() {
            tracing::info!(
                "Recovery: {} resumed, {} marked failed, {} with unknown workflow",
                report.resumed.len(),
                report.failed.len(),
                report.unknown_workflow.len()
            );
        }
        Ok(report)
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of [`FlowRuntime::recover_executions`]
#[derive(Default)]
pub struct RecoveryReport {
    pub resumed: Vec<ExecutionHandle>,
    pub failed: Vec<ExecutionId>,
    pub unknown_workflow: Vec<ExecutionId>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty() && self.failed.is_empty() && self.unknown_workflow.is_empty()
    }
}

/// What to do with executions found running or paused at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    Resume,
    MarkFailed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// `None` keeps finished contexts until cleared explicitly
    pub context_retention_secs: Option<u64>,
    pub default_timeout_ms: Option<u64>,
    pub recovery_mode: RecoveryMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            context_retention_secs: Some(300),
            default_timeout_ms: None,
            recovery_mode: RecoveryMode::Resume,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `FLOW_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_parse("FLOW_MAX_PARALLEL_NODES")? {
            config.max_parallel_nodes = v;
        }
        if let Some(v) = env_parse("FLOW_EVENT_BUFFER_SIZE")? {
            config.event_buffer_size = v;
        }
        if let Some(v) = env_parse::<u64>("FLOW_CONTEXT_RETENTION_SECS")? {
            // 0 disables eviction
            config.context_retention_secs = (v > 0).then_some(v);
        }
        if let Some(v) = env_parse("FLOW_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout_ms = Some(v);
        }
        if let Ok(value) = std::env::var("FLOW_RECOVERY_MODE") {
            config.recovery_mode = match value.to_ascii_lowercase().as_str() {
                "resume" => RecoveryMode::Resume,
                "mark_failed" => RecoveryMode::MarkFailed,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "FLOW_RECOVERY_MODE",
                        value,
                    })
                }
            };
        }
        Ok(config)
    }

    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_parallel_nodes: self.max_parallel_nodes.max(1),
            default_timeout: self.default_timeout_ms.map(Duration::from_millis),
            context_retention: self.context_retention_secs.map(Duration::from_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
        Err(_) => Ok(None),
    }
}
