//! Workflow execution runtime
//!
//! This crate provides the cascade execution engine, the dependency
//! resolver over the workflow graph, per-execution contexts, persistence
//! hooks and the node registry that runs built-in node types.

mod context;
mod engine;
mod graph;
mod history;
mod registry;
mod resolver;
mod runtime;
mod schedule;
mod store;

pub use context::{
    ExecutionContext, ExecutionContextManager, ExecutionSnapshot, NodeRunResult, Transition,
};
pub use engine::{
    EngineConfig, ExecuteOptions, ExecutionFlowStatus, ExecutionHandle, FlowExecutionEngine,
    FlowExecutionResult,
};
pub use graph::WorkflowGraph;
pub use history::DurationHistory;
pub use registry::{NodeFactory, NodeMetadata, NodeRegistry, PortDefinition};
pub use resolver::{
    detect_circular_dependencies, get_executable_nodes, validate_execution_path,
    CircularDependency, DependencyResolver, Severity, ValidationIssue, ValidationResult,
    ValidationWarning,
};
pub use runtime::{ConfigError, FlowRuntime, RecoveryMode, RecoveryReport, RuntimeConfig};
pub use store::{ExecutionStore, InMemoryExecutionStore};
