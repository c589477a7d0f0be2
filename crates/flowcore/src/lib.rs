//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: values and port data, workflow definitions,
//! statuses, errors and the execution event bus.

mod error;
pub mod events;
mod node;
mod status;
mod value;
mod workflow;

pub use error::{ExecutionError, FlowError, FlowErrorKind, NodeError, WorkflowError};
pub use events::*;
pub use node::{Node, NodeContext, NodeExecutor, NodeMetadata, NodeOutput, PortData};
pub use status::{ExecutionStatus, NodeExecutionStatus, SkipReason};
pub use value::Value;
pub use workflow::{
    ConcurrencyPolicy, Connection, ErrorHandling, NodeId, NodeSpec, Position, RetryPolicy,
    Workflow, WorkflowId, WorkflowSettings, MAIN_PORT,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
