use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall status of one execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    /// Finished with failed nodes tolerated by `ErrorHandling::ContinueOnError`
    Partial,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Partial
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
        )
    }

    /// Whether an execution in this state may still make progress
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::Paused)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a node inside one execution context.
///
/// Never stored on the node itself: the same node can be running in one
/// context and idle in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Idle,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeExecutionStatus {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            NodeExecutionStatus::Completed
                | NodeExecutionStatus::Failed
                | NodeExecutionStatus::Skipped
        )
    }
}

impl fmt::Display for NodeExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeExecutionStatus::Idle => "idle",
            NodeExecutionStatus::Queued => "queued",
            NodeExecutionStatus::Running => "running",
            NodeExecutionStatus::Completed => "completed",
            NodeExecutionStatus::Failed => "failed",
            NodeExecutionStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a node was skipped instead of executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A dependency failed, or was itself skipped because of a failure
    UpstreamFailed,
    /// Dependencies settled but none of the connected output ports fired
    BranchNotTaken,
    Disabled,
    /// Dispatch stopped by `ErrorHandling::StopWorkflow`
    WorkflowStopped,
}

impl SkipReason {
    /// Settled-without-data skips let downstream joins proceed
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, SkipReason::BranchNotTaken | SkipReason::Disabled)
    }
}
