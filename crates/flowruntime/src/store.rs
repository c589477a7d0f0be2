//! Persistence of execution snapshots for pause/resume and crash recovery

use crate::context::ExecutionSnapshot;
use async_trait::async_trait;
use flowcore::{ExecutionId, FlowError};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// External store for execution snapshots.
///
/// The engine saves on every significant state change and logs failures
/// instead of propagating them.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<(), FlowError>;

    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, FlowError>;

    /// Snapshots of executions that were still running or paused
    async fn list_recoverable(&self) -> Result<Vec<ExecutionSnapshot>, FlowError>;

    async fn remove(&self, execution_id: &str) -> Result<(), FlowError>;
}

/// Process-local store, mainly for tests and single-node deployments
#[derive(Default)]
pub struct InMemoryExecutionStore {
    snapshots: RwLock<HashMap<ExecutionId, ExecutionSnapshot>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save(&self, snapshot: &ExecutionSnapshot) -> Result<(), FlowError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.execution_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<ExecutionSnapshot>, FlowError> {
        Ok(self.snapshots.read().await.get(execution_id).cloned())
    }

    async fn list_recoverable(&self) -> Result<Vec<ExecutionSnapshot>, FlowError> {
        let snapshots = self.snapshots.read().await;
        let mut recoverable: Vec<ExecutionSnapshot> = snapshots
            .values()
            .filter(|s| s.status.is_active())
            .cloned()
            .collect();
        recoverable.sort_by_key(|s| s.started_at);
        Ok(recoverable)
    }

    async fn remove(&self, execution_id: &str) -> Result<(), FlowError> {
        self.snapshots.write().await.remove(execution_id);
        Ok(())
    }
}
