//! Per-execution state and the registry that isolates concurrent executions.
//!
//! Every mutation of an [`ExecutionContext`] goes through
//! [`ExecutionContextManager`], under one write lock, so a node is in at
//! most one status set at any time and status events for a node leave in
//! transition order.

use chrono::{DateTime, Utc};
use flowcore::{
    EventBus, ExecutionError, ExecutionEvent, ExecutionId, ExecutionStatus, FlowError,
    NodeExecutionStatus, NodeId, PortData, SkipReason, Value, WorkflowId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

/// Outcome of one node inside one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunResult {
    pub status: NodeExecutionStatus,
    pub outputs: PortData,
    pub error: Option<ExecutionError>,
    pub skip_reason: Option<SkipReason>,
    pub duration_ms: u64,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl NodeRunResult {
    fn new(status: NodeExecutionStatus) -> Self {
        Self {
            status,
            outputs: PortData::new(),
            error: None,
            skip_reason: None,
            duration_ms: 0,
            attempts: 0,
            finished_at: Utc::now(),
        }
    }

    /// Ports that produced at least one item
    pub fn fired_ports(&self) -> HashSet<String> {
        self.outputs
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(port, _)| port.clone())
            .collect()
    }
}

/// Whether a node may move between two statuses within one context
fn transition_allowed(from: NodeExecutionStatus, to: NodeExecutionStatus) -> bool {
    use NodeExecutionStatus::*;
    matches!(
        (from, to),
        (Idle, Queued)
            | (Idle, Skipped)
            | (Queued, Running)
            | (Queued, Skipped)
            | (Running, Completed)
            | (Running, Failed)
    )
}

/// Isolated state of one cascade run
#[derive(Debug)]
pub struct ExecutionContext {
    execution_id: ExecutionId,
    workflow_id: WorkflowId,
    trigger_node_id: NodeId,
    affected_node_ids: HashSet<NodeId>,
    queued: HashSet<NodeId>,
    running: HashSet<NodeId>,
    completed: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    skipped: HashMap<NodeId, SkipReason>,
    status: ExecutionStatus,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    execution_path: Vec<NodeId>,
    node_results: HashMap<NodeId, NodeRunResult>,
    errors: Vec<ExecutionError>,
    seed: Option<Value>,
    start_input: PortData,
    reject_conflicts: bool,
    status_tx: watch::Sender<ExecutionStatus>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    fn new(
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        trigger_node_id: NodeId,
        affected_node_ids: HashSet<NodeId>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ExecutionStatus::Running);
        Self {
            execution_id,
            workflow_id,
            trigger_node_id,
            affected_node_ids,
            queued: HashSet::new(),
            running: HashSet::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            skipped: HashMap::new(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            execution_path: Vec::new(),
            node_results: HashMap::new(),
            errors: Vec::new(),
            seed: None,
            start_input: PortData::new(),
            reject_conflicts: false,
            status_tx,
            cancellation: CancellationToken::new(),
        }
    }

    fn from_snapshot(snapshot: ExecutionSnapshot) -> Self {
        let mut ctx = Self::new(
            snapshot.execution_id,
            snapshot.workflow_id,
            snapshot.trigger_node_id,
            snapshot.affected_node_ids.into_iter().collect(),
        );
        // interrupted nodes run again
        ctx.queued = snapshot.queued.into_iter().chain(snapshot.running).collect();
        ctx.completed = snapshot.completed.into_iter().collect();
        ctx.failed = snapshot.failed.into_iter().collect();
        ctx.skipped = snapshot.skipped;
        ctx.started_at = snapshot.started_at;
        ctx.execution_path = snapshot.execution_path;
        ctx.node_results = snapshot.node_results;
        ctx.errors = snapshot.errors;
        ctx.seed = snapshot.seed;
        ctx.start_input = snapshot.start_input;
        ctx.reject_conflicts = snapshot.reject_conflicts;
        ctx.status = snapshot.status;
        ctx.status_tx.send_replace(snapshot.status);
        ctx
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    pub fn trigger_node_id(&self) -> &NodeId {
        &self.trigger_node_id
    }

    pub fn affected_node_ids(&self) -> &HashSet<NodeId> {
        &self.affected_node_ids
    }

    pub fn queued_nodes(&self) -> &HashSet<NodeId> {
        &self.queued
    }

    pub fn running_nodes(&self) -> &HashSet<NodeId> {
        &self.running
    }

    pub fn completed_nodes(&self) -> &HashSet<NodeId> {
        &self.completed
    }

    pub fn failed_nodes(&self) -> &HashSet<NodeId> {
        &self.failed
    }

    pub fn skipped_nodes(&self) -> &HashMap<NodeId, SkipReason> {
        &self.skipped
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Settled nodes in completion order
    pub fn execution_path(&self) -> &[NodeId] {
        &self.execution_path
    }

    pub fn node_results(&self) -> &HashMap<NodeId, NodeRunResult> {
        &self.node_results
    }

    pub fn node_result(&self, node_id: &str) -> Option<&NodeRunResult> {
        self.node_results.get(node_id)
    }

    pub fn errors(&self) -> &[ExecutionError] {
        &self.errors
    }

    pub fn seed(&self) -> Option<&Value> {
        self.seed.as_ref()
    }

    pub fn start_input(&self) -> &PortData {
        &self.start_input
    }

    /// Whether this execution refuses nodes another execution holds
    pub fn rejects_conflicts(&self) -> bool {
        self.reject_conflicts
    }

    pub fn node_status(&self, node_id: &str) -> NodeExecutionStatus {
        if self.queued.contains(node_id) {
            NodeExecutionStatus::Queued
        } else if self.running.contains(node_id) {
            NodeExecutionStatus::Running
        } else if self.completed.contains(node_id) {
            NodeExecutionStatus::Completed
        } else if self.failed.contains(node_id) {
            NodeExecutionStatus::Failed
        } else if self.skipped.contains_key(node_id) {
            NodeExecutionStatus::Skipped
        } else {
            NodeExecutionStatus::Idle
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.affected_node_ids.is_empty() {
            return 0.0;
        }
        self.completed.len() as f64 / self.affected_node_ids.len() as f64 * 100.0
    }

    pub fn duration(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    pub fn to_snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id,
            trigger_node_id: self.trigger_node_id.clone(),
            affected_node_ids: sorted(self.affected_node_ids.iter()),
            queued: sorted(self.queued.iter()),
            running: sorted(self.running.iter()),
            completed: sorted(self.completed.iter()),
            failed: sorted(self.failed.iter()),
            skipped: self.skipped.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            execution_path: self.execution_path.clone(),
            node_results: self.node_results.clone(),
            errors: self.errors.clone(),
            seed: self.seed.clone(),
            start_input: self.start_input.clone(),
            reject_conflicts: self.reject_conflicts,
        }
    }

    /// Move `node_id` into the set for `to`, leaving every other set
    fn place(&mut self, node_id: &NodeId, to: NodeExecutionStatus, reason: Option<SkipReason>) {
        self.queued.remove(node_id);
        self.running.remove(node_id);
        self.completed.remove(node_id);
        self.failed.remove(node_id);
        self.skipped.remove(node_id);
        match to {
            NodeExecutionStatus::Idle => {}
            NodeExecutionStatus::Queued => {
                self.queued.insert(node_id.clone());
            }
            NodeExecutionStatus::Running => {
                self.running.insert(node_id.clone());
            }
            NodeExecutionStatus::Completed => {
                self.completed.insert(node_id.clone());
            }
            NodeExecutionStatus::Failed => {
                self.failed.insert(node_id.clone());
            }
            NodeExecutionStatus::Skipped => {
                self.skipped
                    .insert(node_id.clone(), reason.unwrap_or(SkipReason::UpstreamFailed));
            }
        }
    }

    fn set_status(&mut self, status: ExecutionStatus) -> ExecutionStatus {
        let previous = self.status;
        self.status = status;
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        self.status_tx.send_replace(status);
        previous
    }

    fn record_error(&mut self, mut error: ExecutionError) {
        if error.execution_path.is_empty() {
            error.execution_path = self.execution_path.clone();
        }
        self.errors.push(error);
    }
}

fn sorted<'a>(ids: impl Iterator<Item = &'a NodeId>) -> Vec<NodeId> {
    let mut ids: Vec<NodeId> = ids.cloned().collect();
    ids.sort();
    ids
}

/// Serialisable copy of a context, used for persistence and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub trigger_node_id: NodeId,
    pub affected_node_ids: Vec<NodeId>,
    pub queued: Vec<NodeId>,
    pub running: Vec<NodeId>,
    pub completed: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub skipped: HashMap<NodeId, SkipReason>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub execution_path: Vec<NodeId>,
    pub node_results: HashMap<NodeId, NodeRunResult>,
    pub errors: Vec<ExecutionError>,
    pub seed: Option<Value>,
    pub start_input: PortData,
    #[serde(default)]
    pub reject_conflicts: bool,
}

/// Result of a requested state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The execution is no longer active; the change was dropped
    Discarded,
    /// Another active execution holds the node; it was failed with
    /// `CONCURRENT_EXECUTION_CONFLICT` instead of starting
    Rejected,
}

enum NodeUpdate {
    Status,
    Completed {
        outputs: PortData,
        duration_ms: u64,
        attempts: u32,
    },
    Failed {
        error: ExecutionError,
        duration_ms: u64,
        attempts: u32,
    },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ContextKey(u64);

#[derive(Default)]
struct Registry {
    contexts: HashMap<ContextKey, ExecutionContext>,
    ids: HashMap<ExecutionId, ContextKey>,
    node_index: HashMap<NodeId, HashSet<ContextKey>>,
    current: Option<ContextKey>,
    next_key: u64,
}

impl Registry {
    fn key(&self, execution_id: &str) -> Result<ContextKey, FlowError> {
        self.ids
            .get(execution_id)
            .copied()
            .ok_or_else(|| FlowError::ExecutionNotFound(execution_id.to_string()))
    }

    fn get(&self, execution_id: &str) -> Option<&ExecutionContext> {
        self.ids
            .get(execution_id)
            .and_then(|key| self.contexts.get(key))
    }

    fn get_mut(&mut self, execution_id: &str) -> Result<&mut ExecutionContext, FlowError> {
        let key = self.key(execution_id)?;
        self.contexts
            .get_mut(&key)
            .ok_or_else(|| FlowError::ExecutionNotFound(execution_id.to_string()))
    }

    fn insert(&mut self, ctx: ExecutionContext) -> Result<(), FlowError> {
        if self.ids.contains_key(&ctx.execution_id) {
            return Err(FlowError::Execution(format!(
                "execution {} is already registered",
                ctx.execution_id
            )));
        }
        let key = ContextKey(self.next_key);
        self.next_key += 1;
        for node in &ctx.affected_node_ids {
            self.node_index.entry(node.clone()).or_default().insert(key);
        }
        self.ids.insert(ctx.execution_id.clone(), key);
        self.contexts.insert(key, ctx);
        Ok(())
    }

    fn remove(&mut self, key: ContextKey) -> Option<ExecutionContext> {
        let ctx = self.contexts.remove(&key)?;
        for node in &ctx.affected_node_ids {
            if let Some(keys) = self.node_index.get_mut(node) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.node_index.remove(node);
                }
            }
        }
        self.ids.retain(|_, k| *k != key);
        if self.current == Some(key) {
            self.current = None;
        }
        Some(ctx)
    }

    /// First of `nodes` that an active execution other than `except` has
    /// queued or running
    fn find_conflict<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a NodeId>,
        except: Option<ContextKey>,
    ) -> Option<(NodeId, ExecutionId)> {
        let mut candidates: Vec<&NodeId> = nodes.into_iter().collect();
        candidates.sort();
        for node in candidates {
            let Some(keys) = self.node_index.get(node) else {
                continue;
            };
            let holder = keys
                .iter()
                .filter(|key| Some(**key) != except)
                .filter_map(|key| self.contexts.get(key))
                .find(|ctx| {
                    ctx.status.is_active()
                        && (ctx.queued.contains(node) || ctx.running.contains(node))
                });
            if let Some(ctx) = holder {
                return Some((node.clone(), ctx.execution_id.clone()));
            }
        }
        None
    }

    fn running_in(&self, key: ContextKey, node_id: &str) -> bool {
        self.contexts
            .get(&key)
            .map(|ctx| ctx.status == ExecutionStatus::Running && ctx.running.contains(node_id))
            .unwrap_or(false)
    }
}

/// Registry of live execution contexts.
///
/// Owns the node → executions reverse index, the only structure touched by
/// several executions, and an optional "current" execution used by UI
/// queries only. Scheduling never consults the current pointer.
pub struct ExecutionContextManager {
    registry: RwLock<Registry>,
    events: Arc<EventBus>,
}

impl ExecutionContextManager {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            events,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register a new running context covering `affected_nodes`
    pub async fn start_execution(
        &self,
        execution_id: impl Into<ExecutionId>,
        workflow_id: WorkflowId,
        trigger_node_id: impl Into<NodeId>,
        affected_nodes: HashSet<NodeId>,
    ) -> Result<(), FlowError> {
        let ctx = ExecutionContext::new(
            execution_id.into(),
            workflow_id,
            trigger_node_id.into(),
            affected_nodes,
        );
        self.register(ctx).await
    }

    /// Register a context that carries the seed data needed to rebuild it later.
    ///
    /// With `reject_conflicts` the context is refused when another active
    /// execution has one of `affected_nodes` queued or running, and later
    /// refuses to start nodes another execution holds.
    pub(crate) async fn start_seeded(
        &self,
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        trigger_node_id: NodeId,
        affected_nodes: HashSet<NodeId>,
        seed: Option<Value>,
        start_input: PortData,
        reject_conflicts: bool,
    ) -> Result<(), FlowError> {
        let mut ctx =
            ExecutionContext::new(execution_id, workflow_id, trigger_node_id, affected_nodes);
        ctx.seed = seed;
        ctx.start_input = start_input;
        ctx.reject_conflicts = reject_conflicts;
        self.register(ctx).await
    }

    /// Rebuild a context from a persisted snapshot; interrupted nodes are re-queued
    pub async fn restore_execution(&self, snapshot: ExecutionSnapshot) -> Result<(), FlowError> {
        self.register(ExecutionContext::from_snapshot(snapshot)).await
    }

    async fn register(&self, ctx: ExecutionContext) -> Result<(), FlowError> {
        let event = ExecutionEvent::ExecutionStarted {
            execution_id: ctx.execution_id.clone(),
            workflow_id: ctx.workflow_id,
            trigger_node_id: ctx.trigger_node_id.clone(),
            affected_nodes: ctx.affected_node_ids.len(),
            timestamp: Utc::now(),
        };
        let mut registry = self.registry.write().await;
        if ctx.reject_conflicts {
            if let Some((node_id, other_execution)) =
                registry.find_conflict(&ctx.affected_node_ids, None)
            {
                return Err(FlowError::ConcurrentExecutionConflict {
                    node_id,
                    other_execution,
                });
            }
        }
        registry.insert(ctx)?;
        self.events.emit(event);
        Ok(())
    }

    /// Attach a server-assigned id; the previous id keeps resolving
    pub async fn assign_execution_id(
        &self,
        execution_id: &str,
        assigned_id: impl Into<ExecutionId>,
    ) -> Result<(), FlowError> {
        let assigned_id = assigned_id.into();
        let mut registry = self.registry.write().await;
        let key = registry.key(execution_id)?;
        if let Some(existing) = registry.ids.get(&assigned_id) {
            if *existing == key {
                return Ok(());
            }
            return Err(FlowError::Execution(format!(
                "execution id {} is already in use",
                assigned_id
            )));
        }
        registry.ids.insert(assigned_id.clone(), key);
        if let Some(ctx) = registry.contexts.get_mut(&key) {
            ctx.execution_id = assigned_id;
        }
        Ok(())
    }

    pub async fn set_node_queued(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<Transition, FlowError> {
        self.transition(execution_id, node_id, NodeExecutionStatus::Queued, NodeUpdate::Status)
            .await
    }

    pub async fn set_node_running(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<Transition, FlowError> {
        self.transition(execution_id, node_id, NodeExecutionStatus::Running, NodeUpdate::Status)
            .await
    }

    pub async fn set_node_completed(
        &self,
        execution_id: &str,
        node_id: &str,
        outputs: PortData,
        duration_ms: u64,
        attempts: u32,
    ) -> Result<Transition, FlowError> {
        let update = NodeUpdate::Completed {
            outputs,
            duration_ms,
            attempts,
        };
        self.transition(execution_id, node_id, NodeExecutionStatus::Completed, update)
            .await
    }

    pub async fn set_node_failed(
        &self,
        execution_id: &str,
        node_id: &str,
        error: ExecutionError,
        duration_ms: u64,
        attempts: u32,
    ) -> Result<Transition, FlowError> {
        let update = NodeUpdate::Failed {
            error,
            duration_ms,
            attempts,
        };
        self.transition(execution_id, node_id, NodeExecutionStatus::Failed, update)
            .await
    }

    pub async fn set_node_skipped(
        &self,
        execution_id: &str,
        node_id: &str,
        reason: SkipReason,
    ) -> Result<Transition, FlowError> {
        self.transition(
            execution_id,
            node_id,
            NodeExecutionStatus::Skipped,
            NodeUpdate::Skipped(reason),
        )
        .await
    }

    async fn transition(
        &self,
        execution_id: &str,
        node_id: &str,
        to: NodeExecutionStatus,
        update: NodeUpdate,
    ) -> Result<Transition, FlowError> {
        let mut registry = self.registry.write().await;
        let key = registry.key(execution_id)?;
        let conflict = match registry.contexts.get(&key) {
            Some(ctx) if to == NodeExecutionStatus::Running && ctx.reject_conflicts => registry
                .find_conflict(ctx.affected_node_ids.get(node_id), Some(key))
                .map(|(_, other)| other),
            _ => None,
        };
        let ctx = registry.get_mut(execution_id)?;

        if !ctx.status.is_active() {
            tracing::debug!(
                "Dropping {} -> {} for node {} in {} execution {}",
                ctx.node_status(node_id),
                to,
                node_id,
                ctx.status,
                ctx.execution_id
            );
            return Ok(Transition::Discarded);
        }

        let Some(node) = ctx.affected_node_ids.get(node_id).cloned() else {
            return Err(FlowError::Execution(format!(
                "node {} is not part of execution {}",
                node_id, ctx.execution_id
            )));
        };

        let from = ctx.node_status(&node);
        if !transition_allowed(from, to) {
            return Err(FlowError::InvalidNodeTransition {
                execution_id: ctx.execution_id.clone(),
                node_id: node,
                from,
                to,
            });
        }

        let (to, update, outcome) = match conflict {
            Some(other_execution) => {
                tracing::warn!(
                    "Node {} of execution {} is held by execution {}",
                    node,
                    ctx.execution_id,
                    other_execution
                );
                let error = ExecutionError::from_flow_error(
                    &FlowError::ConcurrentExecutionConflict {
                        node_id: node.clone(),
                        other_execution,
                    },
                )
                .with_node(node.clone());
                let update = NodeUpdate::Failed {
                    error,
                    duration_ms: 0,
                    attempts: 0,
                };
                (NodeExecutionStatus::Failed, update, Transition::Rejected)
            }
            None => (to, update, Transition::Applied),
        };

        let mut data = None;
        let mut error_message = None;
        match update {
            NodeUpdate::Status => ctx.place(&node, to, None),
            NodeUpdate::Completed {
                outputs,
                duration_ms,
                attempts,
            } => {
                ctx.place(&node, to, None);
                ctx.execution_path.push(node.clone());
                let mut result = NodeRunResult::new(to);
                result.outputs = outputs.clone();
                result.duration_ms = duration_ms;
                result.attempts = attempts;
                ctx.node_results.insert(node.clone(), result);
                data = Some(outputs);
            }
            NodeUpdate::Failed {
                error,
                duration_ms,
                attempts,
            } => {
                ctx.place(&node, to, None);
                ctx.execution_path.push(node.clone());
                let mut error = error;
                if error.execution_path.is_empty() {
                    error.execution_path = ctx.execution_path.clone();
                }
                error_message = Some(error.message.clone());
                let mut result = NodeRunResult::new(to);
                result.error = Some(error.clone());
                result.duration_ms = duration_ms;
                result.attempts = attempts;
                ctx.node_results.insert(node.clone(), result);
                ctx.errors.push(error);
            }
            NodeUpdate::Skipped(reason) => {
                ctx.place(&node, to, Some(reason));
                let mut result = NodeRunResult::new(to);
                result.skip_reason = Some(reason);
                ctx.node_results.insert(node.clone(), result);
            }
        }

        self.events.emit(ExecutionEvent::NodeStatusChanged {
            execution_id: ctx.execution_id.clone(),
            node_id: node,
            status: to,
            timestamp: Utc::now(),
            data,
            error: error_message,
        });
        Ok(outcome)
    }

    /// Skip every node that has not started yet; returns the skipped ids
    pub async fn skip_pending(
        &self,
        execution_id: &str,
        reason: SkipReason,
    ) -> Result<Vec<NodeId>, FlowError> {
        let mut registry = self.registry.write().await;
        let ctx = registry.get_mut(execution_id)?;
        if !ctx.status.is_active() {
            return Ok(Vec::new());
        }

        let mut pending: Vec<NodeId> = ctx
            .affected_node_ids
            .iter()
            .filter(|id| {
                matches!(
                    ctx.node_status(id),
                    NodeExecutionStatus::Idle | NodeExecutionStatus::Queued
                )
            })
            .cloned()
            .collect();
        pending.sort();

        for node in &pending {
            ctx.place(node, NodeExecutionStatus::Skipped, Some(reason));
            let mut result = NodeRunResult::new(NodeExecutionStatus::Skipped);
            result.skip_reason = Some(reason);
            ctx.node_results.insert(node.clone(), result);
            self.events.emit(ExecutionEvent::NodeStatusChanged {
                execution_id: ctx.execution_id.clone(),
                node_id: node.clone(),
                status: NodeExecutionStatus::Skipped,
                timestamp: Utc::now(),
                data: None,
                error: None,
            });
        }
        Ok(pending)
    }

    pub async fn pause_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        self.change_status(
            execution_id,
            "pause",
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
        )
        .await
    }

    pub async fn resume_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        self.change_status(
            execution_id,
            "resume",
            ExecutionStatus::Paused,
            ExecutionStatus::Running,
        )
        .await
    }

    async fn change_status(
        &self,
        execution_id: &str,
        operation: &'static str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<(), FlowError> {
        let mut registry = self.registry.write().await;
        let ctx = registry.get_mut(execution_id)?;
        if ctx.status != from {
            return Err(FlowError::InvalidFlowState {
                execution_id: ctx.execution_id.clone(),
                status: ctx.status,
                operation,
            });
        }
        let previous = ctx.set_status(to);
        self.emit_status(ctx, previous);
        Ok(())
    }

    /// Cancel an active execution, clearing its queued and running sets.
    ///
    /// Returns `false` when the execution had already finished.
    pub async fn cancel_execution(
        &self,
        execution_id: &str,
        reason: Option<ExecutionError>,
    ) -> Result<bool, FlowError> {
        let mut registry = self.registry.write().await;
        let ctx = registry.get_mut(execution_id)?;
        if ctx.status.is_terminal() {
            return Ok(false);
        }
        ctx.queued.clear();
        ctx.running.clear();
        if let Some(error) = reason {
            ctx.record_error(error);
        }
        let previous = ctx.set_status(ExecutionStatus::Cancelled);
        ctx.cancellation.cancel();
        self.emit_status(ctx, previous);
        Ok(true)
    }

    /// Move an active execution into a terminal status
    pub async fn finish_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<Transition, FlowError> {
        let mut registry = self.registry.write().await;
        let ctx = registry.get_mut(execution_id)?;
        if !ctx.status.is_active() {
            return Ok(Transition::Discarded);
        }
        if !status.is_terminal() {
            return Err(FlowError::InvalidFlowState {
                execution_id: ctx.execution_id.clone(),
                status: ctx.status,
                operation: "finish",
            });
        }
        let previous = ctx.set_status(status);
        self.emit_status(ctx, previous);
        Ok(Transition::Applied)
    }

    pub async fn record_error(
        &self,
        execution_id: &str,
        error: ExecutionError,
    ) -> Result<(), FlowError> {
        let mut registry = self.registry.write().await;
        registry.get_mut(execution_id)?.record_error(error);
        Ok(())
    }

    fn emit_status(&self, ctx: &ExecutionContext, previous: ExecutionStatus) {
        self.events.emit(ExecutionEvent::ExecutionStatusChanged {
            execution_id: ctx.execution_id.clone(),
            previous,
            status: ctx.status,
            timestamp: Utc::now(),
        });
    }

    /// Read-only access to a context
    pub async fn read<R>(
        &self,
        execution_id: &str,
        f: impl FnOnce(&ExecutionContext) -> R,
    ) -> Option<R> {
        let registry = self.registry.read().await;
        registry.get(execution_id).map(f)
    }

    pub async fn contains(&self, execution_id: &str) -> bool {
        self.registry.read().await.ids.contains_key(execution_id)
    }

    pub async fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.read(execution_id, |ctx| ctx.status).await
    }

    pub async fn node_status(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Option<NodeExecutionStatus> {
        self.read(execution_id, |ctx| ctx.node_status(node_id)).await
    }

    pub async fn snapshot(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        self.read(execution_id, ExecutionContext::to_snapshot).await
    }

    pub async fn watch_status(&self, execution_id: &str) -> Option<watch::Receiver<ExecutionStatus>> {
        self.read(execution_id, |ctx| ctx.status_tx.subscribe()).await
    }

    pub async fn cancellation_token(&self, execution_id: &str) -> Option<CancellationToken> {
        self.read(execution_id, |ctx| ctx.cancellation.clone()).await
    }

    /// Focus an execution for UI queries, or clear the focus with `None`
    pub async fn set_current_execution(&self, execution_id: Option<&str>) -> Result<(), FlowError> {
        let mut registry = self.registry.write().await;
        registry.current = match execution_id {
            Some(id) => Some(registry.key(id)?),
            None => None,
        };
        Ok(())
    }

    pub async fn current_execution(&self) -> Option<ExecutionId> {
        let registry = self.registry.read().await;
        registry
            .current
            .and_then(|key| registry.contexts.get(&key))
            .map(|ctx| ctx.execution_id.clone())
    }

    /// True only when `node_id` is running in the focused execution and that
    /// execution is itself running
    pub async fn is_node_executing_in_current(&self, node_id: &str) -> bool {
        let registry = self.registry.read().await;
        registry
            .current
            .map(|key| registry.running_in(key, node_id))
            .unwrap_or(false)
    }

    /// Same check against an explicitly named execution
    pub async fn is_node_executing_in(&self, execution_id: &str, node_id: &str) -> bool {
        let registry = self.registry.read().await;
        registry
            .ids
            .get(execution_id)
            .map(|key| registry.running_in(*key, node_id))
            .unwrap_or(false)
    }

    /// Executions whose affected set contains `node_id`
    pub async fn executions_for_node(&self, node_id: &str) -> Vec<ExecutionId> {
        let registry = self.registry.read().await;
        let mut ids: Vec<ExecutionId> = registry
            .node_index
            .get(node_id)
            .into_iter()
            .flatten()
            .filter_map(|key| registry.contexts.get(key))
            .map(|ctx| ctx.execution_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// First node of `nodes` that an active execution has queued or running
    pub async fn find_conflict(&self, nodes: &HashSet<NodeId>) -> Option<(NodeId, ExecutionId)> {
        self.registry.read().await.find_conflict(nodes, None)
    }

    pub async fn active_executions(&self) -> Vec<ExecutionId> {
        let registry = self.registry.read().await;
        let mut ids: Vec<ExecutionId> = registry
            .contexts
            .values()
            .filter(|ctx| ctx.status.is_active())
            .map(|ctx| ctx.execution_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop a finished context and its index entries. Active contexts are kept.
    pub async fn clear_execution(&self, execution_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let Ok(key) = registry.key(execution_id) else {
            return false;
        };
        let active = registry
            .contexts
            .get(&key)
            .map(|ctx| ctx.status.is_active())
            .unwrap_or(false);
        if active {
            return false;
        }
        registry.remove(key).is_some()
    }

    /// Drop every finished context that ended at least `older_than` ago
    pub async fn clear_inactive_executions(&self, older_than: Duration) -> usize {
        let mut registry = self.registry.write().await;
        let now = Utc::now();
        let expired: Vec<ContextKey> = registry
            .contexts
            .iter()
            .filter(|(_, ctx)| {
                ctx.ended_at
                    .map(|end| (now - end).to_std().unwrap_or_default() >= older_than)
                    .unwrap_or(false)
            })
            .map(|(key, _)| *key)
            .collect();
        let count = expired.len();
        for key in expired {
            registry.remove(key);
        }
        if count > 0 {
            tracing::debug!("Evicted {} finished execution contexts", count);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.contexts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
