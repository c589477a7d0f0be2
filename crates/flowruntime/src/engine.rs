//! Cascade execution: runs the downstream closure of a start node, one
//! isolated context per execution.

use crate::context::{
    ExecutionContext, ExecutionContextManager, ExecutionSnapshot, NodeRunResult, Transition,
};
use crate::graph::WorkflowGraph;
use crate::history::DurationHistory;
use crate::resolver::DependencyResolver;
use crate::schedule::{plan_step, SchedulingView};
use crate::store::ExecutionStore;
use chrono::{DateTime, Utc};
use flowcore::{
    ConcurrencyPolicy, ErrorHandling, ExecutionError, ExecutionEvent, ExecutionId,
    ExecutionStatus, FlowError, FlowErrorKind, NodeContext, NodeError, NodeExecutionStatus,
    NodeExecutor, NodeId, NodeOutput, PortData, RetryPolicy, SkipReason, Value, WorkflowError,
    WorkflowId, MAIN_PORT,
};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Engine-wide limits and defaults
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Nodes of one execution that may run at the same time
    pub max_parallel_nodes: usize,
    /// Used when neither the caller nor the workflow sets a timeout
    pub default_timeout: Option<Duration>,
    /// How long finished contexts stay queryable; `None` keeps them
    pub context_retention: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            default_timeout: None,
            context_retention: Some(Duration::from_secs(300)),
        }
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Use this id instead of generating one
    pub execution_id: Option<ExecutionId>,
    /// Input items for the start node when it is not a trigger
    pub input: PortData,
    /// Overrides the workflow and engine timeouts
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn with_execution_id(mut self, execution_id: impl Into<ExecutionId>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_input(mut self, port: impl Into<String>, items: Vec<Value>) -> Self {
        self.input.entry(port.into()).or_default().extend(items);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final outcome of one execution
#[derive(Debug, Clone, Serialize)]
pub struct FlowExecutionResult {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    /// Completed nodes, in completion order
    pub executed_nodes: Vec<NodeId>,
    pub failed_nodes: Vec<NodeId>,
    pub skipped_nodes: Vec<NodeId>,
    pub execution_path: Vec<NodeId>,
    pub total_duration_ms: u64,
    pub node_results: HashMap<NodeId, NodeRunResult>,
    pub errors: Vec<ExecutionError>,
}

impl FlowExecutionResult {
    fn from_context(ctx: &ExecutionContext) -> Self {
        let in_path = |set: &HashSet<NodeId>| -> Vec<NodeId> {
            ctx.execution_path()
                .iter()
                .filter(|id| set.contains(*id))
                .cloned()
                .collect()
        };
        let mut skipped_nodes: Vec<NodeId> = ctx.skipped_nodes().keys().cloned().collect();
        skipped_nodes.sort();

        Self {
            execution_id: ctx.execution_id().clone(),
            workflow_id: ctx.workflow_id(),
            status: ctx.status(),
            executed_nodes: in_path(ctx.completed_nodes()),
            failed_nodes: in_path(ctx.failed_nodes()),
            skipped_nodes,
            execution_path: ctx.execution_path().to_vec(),
            total_duration_ms: ctx.duration().as_millis() as u64,
            node_results: ctx.node_results().clone(),
            errors: ctx.errors().to_vec(),
        }
    }

    fn rejected(execution_id: ExecutionId, workflow_id: WorkflowId, error: ExecutionError) -> Self {
        Self {
            execution_id,
            workflow_id,
            status: ExecutionStatus::Failed,
            executed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            skipped_nodes: Vec::new(),
            execution_path: Vec::new(),
            total_duration_ms: 0,
            node_results: HashMap::new(),
            errors: vec![error],
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    pub fn node_status(&self, node_id: &str) -> NodeExecutionStatus {
        self.node_results
            .get(node_id)
            .map(|r| r.status)
            .unwrap_or(NodeExecutionStatus::Idle)
    }

    /// Items a completed node produced on `port`
    pub fn output(&self, node_id: &str, port: &str) -> &[Value] {
        self.node_results
            .get(node_id)
            .and_then(|r| r.outputs.get(port))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn skip_reason(&self, node_id: &str) -> Option<SkipReason> {
        self.node_results.get(node_id).and_then(|r| r.skip_reason)
    }

    pub fn first_error_of(&self, kind: FlowErrorKind) -> Option<&ExecutionError> {
        self.errors.iter().find(|e| e.kind == kind)
    }
}

/// Point-in-time view of a live or recently finished execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionFlowStatus {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub node_states: HashMap<NodeId, NodeExecutionStatus>,
    pub currently_executing: Vec<NodeId>,
    pub progress_percent: f64,
    pub estimated_time_remaining_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A started execution; control calls only need the id
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    task: JoinHandle<FlowExecutionResult>,
}

impl ExecutionHandle {
    fn ready(result: FlowExecutionResult) -> Self {
        Self {
            execution_id: result.execution_id.clone(),
            task: tokio::spawn(async move { result }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the execution to reach a terminal status
    pub async fn wait(self) -> FlowExecutionResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Execution task {} aborted: {}", self.execution_id, e);
                FlowExecutionResult::rejected(
                    self.execution_id,
                    WorkflowId::nil(),
                    ExecutionError::new(
                        FlowErrorKind::NodeExecutionFailed,
                        format!("execution task aborted: {}", e),
                    ),
                )
            }
        }
    }
}

struct NodeRun {
    node_id: NodeId,
    attempt: u32,
    result: Result<NodeOutput, NodeError>,
    duration_ms: u64,
}

enum Wake {
    Settled(NodeRun),
    StatusChanged,
    Closed,
    TimedOut,
}

/// Runs executions against a [`NodeExecutor`].
///
/// Cheap to clone; clones share contexts, history and store.
#[derive(Clone)]
pub struct FlowExecutionEngine {
    executor: Arc<dyn NodeExecutor>,
    contexts: Arc<ExecutionContextManager>,
    history: Arc<DurationHistory>,
    store: Option<Arc<dyn ExecutionStore>>,
    config: EngineConfig,
}

impl FlowExecutionEngine {
    pub fn new(
        executor: Arc<dyn NodeExecutor>,
        contexts: Arc<ExecutionContextManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            contexts,
            history: Arc::new(DurationHistory::new()),
            store: None,
            config,
        }
    }

    /// Persist a snapshot after every settled node and status change
    pub fn with_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_history(mut self, history: Arc<DurationHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn contexts(&self) -> &Arc<ExecutionContextManager> {
        &self.contexts
    }

    pub fn history(&self) -> &Arc<DurationHistory> {
        &self.history
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the cascade below a trigger node and wait for it to finish
    pub async fn execute_from_trigger(
        &self,
        graph: Arc<WorkflowGraph>,
        trigger_node_id: &str,
        trigger_data: Value,
        options: ExecuteOptions,
    ) -> FlowExecutionResult {
        self.start_from_trigger(graph, trigger_node_id, trigger_data, options)
            .await
            .wait()
            .await
    }

    /// Run `node_id` and everything downstream of it, then wait
    pub async fn execute_from_node(
        &self,
        graph: Arc<WorkflowGraph>,
        node_id: &str,
        options: ExecuteOptions,
    ) -> FlowExecutionResult {
        self.start_from_node(graph, node_id, options)
            .await
            .wait()
            .await
    }

    /// Start a trigger cascade in the background.
    ///
    /// The trigger is not executed; its output is `trigger_data` on the
    /// main port (an array is split into one item per element).
    pub async fn start_from_trigger(
        &self,
        graph: Arc<WorkflowGraph>,
        trigger_node_id: &str,
        trigger_data: Value,
        options: ExecuteOptions,
    ) -> ExecutionHandle {
        self.start(graph, trigger_node_id, Some(trigger_data), options)
            .await
    }

    /// Start a partial run from any node in the background
    pub async fn start_from_node(
        &self,
        graph: Arc<WorkflowGraph>,
        node_id: &str,
        options: ExecuteOptions,
    ) -> ExecutionHandle {
        self.start(graph, node_id, None, options).await
    }

    async fn start(
        &self,
        graph: Arc<WorkflowGraph>,
        start_id: &str,
        seed: Option<Value>,
        options: ExecuteOptions,
    ) -> ExecutionHandle {
        let execution_id = options
            .execution_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let start_id = start_id.to_string();

        if !graph.contains(&start_id) {
            let error = ExecutionError::new(
                FlowErrorKind::MissingDependency,
                format!("start node {} does not exist in the workflow", start_id),
            )
            .with_node(start_id.clone());
            return self
                .reject(execution_id, &graph, &start_id, HashSet::new(), error)
                .await;
        }

        let affected = DependencyResolver::new(&graph).get_downstream_closure(&start_id);
        let scope = Arc::new(graph.subgraph(&affected));

        let cycles = DependencyResolver::new(&scope).detect_circular_dependencies();
        if !cycles.is_empty() {
            let mut in_cycle: Vec<NodeId> = cycles
                .iter()
                .flat_map(|c| c.cycle.iter().cloned())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            in_cycle.sort();
            let described: Vec<String> = cycles.iter().map(|c| c.describe()).collect();
            let error = ExecutionError::new(
                FlowErrorKind::CircularDependency,
                format!("Circular dependency: {}", described.join("; ")),
            )
            .with_affected_nodes(in_cycle);
            return self
                .reject(execution_id, &graph, &start_id, affected, error)
                .await;
        }

        let affected_count = affected.len();
        let reject_conflicts =
            scope.settings().concurrency == ConcurrencyPolicy::RejectConflicting;
        let registered = self
            .contexts
            .start_seeded(
                execution_id.clone(),
                graph.workflow_id(),
                start_id.clone(),
                affected.clone(),
                seed,
                options.input,
                reject_conflicts,
            )
            .await;
        match registered {
            Ok(()) => {}
            Err(FlowError::ConcurrentExecutionConflict {
                node_id,
                other_execution,
            }) => {
                let error = ExecutionError::from_flow_error(
                    &FlowError::ConcurrentExecutionConflict {
                        node_id: node_id.clone(),
                        other_execution,
                    },
                )
                .with_node(node_id);
                return self
                    .reject(execution_id, &graph, &start_id, affected, error)
                    .await;
            }
            Err(e) => {
                tracing::error!("Cannot register execution {}: {}", execution_id, e);
                return ExecutionHandle::ready(FlowExecutionResult::rejected(
                    execution_id,
                    graph.workflow_id(),
                    ExecutionError::from_flow_error(&e),
                ));
            }
        }

        tracing::info!(
            "Starting execution {} of workflow {} from {} ({} nodes)",
            execution_id,
            graph.workflow_id(),
            start_id,
            affected_count
        );
        self.persist(&execution_id).await;

        let timeout = options
            .timeout
            .or_else(|| scope.settings().execution_timeout_ms.map(Duration::from_millis))
            .or(self.config.default_timeout);
        self.spawn_run(execution_id, scope, start_id, timeout)
    }

    /// Register a context that fails before any node runs
    async fn reject(
        &self,
        execution_id: ExecutionId,
        graph: &WorkflowGraph,
        start_id: &str,
        affected: HashSet<NodeId>,
        error: ExecutionError,
    ) -> ExecutionHandle {
        tracing::error!("Execution {} rejected: {}", execution_id, error);
        let registered = self
            .contexts
            .start_execution(execution_id.clone(), graph.workflow_id(), start_id, affected)
            .await;
        if let Err(e) = registered {
            tracing::warn!("Cannot register rejected execution {}: {}", execution_id, e);
            return ExecutionHandle::ready(FlowExecutionResult::rejected(
                execution_id,
                graph.workflow_id(),
                error,
            ));
        }

        if let Err(e) = self.contexts.record_error(&execution_id, error.clone()).await {
            tracing::warn!("Cannot record error for {}: {}", execution_id, e);
        }
        if let Err(e) = self
            .contexts
            .finish_execution(&execution_id, ExecutionStatus::Failed)
            .await
        {
            tracing::warn!("Cannot finish rejected execution {}: {}", execution_id, e);
        }

        let result = match self.result_of(&execution_id).await {
            Some(result) => result,
            None => FlowExecutionResult::rejected(execution_id.clone(), graph.workflow_id(), error),
        };
        self.emit_finished(&result);
        self.schedule_eviction(&execution_id);
        ExecutionHandle::ready(result)
    }

    fn spawn_run(
        &self,
        execution_id: ExecutionId,
        scope: Arc<WorkflowGraph>,
        start_id: NodeId,
        timeout: Option<Duration>,
    ) -> ExecutionHandle {
        let engine = self.clone();
        let id = execution_id.clone();
        let task = tokio::spawn(async move { engine.run(id, scope, start_id, timeout).await });
        ExecutionHandle { execution_id, task }
    }

    async fn run(
        self,
        execution_id: ExecutionId,
        scope: Arc<WorkflowGraph>,
        start_id: NodeId,
        timeout: Option<Duration>,
    ) -> FlowExecutionResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        if let Err(e) = self.drive(&execution_id, &scope, &start_id, deadline).await {
            tracing::error!("Execution {} aborted: {}", execution_id, e);
            let error = ExecutionError::from_flow_error(&e);
            if let Err(e) = self.contexts.record_error(&execution_id, error).await {
                tracing::warn!("Cannot record error for {}: {}", execution_id, e);
            }
            if let Err(e) = self
                .contexts
                .finish_execution(&execution_id, ExecutionStatus::Failed)
                .await
            {
                tracing::warn!("Cannot finish execution {}: {}", execution_id, e);
            }
        }
        self.finalize(&execution_id, &scope).await
    }

    async fn drive(
        &self,
        execution_id: &str,
        scope: &Arc<WorkflowGraph>,
        start_id: &str,
        mut deadline: Option<Instant>,
    ) -> Result<(), FlowError> {
        let not_found = || FlowError::ExecutionNotFound(execution_id.to_string());
        let mut status_rx = self
            .contexts
            .watch_status(execution_id)
            .await
            .ok_or_else(not_found)?;
        let cancellation = self
            .contexts
            .cancellation_token(execution_id)
            .await
            .ok_or_else(not_found)?;

        if self.contexts.node_status(execution_id, start_id).await
            == Some(NodeExecutionStatus::Idle)
        {
            let seeded = self
                .contexts
                .read(execution_id, |ctx| ctx.seed().is_some())
                .await
                .unwrap_or(false);
            if scope.is_disabled(start_id) && !seeded {
                tracing::debug!("Start node {} is disabled", start_id);
                self.contexts
                    .set_node_skipped(execution_id, start_id, SkipReason::Disabled)
                    .await?;
            } else {
                self.contexts.set_node_queued(execution_id, start_id).await?;
            }
        }
        // restored contexts may hold settled nodes whose dependents were never planned
        self.advance(execution_id, scope, start_id).await?;

        let max_parallel = self.config.max_parallel_nodes.max(1);
        let mut in_flight: FuturesUnordered<BoxFuture<'static, NodeRun>> = FuturesUnordered::new();

        loop {
            let status = *status_rx.borrow_and_update();
            if status.is_terminal() {
                break;
            }

            if status == ExecutionStatus::Running {
                for node_id in self.queued_in_order(execution_id, scope).await {
                    if in_flight.len() >= max_parallel {
                        break;
                    }
                    match self.contexts.set_node_running(execution_id, &node_id).await? {
                        Transition::Applied => {}
                        Transition::Discarded => break,
                        Transition::Rejected => {
                            self.apply_failure_policy(execution_id, scope, &node_id)
                                .await?;
                            self.advance(execution_id, scope, start_id).await?;
                            self.persist(execution_id).await;
                            // the failure may have settled other queued nodes
                            break;
                        }
                    }
                    match self.seed_of(execution_id, &node_id, start_id).await {
                        Some(seed) => {
                            self.complete_seed(execution_id, scope, start_id, &node_id, seed)
                                .await?;
                        }
                        None => {
                            let run = self
                                .dispatch(execution_id, scope, &node_id, 1, None, &cancellation)
                                .await?;
                            in_flight.push(run);
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                if status == ExecutionStatus::Running {
                    if self.has_queued(execution_id).await {
                        continue;
                    }
                    break;
                }
                // paused with nothing in flight: wait for resume, cancel or deadline
                let wake = tokio::select! {
                    changed = status_rx.changed() => match changed {
                        Ok(()) => Wake::StatusChanged,
                        Err(_) => Wake::Closed,
                    },
                    _ = wait_deadline(deadline) => Wake::TimedOut,
                };
                match wake {
                    Wake::Closed => break,
                    Wake::TimedOut => {
                        self.expire(execution_id).await?;
                        deadline = None;
                    }
                    _ => {}
                }
                continue;
            }

            let wake = tokio::select! {
                Some(run) = in_flight.next() => Wake::Settled(run),
                changed = status_rx.changed() => match changed {
                    Ok(()) => Wake::StatusChanged,
                    Err(_) => Wake::Closed,
                },
                _ = wait_deadline(deadline) => Wake::TimedOut,
            };
            match wake {
                Wake::Settled(run) => {
                    self.settle(execution_id, scope, start_id, run, &mut in_flight, &cancellation)
                        .await?;
                }
                Wake::StatusChanged => {}
                Wake::Closed => break,
                Wake::TimedOut => {
                    self.expire(execution_id).await?;
                    deadline = None;
                }
            }
        }

        Ok(())
    }

    async fn queued_in_order(&self, execution_id: &str, scope: &WorkflowGraph) -> Vec<NodeId> {
        let queued = self
            .contexts
            .read(execution_id, |ctx| ctx.queued_nodes().clone())
            .await
            .unwrap_or_default();
        scope
            .nodes()
            .iter()
            .filter(|n| queued.contains(&n.id))
            .map(|n| n.id.clone())
            .collect()
    }

    async fn has_queued(&self, execution_id: &str) -> bool {
        self.contexts
            .read(execution_id, |ctx| !ctx.queued_nodes().is_empty())
            .await
            .unwrap_or(false)
    }

    /// Trigger data for the start node of a trigger cascade
    async fn seed_of(&self, execution_id: &str, node_id: &str, start_id: &str) -> Option<Value> {
        if node_id != start_id {
            return None;
        }
        self.contexts
            .read(execution_id, |ctx| ctx.seed().cloned())
            .await
            .flatten()
    }

    async fn complete_seed(
        &self,
        execution_id: &str,
        scope: &WorkflowGraph,
        start_id: &str,
        node_id: &str,
        seed: Value,
    ) -> Result<(), FlowError> {
        let items = match seed {
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut outputs = PortData::new();
        outputs.insert(MAIN_PORT.to_string(), items);
        if self
            .contexts
            .set_node_completed(execution_id, node_id, outputs, 0, 1)
            .await?
            == Transition::Applied
        {
            tracing::debug!("Trigger {} seeded execution {}", node_id, execution_id);
            self.advance(execution_id, scope, start_id).await?;
            self.persist(execution_id).await;
        }
        Ok(())
    }

    /// Spawn one attempt of a node, optionally after a retry delay
    async fn dispatch(
        &self,
        execution_id: &str,
        scope: &WorkflowGraph,
        node_id: &str,
        attempt: u32,
        delay: Option<Duration>,
        cancellation: &CancellationToken,
    ) -> Result<BoxFuture<'static, NodeRun>, FlowError> {
        let spec = scope
            .node(node_id)
            .ok_or_else(|| WorkflowError::NodeNotFound(node_id.to_string()))?;
        let inputs = self.collect_inputs(execution_id, scope, node_id).await?;

        let mut ctx = NodeContext::new(
            execution_id.to_string(),
            node_id,
            spec.node_type.clone(),
            self.contexts
                .events()
                .create_emitter(execution_id.to_string(), node_id.to_string()),
        );
        ctx.inputs = inputs;
        ctx.config = spec.config.clone();
        ctx.cancellation = cancellation.child_token();

        tracing::debug!(
            "Dispatching node {} ({}) attempt {} in execution {}",
            node_id,
            spec.node_type,
            attempt,
            execution_id
        );

        let executor = self.executor.clone();
        let node_timeout = scope.settings().node_timeout_ms;
        let token = cancellation.clone();
        let task = tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return (Err(NodeError::Cancelled), 0),
                }
            }
            let start = Instant::now();
            let result = match node_timeout {
                Some(millis) => {
                    match timeout(Duration::from_millis(millis), executor.execute(ctx)).await {
                        Ok(result) => result,
                        Err(_) => Err(NodeError::Timeout { millis }),
                    }
                }
                None => executor.execute(ctx).await,
            };
            (result, start.elapsed().as_millis() as u64)
        });

        let node_id = node_id.to_string();
        Ok(async move {
            let (result, duration_ms) = match task.await {
                Ok(outcome) => outcome,
                Err(e) => (
                    Err(NodeError::ExecutionFailed(format!("node task panicked: {}", e))),
                    0,
                ),
            };
            NodeRun {
                node_id,
                attempt,
                result,
                duration_ms,
            }
        }
        .boxed())
    }

    /// Merge items from every activated incoming connection.
    ///
    /// Upstream nodes contribute in completion order; a start node without
    /// in-scope inputs receives the caller's input.
    async fn collect_inputs(
        &self,
        execution_id: &str,
        scope: &WorkflowGraph,
        node_id: &str,
    ) -> Result<PortData, FlowError> {
        let incoming: Vec<_> = scope.incoming(node_id).into_iter().cloned().collect();
        self.contexts
            .read(execution_id, |ctx| {
                if incoming.is_empty() {
                    return ctx.start_input().clone();
                }
                let mut inputs = PortData::new();
                for source in ctx.execution_path() {
                    let Some(result) = ctx.node_result(source) else {
                        continue;
                    };
                    if result.status != NodeExecutionStatus::Completed {
                        continue;
                    }
                    for conn in incoming.iter().filter(|c| &c.from_node == source) {
                        if let Some(items) = result.outputs.get(&conn.from_port) {
                            if !items.is_empty() {
                                inputs
                                    .entry(conn.to_port.clone())
                                    .or_default()
                                    .extend(items.iter().cloned());
                            }
                        }
                    }
                }
                inputs
            })
            .await
            .ok_or_else(|| FlowError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn settle(
        &self,
        execution_id: &str,
        scope: &WorkflowGraph,
        start_id: &str,
        run: NodeRun,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, NodeRun>>,
        cancellation: &CancellationToken,
    ) -> Result<(), FlowError> {
        let NodeRun {
            node_id,
            attempt,
            result,
            duration_ms,
        } = run;

        match result {
            Ok(output) => {
                let applied = self
                    .contexts
                    .set_node_completed(execution_id, &node_id, output.outputs, duration_ms, attempt)
                    .await?;
                if applied == Transition::Discarded {
                    tracing::debug!("Discarding late result of node {}", node_id);
                    return Ok(());
                }
                tracing::info!("Node {} completed in {}ms", node_id, duration_ms);
                self.history
                    .record(scope.workflow_id(), &node_id, duration_ms)
                    .await;
            }
            Err(error) => {
                if let Some(policy) = retry_policy(scope, &node_id) {
                    let retryable = !matches!(error, NodeError::Cancelled);
                    if retryable && attempt < policy.max_attempts && !cancellation.is_cancelled() {
                        let delay = policy.delay_after(attempt);
                        tracing::warn!(
                            "Node {} failed (attempt {}/{}): {}; retrying in {:?}",
                            node_id,
                            attempt,
                            policy.max_attempts,
                            error,
                            delay
                        );
                        let retry = self
                            .dispatch(
                                execution_id,
                                scope,
                                &node_id,
                                attempt + 1,
                                Some(delay),
                                cancellation,
                            )
                            .await?;
                        // takes over the slot of the attempt that just settled
                        in_flight.push(retry);
                        return Ok(());
                    }
                }

                let kind = match error {
                    NodeError::Timeout { .. } => FlowErrorKind::ExecutionTimeout,
                    _ => FlowErrorKind::NodeExecutionFailed,
                };
                let mut downstream: Vec<NodeId> = DependencyResolver::new(scope)
                    .get_downstream_closure(&node_id)
                    .into_iter()
                    .filter(|id| id != &node_id)
                    .collect();
                downstream.sort();
                let record = ExecutionError::new(kind, error.to_string())
                    .with_node(node_id.clone())
                    .with_affected_nodes(downstream);

                let applied = self
                    .contexts
                    .set_node_failed(execution_id, &node_id, record, duration_ms, attempt)
                    .await?;
                if applied == Transition::Discarded {
                    tracing::debug!("Discarding late failure of node {}", node_id);
                    return Ok(());
                }
                tracing::error!("Node {} failed: {}", node_id, error);
                self.apply_failure_policy(execution_id, scope, &node_id)
                    .await?;
            }
        }

        self.advance(execution_id, scope, start_id).await?;
        self.persist(execution_id).await;
        Ok(())
    }

    /// Under `StopWorkflow`, skip everything that has not started yet
    async fn apply_failure_policy(
        &self,
        execution_id: &str,
        scope: &WorkflowGraph,
        failed_node: &str,
    ) -> Result<(), FlowError> {
        if scope.settings().on_error != ErrorHandling::StopWorkflow {
            return Ok(());
        }
        let skipped = self
            .contexts
            .skip_pending(execution_id, SkipReason::WorkflowStopped)
            .await?;
        tracing::info!(
            "Stopping execution {} after failure of {} ({} pending nodes skipped)",
            execution_id,
            failed_node,
            skipped.len()
        );
        Ok(())
    }

    /// Apply one scheduling step: skip unreachable nodes, queue ready ones
    async fn advance(
        &self,
        execution_id: &str,
        scope: &WorkflowGraph,
        start_id: &str,
    ) -> Result<(), FlowError> {
        let view = self
            .contexts
            .read(execution_id, SchedulingView::from_context)
            .await
            .ok_or_else(|| FlowError::ExecutionNotFound(execution_id.to_string()))?;
        let plan = plan_step(&DependencyResolver::new(scope), start_id, &view);

        for (node_id, reason) in plan.skipped {
            if self
                .contexts
                .set_node_skipped(execution_id, &node_id, reason)
                .await?
                == Transition::Discarded
            {
                return Ok(());
            }
            tracing::debug!("Skipped node {} ({:?})", node_id, reason);
        }
        for node_id in plan.ready {
            if self.contexts.set_node_queued(execution_id, &node_id).await?
                == Transition::Discarded
            {
                return Ok(());
            }
            tracing::debug!("Queued node {}", node_id);
        }
        Ok(())
    }

    async fn expire(&self, execution_id: &str) -> Result<(), FlowError> {
        let unfinished = self
            .contexts
            .read(execution_id, |ctx| {
                let mut ids: Vec<NodeId> = ctx
                    .running_nodes()
                    .iter()
                    .chain(ctx.queued_nodes().iter())
                    .cloned()
                    .collect();
                ids.sort();
                ids
            })
            .await
            .unwrap_or_default();
        let error = ExecutionError::new(
            FlowErrorKind::ExecutionTimeout,
            "execution exceeded its time budget",
        )
        .with_affected_nodes(unfinished);
        tracing::warn!("Execution {} timed out", execution_id);
        if self.contexts.cancel_execution(execution_id, Some(error)).await? {
            self.persist(execution_id).await;
        }
        Ok(())
    }

    async fn finalize(&self, execution_id: &str, scope: &WorkflowGraph) -> FlowExecutionResult {
        let outcome = self
            .contexts
            .read(execution_id, |ctx| {
                (ctx.status(), !ctx.failed_nodes().is_empty())
            })
            .await;
        if let Some((status, has_failures)) = outcome {
            if status.is_active() {
                let terminal = if !has_failures {
                    ExecutionStatus::Completed
                } else if scope.settings().on_error == ErrorHandling::ContinueOnError {
                    ExecutionStatus::Partial
                } else {
                    ExecutionStatus::Failed
                };
                if let Err(e) = self.contexts.finish_execution(execution_id, terminal).await {
                    tracing::warn!("Cannot finish execution {}: {}", execution_id, e);
                }
            }
        }

        let result = match self.result_of(execution_id).await {
            Some(result) => result,
            None => FlowExecutionResult::rejected(
                execution_id.to_string(),
                scope.workflow_id(),
                ExecutionError::new(
                    FlowErrorKind::NodeExecutionFailed,
                    "execution context disappeared before completion",
                ),
            ),
        };
        tracing::info!(
            "Execution {} finished as {} in {}ms ({} completed, {} failed, {} skipped)",
            execution_id,
            result.status,
            result.total_duration_ms,
            result.executed_nodes.len(),
            result.failed_nodes.len(),
            result.skipped_nodes.len()
        );
        self.emit_finished(&result);
        self.persist(execution_id).await;
        self.schedule_eviction(execution_id);
        result
    }

    fn emit_finished(&self, result: &FlowExecutionResult) {
        self.contexts.events().emit(ExecutionEvent::ExecutionFinished {
            execution_id: result.execution_id.clone(),
            status: result.status,
            duration_ms: result.total_duration_ms,
            timestamp: Utc::now(),
        });
    }

    async fn result_of(&self, execution_id: &str) -> Option<FlowExecutionResult> {
        self.contexts
            .read(execution_id, FlowExecutionResult::from_context)
            .await
    }

    async fn persist(&self, execution_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(snapshot) = self.contexts.snapshot(execution_id).await else {
            return;
        };
        if let Err(e) = store.save(&snapshot).await {
            tracing::warn!("Failed to persist execution {}: {}", execution_id, e);
        }
    }

    fn schedule_eviction(&self, execution_id: &str) {
        let Some(retention) = self.config.context_retention else {
            return;
        };
        let contexts = self.contexts.clone();
        let execution_id = execution_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if contexts.clear_execution(&execution_id).await {
                tracing::debug!("Evicted execution context {}", execution_id);
            }
        });
    }

    /// Stop an execution. Running nodes see their cancellation token fire;
    /// results they still deliver are dropped. Idempotent.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        if self.contexts.cancel_execution(execution_id, None).await? {
            tracing::info!("Cancelled execution {}", execution_id);
            self.persist(execution_id).await;
        }
        Ok(())
    }

    /// Stop dispatching queued nodes; running nodes finish and are recorded
    pub async fn pause_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        self.contexts.pause_execution(execution_id).await?;
        tracing::info!("Paused execution {}", execution_id);
        self.persist(execution_id).await;
        Ok(())
    }

    pub async fn resume_execution(&self, execution_id: &str) -> Result<(), FlowError> {
        self.contexts.resume_execution(execution_id).await?;
        tracing::info!("Resumed execution {}", execution_id);
        self.persist(execution_id).await;
        Ok(())
    }

    pub async fn get_execution_status(&self, execution_id: &str) -> Option<ExecutionFlowStatus> {
        let (mut status, workflow_id, remaining) = self
            .contexts
            .read(execution_id, |ctx| {
                let node_states: HashMap<NodeId, NodeExecutionStatus> = ctx
                    .affected_node_ids()
                    .iter()
                    .map(|id| (id.clone(), ctx.node_status(id)))
                    .collect();
                let remaining: Vec<NodeId> = node_states
                    .iter()
                    .filter(|(_, s)| !s.is_settled())
                    .map(|(id, _)| id.clone())
                    .collect();
                let mut currently_executing: Vec<NodeId> =
                    ctx.running_nodes().iter().cloned().collect();
                currently_executing.sort();
                let status = ExecutionFlowStatus {
                    execution_id: ctx.execution_id().clone(),
                    status: ctx.status(),
                    node_states,
                    currently_executing,
                    progress_percent: ctx.progress_percent(),
                    estimated_time_remaining_ms: None,
                    started_at: ctx.started_at(),
                    ended_at: ctx.ended_at(),
                };
                (status, ctx.workflow_id(), remaining)
            })
            .await?;

        status.estimated_time_remaining_ms = if status.status.is_active() {
            self.history
                .estimate_remaining_ms(workflow_id, remaining.iter())
                .await
        } else {
            Some(0)
        };
        Some(status)
    }

    /// Continue a persisted execution; nodes that were running start over
    pub async fn restore_execution(
        &self,
        graph: Arc<WorkflowGraph>,
        snapshot: ExecutionSnapshot,
        timeout: Option<Duration>,
    ) -> Result<ExecutionHandle, FlowError> {
        let affected: HashSet<NodeId> = snapshot.affected_node_ids.iter().cloned().collect();
        let scope = Arc::new(graph.subgraph(&affected));
        let execution_id = snapshot.execution_id.clone();
        let start_id = snapshot.trigger_node_id.clone();
        let interrupted = snapshot.running.len();

        self.contexts.restore_execution(snapshot).await?;
        tracing::info!(
            "Restored execution {} ({} interrupted nodes re-queued)",
            execution_id,
            interrupted
        );
        self.persist(&execution_id).await;
        Ok(self.spawn_run(execution_id, scope, start_id, timeout))
    }

    /// Register a persisted execution as failed without running anything
    pub async fn abandon_execution(
        &self,
        mut snapshot: ExecutionSnapshot,
        reason: &str,
    ) -> Result<FlowExecutionResult, FlowError> {
        let execution_id = snapshot.execution_id.clone();
        let mut interrupted: Vec<NodeId> = snapshot
            .running
            .drain(..)
            .chain(snapshot.queued.drain(..))
            .collect();
        interrupted.sort();

        self.contexts.restore_execution(snapshot).await?;
        let error = ExecutionError::new(FlowErrorKind::NodeExecutionFailed, reason)
            .with_affected_nodes(interrupted);
        self.contexts.record_error(&execution_id, error).await?;
        self.contexts
            .finish_execution(&execution_id, ExecutionStatus::Failed)
            .await?;
        tracing::warn!("Marked execution {} as failed: {}", execution_id, reason);

        let result = self
            .result_of(&execution_id)
            .await
            .ok_or_else(|| FlowError::ExecutionNotFound(execution_id.clone()))?;
        self.emit_finished(&result);
        self.persist(&execution_id).await;
        self.schedule_eviction(&execution_id);
        Ok(result)
    }
}

fn retry_policy(scope: &WorkflowGraph, node_id: &str) -> Option<RetryPolicy> {
    scope
        .node(node_id)
        .and_then(|n| n.retry_policy.clone())
        .or_else(|| scope.settings().retry.clone())
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
