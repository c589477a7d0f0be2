//! Shared helpers for runtime integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    EventBus, ExecutionId, NodeContext, NodeError, NodeExecutionStatus, NodeExecutor, NodeId,
    NodeOutput, NodeSpec, PortData, Value, Workflow, MAIN_PORT,
};
use flowruntime::{
    EngineConfig, ExecutionContextManager, FlowExecutionEngine, WorkflowGraph,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

pub const TEST_NODE: &str = "test.node";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn trigger(id: &str) -> NodeSpec {
    NodeSpec::new(id, "trigger.manual")
}

pub fn node(id: &str) -> NodeSpec {
    NodeSpec::new(id, TEST_NODE)
}

/// Workflow from node specs and `(from, to)` main-port connections
pub fn workflow(nodes: Vec<NodeSpec>, edges: &[(&str, &str)]) -> Workflow {
    let mut wf = Workflow::new("test");
    for spec in nodes {
        wf.add_node(spec);
    }
    for (from, to) in edges {
        wf.connect_main(*from, *to);
    }
    wf
}

pub fn graph(workflow: &Workflow) -> Arc<WorkflowGraph> {
    Arc::new(WorkflowGraph::from_workflow(workflow).expect("valid workflow"))
}

pub fn engine(executor: Arc<ScriptedExecutor>) -> FlowExecutionEngine {
    engine_with(executor, EngineConfig::default())
}

pub fn engine_with(executor: Arc<ScriptedExecutor>, config: EngineConfig) -> FlowExecutionEngine {
    let contexts = Arc::new(ExecutionContextManager::new(Arc::new(EventBus::new(1024))));
    FlowExecutionEngine::new(executor, contexts, config)
}

/// Behaviour of one node in the scripted executor
#[derive(Clone, Default)]
pub struct Script {
    pub delay: Option<Duration>,
    /// Always fail with this message
    pub fail: Option<String>,
    /// Fail this many attempts, then succeed
    pub fail_first: u32,
    /// Replaces the default output (`main: [node id]`)
    pub outputs: Option<PortData>,
    /// Block until a permit is available
    pub gate: Option<Arc<Semaphore>>,
}

impl Script {
    pub fn delay(ms: u64) -> Self {
        Self {
            delay: Some(Duration::from_millis(ms)),
            ..Default::default()
        }
    }

    pub fn fail(message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn fail_first(times: u32) -> Self {
        Self {
            fail_first: times,
            ..Default::default()
        }
    }

    pub fn gated(gate: &Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate.clone()),
            ..Default::default()
        }
    }

    pub fn port(port: &str, items: Vec<Value>) -> Self {
        let mut outputs = PortData::new();
        outputs.insert(port.to_string(), items);
        Self {
            outputs: Some(outputs),
            ..Default::default()
        }
    }
}

/// Test executor driven by per-node scripts.
///
/// Records every attempt, the inputs it saw and the peak number of
/// concurrently running nodes. Gates and delays observe cancellation.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<NodeId, Script>>,
    attempts: Mutex<HashMap<(ExecutionId, NodeId), u32>>,
    inputs: Mutex<HashMap<(ExecutionId, NodeId), PortData>>,
    started: Mutex<Vec<(ExecutionId, NodeId)>>,
    finished: Mutex<Vec<(ExecutionId, NodeId)>>,
    running: AtomicUsize,
    peak: AtomicUsize,
    notify: Mutex<Option<mpsc::UnboundedSender<(ExecutionId, NodeId)>>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(self: &Arc<Self>, node_id: &str, script: Script) -> Arc<Self> {
        self.scripts
            .lock()
            .unwrap()
            .insert(node_id.to_string(), script);
        self.clone()
    }

    /// Receive `(execution, node)` each time an attempt starts
    pub fn subscribe_starts(&self) -> mpsc::UnboundedReceiver<(ExecutionId, NodeId)> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify.lock().unwrap() = Some(tx);
        rx
    }

    /// Node ids of every started attempt, in start order
    pub fn started_nodes(&self) -> Vec<NodeId> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(_, node)| node.clone())
            .collect()
    }

    pub fn finished_nodes(&self) -> Vec<NodeId> {
        self.finished
            .lock()
            .unwrap()
            .iter()
            .map(|(_, node)| node.clone())
            .collect()
    }

    pub fn start_count(&self, node_id: &str) -> usize {
        self.started_nodes().iter().filter(|n| *n == node_id).count()
    }

    pub fn inputs_of(&self, execution_id: &str, node_id: &str) -> PortData {
        self.inputs
            .lock()
            .unwrap()
            .get(&(execution_id.to_string(), node_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn peak_running(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl NodeExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let key = (ctx.execution_id.clone(), ctx.node_id.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&ctx.node_id)
            .cloned()
            .unwrap_or_default();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.inputs
            .lock()
            .unwrap()
            .insert(key.clone(), ctx.inputs.clone());
        self.started.lock().unwrap().push(key.clone());
        if let Some(tx) = self.notify.lock().unwrap().as_ref() {
            let _ = tx.send(key.clone());
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        if let Some(gate) = &script.gate {
            tokio::select! {
                permit = gate.acquire() => {
                    permit.map_err(|_| NodeError::Cancelled)?.forget();
                }
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            }
        }
        if let Some(delay) = script.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            }
        }

        self.finished.lock().unwrap().push(key);

        if let Some(message) = script.fail {
            return Err(NodeError::ExecutionFailed(message));
        }
        if attempt <= script.fail_first {
            return Err(NodeError::ExecutionFailed(format!(
                "attempt {} failed",
                attempt
            )));
        }

        Ok(match script.outputs {
            Some(outputs) => NodeOutput {
                outputs,
                ..Default::default()
            },
            None => NodeOutput::new().with_output(MAIN_PORT, ctx.node_id.clone()),
        })
    }
}

/// Poll until `node_id` reaches `status` in the execution
pub async fn wait_for_node(
    engine: &FlowExecutionEngine,
    execution_id: &str,
    node_id: &str,
    status: NodeExecutionStatus,
) {
    let contexts = engine.contexts().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if contexts.node_status(execution_id, node_id).await == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("node {} never reached {}", node_id, status));
}
