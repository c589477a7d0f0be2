use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value, MAIN_PORT};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

const DEFAULT_DELAY_MS: u64 = 1000;

/// Delay execution for a specified duration
pub struct DelayNode {
    delay_ms: u64,
}

impl DelayNode {
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        "time.delay"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        ctx.events.info(format!("Delaying for {}ms", self.delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(self.delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        // Pass through every input port unchanged
        Ok(NodeOutput {
            outputs: ctx.inputs,
            metadata: flowcore::NodeMetadata {
                execution_time_ms: self.delay_ms,
                ..Default::default()
            },
        })
    }

    fn validate_config(&self, config: &HashMap<String, Value>) -> Result<(), NodeError> {
        match config.get("delay_ms") {
            Some(v) if v.as_f64().map(|ms| ms < 0.0).unwrap_or(true) => Err(
                NodeError::Configuration("delay_ms must be a non-negative number".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let delay_ms = config
            .get("delay_ms")
            .and_then(|v| v.as_f64())
            .map(|ms| ms.max(0.0) as u64)
            .unwrap_or(DEFAULT_DELAY_MS);
        Ok(Box::new(DelayNode::new(delay_ms)))
    }

    fn node_type(&self) -> &str {
        "time.delay"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Delay execution for specified milliseconds".to_string(),
            category: "time".to_string(),
            inputs: vec![PortDefinition::new(MAIN_PORT, "Items to hold back")],
            outputs: vec![PortDefinition::new(MAIN_PORT, "The same items, later")],
        }
    }
}
