use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value, MAIN_PORT};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

/// Simple debug node that logs its input items and passes them on
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    fn node_type(&self) -> &str {
        "debug.log"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let label = ctx
            .config
            .get("label")
            .and_then(|v| v.as_str())
            .unwrap_or(ctx.node_id.as_str())
            .to_string();
        let items = ctx.input_items(MAIN_PORT);

        ctx.events.info(format!("DEBUG {}: {} item(s)", label, items.len()));
        for item in items {
            let rendered = item.to_json().to_string();
            tracing::info!("[{}] {}", label, rendered);
            ctx.events.info(format!("  {}", rendered));
        }

        Ok(NodeOutput::new().with_items(MAIN_PORT, items.to_vec()))
    }
}

pub struct DebugNodeFactory;

impl NodeFactory for DebugNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DebugNode))
    }

    fn node_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Logs input items for debugging".to_string(),
            category: "debug".to_string(),
            inputs: vec![PortDefinition::new(MAIN_PORT, "Items to log")],
            outputs: vec![PortDefinition::new(MAIN_PORT, "The same items")],
        }
    }
}
