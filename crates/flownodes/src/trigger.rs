use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value, MAIN_PORT};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

/// Entry point started by hand.
///
/// Trigger cascades never run this node; it only executes when a partial
/// run starts from it, and then forwards the supplied items (or a single
/// empty object).
pub struct ManualTriggerNode;

#[async_trait]
impl Node for ManualTriggerNode {
    fn node_type(&self) -> &str {
        "trigger.manual"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = ctx.input_items(MAIN_PORT);
        let items = if items.is_empty() {
            vec![Value::Object(HashMap::new())]
        } else {
            items.to_vec()
        };
        Ok(NodeOutput::new().with_items(MAIN_PORT, items))
    }
}

pub struct ManualTriggerNodeFactory;

impl NodeFactory for ManualTriggerNodeFactory {
    fn create(&self, _config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ManualTriggerNode))
    }

    fn node_type(&self) -> &str {
        "trigger.manual"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Start a workflow by hand".to_string(),
            category: "trigger".to_string(),
            inputs: vec![],
            outputs: vec![PortDefinition::new(MAIN_PORT, "Trigger data items")],
        }
    }
}
