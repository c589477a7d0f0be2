use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value, MAIN_PORT};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

pub const TRUE_PORT: &str = "true";
pub const FALSE_PORT: &str = "false";

/// Route each item to the `true` or `false` port.
///
/// The tested value is the item itself, or its `field` when configured.
/// With `equals` set the test is equality, otherwise truthiness. Only ports
/// that receive items fire, so the other branch is skipped downstream.
pub struct IfNode {
    field: Option<String>,
    equals: Option<Value>,
}

impl IfNode {
    fn matches(&self, item: &Value) -> bool {
        let tested = match &self.field {
            Some(field) => item.get(field).unwrap_or(&Value::Null),
            None => item,
        };
        match &self.equals {
            Some(expected) => tested == expected,
            None => tested.is_truthy(),
        }
    }
}

#[async_trait]
impl Node for IfNode {
    fn node_type(&self) -> &str {
        "logic.if"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let (passed, rejected): (Vec<Value>, Vec<Value>) = ctx
            .input_items(MAIN_PORT)
            .iter()
            .cloned()
            .partition(|item| self.matches(item));

        ctx.events.info(format!(
            "{} item(s) true, {} item(s) false",
            passed.len(),
            rejected.len()
        ));

        let mut output = NodeOutput::new();
        if !passed.is_empty() {
            output = output.with_items(TRUE_PORT, passed);
        }
        if !rejected.is_empty() {
            output = output.with_items(FALSE_PORT, rejected);
        }
        Ok(output)
    }
}

pub struct IfNodeFactory;

impl NodeFactory for IfNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let field = match config.get("field") {
            None | Some(Value::Null) => None,
            Some(Value::String(field)) => Some(field.clone()),
            Some(_) => {
                return Err(NodeError::Configuration(
                    "field must be a string".to_string(),
                ))
            }
        };
        Ok(Box::new(IfNode {
            field,
            equals: config.get("equals").cloned(),
        }))
    }

    fn node_type(&self) -> &str {
        "logic.if"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Split items by a condition".to_string(),
            category: "logic".to_string(),
            inputs: vec![PortDefinition::new(MAIN_PORT, "Items to test")],
            outputs: vec![
                PortDefinition::new(TRUE_PORT, "Items matching the condition"),
                PortDefinition::new(FALSE_PORT, "All other items"),
            ],
        }
    }
}
