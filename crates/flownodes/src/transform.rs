use async_trait::async_trait;
use flowcore::{Node, NodeContext, NodeError, NodeOutput, Value, MAIN_PORT};
use flowruntime::{NodeFactory, NodeMetadata, PortDefinition};
use std::collections::HashMap;

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse JSON text into structured items.
///
/// A string item is parsed as a whole; for object items the text is read
/// from the `field` parameter (default `json`).
pub struct JsonParseNode {
    field: String,
}

#[async_trait]
impl Node for JsonParseNode {
    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut parsed = Vec::new();
        for item in ctx.require_input(MAIN_PORT)? {
            let source = match item {
                Value::String(_) => item,
                other => other.get(&self.field).ok_or_else(|| {
                    NodeError::MissingInput(format!("{}.{}", MAIN_PORT, self.field))
                })?,
            };
            let text = source.as_str().ok_or_else(|| NodeError::InvalidInputType {
                field: self.field.clone(),
                expected: "string".to_string(),
                actual: type_name(source).to_string(),
            })?;
            let json: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| NodeError::ExecutionFailed(format!("JSON parse error: {}", e)))?;
            parsed.push(Value::from(json));
        }

        Ok(NodeOutput::new().with_items(MAIN_PORT, parsed))
    }
}

pub struct JsonParseNodeFactory;

impl NodeFactory for JsonParseNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let field = config
            .get("field")
            .and_then(|v| v.as_str())
            .unwrap_or("json")
            .to_string();
        Ok(Box::new(JsonParseNode { field }))
    }

    fn node_type(&self) -> &str {
        "transform.json_parse"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Parse JSON strings into items".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortDefinition::new(MAIN_PORT, "JSON text items").required()],
            outputs: vec![PortDefinition::new(MAIN_PORT, "Parsed items")],
        }
    }
}

/// Render each item as JSON text
pub struct JsonStringifyNode {
    pretty: bool,
}

#[async_trait]
impl Node for JsonStringifyNode {
    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let mut rendered = Vec::new();
        for item in ctx.require_input(MAIN_PORT)? {
            let json = item.to_json();
            let text = if self.pretty {
                serde_json::to_string_pretty(&json)
            } else {
                serde_json::to_string(&json)
            }
            .map_err(|e| NodeError::ExecutionFailed(format!("JSON stringify error: {}", e)))?;
            rendered.push(Value::String(text));
        }

        Ok(NodeOutput::new().with_items(MAIN_PORT, rendered))
    }
}

pub struct JsonStringifyNodeFactory;

impl NodeFactory for JsonStringifyNodeFactory {
    fn create(&self, config: &HashMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let pretty = config
            .get("pretty")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Box::new(JsonStringifyNode { pretty }))
    }

    fn node_type(&self) -> &str {
        "transform.json_stringify"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            description: "Convert items to JSON strings".to_string(),
            category: "transform".to_string(),
            inputs: vec![PortDefinition::new(MAIN_PORT, "Items to render").required()],
            outputs: vec![PortDefinition::new(MAIN_PORT, "JSON text items")],
        }
    }
}
