//! Standard node library
//!
//! Collection of built-in nodes for common operations. Every node reads
//! its items from the `main` input port.

mod debug;
mod logic;
mod time;
mod transform;
mod trigger;

use flowruntime::NodeRegistry;
use std::sync::Arc;

pub use debug::DebugNode;
pub use logic::{IfNode, FALSE_PORT, TRUE_PORT};
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode};
pub use trigger::ManualTriggerNode;

/// Register all standard nodes with a registry
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register(Arc::new(trigger::ManualTriggerNodeFactory));
    registry.register(Arc::new(debug::DebugNodeFactory));
    registry.register(Arc::new(logic::IfNodeFactory));
    registry.register(Arc::new(transform::JsonParseNodeFactory));
    registry.register(Arc::new(transform::JsonStringifyNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
}

/// Registry pre-loaded with every standard node
pub fn standard_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_all(&mut registry);
    registry
}
