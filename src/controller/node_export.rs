//! Export nodes: the named values a module surfaces to its instantiator.
//!
//! Only module sub-controllers contain these. After each evaluation pass
//! the controller collects every export node's value into the module's
//! export map and publishes it upward when it changed.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::config::{evaluate_expr, Block, Scope};
use crate::controller::health::Health;
use crate::controller::node::NodeError;

pub struct ExportNode {
    id: String,
    label: String,
    block: Mutex<Block>,
    value: RwLock<Value>,
}

impl ExportNode {
    pub fn new(block: Block) -> Result<Arc<Self>, NodeError> {
        let label = block
            .label
            .clone()
            .ok_or_else(|| NodeError::Invalid("export blocks require a label".to_string()))?;
        Ok(Arc::new(Self {
            id: block.id(),
            label,
            block: Mutex::new(block),
            value: RwLock::new(Value::Null),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn block(&self) -> Block {
        self.block.lock().clone()
    }

    pub fn update_block(&self, block: Block) {
        debug_assert_eq!(block.id(), self.id);
        *self.block.lock() = block;
    }

    /// The most recently evaluated export value.
    pub fn value(&self) -> Value {
        self.value.read().clone()
    }

    pub fn evaluate(&self, scope: &Scope) -> Result<(), NodeError> {
        let expr = {
            let block = self.block.lock();
            block.body.attr("value").cloned().ok_or_else(|| {
                NodeError::Invalid(format!("export {:?} is missing a value attribute", self.label))
            })?
        };
        let value = evaluate_expr(scope, &expr)?;
        *self.value.write() = value;
        Ok(())
    }

    pub fn current_health(&self) -> Health {
        Health::healthy("export evaluated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;
    use serde_json::json;

    #[test]
    fn evaluate_resolves_the_value_expression() {
        let blocks = parse("export \"output\" { value = a.b.count }").unwrap();
        let node = ExportNode::new(blocks[0].clone()).unwrap();
        let mut scope = Scope::new();
        scope.insert_exports("a.b", json!({"count": 3}));
        node.evaluate(&scope).unwrap();
        assert_eq!(node.value(), json!(3));
    }

    #[test]
    fn missing_value_attribute_is_an_error() {
        let blocks = parse("export \"output\" { }").unwrap();
        let node = ExportNode::new(blocks[0].clone()).unwrap();
        let err = node.evaluate(&Scope::new()).unwrap_err();
        assert!(err.to_string().contains("missing a value attribute"));
    }
}
