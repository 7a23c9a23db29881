//! Argument nodes: module parameters surfaced as `argument.<name>.value`.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::config::{Block, Expr, Scope};
use crate::controller::health::Health;
use crate::controller::node::NodeError;

/// Shared handle to the argument values the instantiating component passed
/// into the module.
pub type ModuleArgs = Arc<Mutex<Map<String, Value>>>;

pub struct ArgumentNode {
    id: String,
    name: String,
    optional: bool,
    block: Mutex<Block>,
    args: ModuleArgs,
    value: RwLock<Option<Value>>,
}

impl ArgumentNode {
    pub fn new(block: Block, args: ModuleArgs) -> Result<Arc<Self>, NodeError> {
        let name = block
            .label
            .clone()
            .ok_or_else(|| NodeError::Invalid("argument blocks require a label".to_string()))?;
        let optional = matches!(block.body.attr("optional"), Some(Expr::Bool(true)));
        Ok(Arc::new(Self {
            id: block.id(),
            name,
            optional,
            block: Mutex::new(block),
            args,
            value: RwLock::new(None),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.id
    }

    pub fn block(&self) -> Block {
        self.block.lock().clone()
    }

    pub fn update_block(&self, block: Block) {
        debug_assert_eq!(block.id(), self.id);
        *self.block.lock() = block;
    }

    /// Exported as `{"value": <arg>}` so references read
    /// `argument.<name>.value`.
    pub fn exports(&self) -> Option<Value> {
        self.value.read().clone().map(|value| {
            let mut object = Map::new();
            object.insert("value".to_string(), value);
            Value::Object(object)
        })
    }

    pub fn evaluate(&self, _scope: &Scope) -> Result<(), NodeError> {
        let provided = self.args.lock().get(&self.name).cloned();
        match provided {
            Some(value) => {
                *self.value.write() = Some(value);
                Ok(())
            }
            None if self.optional => {
                *self.value.write() = Some(Value::Null);
                Ok(())
            }
            None => Err(NodeError::Invalid(format!(
                "missing required argument {:?}",
                self.name
            ))),
        }
    }

    pub fn current_health(&self) -> Health {
        Health::healthy("argument bound")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;
    use serde_json::json;

    fn args_of(value: Value) -> ModuleArgs {
        let mut map = Map::new();
        map.insert("input".to_string(), value);
        Arc::new(Mutex::new(map))
    }

    #[test]
    fn bound_argument_exports_its_value() {
        let blocks = parse("argument \"input\" { optional = false }").unwrap();
        let node = ArgumentNode::new(blocks[0].clone(), args_of(json!(5))).unwrap();
        node.evaluate(&Scope::new()).unwrap();
        assert_eq!(node.exports(), Some(json!({"value": 5})));
    }

    #[test]
    fn missing_required_argument_is_an_error() {
        let blocks = parse("argument \"other\" { }").unwrap();
        let node = ArgumentNode::new(blocks[0].clone(), args_of(json!(5))).unwrap();
        let err = node.evaluate(&Scope::new()).unwrap_err();
        assert!(err.to_string().contains("missing required argument"));
    }

    #[test]
    fn missing_optional_argument_binds_null() {
        let blocks = parse("argument \"other\" { optional = true }").unwrap();
        let node = ArgumentNode::new(blocks[0].clone(), args_of(json!(5))).unwrap();
        node.evaluate(&Scope::new()).unwrap();
        assert_eq!(node.exports(), Some(json!({"value": null})));
    }
}
