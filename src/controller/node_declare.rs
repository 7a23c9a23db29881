//! Declare nodes: reusable, parameterized subgraph templates.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{Block, Expr, Scope};
use crate::controller::health::Health;
use crate::controller::node::NodeError;

/// A module template: the verbatim body text of a `declare` block plus its
/// parameter declarations. Instantiating custom components capture a clone,
/// so a template is immutable for the duration of any run built from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Declare {
    pub label: String,
    pub template: String,
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub optional: bool,
}

impl Declare {
    /// Build a declare record from its block, slicing the template verbatim
    /// out of the source text the block was parsed from.
    pub fn from_block(block: &Block, source: &str) -> Result<Self, NodeError> {
        let label = block
            .label
            .clone()
            .ok_or_else(|| NodeError::Invalid("declare blocks require a label".to_string()))?;
        let mut params: Vec<ParamSpec> = Vec::new();
        for inner in &block.body.blocks {
            if inner.name != "argument" {
                continue;
            }
            let name = inner.label.clone().ok_or_else(|| {
                NodeError::Invalid(format!("argument blocks in declare {label:?} require a label"))
            })?;
            if params.iter().any(|p| p.name == name) {
                return Err(NodeError::Invalid(format!(
                    "argument {name:?} declared twice in declare {label:?}"
                )));
            }
            let optional = matches!(inner.body.attr("optional"), Some(Expr::Bool(true)));
            params.push(ParamSpec { name, optional });
        }
        Ok(Self {
            label,
            template: block.body.span.slice(source).to_string(),
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Graph node holding a [`Declare`]. It has no arguments, exports, or run
/// loop; it exists so instantiating nodes can depend on it and pick up
/// template changes in evaluation order.
pub struct DeclareNode {
    id: String,
    declare: Mutex<Declare>,
    block: Mutex<Block>,
}

impl DeclareNode {
    pub fn new(block: Block, declare: Declare) -> Arc<Self> {
        Arc::new(Self {
            id: block.id(),
            declare: Mutex::new(declare),
            block: Mutex::new(block),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> String {
        self.declare.lock().label.clone()
    }

    pub fn declare(&self) -> Declare {
        self.declare.lock().clone()
    }

    pub fn block(&self) -> Block {
        self.block.lock().clone()
    }

    pub fn update_block(&self, block: Block) {
        debug_assert_eq!(block.id(), self.id);
        *self.block.lock() = block;
    }

    /// Replace the template; instantiations pick it up on their next
    /// Evaluate.
    pub fn update_declare(&self, declare: Declare) {
        *self.declare.lock() = declare;
    }

    pub fn evaluate(&self, _scope: &Scope) -> Result<(), NodeError> {
        Ok(())
    }

    pub fn current_health(&self) -> Health {
        Health::healthy("declare template registered")
    }
}
