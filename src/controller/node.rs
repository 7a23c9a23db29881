//! Graph node kinds and the plumbing they share.
//!
//! Node variants are a closed set dispatched by match: native components,
//! reusable declare templates, import nodes, custom components instantiated
//! from declares, and the export/argument nodes that only exist inside
//! module sub-controllers. Every variant carries a stable node-ID, a current
//! block, health, and (for some) exports.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::component::ComponentError;
use crate::config::{Block, EvalError, Scope};
use crate::controller::graph::Identified;
use crate::controller::health::Health;
use crate::import::ImportError;

use super::node_argument::ArgumentNode;
use super::node_component::ComponentNode;
use super::node_custom::CustomComponentNode;
use super::node_declare::DeclareNode;
use super::node_export::ExportNode;
use super::node_import::ImportConfigNode;

#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Run was called on a node whose Evaluate has never succeeded.
    #[error("node has not been successfully evaluated yet")]
    #[diagnostic(code(tributary::node::unevaluated))]
    Unevaluated,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Import(#[from] ImportError),

    #[error("{0}")]
    #[diagnostic(code(tributary::node::invalid))]
    Invalid(String),
}

/// Callback informing the controller that a node's outputs changed and its
/// dependents need re-evaluation. Flows child → parent only; nodes never
/// hold a reference back to the controller.
pub type OnNodeUpdate = Arc<dyn Fn(&str) + Send + Sync>;

pub fn noop_on_update() -> OnNodeUpdate {
    Arc::new(|_| {})
}

/// A node's published exports plus the change gate around them.
///
/// Exports have their own lock so a component's run task can publish while
/// Evaluate holds the node's main state lock. Structurally equal values are
/// dropped without waking dependents.
pub struct ExportsCell {
    node_id: String,
    value: RwLock<Option<Value>>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    on_update: OnNodeUpdate,
}

impl ExportsCell {
    pub fn new(node_id: impl Into<String>, on_update: OnNodeUpdate) -> Self {
        Self {
            node_id: node_id.into(),
            value: RwLock::new(None),
            last_update: RwLock::new(None),
            on_update,
        }
    }

    /// Publish a new export value. Returns true when the value actually
    /// changed and dependents were notified.
    pub fn set(&self, value: Value) -> bool {
        {
            let mut current = self.value.write();
            if current.as_ref() == Some(&value) {
                return false;
            }
            *current = Some(value);
        }
        *self.last_update.write() = Some(Utc::now());
        (self.on_update)(&self.node_id);
        true
    }

    pub fn get(&self) -> Option<Value> {
        self.value.read().clone()
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.read()
    }
}

/// Eval/run health pair shared by every stateful node kind.
pub(crate) struct NodeHealth {
    eval: RwLock<Health>,
    run: RwLock<Health>,
}

impl NodeHealth {
    pub(crate) fn new() -> Self {
        Self {
            eval: RwLock::new(Health::unknown("node created")),
            run: RwLock::new(Health::unknown("node created")),
        }
    }

    pub(crate) fn set_eval(&self, health: Health) {
        *self.eval.write() = health;
    }

    pub(crate) fn set_run(&self, health: Health) {
        *self.run.write() = health;
    }

    /// Combine eval/run with an optional component-reported record.
    pub(crate) fn combined(&self, component: Option<Health>) -> Health {
        let mut records = vec![self.eval.read().clone(), self.run.read().clone()];
        records.extend(component);
        Health::least_healthy(records)
    }
}

/// A vertex of the controller's DAG.
#[derive(Clone)]
pub enum GraphNode {
    Component(Arc<ComponentNode>),
    Declare(Arc<DeclareNode>),
    Import(Arc<ImportConfigNode>),
    Custom(Arc<CustomComponentNode>),
    Export(Arc<ExportNode>),
    Argument(Arc<ArgumentNode>),
}

impl Identified for GraphNode {
    fn node_id(&self) -> &str {
        match self {
            GraphNode::Component(n) => n.node_id(),
            GraphNode::Declare(n) => n.node_id(),
            GraphNode::Import(n) => n.node_id(),
            GraphNode::Custom(n) => n.node_id(),
            GraphNode::Export(n) => n.node_id(),
            GraphNode::Argument(n) => n.node_id(),
        }
    }
}

impl GraphNode {
    pub fn block(&self) -> Block {
        match self {
            GraphNode::Component(n) => n.block(),
            GraphNode::Declare(n) => n.block(),
            GraphNode::Import(n) => n.block(),
            GraphNode::Custom(n) => n.block(),
            GraphNode::Export(n) => n.block(),
            GraphNode::Argument(n) => n.block(),
        }
    }

    pub fn update_block(&self, block: Block) {
        match self {
            GraphNode::Component(n) => n.update_block(block),
            GraphNode::Declare(n) => n.update_block(block),
            GraphNode::Import(n) => n.update_block(block),
            GraphNode::Custom(n) => n.update_block(block),
            GraphNode::Export(n) => n.update_block(block),
            GraphNode::Argument(n) => n.update_block(block),
        }
    }

    pub async fn evaluate(&self, scope: &Scope) -> Result<(), NodeError> {
        match self {
            GraphNode::Component(n) => n.evaluate(scope).await,
            GraphNode::Declare(n) => n.evaluate(scope),
            GraphNode::Import(n) => n.clone().evaluate(scope).await,
            GraphNode::Custom(n) => n.evaluate(scope).await,
            GraphNode::Export(n) => n.evaluate(scope),
            GraphNode::Argument(n) => n.evaluate(scope),
        }
    }

    pub fn exports(&self) -> Option<Value> {
        match self {
            GraphNode::Component(n) => n.exports(),
            GraphNode::Declare(_) => None,
            GraphNode::Import(_) => None,
            GraphNode::Custom(n) => n.exports(),
            GraphNode::Export(_) => None,
            GraphNode::Argument(n) => n.exports(),
        }
    }

    pub fn current_health(&self) -> Health {
        match self {
            GraphNode::Component(n) => n.current_health(),
            GraphNode::Declare(n) => n.current_health(),
            GraphNode::Import(n) => n.current_health(),
            GraphNode::Custom(n) => n.current_health(),
            GraphNode::Export(n) => n.current_health(),
            GraphNode::Argument(n) => n.current_health(),
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            GraphNode::Component(_) | GraphNode::Import(_) | GraphNode::Custom(_)
        )
    }

    pub fn is_evaluated(&self) -> bool {
        match self {
            GraphNode::Component(n) => n.is_evaluated(),
            GraphNode::Import(n) => n.is_evaluated(),
            GraphNode::Custom(n) => n.is_evaluated(),
            GraphNode::Declare(_) | GraphNode::Export(_) | GraphNode::Argument(_) => true,
        }
    }

    /// Spawn the node's Run on its own task. Returns None for stateless
    /// node kinds.
    pub fn spawn_run(
        &self,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<Result<(), NodeError>>> {
        match self {
            GraphNode::Component(n) => {
                let node = n.clone();
                Some(tokio::spawn(async move { node.run(cancel).await }))
            }
            GraphNode::Import(n) => {
                let node = n.clone();
                Some(tokio::spawn(async move { node.run(cancel).await }))
            }
            GraphNode::Custom(n) => {
                let node = n.clone();
                Some(tokio::spawn(async move { node.run(cancel).await }))
            }
            GraphNode::Declare(_) | GraphNode::Export(_) | GraphNode::Argument(_) => None,
        }
    }
}
