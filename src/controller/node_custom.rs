//! Custom component nodes: declares instantiated as reusable components.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::component::StateChangeFn;
use crate::config::{evaluate_body, Block, Scope};
use crate::controller::health::Health;
use crate::controller::node::{ExportsCell, NodeError, NodeHealth, OnNodeUpdate};
use crate::controller::node_declare::Declare;
use crate::controller::subgraph::Subgraph;
use crate::controller::FlowController;

/// The template a custom component instantiates plus the declares visible
/// at its definition site, retrieved from the owning controller.
#[derive(Clone)]
pub struct CustomComponentConfig {
    pub declare: Declare,
    pub additional_declares: FxHashMap<String, Declare>,
}

/// Resolver handed to the node at construction; looks the template up by
/// `(import_label, declare_label)` against the controller's current graph.
pub type GetConfigFn =
    Arc<dyn Fn(&str, &str) -> Result<CustomComponentConfig, NodeError> + Send + Sync>;

/// Factory building the child controller for a subgraph, capturing the
/// parent controller's registry, data path, and nesting depth.
pub type SubcontrollerFactory =
    Arc<dyn Fn(&str, StateChangeFn) -> Arc<FlowController> + Send + Sync>;

/// Split a custom component's block name into import and declare labels:
/// `anotherModule` → `("", "anotherModule")`, `testImport.test` →
/// `("testImport", "test")`.
pub fn extract_import_and_declare_labels(component_name: &str) -> (String, String) {
    match component_name.split_once('.') {
        Some((import_label, declare_label)) => {
            (import_label.to_string(), declare_label.to_string())
        }
        None => (String::new(), component_name.to_string()),
    }
}

pub struct CustomComponentNode {
    id: String,
    global_id: String,
    component_name: String,
    import_label: String,
    declare_label: String,

    block: Mutex<Block>,
    args: Mutex<Option<Map<String, Value>>>,
    subgraph: tokio::sync::Mutex<Option<Subgraph>>,
    run_token: Mutex<Option<CancellationToken>>,

    get_config: GetConfigFn,
    new_subcontroller: SubcontrollerFactory,

    exports: Arc<ExportsCell>,
    health: NodeHealth,
    evaluated: AtomicBool,
}

impl CustomComponentNode {
    pub fn new(
        block: Block,
        import_label: String,
        declare_label: String,
        controller_id: &str,
        get_config: GetConfigFn,
        new_subcontroller: SubcontrollerFactory,
        on_update: OnNodeUpdate,
    ) -> Arc<Self> {
        let id = block.id();
        let global_id = if controller_id.is_empty() {
            id.clone()
        } else {
            format!("{controller_id}/{id}")
        };
        Arc::new(Self {
            component_name: block.name.clone(),
            import_label,
            declare_label,
            block: Mutex::new(block),
            args: Mutex::new(None),
            subgraph: tokio::sync::Mutex::new(None),
            run_token: Mutex::new(None),
            get_config,
            new_subcontroller,
            exports: Arc::new(ExportsCell::new(id.clone(), on_update)),
            health: NodeHealth::new(),
            evaluated: AtomicBool::new(false),
            global_id,
            id,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.id
    }

    pub fn global_id(&self) -> &str {
        &self.global_id
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn import_label(&self) -> &str {
        &self.import_label
    }

    pub fn declare_label(&self) -> &str {
        &self.declare_label
    }

    pub fn block(&self) -> Block {
        self.block.lock().clone()
    }

    pub fn update_block(&self, block: Block) {
        debug_assert_eq!(block.id(), self.id);
        *self.block.lock() = block;
    }

    pub fn arguments(&self) -> Option<Value> {
        self.args.lock().clone().map(Value::Object)
    }

    pub fn exports(&self) -> Option<Value> {
        self.exports.get()
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated.load(Ordering::Acquire)
    }

    pub async fn evaluate(&self, scope: &Scope) -> Result<(), NodeError> {
        let result = self.evaluate_inner(scope).await;
        match &result {
            Ok(()) => self.health.set_eval(Health::healthy("component evaluated")),
            Err(err) => self
                .health
                .set_eval(Health::unhealthy(format!("evaluation failed: {err}"))),
        }
        result
    }

    async fn evaluate_inner(&self, scope: &Scope) -> Result<(), NodeError> {
        let body = self.block.lock().body.clone();
        let args = evaluate_body(scope, &body)?;
        let config = (self.get_config)(&self.import_label, &self.declare_label)?;
        self.validate_arguments(&args, &config.declare)?;

        let mut guard = self.subgraph.lock().await;
        let rebuild = !matches!(
            guard.as_ref(),
            Some(sub) if sub.template() == config.declare.template
        );
        if rebuild {
            if let Some(old) = guard.take() {
                old.shutdown().await;
            }
            let exports = self.exports.clone();
            let on_exports: StateChangeFn = Arc::new(move |value| {
                exports.set(value);
            });
            let controller = (self.new_subcontroller)(&self.global_id, on_exports);
            *guard = Some(Subgraph::new(config.declare.template.clone(), controller));
        }

        let sub = guard.as_ref().expect("subgraph installed above");
        sub.load(args.clone(), config.additional_declares)
            .await
            .map_err(|err| NodeError::Invalid(format!("loading module: {err}")))?;

        if rebuild {
            let token = self.run_token.lock().clone();
            if let Some(token) = token {
                sub.spawn(&token);
            }
        }

        *self.args.lock() = Some(args);
        self.evaluated.store(true, Ordering::Release);
        Ok(())
    }

    /// Every attribute must name a declared parameter; every non-optional
    /// parameter must be supplied.
    fn validate_arguments(
        &self,
        args: &Map<String, Value>,
        declare: &Declare,
    ) -> Result<(), NodeError> {
        for key in args.keys() {
            if declare.param(key).is_none() {
                return Err(NodeError::Invalid(format!(
                    "unknown argument {key:?} for component {:?}",
                    self.component_name
                )));
            }
        }
        for param in &declare.params {
            if !param.optional && !args.contains_key(&param.name) {
                return Err(NodeError::Invalid(format!(
                    "missing required argument {:?} for component {:?}",
                    param.name, self.component_name
                )));
            }
        }
        Ok(())
    }

    /// Drive the subgraph until cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), NodeError> {
        if !self.is_evaluated() {
            return Err(NodeError::Unevaluated);
        }
        *self.run_token.lock() = Some(cancel.clone());
        {
            let guard = self.subgraph.lock().await;
            if let Some(sub) = guard.as_ref() {
                sub.spawn(&cancel);
            }
        }
        self.health
            .set_run(Health::healthy("started custom component"));

        cancel.cancelled().await;

        let guard = self.subgraph.lock().await;
        if let Some(sub) = guard.as_ref() {
            sub.join().await;
        }
        info!(node = %self.global_id, "custom component exited");
        self.health.set_run(Health::exited("custom component shut down"));
        Ok(())
    }

    pub fn current_health(&self) -> Health {
        self.health.combined(None)
    }

    /// The child controller, when instantiated. Exposed for tests and the
    /// admin surface.
    pub async fn module_controller(&self) -> Option<Arc<FlowController>> {
        self.subgraph
            .lock()
            .await
            .as_ref()
            .map(|sub| sub.controller().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_extraction_splits_on_first_dot() {
        assert_eq!(
            extract_import_and_declare_labels("anotherModule"),
            ("".to_string(), "anotherModule".to_string())
        );
        assert_eq!(
            extract_import_and_declare_labels("testImport.test"),
            ("testImport".to_string(), "test".to_string())
        );
    }
}
