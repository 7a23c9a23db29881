//! Graph node owning a native component instance.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::component::{Component, ComponentContext, ComponentOptions, Registration};
use crate::config::{evaluate_body, Block, Scope};
use crate::controller::health::Health;
use crate::controller::node::{ExportsCell, NodeError, NodeHealth, OnNodeUpdate};

/// A controller node which manages a registry-built component.
///
/// The node caches the component's current arguments and exports. The
/// managed component is built the first time Evaluate succeeds; later
/// evaluations reconfigure it in place via `Component::update`.
pub struct ComponentNode {
    id: String,
    global_id: String,
    component_name: String,
    registration: Registration,
    data_path: PathBuf,

    block: Mutex<Block>,
    args: Mutex<Option<Value>>,
    managed: RwLock<Option<Arc<dyn Component>>>,

    health: NodeHealth,
    exports: Arc<ExportsCell>,
    evaluated: AtomicBool,
}

impl ComponentNode {
    pub fn new(
        block: Block,
        registration: Registration,
        controller_id: &str,
        data_path: &std::path::Path,
        on_update: OnNodeUpdate,
    ) -> Arc<Self> {
        let id = block.id();
        let global_id = if controller_id.is_empty() {
            id.clone()
        } else {
            format!("{controller_id}/{id}")
        };
        Arc::new(Self {
            data_path: data_path.join(&global_id),
            component_name: block.name.clone(),
            registration,
            block: Mutex::new(block),
            args: Mutex::new(None),
            managed: RwLock::new(None),
            health: NodeHealth::new(),
            exports: Arc::new(ExportsCell::new(id.clone(), on_update)),
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

    pub fn block(&self) -> Block {
        self.block.lock().clone()
    }

    /// Swap in a new block; it takes effect on the next Evaluate.
    pub fn update_block(&self, block: Block) {
        debug_assert_eq!(block.id(), self.id);
        *self.block.lock() = block;
    }

    pub fn arguments(&self) -> Option<Value> {
        self.args.lock().clone()
    }

    pub fn exports(&self) -> Option<Value> {
        self.exports.get()
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated.load(Ordering::Acquire)
    }

    /// The managed component instance, if built. Exposed for tests and
    /// tooling.
    pub fn component(&self) -> Option<Arc<dyn Component>> {
        self.managed.read().clone()
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
        let args = Value::Object(evaluate_body(scope, &body)?);

        let unchanged = {
            let current = self.args.lock();
            current.as_ref() == Some(&args)
        };

        let managed = self.managed.read().clone();
        match managed {
            Some(component) => {
                if !unchanged {
                    component.update(args.clone())?;
                }
            }
            None => {
                let opts = ComponentOptions {
                    id: self.id.clone(),
                    global_id: self.global_id.clone(),
                    data_path: self.data_path.clone(),
                    on_state_change: {
                        let exports = self.exports.clone();
                        Arc::new(move |value| {
                            exports.set(value);
                        })
                    },
                };
                let component = (self.registration.build)(opts, args.clone())?;
                *self.managed.write() = Some(component);
            }
        }

        *self.args.lock() = Some(args);
        self.evaluated.store(true, Ordering::Release);
        Ok(())
    }

    /// Run the managed component until cancellation. Fails fast when the
    /// node was never successfully evaluated.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), NodeError> {
        if !self.is_evaluated() {
            return Err(NodeError::Unevaluated);
        }
        let component = self
            .managed
            .read()
            .clone()
            .ok_or(NodeError::Unevaluated)?;

        self.health.set_run(Health::healthy("started component"));
        let result = component.run(ComponentContext { cancel }).await;
        match &result {
            Ok(()) => {
                info!(node = %self.global_id, "component exited");
                self.health
                    .set_run(Health::exited("component shut down normally"));
            }
            Err(err) => {
                error!(node = %self.global_id, %err, "component exited with error");
                self.health
                    .set_run(Health::exited(format!("component shut down with error: {err}")));
            }
        }
        result.map_err(NodeError::from)
    }

    /// Least healthy of eval, run, and component-reported health.
    pub fn current_health(&self) -> Health {
        let component = self.managed.read().as_ref().map(|c| c.current_health());
        self.health.combined(component)
    }
}
