//! A module instance: a sub-controller built from a declare template.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::controller::node_declare::Declare;
use crate::controller::{FlowController, LoadError};

/// Owns the child [`FlowController`] a custom component instantiates from
/// its declare template, plus the task driving it.
///
/// The template is captured at construction; a template change replaces the
/// whole subgraph rather than mutating it in place.
pub(crate) struct Subgraph {
    template: String,
    controller: Arc<FlowController>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subgraph {
    pub(crate) fn new(template: String, controller: Arc<FlowController>) -> Self {
        Self {
            template,
            controller,
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn template(&self) -> &str {
        &self.template
    }

    pub(crate) fn controller(&self) -> &Arc<FlowController> {
        &self.controller
    }

    /// Load (or reload) the template with fresh argument values and the
    /// declares visible at the definition site. Node state inside the child
    /// controller is reused where IDs match. Boxed because module loading
    /// recurses back into controller loading.
    pub(crate) fn load(
        &self,
        args: Map<String, Value>,
        declares: FxHashMap<String, Declare>,
    ) -> BoxFuture<'static, Result<(), LoadError>> {
        let controller = self.controller.clone();
        let template = self.template.clone();
        controller.set_module_args(args);
        controller.set_external_declares(declares);
        Box::pin(async move { controller.load_source(&template).await })
    }

    /// Start the sub-controller on its own task, tied to the owning node's
    /// run token.
    pub(crate) fn spawn(&self, parent: &CancellationToken) {
        let token = parent.child_token();
        let controller = self.controller.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            controller.run(run_token).await;
        });
        *self.cancel.lock() = Some(token);
        *self.task.lock() = Some(handle);
    }

    /// Wait for the run task to finish after its token was cancelled.
    pub(crate) async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Cancel and wait out the run task; used when the template changed and
    /// the subgraph is being replaced.
    pub(crate) async fn shutdown(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.join().await;
    }
}
