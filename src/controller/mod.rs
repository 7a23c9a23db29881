//! The component graph controller.
//!
//! [`FlowController::load_source`] parses configuration text, builds or
//! reconciles the DAG, and evaluates every node in topological order.
//! [`FlowController::run`] supervises node run tasks and drives change
//! propagation: nodes whose exports change enqueue themselves on a dirty
//! queue, and a single evaluator loop re-evaluates their transitive
//! dependents in topological order.
//!
//! Graph mutation happens only on the evaluation path, which is serialized
//! by an async lock, so Evaluate is never concurrent with itself on any
//! node. Exports and health have their own locks so run tasks can publish
//! without blocking evaluation of peers.

pub mod graph;
pub mod health;
pub mod node;
pub mod node_argument;
pub mod node_component;
pub mod node_custom;
pub mod node_declare;
pub mod node_export;
pub mod node_import;
pub(crate) mod subgraph;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::component::{Registry, StateChangeFn};
use crate::config::{self, body_references, Block, ParseError, Scope};
use crate::import::SourceKind;

use self::graph::{Graph, GraphError};
use self::health::Health;
use self::node::{GraphNode, NodeError, OnNodeUpdate};
use self::node_argument::ArgumentNode;
use self::node_component::ComponentNode;
use self::node_custom::{
    extract_import_and_declare_labels, CustomComponentConfig, CustomComponentNode, GetConfigFn,
    SubcontrollerFactory,
};
use self::node_declare::{Declare, DeclareNode};
use self::node_export::ExportNode;
use self::node_import::ImportConfigNode;

/// Default bound on nested module recursion.
pub const DEFAULT_MAX_IMPORT_DEPTH: usize = 8;

/// How long a node's Run gets to wind down after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),

    #[error("unrecognized component name \"{name}\"")]
    #[diagnostic(
        code(tributary::controller::unrecognized_component),
        help("Component names must be registered, declared, or provided by an import.")
    )]
    UnrecognizedComponentName { name: String },

    #[error("{name} blocks are only allowed inside modules")]
    #[diagnostic(code(tributary::controller::forbidden_block))]
    ForbiddenBlock { name: String },

    #[error("invalid block {id:?}: {message}")]
    #[diagnostic(code(tributary::controller::invalid_block))]
    InvalidBlock { id: String, message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error("evaluation failed: {}", errors.join("; "))]
    #[diagnostic(code(tributary::controller::eval))]
    Eval { errors: Vec<String> },
}

/// Options for a root controller.
#[derive(Clone)]
pub struct ControllerOptions {
    /// Global ID prefix; empty at the root. Nested controllers prefix node
    /// global IDs with their parent's global ID.
    pub controller_id: String,
    /// Directory for per-component on-disk state.
    pub data_path: PathBuf,
    pub registry: Arc<Registry>,
    pub max_import_depth: usize,
}

impl ControllerOptions {
    pub fn new(registry: Arc<Registry>, data_path: impl Into<PathBuf>) -> Self {
        Self {
            controller_id: String::new(),
            data_path: data_path.into(),
            registry,
            max_import_depth: DEFAULT_MAX_IMPORT_DEPTH,
        }
    }
}

struct ControllerInner {
    controller_id: String,
    data_path: PathBuf,
    registry: Arc<Registry>,
    max_import_depth: usize,
    depth: usize,

    graph: Mutex<Graph<GraphNode>>,
    queue_tx: flume::Sender<String>,
    queue_rx: flume::Receiver<String>,
    /// Serializes every evaluation pass; Evaluate is totally ordered per
    /// controller.
    eval_lock: tokio::sync::Mutex<()>,
    sync_notify: tokio::sync::Notify,
    /// Set by load_source so the run loop restarts exited nodes; plain
    /// dirty passes only start nodes that have never run.
    pending_full_sync: AtomicBool,

    /// Module machinery, inert at the root.
    module_args: node_argument::ModuleArgs,
    external_declares: Mutex<FxHashMap<String, Declare>>,
    on_exports_change: Option<StateChangeFn>,
    module_exports: Mutex<Map<String, Value>>,
}

/// Orchestrates the component DAG: loading, evaluation, and supervision.
pub struct FlowController {
    inner: Arc<ControllerInner>,
}

struct NodeTask {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), NodeError>>,
}

impl FlowController {
    pub fn new(opts: ControllerOptions) -> Self {
        Self::build(
            opts.controller_id,
            opts.data_path,
            opts.registry,
            opts.max_import_depth,
            0,
            None,
        )
    }

    pub(crate) fn new_module(
        controller_id: String,
        data_path: PathBuf,
        registry: Arc<Registry>,
        max_import_depth: usize,
        depth: usize,
        on_exports_change: StateChangeFn,
    ) -> Self {
        Self::build(
            controller_id,
            data_path,
            registry,
            max_import_depth,
            depth,
            Some(on_exports_change),
        )
    }

    fn build(
        controller_id: String,
        data_path: PathBuf,
        registry: Arc<Registry>,
        max_import_depth: usize,
        depth: usize,
        on_exports_change: Option<StateChangeFn>,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::unbounded();
        Self {
            inner: Arc::new(ControllerInner {
                controller_id,
                data_path,
                registry,
                max_import_depth,
                depth,
                graph: Mutex::new(Graph::new()),
                queue_tx,
                queue_rx,
                eval_lock: tokio::sync::Mutex::new(()),
                sync_notify: tokio::sync::Notify::new(),
                pending_full_sync: AtomicBool::new(false),
                module_args: Arc::new(Mutex::new(Map::new())),
                external_declares: Mutex::new(FxHashMap::default()),
                on_exports_change,
                module_exports: Mutex::new(Map::new()),
            }),
        }
    }

    fn is_module(&self) -> bool {
        self.inner.on_exports_change.is_some()
    }

    pub(crate) fn set_module_args(&self, args: Map<String, Value>) {
        *self.inner.module_args.lock() = args;
    }

    pub(crate) fn set_external_declares(&self, declares: FxHashMap<String, Declare>) {
        *self.inner.external_declares.lock() = declares;
    }

    fn on_update_fn(&self) -> OnNodeUpdate {
        let tx = self.inner.queue_tx.clone();
        Arc::new(move |id: &str| {
            let _ = tx.send(id.to_string());
        })
    }

    fn get_config_fn(&self) -> GetConfigFn {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |import_label, declare_label| {
            let inner = weak
                .upgrade()
                .ok_or_else(|| NodeError::Invalid("controller shut down".to_string()))?;
            ControllerInner::custom_component_config(&inner, import_label, declare_label)
        })
    }

    fn subcontroller_factory(&self) -> SubcontrollerFactory {
        let data_path = self.inner.data_path.clone();
        let registry = self.inner.registry.clone();
        let max_import_depth = self.inner.max_import_depth;
        let depth = self.inner.depth;
        Arc::new(move |global_id: &str, on_exports: StateChangeFn| {
            Arc::new(FlowController::new_module(
                global_id.to_string(),
                data_path.clone(),
                registry.clone(),
                max_import_depth,
                depth + 1,
                on_exports,
            ))
        })
    }

    /// Parse `text`, reconcile the DAG, and evaluate every node in
    /// topological order.
    ///
    /// Parse, validation, and cycle errors leave the prior graph intact.
    /// Evaluation errors install the new graph, mark the failing nodes
    /// unhealthy, and are returned aggregated.
    #[instrument(skip_all, fields(controller = %self.inner.controller_id))]
    pub async fn load_source(&self, text: &str) -> Result<(), LoadError> {
        let _guard = self.inner.eval_lock.lock().await;

        let blocks = config::parse(text)?;
        let new_graph = self.build_graph(text, &blocks)?;
        let order = new_graph.topo_order()?;

        *self.inner.graph.lock() = new_graph;
        info!(nodes = order.len(), "graph loaded");

        let errors = self.evaluate_ids(&order).await;
        self.publish_module_exports();
        self.inner.pending_full_sync.store(true, Ordering::Release);
        self.inner.sync_notify.notify_one();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LoadError::Eval {
                errors: errors
                    .into_iter()
                    .map(|(id, err)| format!("{id}: {err}"))
                    .collect(),
            })
        }
    }

    /// Build the next graph from parsed blocks, reusing nodes from the
    /// current graph where IDs match.
    fn build_graph(&self, text: &str, blocks: &[Block]) -> Result<Graph<GraphNode>, LoadError> {
        let old_graph = self.inner.graph.lock().clone();
        let external = self.inner.external_declares.lock().clone();
        let mut graph: Graph<GraphNode> = Graph::new();

        let local_declares: FxHashSet<&str> = blocks
            .iter()
            .filter(|b| b.name == "declare")
            .filter_map(|b| b.label.as_deref())
            .collect();
        let import_label_to_id: FxHashMap<&str, String> = blocks
            .iter()
            .filter(|b| SourceKind::from_block_name(&b.name).is_some())
            .filter_map(|b| b.label.as_deref().map(|l| (l, b.id())))
            .collect();

        for block in blocks {
            let node = self.build_node(
                block,
                text,
                &old_graph,
                &external,
                &local_declares,
                &import_label_to_id,
            )?;
            graph.insert(node)?;
        }

        // Derive edges: body references resolved by longest node-ID prefix,
        // plus each custom component's edge to its providing declare or
        // import node.
        let all: Vec<(String, Block)> = graph
            .iter()
            .map(|n| (graph::Identified::node_id(n).to_string(), n.block()))
            .collect();
        for (id, block) in &all {
            let mut writers: Vec<String> = Vec::new();
            for path in body_references(&block.body) {
                if let Some(writer) = longest_prefix_match(&graph, path) {
                    writers.push(writer);
                }
            }
            if let Some(GraphNode::Custom(custom)) = graph.get(id) {
                if custom.import_label().is_empty() {
                    let declare_id = format!("declare.{}", custom.declare_label());
                    if graph.contains(&declare_id) {
                        writers.push(declare_id);
                    }
                } else if let Some(import_id) = import_label_to_id.get(custom.import_label()) {
                    writers.push(import_id.clone());
                }
            }
            graph.set_dependencies(id, &writers);
        }
        Ok(graph)
    }

    fn build_node(
        &self,
        block: &Block,
        text: &str,
        old_graph: &Graph<GraphNode>,
        external: &FxHashMap<String, Declare>,
        local_declares: &FxHashSet<&str>,
        import_label_to_id: &FxHashMap<&str, String>,
    ) -> Result<GraphNode, LoadError> {
        let id = block.id();
        let invalid = |err: NodeError| LoadError::InvalidBlock {
            id: id.clone(),
            message: err.to_string(),
        };

        if block.name == "declare" {
            let declare = Declare::from_block(block, text).map_err(invalid)?;
            if let Some(GraphNode::Declare(existing)) = old_graph.get(&id) {
                existing.update_block(block.clone());
                existing.update_declare(declare);
                return Ok(GraphNode::Declare(existing.clone()));
            }
            return Ok(GraphNode::Declare(DeclareNode::new(block.clone(), declare)));
        }

        if block.name == "export" {
            if !self.is_module() {
                return Err(LoadError::ForbiddenBlock {
                    name: "export".to_string(),
                });
            }
            if let Some(GraphNode::Export(existing)) = old_graph.get(&id) {
                existing.update_block(block.clone());
                return Ok(GraphNode::Export(existing.clone()));
            }
            return Ok(GraphNode::Export(
                ExportNode::new(block.clone()).map_err(invalid)?,
            ));
        }

        if block.name == "argument" {
            if !self.is_module() {
                return Err(LoadError::ForbiddenBlock {
                    name: "argument".to_string(),
                });
            }
            if let Some(GraphNode::Argument(existing)) = old_graph.get(&id) {
                existing.update_block(block.clone());
                return Ok(GraphNode::Argument(existing.clone()));
            }
            return Ok(GraphNode::Argument(
                ArgumentNode::new(block.clone(), self.inner.module_args.clone())
                    .map_err(invalid)?,
            ));
        }

        if let Some(kind) = SourceKind::from_block_name(&block.name) {
            if let Some(GraphNode::Import(existing)) = old_graph.get(&id) {
                existing.update_block(block.clone());
                return Ok(GraphNode::Import(existing.clone()));
            }
            return Ok(GraphNode::Import(
                ImportConfigNode::new(
                    block.clone(),
                    kind,
                    &self.inner.controller_id,
                    &self.inner.data_path,
                    self.inner.depth,
                    self.inner.max_import_depth,
                    self.on_update_fn(),
                )
                .map_err(invalid)?,
            ));
        }

        if let Some(registration) = self.inner.registry.get(&block.name) {
            if let Some(GraphNode::Component(existing)) = old_graph.get(&id) {
                existing.update_block(block.clone());
                return Ok(GraphNode::Component(existing.clone()));
            }
            return Ok(GraphNode::Component(ComponentNode::new(
                block.clone(),
                registration.clone(),
                &self.inner.controller_id,
                &self.inner.data_path,
                self.on_update_fn(),
            )));
        }

        // Not a native component: resolve as a custom component backed by a
        // local declare, an imported declare, or one provided from outside.
        let name = block.name.as_str();
        let (import_label, declare_label) = extract_import_and_declare_labels(name);
        let (import_label, declare_label) = if !import_label.is_empty()
            && import_label_to_id.contains_key(import_label.as_str())
        {
            (import_label, declare_label)
        } else if local_declares.contains(name) || external.contains_key(name) {
            // Locally declared, or provided from outside — possibly under a
            // namespaced label, in which case the full name is the declare
            // label.
            (String::new(), name.to_string())
        } else {
            return Err(LoadError::UnrecognizedComponentName {
                name: name.to_string(),
            });
        };

        if let Some(GraphNode::Custom(existing)) = old_graph.get(&id) {
            if existing.component_name() == name {
                existing.update_block(block.clone());
                return Ok(GraphNode::Custom(existing.clone()));
            }
        }
        Ok(GraphNode::Custom(CustomComponentNode::new(
            block.clone(),
            import_label,
            declare_label,
            &self.inner.controller_id,
            self.get_config_fn(),
            self.subcontroller_factory(),
            self.on_update_fn(),
        )))
    }

    /// Evaluate nodes in the given order, building a fresh scope before
    /// each so upstream exports produced earlier in the pass are visible.
    async fn evaluate_ids(&self, order: &[String]) -> Vec<(String, NodeError)> {
        let mut errors = Vec::new();
        for id in order {
            let prepared = {
                let graph = self.inner.graph.lock();
                graph.get(id).map(|node| (node.clone(), build_scope(&graph)))
            };
            let Some((node, scope)) = prepared else {
                continue;
            };
            if let Err(err) = node.evaluate(&scope).await {
                error!(node = %id, %err, "failed to evaluate node");
                errors.push((id.clone(), err));
            }
        }
        errors
    }

    /// One pass of the dirty-queue evaluator: drain pending IDs, compute
    /// the transitive dependent set, and re-evaluate it in topological
    /// order.
    async fn handle_dirty(&self, first: String) {
        let _guard = self.inner.eval_lock.lock().await;

        let mut seeds: FxHashSet<String> = FxHashSet::default();
        seeds.insert(first);
        while let Ok(id) = self.inner.queue_rx.try_recv() {
            seeds.insert(id);
        }

        let order = {
            let graph = self.inner.graph.lock();
            let affected = graph.dependents_closure(&seeds);
            if affected.is_empty() {
                Vec::new()
            } else {
                match graph.topo_order_subset(&affected) {
                    Ok(order) => order,
                    Err(err) => {
                        // The loaded graph was validated acyclic; reaching
                        // this means the invariant itself is broken.
                        unreachable!("validated graph produced {err}");
                    }
                }
            }
        };
        if !order.is_empty() {
            debug!(seeds = seeds.len(), affected = order.len(), "re-evaluating dependents");
            self.evaluate_ids(&order).await;
        }
        self.publish_module_exports();
    }

    /// Collect export-node values into the module export map and publish
    /// upward when the map changed structurally.
    fn publish_module_exports(&self) {
        let Some(on_exports_change) = &self.inner.on_exports_change else {
            return;
        };
        let map = {
            let graph = self.inner.graph.lock();
            let mut map = Map::new();
            for node in graph.iter() {
                if let GraphNode::Export(export) = node {
                    map.insert(export.label().to_string(), export.value());
                }
            }
            map
        };
        {
            let mut current = self.inner.module_exports.lock();
            if *current == map {
                return;
            }
            *current = map.clone();
        }
        on_exports_change(Value::Object(map));
    }

    /// Supervise node run tasks and drive change propagation until the
    /// token is cancelled.
    #[instrument(skip_all, fields(controller = %self.inner.controller_id))]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut tasks: FxHashMap<String, NodeTask> = FxHashMap::default();
        self.reconcile_tasks(&mut tasks, &cancel, true);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.sync_notify.notified() => {
                    let full = self.inner.pending_full_sync.swap(false, Ordering::AcqRel);
                    self.reconcile_tasks(&mut tasks, &cancel, full);
                }
                dirty = self.inner.queue_rx.recv_async() => {
                    match dirty {
                        Ok(id) => {
                            self.handle_dirty(id).await;
                            self.reconcile_tasks(&mut tasks, &cancel, false);
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Child tokens descend from `cancel`, so every node is already
        // winding down; give each the shutdown grace period.
        let pending: Vec<_> = tasks
            .drain()
            .map(|(id, task)| async move {
                if tokio::time::timeout(SHUTDOWN_GRACE, task.handle).await.is_err() {
                    warn!(node = %id, "node did not stop within the shutdown grace period");
                }
            })
            .collect();
        futures::future::join_all(pending).await;
        info!("controller stopped");
    }

    /// Align run tasks with the current graph: cancel tasks for removed
    /// nodes and spawn tasks for evaluated runnable nodes. Exited nodes are
    /// restarted only on a full sync (after load_source), never by a plain
    /// dirty pass.
    fn reconcile_tasks(
        &self,
        tasks: &mut FxHashMap<String, NodeTask>,
        cancel: &CancellationToken,
        restart_exited: bool,
    ) {
        let graph = self.inner.graph.lock();

        tasks.retain(|id, task| {
            if graph.contains(id) {
                true
            } else {
                debug!(node = %id, "cancelling removed node");
                task.cancel.cancel();
                false
            }
        });
        if restart_exited {
            tasks.retain(|_, task| !task.handle.is_finished());
        }

        for node in graph.iter() {
            if !node.is_runnable() || !node.is_evaluated() {
                continue;
            }
            let id = graph::Identified::node_id(node).to_string();
            if tasks.contains_key(&id) {
                continue;
            }
            let token = cancel.child_token();
            if let Some(handle) = node.spawn_run(token.clone()) {
                debug!(node = %id, "starting node");
                tasks.insert(
                    id,
                    NodeTask {
                        cancel: token,
                        handle,
                    },
                );
            }
        }
    }

    /// Current exports of a node, if any.
    pub fn get_exports(&self, node_id: &str) -> Option<Value> {
        self.inner.graph.lock().get(node_id).and_then(GraphNode::exports)
    }

    /// Health snapshot of a single node; safe to call concurrently with
    /// Run.
    pub fn node_health(&self, node_id: &str) -> Option<Health> {
        self.inner
            .graph
            .lock()
            .get(node_id)
            .map(GraphNode::current_health)
    }

    /// Health snapshot of every node, sorted by node-ID.
    pub fn health(&self) -> Vec<(String, Health)> {
        let graph = self.inner.graph.lock();
        let mut out: Vec<(String, Health)> = graph
            .iter()
            .map(|n| {
                (
                    graph::Identified::node_id(n).to_string(),
                    n.current_health(),
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn node_ids(&self) -> Vec<String> {
        let graph = self.inner.graph.lock();
        let mut ids: Vec<String> = graph.node_ids().map(str::to_string).collect();
        ids.sort();
        ids
    }

    /// The module controller of an instantiated custom component, if the
    /// node exists and has been evaluated. Test and tooling hook.
    pub async fn module_controller(&self, node_id: &str) -> Option<Arc<FlowController>> {
        let node = {
            let graph = self.inner.graph.lock();
            match graph.get(node_id) {
                Some(GraphNode::Custom(custom)) => Some(custom.clone()),
                _ => None,
            }
        }?;
        node.module_controller().await
    }
}

impl ControllerInner {
    /// Resolve the template and definition-site declares for a custom
    /// component.
    fn custom_component_config(
        inner: &Arc<ControllerInner>,
        import_label: &str,
        declare_label: &str,
    ) -> Result<CustomComponentConfig, NodeError> {
        if inner.depth + 1 > inner.max_import_depth {
            return Err(NodeError::Invalid(format!(
                "module nesting depth limit of {} exceeded",
                inner.max_import_depth
            )));
        }
        let graph = inner.graph.lock();

        if !import_label.is_empty() {
            for node in graph.iter() {
                if let GraphNode::Import(import) = node {
                    if import.label() == import_label {
                        let declares = import.imported_declares();
                        let declare = declares.get(declare_label).cloned().ok_or_else(|| {
                            NodeError::Invalid(format!(
                                "declare {declare_label:?} not found in import {import_label:?}"
                            ))
                        })?;
                        return Ok(CustomComponentConfig {
                            declare,
                            additional_declares: declares,
                        });
                    }
                }
            }
            return Err(NodeError::Invalid(format!(
                "import {import_label:?} not found"
            )));
        }

        // Local declare: everything visible at this controller's scope is
        // carried along so the module body can resolve its own references.
        let mut additional = inner.external_declares.lock().clone();
        for node in graph.iter() {
            match node {
                GraphNode::Declare(declare) => {
                    additional.insert(declare.label(), declare.declare());
                }
                GraphNode::Import(import) => {
                    for (label, declare) in import.imported_declares() {
                        additional.insert(format!("{}.{}", import.label(), label), declare);
                    }
                }
                _ => {}
            }
        }
        let declare = additional.get(declare_label).cloned().ok_or_else(|| {
            NodeError::Invalid(format!("declare {declare_label:?} not found"))
        })?;
        Ok(CustomComponentConfig {
            declare,
            additional_declares: additional,
        })
    }
}

/// Scope of every node's current exports, keyed by node-ID path.
fn build_scope(graph: &Graph<GraphNode>) -> Scope {
    let mut scope = Scope::new();
    for node in graph.iter() {
        if let Some(exports) = node.exports() {
            scope.insert_exports(graph::Identified::node_id(node), exports);
        }
    }
    scope
}

/// Resolve a reference path to the node whose ID is its longest dotted
/// prefix.
fn longest_prefix_match(graph: &Graph<GraphNode>, path: &[String]) -> Option<String> {
    for take in (1..=path.len()).rev() {
        let candidate = path[..take].join(".");
        if graph.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}
