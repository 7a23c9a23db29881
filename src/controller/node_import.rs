//! Import nodes: dynamic declare sets loaded from an external source.
//!
//! An import node owns one [`ImportSource`] and the subgraph produced from
//! its content: a map of imported declares plus nested child import nodes.
//! Module content may only contain `declare` and `import.*` blocks. When a
//! child import contributes declares, each label `X` is re-exported as
//! `<child-label>.X` so siblings cannot collide.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{evaluate_body, parse, Block, Scope};
use crate::controller::health::Health;
use crate::controller::node::{NodeError, NodeHealth, OnNodeUpdate};
use crate::controller::node_declare::Declare;
use crate::import::{new_import_source, ImportSource, SourceKind, SourceOptions};

struct ContentState {
    /// Imported declares keyed by label; child contributions are namespaced
    /// as `<child-label>.<declare-label>`.
    declares: FxHashMap<String, Declare>,
    /// Suppresses child-triggered upward notifications while this node is
    /// itself processing new content.
    in_update: bool,
}

pub struct ImportConfigNode {
    id: String,
    label: String,
    global_id: String,
    source: Arc<dyn ImportSource>,
    on_update: OnNodeUpdate,
    depth: usize,
    max_depth: usize,
    data_path_base: PathBuf,

    block: Mutex<Block>,
    args: Mutex<Option<Value>>,
    content: Mutex<ContentState>,
    children: Mutex<FxHashMap<String, Arc<ImportConfigNode>>>,
    children_running: AtomicBool,
    children_swap: tokio::sync::Notify,

    health: NodeHealth,
    evaluated: AtomicBool,
    last_update: RwLock<Option<DateTime<Utc>>>,
}

impl ImportConfigNode {
    pub fn new(
        block: Block,
        kind: SourceKind,
        controller_id: &str,
        data_path: &Path,
        depth: usize,
        max_depth: usize,
        on_update: OnNodeUpdate,
    ) -> Result<Arc<Self>, NodeError> {
        let label = block
            .label
            .clone()
            .ok_or_else(|| NodeError::Invalid("import blocks require a label".to_string()))?;
        let id = block.id();
        let global_id = if controller_id.is_empty() {
            id.clone()
        } else {
            format!("{controller_id}/{id}")
        };
        let source = new_import_source(
            kind,
            SourceOptions {
                global_id: global_id.clone(),
                data_path: data_path.join(&global_id),
            },
        );
        Ok(Arc::new(Self {
            id,
            label,
            source,
            on_update,
            depth,
            max_depth,
            data_path_base: data_path.to_path_buf(),
            block: Mutex::new(block),
            args: Mutex::new(None),
            content: Mutex::new(ContentState {
                declares: FxHashMap::default(),
                in_update: false,
            }),
            children: Mutex::new(FxHashMap::default()),
            children_running: AtomicBool::new(false),
            children_swap: tokio::sync::Notify::new(),
            health: NodeHealth::new(),
            evaluated: AtomicBool::new(false),
            last_update: RwLock::new(None),
            global_id,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn global_id(&self) -> &str {
        &self.global_id
    }

    pub fn block(&self) -> Block {
        self.block.lock().clone()
    }

    pub fn update_block(&self, block: Block) {
        debug_assert_eq!(block.id(), self.id);
        *self.block.lock() = block;
    }

    pub fn arguments(&self) -> Option<Value> {
        self.args.lock().clone()
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluated.load(Ordering::Acquire)
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.read()
    }

    /// All declares this node currently provides, namespaced contributions
    /// included.
    pub fn imported_declares(&self) -> FxHashMap<String, Declare> {
        self.content.lock().declares.clone()
    }

    pub fn get_declare(&self, label: &str) -> Option<Declare> {
        self.content.lock().declares.get(label).cloned()
    }

    pub async fn evaluate(self: Arc<Self>, scope: &Scope) -> Result<(), NodeError> {
        let result = self.clone().evaluate_inner(scope).await;
        match &result {
            Ok(()) => self.health.set_eval(Health::healthy("component evaluated")),
            Err(err) => self
                .health
                .set_eval(Health::unhealthy(format!("evaluation failed: {err}"))),
        }
        result
    }

    async fn evaluate_inner(self: Arc<Self>, scope: &Scope) -> Result<(), NodeError> {
        let body = self.block.lock().body.clone();
        let args = Value::Object(evaluate_body(scope, &body)?);
        let content = self.source.evaluate(args.clone()).await?;
        *self.args.lock() = Some(args);
        if let Some(content) = content {
            self.clone().process_content(content).await?;
        }
        self.evaluated.store(true, Ordering::Release);
        Ok(())
    }

    /// Parse fetched module content and swap in the declares and child
    /// imports it defines. On any failure the previous content stays
    /// active. Boxed because nested imports recurse through here.
    fn process_content(
        self: Arc<Self>,
        content: String,
    ) -> BoxFuture<'static, Result<(), NodeError>> {
        Box::pin(async move {
            let blocks = parse(&content)
                .map_err(|err| NodeError::Invalid(format!("parsing module content: {err}")))?;

            let mut declares: FxHashMap<String, Declare> = FxHashMap::default();
            let mut children: FxHashMap<String, Arc<ImportConfigNode>> = FxHashMap::default();
            for block in &blocks {
                if block.name == "declare" {
                    let declare = Declare::from_block(block, &content)?;
                    if declares
                        .insert(declare.label.clone(), declare)
                        .is_some()
                    {
                        return Err(NodeError::Invalid(format!(
                            "declare block {:?} redefined",
                            block.label.as_deref().unwrap_or_default()
                        )));
                    }
                } else if let Some(kind) = SourceKind::from_block_name(&block.name) {
                    if self.depth + 1 > self.max_depth {
                        return Err(NodeError::Invalid(format!(
                            "import depth limit of {} exceeded",
                            self.max_depth
                        )));
                    }
                    let weak = Arc::downgrade(&self);
                    let on_child_update: OnNodeUpdate = Arc::new(move |_id| {
                        if let Some(parent) = weak.upgrade() {
                            parent.on_child_content_update();
                        }
                    });
                    let child = ImportConfigNode::new(
                        block.clone(),
                        kind,
                        &self.global_id,
                        &self.data_path_base,
                        self.depth + 1,
                        self.max_depth,
                        on_child_update,
                    )?;
                    if children.insert(child.label.clone(), child).is_some() {
                        return Err(NodeError::Invalid(format!(
                            "import block {:?} redefined",
                            block.label.as_deref().unwrap_or_default()
                        )));
                    }
                } else {
                    return Err(NodeError::Invalid(format!(
                        "unexpected block {:?}: only declare and import blocks are allowed in a module",
                        block.name
                    )));
                }
            }

            // Nested imports cannot close over the parent scope.
            for child in children.values() {
                child.clone().evaluate(&Scope::new()).await.map_err(|err| {
                    NodeError::Invalid(format!(
                        "imported node {:?} failed to evaluate: {err}",
                        child.label
                    ))
                })?;
            }

            {
                let mut state = self.content.lock();
                state.in_update = true;
                for (child_label, child) in &children {
                    for (label, declare) in child.imported_declares() {
                        declares.insert(format!("{child_label}.{label}"), declare);
                    }
                }
                state.declares = declares;
            }
            *self.children.lock() = children;

            if self.children_running.load(Ordering::Acquire) {
                self.children_swap.notify_one();
            }

            *self.last_update.write() = Some(Utc::now());
            self.content.lock().in_update = false;
            (self.on_update)(&self.id);
            Ok(())
        })
    }

    /// A child import re-fetched its content: refresh the namespaced view
    /// and bubble upward unless this node is mid-update itself.
    fn on_child_content_update(&self) {
        let contributions: Vec<(String, FxHashMap<String, Declare>)> = {
            let children = self.children.lock();
            children
                .iter()
                .map(|(label, child)| (label.clone(), child.imported_declares()))
                .collect()
        };
        let in_update = {
            let mut state = self.content.lock();
            for (child_label, declares) in contributions {
                let prefix = format!("{child_label}.");
                state.declares.retain(|key, _| !key.starts_with(&prefix));
                for (label, declare) in declares {
                    state.declares.insert(format!("{child_label}.{label}"), declare);
                }
            }
            state.in_update
        };
        if !in_update {
            (self.on_update)(&self.id);
        }
    }

    /// Run the import source and supervise the child import set. Child sets
    /// are swapped atomically: the old set is cancelled and awaited before
    /// the new one starts.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), NodeError> {
        if !self.is_evaluated() {
            return Err(NodeError::Unevaluated);
        }
        self.health.set_run(Health::healthy("started component"));

        let (content_tx, content_rx) = flume::unbounded::<String>();
        let source_cancel = cancel.child_token();
        let mut source_task = tokio::spawn({
            let source = self.source.clone();
            let source_cancel = source_cancel.clone();
            async move { source.run(source_cancel, content_tx).await }
        });

        let mut child_cancel = cancel.child_token();
        let mut child_tasks = self.start_children(&child_cancel);
        self.children_running.store(true, Ordering::Release);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                source_result = &mut source_task => {
                    // The source loop only returns on cancellation or a
                    // terminal failure.
                    match source_result {
                        Ok(Ok(())) => break Ok(()),
                        Ok(Err(err)) => break Err(NodeError::from(err)),
                        Err(join_err) => break Err(NodeError::Invalid(format!(
                            "import source task failed: {join_err}"
                        ))),
                    }
                }
                content = content_rx.recv_async() => {
                    match content {
                        Ok(content) => {
                            debug!(node = %self.global_id, "import content changed");
                            if let Err(err) = self.clone().process_content(content).await {
                                error!(node = %self.global_id, %err, "failed to process module content");
                            }
                        }
                        Err(_) => break Ok(()),
                    }
                }
                _ = self.children_swap.notified() => {
                    child_cancel.cancel();
                    while let Some(exited) = child_tasks.join_next().await {
                        if let Ok(Err(err)) = exited {
                            error!(node = %self.global_id, %err, "import child exited with error during swap");
                        }
                    }
                    child_cancel = cancel.child_token();
                    child_tasks = self.start_children(&child_cancel);
                }
                exited = child_tasks.join_next(), if !child_tasks.is_empty() => {
                    match exited {
                        Some(Ok(Err(err))) => break Err(err),
                        Some(Err(join_err)) => break Err(NodeError::Invalid(format!(
                            "import child task failed: {join_err}"
                        ))),
                        _ => {}
                    }
                }
            }
        };

        self.children_running.store(false, Ordering::Release);
        source_cancel.cancel();
        child_cancel.cancel();
        while child_tasks.join_next().await.is_some() {}

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
        result
    }

    fn start_children(&self, cancel: &CancellationToken) -> JoinSet<Result<(), NodeError>> {
        let mut tasks = JoinSet::new();
        for child in self.children.lock().values() {
            let child = child.clone();
            let token = cancel.child_token();
            tasks.spawn(async move { child.run(token).await });
        }
        tasks
    }

    /// Least healthy of run, eval, and the source's own health.
    pub fn current_health(&self) -> Health {
        self.health.combined(Some(self.source.current_health()))
    }
}
