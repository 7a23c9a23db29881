//! Component contract and factory registry.
//!
//! A component is a long-running unit owned by a graph node: it is built
//! from evaluated arguments, reconfigured with [`Component::update`] while
//! running, and publishes exports through the `on_state_change` handle in
//! its [`ComponentOptions`]. The registry maps block names to factories.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::controller::health::Health;

#[derive(Debug, Error, Diagnostic)]
pub enum ComponentError {
    #[error("decoding arguments: {0}")]
    #[diagnostic(
        code(tributary::component::arguments),
        help("Check the block's attributes against the component's documented arguments.")
    )]
    InvalidArguments(#[from] serde_json::Error),

    #[error("building component: {0}")]
    #[diagnostic(code(tributary::component::build))]
    Build(String),

    #[error("component failed: {0}")]
    #[diagnostic(code(tributary::component::runtime))]
    Runtime(String),
}

/// Handle used by a component to publish a new export value.
///
/// Exports are compared structurally by the owning node; republishing an
/// equal value does not wake dependents.
pub type StateChangeFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Construction-time options handed to a component factory.
#[derive(Clone)]
pub struct ComponentOptions {
    /// Node-ID within the owning controller, e.g. `metrics.remote_queue.default`.
    pub id: String,
    /// Globally unique ID, prefixed by parent controller IDs.
    pub global_id: String,
    /// Directory reserved for this component's on-disk state.
    pub data_path: PathBuf,
    /// Publishes the component's exports to the controller.
    pub on_state_change: StateChangeFn,
}

impl ComponentOptions {
    /// Options suitable for building a component outside a controller,
    /// discarding exports. Used by unit tests and tools.
    pub fn detached(id: impl Into<String>, data_path: impl Into<PathBuf>) -> Self {
        let id = id.into();
        Self {
            global_id: id.clone(),
            id,
            data_path: data_path.into(),
            on_state_change: Arc::new(|_| {}),
        }
    }
}

/// Per-run context: carries the cancellation token the run loop must obey.
#[derive(Clone)]
pub struct ComponentContext {
    pub cancel: CancellationToken,
}

/// A long-running component managed by a graph node.
#[async_trait]
pub trait Component: Send + Sync {
    /// Run until `ctx.cancel` fires. Must return within about a second of
    /// cancellation; loops check the token on every iteration and at every
    /// I/O boundary.
    async fn run(&self, ctx: ComponentContext) -> Result<(), ComponentError>;

    /// Apply a new set of evaluated arguments. Called concurrently with
    /// `run`; implementations guard shared state accordingly.
    fn update(&self, args: Value) -> Result<(), ComponentError>;

    /// Component-reported health, combined with eval/run health by the node.
    fn current_health(&self) -> Health {
        Health::healthy("component running")
    }
}

/// Factory function building a component from options and arguments.
pub type BuildFn =
    fn(ComponentOptions, Value) -> Result<Arc<dyn Component>, ComponentError>;

/// A registered component kind, keyed by block name.
#[derive(Clone)]
pub struct Registration {
    pub name: &'static str,
    pub build: BuildFn,
}

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("component {0:?} registered twice")]
    #[diagnostic(code(tributary::component::duplicate_registration))]
    Duplicate(&'static str),
}

/// Maps block names to component factories.
#[derive(Clone, Default)]
pub struct Registry {
    entries: FxHashMap<&'static str, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the crate's native components.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register(crate::queue::registration())
            .expect("builtin registrations are unique");
        registry
    }

    pub fn register(&mut self, registration: Registration) -> Result<(), RegistryError> {
        if self.entries.contains_key(registration.name) {
            return Err(RegistryError::Duplicate(registration.name));
        }
        self.entries.insert(registration.name, registration);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
