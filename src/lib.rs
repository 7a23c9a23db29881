//! ```text
//! source text ─► config::parse ─► FlowController::load_source
//!                                   │
//!                                   ├─► DAG of nodes (components, declares,
//!                                   │   imports, custom components)
//!                                   ├─► topological Evaluate + dirty-set
//!                                   │   re-evaluation on export changes
//!                                   └─► FlowController::run ─► node tasks
//!
//! import.{file,http,git} ─► module content ─► declares ─► custom components
//! metrics.remote_queue   ─► on-disk queue ─► writer ─► remote endpoint
//! ```
//!
//! Tributary is the core of a configurable telemetry agent: a dataflow
//! controller that loads a declarative configuration, assembles a DAG of
//! long-running components, re-evaluates them as their inputs change, and
//! supports reusable modules imported from files, HTTP endpoints, or Git
//! repositories. The `metrics.remote_queue` component is the durable
//! data-plane exemplar: a bookmark-replayed write-ahead queue feeding a
//! remote-write endpoint.

pub mod component;
pub mod config;
pub mod controller;
pub mod import;
pub mod queue;
pub mod utils;

pub use component::{Component, ComponentContext, ComponentOptions, Registration, Registry};
pub use controller::health::{Health, HealthStatus};
pub use controller::{ControllerOptions, FlowController, LoadError};
