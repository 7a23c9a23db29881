//! Module content sources for import nodes.
//!
//! An import source fetches module text from somewhere external and reports
//! when it changes. Three variants exist: local file, HTTP endpoint, and a
//! Git repository working copy. All share the same contract:
//!
//! - [`ImportSource::evaluate`] decodes freshly evaluated arguments; when
//!   they differ from the current ones it applies them, performs an
//!   immediate fetch, and returns the new content if it changed.
//! - [`ImportSource::run`] owns the poll timer and sends changed content on
//!   the provided channel until cancelled.
//!
//! The state machine is Uninitialized → Configured → Polling ↔ Failed; a
//! failed tick keeps the last observed content and the next success returns
//! to Polling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::controller::health::Health;

pub mod file;
pub mod git;
pub mod http;

pub use file::FileSource;
pub use git::GitSource;
pub use http::HttpSource;

/// Block names recognized as import nodes.
pub const BLOCK_IMPORT_FILE: &str = "import.file";
pub const BLOCK_IMPORT_HTTP: &str = "import.http";
pub const BLOCK_IMPORT_GIT: &str = "import.git";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Http,
    Git,
}

impl SourceKind {
    pub fn from_block_name(name: &str) -> Option<Self> {
        match name {
            BLOCK_IMPORT_FILE => Some(SourceKind::File),
            BLOCK_IMPORT_HTTP => Some(SourceKind::Http),
            BLOCK_IMPORT_GIT => Some(SourceKind::Git),
            _ => None,
        }
    }
}

/// Lifecycle state shared by every source variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Uninitialized,
    Configured,
    Polling,
    Failed,
}

#[derive(Debug, Error, Diagnostic)]
pub enum ImportError {
    #[error("decoding import arguments: {0}")]
    #[diagnostic(
        code(tributary::import::arguments),
        help("Check the import block's attributes against its documented arguments.")
    )]
    Arguments(#[from] serde_json::Error),

    #[error("reading {}: {source}", path.display())]
    #[diagnostic(code(tributary::import::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetching {url}: {source}")]
    #[diagnostic(code(tributary::import::http))]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("fetching {url}: unexpected status {status}")]
    #[diagnostic(code(tributary::import::http_status))]
    HttpStatus { url: String, status: u16 },

    #[error("git: {0}")]
    #[diagnostic(code(tributary::import::git))]
    Git(#[from] git2::Error),

    #[error("{0}")]
    #[diagnostic(code(tributary::import::invalid))]
    Invalid(String),
}

/// Construction-time options for a source.
#[derive(Clone)]
pub struct SourceOptions {
    /// Global ID of the owning import node; used for log fields and as the
    /// directory name for on-disk state.
    pub global_id: String,
    /// Directory reserved for this source's on-disk state (git working copy).
    pub data_path: PathBuf,
}

/// A polling loader of module content.
#[async_trait]
pub trait ImportSource: Send + Sync {
    /// Apply freshly evaluated arguments. Returns `Some(content)` when the
    /// immediate fetch observed content different from the last one.
    async fn evaluate(&self, args: serde_json::Value) -> Result<Option<String>, ImportError>;

    /// Poll at the configured frequency until cancelled, sending changed
    /// content on `content_tx`.
    async fn run(
        &self,
        cancel: CancellationToken,
        content_tx: flume::Sender<String>,
    ) -> Result<(), ImportError>;

    fn current_health(&self) -> Health;

    fn state(&self) -> SourceState;
}

/// Build the source variant for an import block kind.
pub fn new_import_source(kind: SourceKind, opts: SourceOptions) -> Arc<dyn ImportSource> {
    match kind {
        SourceKind::File => Arc::new(FileSource::new(opts)),
        SourceKind::Http => Arc::new(HttpSource::new(opts)),
        SourceKind::Git => Arc::new(GitSource::new(opts)),
    }
}

pub(crate) const DEFAULT_POLL_FREQUENCY: Duration = Duration::from_secs(60);

pub(crate) fn default_poll_frequency() -> Duration {
    DEFAULT_POLL_FREQUENCY
}
