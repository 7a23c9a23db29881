//! `metrics.remote_queue`: a durable write-ahead queue between sample
//! ingestion and a remote-write endpoint.
//!
//! Appenders buffer typed signals and flush serialized batches to a
//! key-ordered on-disk store; a single writer replays entries to the remote
//! with at-least-once delivery, resuming from a persisted bookmark after
//! restarts. A background sweeper expires entries past the TTL, and a byte
//! budget sheds the oldest unshipped entries when the remote is down.

pub mod appender;
pub mod batch;
pub mod client;
pub mod store;
pub mod writer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::component::{
    Component, ComponentContext, ComponentError, ComponentOptions, Registration,
};
use crate::controller::health::Health;

pub use appender::Appender;
pub use batch::{
    Bucket, Exemplar, FloatBucket, FloatHistogram, Histogram, Label, MetadataEntry, Sample,
    SignalBatch,
};
pub use client::{
    default_terminal_errors, EndpointConfig, HttpRemoteClient, RemoteClient, RemoteWriteError,
    TerminalErrorClassifier,
};
pub use store::{QueueStore, StoreError};
pub use writer::QueueWriter;

/// Counters the queue maintains about dropped data.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Samples rejected at append time for being older than the TTL.
    pub(crate) stale_dropped: AtomicU64,
    /// Batches skipped after a terminal remote error or decode failure.
    pub(crate) terminal_dropped: AtomicU64,
    /// Entries shed because the on-disk queue exceeded its byte budget.
    pub(crate) backpressure_dropped: AtomicU64,
}

impl QueueMetrics {
    pub(crate) fn inc_stale_dropped(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped.load(Ordering::Relaxed)
    }

    pub fn terminal_dropped(&self) -> u64 {
        self.terminal_dropped.load(Ordering::Relaxed)
    }

    pub fn backpressure_dropped(&self) -> u64 {
        self.backpressure_dropped.load(Ordering::Relaxed)
    }
}

/// State shared between the component, its appenders, and its writer.
pub(crate) struct QueueCore {
    pub(crate) store: QueueStore,
    pub(crate) metrics: QueueMetrics,
    pub(crate) data_notify: tokio::sync::Notify,
    pub(crate) max_queue_bytes: AtomicU64,
}

impl QueueCore {
    /// Persist a flushed batch and enforce the byte budget.
    pub(crate) fn commit_batch(&self, batch: &SignalBatch) -> Result<(), StoreError> {
        let payload = batch.encode_to_bytes();
        let key = self.store.append(&payload, batch.newest_timestamp())?;
        let max_bytes = self.max_queue_bytes.load(Ordering::Relaxed);
        if max_bytes > 0 {
            let dropped = self.store.drop_oldest_until(max_bytes)?;
            if dropped > 0 {
                self.metrics
                    .backpressure_dropped
                    .fetch_add(dropped, Ordering::Relaxed);
                warn!(dropped, "queue over byte budget; dropped oldest entries");
            }
        }
        tracing::trace!(key, signals = batch.len(), "committed batch");
        self.data_notify.notify_one();
        Ok(())
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(2 * 3600)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueArguments {
    pub endpoint: EndpointConfig,
    /// Samples older than this are dropped at append time; whole entries
    /// older than this are swept from disk.
    #[serde(default = "default_ttl", with = "crate::utils::duration")]
    pub ttl: Duration,
    /// On-disk byte budget; zero means unbounded.
    #[serde(default)]
    pub max_queue_bytes: u64,
    /// Retry backoff cap for recoverable delivery failures.
    #[serde(default = "default_max_backoff", with = "crate::utils::duration")]
    pub max_backoff: Duration,
    /// Substrings identifying terminal remote errors.
    #[serde(default = "default_terminal_errors")]
    pub terminal_errors: Vec<String>,
}

/// The queue component.
pub struct Queue {
    opts: ComponentOptions,
    core: Arc<QueueCore>,
    args: RwLock<QueueArguments>,
    /// Test hook: overrides the HTTP client built from the endpoint config.
    client_override: Mutex<Option<Arc<dyn RemoteClient>>>,
}

impl Queue {
    pub fn new(opts: ComponentOptions, args: QueueArguments) -> Result<Arc<Self>, ComponentError> {
        let store = QueueStore::open(&opts.data_path.join("wal"))
            .map_err(|err| ComponentError::Build(err.to_string()))?;
        let core = Arc::new(QueueCore {
            store,
            metrics: QueueMetrics::default(),
            data_notify: tokio::sync::Notify::new(),
            max_queue_bytes: AtomicU64::new(args.max_queue_bytes),
        });
        let queue = Arc::new(Self {
            core,
            args: RwLock::new(args),
            client_override: Mutex::new(None),
            opts,
        });
        queue.publish_exports();
        Ok(queue)
    }

    /// Construct with an injected delivery client instead of the HTTP one;
    /// the escape hatch tests use to exercise writer behavior.
    pub fn with_client(
        opts: ComponentOptions,
        args: QueueArguments,
        client: Arc<dyn RemoteClient>,
    ) -> Result<Arc<Self>, ComponentError> {
        let queue = Self::new(opts, args)?;
        *queue.client_override.lock() = Some(client);
        Ok(queue)
    }

    fn publish_exports(&self) {
        let path = self.opts.data_path.join("wal");
        (self.opts.on_state_change)(json!({
            "queue_path": path.to_string_lossy(),
        }));
    }

    /// A fresh appender with the currently configured TTL.
    pub fn appender(&self) -> Appender {
        Appender::new(self.core.clone(), self.args.read().ttl)
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.core.metrics
    }

    /// Direct store access for inspection; the writer owns delivery.
    pub fn store(&self) -> &QueueStore {
        &self.core.store
    }

    /// A writer over this queue's store using the given client and backoff
    /// settings. Lets callers drive delivery without the HTTP stack.
    pub fn writer_with_client(
        &self,
        client: Arc<dyn RemoteClient>,
        classifier: TerminalErrorClassifier,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> QueueWriter {
        QueueWriter::new(
            &self.opts.global_id,
            self.core.clone(),
            client,
            classifier,
            initial_backoff,
            max_backoff,
        )
    }

    fn build_client(&self) -> Result<Arc<dyn RemoteClient>, ComponentError> {
        if let Some(client) = self.client_override.lock().clone() {
            return Ok(client);
        }
        let endpoint = self.args.read().endpoint.clone();
        HttpRemoteClient::new(endpoint)
            .map(|client| Arc::new(client) as Arc<dyn RemoteClient>)
            .map_err(|err| ComponentError::Build(err.message))
    }

    async fn sweep_loop(&self, cancel: CancellationToken) {
        loop {
            let ttl = self.args.read().ttl;
            let interval = (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let cutoff = chrono::Utc::now().timestamp_millis() - ttl.as_millis() as i64;
            match self.core.store.sweep_expired(cutoff) {
                Ok(0) => {}
                Ok(dropped) => info!(component = %self.opts.global_id, dropped, "swept expired queue entries"),
                Err(err) => warn!(component = %self.opts.global_id, %err, "queue sweep failed"),
            }
        }
    }
}

#[async_trait]
impl Component for Queue {
    async fn run(&self, ctx: ComponentContext) -> Result<(), ComponentError> {
        let (classifier, max_backoff) = {
            let args = self.args.read();
            (
                TerminalErrorClassifier::new(args.terminal_errors.clone()),
                args.max_backoff,
            )
        };
        let client = self.build_client()?;
        let writer = QueueWriter::new(
            &self.opts.global_id,
            self.core.clone(),
            client,
            classifier,
            writer::DEFAULT_INITIAL_BACKOFF,
            max_backoff,
        );

        tokio::select! {
            result = writer.run(ctx.cancel.clone()) => {
                result.map_err(|err| ComponentError::Runtime(err.to_string()))
            }
            _ = self.sweep_loop(ctx.cancel.clone()) => Ok(()),
            _ = ctx.cancel.cancelled() => Ok(()),
        }
    }

    fn update(&self, args: Value) -> Result<(), ComponentError> {
        let new_args: QueueArguments = serde_json::from_value(args)?;
        self.core
            .max_queue_bytes
            .store(new_args.max_queue_bytes, Ordering::Relaxed);
        *self.args.write() = new_args;
        self.publish_exports();
        Ok(())
    }

    fn current_health(&self) -> Health {
        Health::healthy("queue running")
    }
}

/// Registry entry for the queue component.
pub fn registration() -> Registration {
    Registration {
        name: "metrics.remote_queue",
        build: |opts, args| {
            let arguments: QueueArguments = serde_json::from_value(args)?;
            Ok(Queue::new(opts, arguments)? as Arc<dyn Component>)
        },
    }
}
