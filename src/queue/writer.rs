//! The single writer shipping queue entries to the remote endpoint.
//!
//! Entries are read in key order starting just past the persisted bookmark
//! (or from the oldest entry when no bookmark exists). A successful or
//! terminally failed delivery persists the bookmark before advancing, so a
//! crash between entry write and bookmark persistence re-delivers rather
//! than skips: at-least-once.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::batch::SignalBatch;
use crate::queue::client::{RemoteClient, TerminalErrorClassifier};
use crate::queue::store::StoreError;
use crate::queue::QueueCore;

/// Default initial retry delay after a recoverable delivery failure.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// How long to sleep when the queue has no entries to ship.
const IDLE_WAIT: Duration = Duration::from_secs(1);

pub struct QueueWriter {
    /// Bookmark name; unique per writer and remote endpoint.
    name: String,
    core: Arc<QueueCore>,
    client: Arc<dyn RemoteClient>,
    classifier: TerminalErrorClassifier,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl QueueWriter {
    pub fn new(
        parent_id: &str,
        core: Arc<QueueCore>,
        client: Arc<dyn RemoteClient>,
        classifier: TerminalErrorClassifier,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            name: format!("metrics_write_to_{}_parent_{parent_id}", client.endpoint()),
            core,
            client,
            classifier,
            initial_backoff,
            max_backoff,
        }
    }

    pub fn bookmark_name(&self) -> &str {
        &self.name
    }

    /// Deliver entries until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        // The bookmark is the last delivered key; delivery resumes at the
        // next key after it. Entries below the oldest key were swept.
        let mut delivered: u64 = self.core.store.read_bookmark(&self.name)?.unwrap_or(0);
        info!(writer = %self.name, bookmark = delivered, "writer starting");

        let mut backoff = self.initial_backoff;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let Some(key) = self.core.store.next_key(delivered)? else {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = self.core.data_notify.notified() => {}
                    _ = tokio::time::sleep(IDLE_WAIT) => {}
                }
                continue;
            };

            let Some(payload) = self.core.store.get(key)? else {
                // Swept between lookup and read; skip over it.
                delivered = key;
                continue;
            };

            let batch = match SignalBatch::decode_from_bytes(&payload) {
                Ok(batch) => batch,
                Err(err) => {
                    // Undecodable entries cannot ever succeed; count and
                    // move the bookmark over them.
                    error!(writer = %self.name, key, %err, "dropping undecodable entry");
                    self.core.metrics.terminal_dropped.fetch_add(1, Ordering::Relaxed);
                    self.core.store.write_bookmark(&self.name, key)?;
                    delivered = key;
                    continue;
                }
            };

            debug!(writer = %self.name, key, signals = batch.len(), "delivering entry");
            match self.client.send(&batch).await {
                Ok(()) => {
                    self.core.store.write_bookmark(&self.name, key)?;
                    delivered = key;
                    backoff = self.initial_backoff;
                }
                Err(err) if self.classifier.is_terminal(&err.message) => {
                    warn!(writer = %self.name, key, %err, "remote rejected entry; skipping");
                    self.core.metrics.terminal_dropped.fetch_add(1, Ordering::Relaxed);
                    self.core.store.write_bookmark(&self.name, key)?;
                    delivered = key;
                    backoff = self.initial_backoff;
                }
                Err(err) => {
                    error!(writer = %self.name, key, %err, "error sending samples");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }
}
