//! Short-lived buffers feeding the queue.
//!
//! An appender accumulates typed signals in memory and flushes a serialized
//! batch to the store, either on an explicit commit or once the estimated
//! encoded size crosses the flush threshold. Samples older than the TTL are
//! rejected at append time and never reach the store. Append order is
//! preserved within one appender; nothing is guaranteed across concurrent
//! appenders.

use std::time::Duration;

use chrono::Utc;

use crate::queue::batch::{
    estimated_labels_size, Bucket, Exemplar, FloatBucket, FloatHistogram, Histogram, Label,
    MetadataEntry, Sample, SignalBatch,
};
use crate::queue::store::StoreError;
use crate::queue::QueueCore;

/// Flush once the buffered batch is estimated past this size. Trades disk
/// compression efficiency for bounded memory.
pub(crate) const FLUSH_THRESHOLD_BYTES: usize = 16 * 1024 * 1024;

pub struct Appender {
    core: std::sync::Arc<QueueCore>,
    ttl: Duration,
    batch: SignalBatch,
    estimated_size: usize,
}

impl Appender {
    pub(crate) fn new(core: std::sync::Arc<QueueCore>, ttl: Duration) -> Self {
        Self {
            core,
            ttl,
            batch: SignalBatch::default(),
            estimated_size: 0,
        }
    }

    /// Whether a timestamp is older than `now - ttl`.
    fn stale(&self, timestamp_ms: i64) -> bool {
        let cutoff = Utc::now().timestamp_millis() - self.ttl.as_millis() as i64;
        timestamp_ms < cutoff
    }

    fn note_stale(&self) {
        self.core.metrics.inc_stale_dropped();
    }

    fn bump(&mut self, added: usize) -> Result<(), StoreError> {
        self.estimated_size += added;
        if self.estimated_size > FLUSH_THRESHOLD_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    pub fn append_sample(
        &mut self,
        labels: Vec<Label>,
        timestamp_ms: i64,
        value: f64,
    ) -> Result<(), StoreError> {
        if self.stale(timestamp_ms) {
            self.note_stale();
            return Ok(());
        }
        let added = estimated_labels_size(&labels) + 16;
        self.batch.samples.push(Sample {
            labels,
            timestamp_ms,
            value,
        });
        self.bump(added)
    }

    pub fn append_exemplar(
        &mut self,
        labels: Vec<Label>,
        exemplar_labels: Vec<Label>,
        timestamp_ms: i64,
        value: f64,
    ) -> Result<(), StoreError> {
        if self.stale(timestamp_ms) {
            self.note_stale();
            return Ok(());
        }
        let added =
            estimated_labels_size(&labels) + estimated_labels_size(&exemplar_labels) + 16;
        self.batch.exemplars.push(Exemplar {
            labels,
            exemplar_labels,
            timestamp_ms,
            value,
        });
        self.bump(added)
    }

    /// Metadata carries no timestamp and is never TTL-gated.
    pub fn append_metadata(
        &mut self,
        family_name: impl Into<String>,
        kind: impl Into<String>,
        help: impl Into<String>,
        unit: impl Into<String>,
    ) -> Result<(), StoreError> {
        let entry = MetadataEntry {
            family_name: family_name.into(),
            kind: kind.into(),
            help: help.into(),
            unit: unit.into(),
        };
        let added =
            entry.family_name.len() + entry.kind.len() + entry.help.len() + entry.unit.len() + 8;
        self.batch.metadata.push(entry);
        self.bump(added)
    }

    pub fn append_histogram(
        &mut self,
        labels: Vec<Label>,
        timestamp_ms: i64,
        count: u64,
        sum: f64,
        buckets: Vec<Bucket>,
    ) -> Result<(), StoreError> {
        if self.stale(timestamp_ms) {
            self.note_stale();
            return Ok(());
        }
        let added = estimated_labels_size(&labels) + buckets.len() * 16 + 32;
        self.batch.histograms.push(Histogram {
            labels,
            timestamp_ms,
            count,
            sum,
            buckets,
        });
        self.bump(added)
    }

    pub fn append_float_histogram(
        &mut self,
        labels: Vec<Label>,
        timestamp_ms: i64,
        count: f64,
        sum: f64,
        buckets: Vec<FloatBucket>,
    ) -> Result<(), StoreError> {
        if self.stale(timestamp_ms) {
            self.note_stale();
            return Ok(());
        }
        let added = estimated_labels_size(&labels) + buckets.len() * 16 + 32;
        self.batch.float_histograms.push(FloatHistogram {
            labels,
            timestamp_ms,
            count,
            sum,
            buckets,
        });
        self.bump(added)
    }

    /// Number of signals currently buffered.
    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.estimated_size = 0;
        self.core.commit_batch(&batch)
    }

    /// Flush the remaining buffered signals to the store.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.flush()
    }

    /// Discard everything still buffered.
    pub fn rollback(mut self) {
        self.batch = SignalBatch::default();
        self.estimated_size = 0;
    }
}
