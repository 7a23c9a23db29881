//! Typed signal batches and their wire encoding.
//!
//! A queue entry's payload is one encoded [`SignalBatch`]: the samples,
//! exemplars, metadata, histograms, and float histograms an appender
//! accumulated before flushing. Encoding is protobuf via prost; the batch
//! also tracks its newest contained timestamp so the TTL sweeper can expire
//! whole entries.

use prost::Message;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Sample {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
    #[prost(double, tag = "3")]
    pub value: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Exemplar {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub exemplar_labels: Vec<Label>,
    #[prost(int64, tag = "3")]
    pub timestamp_ms: i64,
    #[prost(double, tag = "4")]
    pub value: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetadataEntry {
    #[prost(string, tag = "1")]
    pub family_name: String,
    #[prost(string, tag = "2")]
    pub kind: String,
    #[prost(string, tag = "3")]
    pub help: String,
    #[prost(string, tag = "4")]
    pub unit: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Bucket {
    #[prost(double, tag = "1")]
    pub upper_bound: f64,
    #[prost(uint64, tag = "2")]
    pub count: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Histogram {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
    #[prost(uint64, tag = "3")]
    pub count: u64,
    #[prost(double, tag = "4")]
    pub sum: f64,
    #[prost(message, repeated, tag = "5")]
    pub buckets: Vec<Bucket>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FloatBucket {
    #[prost(double, tag = "1")]
    pub upper_bound: f64,
    #[prost(double, tag = "2")]
    pub count: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FloatHistogram {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
    #[prost(double, tag = "3")]
    pub count: f64,
    #[prost(double, tag = "4")]
    pub sum: f64,
    #[prost(message, repeated, tag = "5")]
    pub buckets: Vec<FloatBucket>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SignalBatch {
    #[prost(message, repeated, tag = "1")]
    pub samples: Vec<Sample>,
    #[prost(message, repeated, tag = "2")]
    pub exemplars: Vec<Exemplar>,
    #[prost(message, repeated, tag = "3")]
    pub metadata: Vec<MetadataEntry>,
    #[prost(message, repeated, tag = "4")]
    pub histograms: Vec<Histogram>,
    #[prost(message, repeated, tag = "5")]
    pub float_histograms: Vec<FloatHistogram>,
}

impl SignalBatch {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
            && self.exemplars.is_empty()
            && self.metadata.is_empty()
            && self.histograms.is_empty()
            && self.float_histograms.is_empty()
    }

    /// Total number of signals in the batch.
    pub fn len(&self) -> usize {
        self.samples.len()
            + self.exemplars.len()
            + self.metadata.len()
            + self.histograms.len()
            + self.float_histograms.len()
    }

    /// The newest timestamp carried by any signal, or zero for a batch of
    /// untimestamped metadata.
    pub fn newest_timestamp(&self) -> i64 {
        let mut newest = 0i64;
        for sample in &self.samples {
            newest = newest.max(sample.timestamp_ms);
        }
        for exemplar in &self.exemplars {
            newest = newest.max(exemplar.timestamp_ms);
        }
        for histogram in &self.histograms {
            newest = newest.max(histogram.timestamp_ms);
        }
        for histogram in &self.float_histograms {
            newest = newest.max(histogram.timestamp_ms);
        }
        newest
    }

    pub fn encode_to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }
}

/// Rough encoded-size contribution of a label set, used for flush
/// accounting before the batch is actually serialized.
pub(crate) fn estimated_labels_size(labels: &[Label]) -> usize {
    labels
        .iter()
        .map(|l| l.name.len() + l.value.len() + 4)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<Label> {
        vec![
            Label::new("__name__", "http_requests_total"),
            Label::new("job", "api"),
        ]
    }

    #[test]
    fn encode_decode_round_trip() {
        let batch = SignalBatch {
            samples: vec![Sample {
                labels: labels(),
                timestamp_ms: 1_700_000_000_000,
                value: 10.5,
            }],
            exemplars: vec![Exemplar {
                labels: labels(),
                exemplar_labels: vec![Label::new("trace_id", "abc")],
                timestamp_ms: 1_700_000_000_100,
                value: 1.0,
            }],
            metadata: vec![MetadataEntry {
                family_name: "http_requests_total".into(),
                kind: "counter".into(),
                help: "requests served".into(),
                unit: "".into(),
            }],
            histograms: vec![],
            float_histograms: vec![],
        };
        let bytes = batch.encode_to_bytes();
        let decoded = SignalBatch::decode_from_bytes(&bytes).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn newest_timestamp_spans_all_signal_kinds() {
        let batch = SignalBatch {
            samples: vec![Sample {
                labels: labels(),
                timestamp_ms: 100,
                value: 1.0,
            }],
            float_histograms: vec![FloatHistogram {
                labels: labels(),
                timestamp_ms: 500,
                count: 2.0,
                sum: 3.0,
                buckets: vec![],
            }],
            ..Default::default()
        };
        assert_eq!(batch.newest_timestamp(), 500);
    }

    #[test]
    fn empty_batch_reports_empty() {
        let batch = SignalBatch::default();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.newest_timestamp(), 0);
    }
}
