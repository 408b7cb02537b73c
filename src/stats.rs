//! Measures, tags, and the stats sink seam
//!
//! What this module provides
//! - The process-wide, immutable registry of server measures and tag keys
//! - `StatsSink`, the injected collector every call reports through
//! - `RecordingSink`, an in-memory sink for tests
//!
//! Exports
//! - Models
//!   - `Measure { name, unit }` consts: started/finished/error counts,
//!     request/response bytes and counts, server elapsed time
//!   - `Measurement { measure, value }`, `Tag { key, value }`
//! - Services
//!   - `StatsSink::record(&self, measurements, tags)` accepting one batch
//!     atomically; thread safety across concurrent calls is the sink's
//!     contract, not ours
//!
//! Composition
//! - `ServerCensusLayer` takes an `Arc<dyn StatsSink>` at construction and
//!   threads it into every per-call observation
//!
//! Testing strategy
//! - Use `RecordingSink` to capture batches; assert exact measure/value/tag
//!   sets per lifecycle event

use std::sync::Mutex;

use serde::Serialize;

/// A named, typed quantity recorded by the metrics sink.
///
/// Measures are registered once at startup and treated as read-only
/// configuration; the consts below are the full server-side registry.
#[derive(Debug, PartialEq, Eq)]
pub struct Measure {
    pub name: &'static str,
    pub unit: &'static str,
}

pub const RPC_SERVER_STARTED_COUNT: Measure = Measure {
    name: "grpc.io/server/started_count",
    unit: "1",
};
pub const RPC_SERVER_FINISHED_COUNT: Measure = Measure {
    name: "grpc.io/server/finished_count",
    unit: "1",
};
pub const RPC_SERVER_ERROR_COUNT: Measure = Measure {
    name: "grpc.io/server/error_count",
    unit: "1",
};
pub const RPC_SERVER_REQUEST_BYTES: Measure = Measure {
    name: "grpc.io/server/request_bytes",
    unit: "By",
};
pub const RPC_SERVER_RESPONSE_BYTES: Measure = Measure {
    name: "grpc.io/server/response_bytes",
    unit: "By",
};
pub const RPC_SERVER_REQUEST_COUNT: Measure = Measure {
    name: "grpc.io/server/request_count",
    unit: "1",
};
pub const RPC_SERVER_RESPONSE_COUNT: Measure = Measure {
    name: "grpc.io/server/response_count",
    unit: "1",
};
pub const RPC_SERVER_SERVER_ELAPSED_TIME: Measure = Measure {
    name: "grpc.io/server/server_elapsed_time",
    unit: "ms",
};

/// Tag key for the call method, e.g. `/svc/Method`.
pub const METHOD_TAG_KEY: &str = "method";
/// Tag key for the string form of the final call status.
pub const STATUS_TAG_KEY: &str = "status";

/// One measured value within a batch.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub measure: &'static Measure,
    pub value: f64,
}

impl Measurement {
    pub fn new(measure: &'static Measure, value: f64) -> Self {
        Self { measure, value }
    }
}

/// A key/value label attached to every measurement in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub key: &'static str,
    pub value: String,
}

impl Tag {
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// The metrics-aggregation backend, injected at layer construction.
///
/// `record` accepts the batch atomically; partial submission is not a
/// defined state. Implementations must tolerate concurrent submission from
/// many calls.
pub trait StatsSink: Send + Sync {
    fn record(&self, measurements: &[Measurement], tags: &[Tag]);
}

/// One batch as captured by [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub measurements: Vec<(&'static str, f64)>,
    pub tags: Vec<Tag>,
}

impl RecordedBatch {
    /// Value of `measure` within this batch, if present.
    pub fn value(&self, measure: &Measure) -> Option<f64> {
        self.measurements
            .iter()
            .find(|(name, _)| *name == measure.name)
            .map(|(_, v)| *v)
    }

    /// Value of the tag under `key`, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

/// In-memory sink capturing every batch, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    batches: Mutex<Vec<RecordedBatch>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<RecordedBatch> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl StatsSink for RecordingSink {
    fn record(&self, measurements: &[Measurement], tags: &[Tag]) {
        let batch = RecordedBatch {
            measurements: measurements
                .iter()
                .map(|m| (m.measure.name, m.value))
                .collect(),
            tags: tags.to_vec(),
        };
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch);
    }
}
