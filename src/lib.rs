//! # Per-call census interception for RPC server pipelines
//!
//! A transparent, Tower-based interception layer that attaches to an RPC
//! server's call-processing pipeline and collects distributed-tracing
//! context and call stats without application code changes. It observes one
//! call's lifecycle end to end: arrival of initial metadata, inbound and
//! outbound message events, and completion.
//!
//! ## Core Concepts
//!
//! - **Interception**: `ServerCensusLayer` wraps the next pipeline stage
//!   per call; the resulting `ServerCensusCall` substitutes the transport's
//!   completion callbacks, chains to the originals exactly once, and
//!   forwards every op batch downstream unchanged (aside from the server
//!   stats it appends to trailing metadata)
//! - **Wire codec**: bounded binary blobs in well-known metadata entries
//!   carry the tracing context, tag set, and server elapsed-time stats
//! - **Stats**: accumulated per-call counters are emitted as one tagged
//!   batch to an injected [`StatsSink`] when the call is destroyed
//! - **Fail-open**: observation faults degrade observability fidelity,
//!   never RPC correctness
//!
//! ## Getting Started
//!
//! ```rust
//! use std::sync::Arc;
//! use tower::Layer;
//! use tower_census::{
//!     CallFinalInfo, OpBatch, OpHandler, RecordingSink, ServerCensusLayer, Status,
//! };
//!
//! struct Terminal;
//! impl OpHandler for Terminal {
//!     fn start_op_batch(&mut self, _op: OpBatch) {}
//! }
//!
//! let sink = Arc::new(RecordingSink::new());
//! let layer = ServerCensusLayer::new(sink.clone());
//!
//! // One decorator per call; the transport drives it with op batches.
//! let mut call = layer.layer(Terminal);
//! call.start_op_batch(OpBatch::default());
//! call.destroy(&CallFinalInfo {
//!     status: Status::Ok,
//!     outgoing_bytes: 0,
//!     incoming_bytes: 0,
//! });
//!
//! assert_eq!(sink.batches().len(), 1);
//! ```

pub mod codec;
pub mod context;
pub mod error;
pub mod metadata;
pub mod op;
pub mod stats;

mod server;

// Re-export the per-call interception surface
pub use server::{ServerCensusCall, ServerCensusLayer};

// Public re-exports for convenience
pub use codec::{
    ServerStats, TagContext, TraceContext, MAX_SERVER_STATS_LEN, MAX_TAG_CONTEXT_LEN,
    MAX_TRACE_CONTEXT_LEN,
};
pub use context::{AuthContext, CallHandle, CensusContext};
pub use error::{CensusError, Result};
pub use metadata::{
    extract_initial, InitialElements, MetadataBatch, MetadataEntry, PATH_KEY, SERVER_STATS_KEY,
    TAG_CONTEXT_KEY, TRACE_CONTEXT_KEY,
};
pub use op::{
    CallFinalInfo, EventCallback, EventResult, MessageSlot, MetadataSlot, OpBatch, OpHandler,
    RecvInitialMetadata, RecvMessage, SendMessage, SendTrailingMetadata, Status, TransportError,
};
pub use stats::{
    Measure, Measurement, RecordedBatch, RecordingSink, StatsSink, Tag, METHOD_TAG_KEY,
    STATUS_TAG_KEY,
};

// Re-export the Tower trait the layer plugs into
pub use tower::Layer;
