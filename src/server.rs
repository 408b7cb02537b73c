//! Server-side per-call census interception
//!
//! What this module provides
//! - `ServerCensusLayer`: a Tower layer producing one transparent decorator
//!   per call stack, injected with the stats sink
//! - `ServerCensusCall<H>`: the per-call interceptor; substitutes the
//!   transport's completion callbacks, observes op batches mid-pipeline,
//!   and emits exactly one measurement batch when the call is destroyed
//!
//! Implementation strategy
//! - One `CallObservation` per call, created before any intercepted event
//!   and torn down in `destroy`. The transport serializes lifecycle events
//!   for a call, so the inner mutex only exists to satisfy the `'static`
//!   callback bound; it never contends within a call
//! - Substituted callbacks wrap the original `ready` closure and invoke it
//!   exactly once with the upstream result unchanged. On an upstream error
//!   the initial-metadata observation is skipped entirely
//! - Every batch is forwarded to the inner stage exactly once, whatever
//!   combination of ops it carries
//! - Fail-open throughout: a census failure degrades observability for the
//!   call, never the call itself
//!
//! Composition
//! - `ServerCensusLayer::new(sink).layer(next_stage)` per call, then hand
//!   the interceptor to the transport as the pipeline entry; the transport
//!   later calls `destroy` with its final-info record
//!
//! Testing strategy
//! - Fake inner stages capture forwarded batches; a `RecordingSink` asserts
//!   the started batch and the final batch, each exactly once

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tower::Layer;
use tracing::warn;

use crate::codec::{ServerStats, MAX_SERVER_STATS_LEN};
use crate::context::{AuthContext, CallHandle, CensusContext};
use crate::metadata::{extract_initial, SERVER_STATS_KEY};
use crate::op::{
    CallFinalInfo, EventCallback, MessageSlot, MetadataSlot, OpBatch, OpHandler,
    RecvInitialMetadata, RecvMessage,
};
use crate::stats::{
    Measurement, StatsSink, Tag, METHOD_TAG_KEY, RPC_SERVER_ERROR_COUNT,
    RPC_SERVER_FINISHED_COUNT, RPC_SERVER_REQUEST_BYTES, RPC_SERVER_REQUEST_COUNT,
    RPC_SERVER_RESPONSE_BYTES, RPC_SERVER_RESPONSE_COUNT, RPC_SERVER_SERVER_ELAPSED_TIME,
    RPC_SERVER_STARTED_COUNT, STATUS_TAG_KEY,
};

/// Layer that wraps the next pipeline stage of a server call with census
/// interception. Holds the process-wide stats sink.
#[derive(Clone)]
pub struct ServerCensusLayer {
    sink: Arc<dyn StatsSink>,
}

impl ServerCensusLayer {
    pub fn new(sink: Arc<dyn StatsSink>) -> Self {
        Self { sink }
    }
}

impl<H: OpHandler> Layer<H> for ServerCensusLayer {
    type Service = ServerCensusCall<H>;

    fn layer(&self, inner: H) -> Self::Service {
        ServerCensusCall::new(inner, self.sink.clone())
    }
}

/// Accumulated observation state for one in-flight call.
///
/// Owned for the call's whole lifetime; all measurements derived from it
/// become visible in a single batch at destruction.
struct CallObservation {
    start_time: Instant,
    elapsed: Option<Duration>,
    sent_message_count: u64,
    recv_message_count: u64,
    call_path: Bytes,
    context: Option<CensusContext>,
    auth: Option<Arc<AuthContext>>,
    handle: Option<Arc<CallHandle>>,
    sink: Arc<dyn StatsSink>,
}

impl CallObservation {
    /// Valid only after initial metadata has been processed; empty before.
    fn method(&self) -> &str {
        std::str::from_utf8(&self.call_path).unwrap_or("")
    }

    /// Successful initial-metadata completion: extract the census entries,
    /// derive the call context, and record the single started measurement.
    fn on_initial_metadata_done(&mut self, slot: &MetadataSlot) {
        let elements = {
            let mut batch = slot.lock().unwrap_or_else(PoisonError::into_inner);
            extract_initial(&mut batch)
        };
        self.call_path = elements.path;

        let method = self.method().to_string();
        let context = CensusContext::generate(&elements.trace, &elements.tags, "", &method);
        if let Some(handle) = &self.handle {
            handle.set_context(context.clone());
        }
        self.context = Some(context);

        self.sink.record(
            &[Measurement::new(&RPC_SERVER_STARTED_COUNT, 1.0)],
            &[Tag::new(METHOD_TAG_KEY, method)],
        );
    }

    /// Message completion. A `None` payload is the final read that follows
    /// trailing metadata and does not count.
    fn on_message_done(&mut self, slot: &MessageSlot) {
        let received = slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if received {
            self.recv_message_count += 1;
        }
    }
}

/// Per-call census decorator over the next pipeline stage.
pub struct ServerCensusCall<H> {
    state: Arc<Mutex<CallObservation>>,
    next: H,
}

impl<H: OpHandler> ServerCensusCall<H> {
    /// Initialize observation for a new call. Captures the start time;
    /// there is no failure path.
    pub fn new(next: H, sink: Arc<dyn StatsSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CallObservation {
                start_time: Instant::now(),
                elapsed: None,
                sent_message_count: 0,
                recv_message_count: 0,
                call_path: Bytes::new(),
                context: None,
                auth: None,
                handle: None,
                sink,
            })),
            next,
        }
    }

    /// Bind the transport's call handle: captures its auth context now and
    /// gives the derived census context somewhere to live later.
    pub fn with_handle(self, handle: Arc<CallHandle>) -> Self {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.auth = handle.auth_context();
            state.handle = Some(handle);
        }
        self
    }

    fn wrap_initial_metadata(&self, op: RecvInitialMetadata) -> RecvInitialMetadata {
        let RecvInitialMetadata { metadata, ready } = op;
        let state = Arc::clone(&self.state);
        let slot = Arc::clone(&metadata);
        let wrapped: EventCallback = Box::new(move |result| {
            if result.is_ok() {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .on_initial_metadata_done(&slot);
            }
            ready(result);
        });
        RecvInitialMetadata {
            metadata,
            ready: wrapped,
        }
    }

    fn wrap_message(&self, op: RecvMessage) -> RecvMessage {
        let RecvMessage { message, ready } = op;
        let state = Arc::clone(&self.state);
        let slot = Arc::clone(&message);
        let wrapped: EventCallback = Box::new(move |result| {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_message_done(&slot);
            ready(result);
        });
        RecvMessage {
            message,
            ready: wrapped,
        }
    }

    /// Finalize observation when the transport destroys the call: emit the
    /// one measurement batch, then release everything owned by the state.
    pub fn destroy(self, final_info: &CallFinalInfo) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        state.auth = None;

        let elapsed_ms = state.elapsed.unwrap_or_default().as_secs_f64() * 1_000.0;
        let error_count = if final_info.status.is_ok() { 0.0 } else { 1.0 };
        let method = state.method().to_string();
        state.sink.record(
            &[
                Measurement::new(&RPC_SERVER_ERROR_COUNT, error_count),
                Measurement::new(&RPC_SERVER_REQUEST_BYTES, final_info.outgoing_bytes as f64),
                Measurement::new(&RPC_SERVER_RESPONSE_BYTES, final_info.incoming_bytes as f64),
                Measurement::new(&RPC_SERVER_SERVER_ELAPSED_TIME, elapsed_ms),
                Measurement::new(&RPC_SERVER_REQUEST_COUNT, state.sent_message_count as f64),
                Measurement::new(&RPC_SERVER_FINISHED_COUNT, 1.0),
                Measurement::new(&RPC_SERVER_RESPONSE_COUNT, state.recv_message_count as f64),
            ],
            &[
                Tag::new(METHOD_TAG_KEY, method),
                Tag::new(STATUS_TAG_KEY, final_info.status.as_str()),
            ],
        );

        state.call_path = Bytes::new();
        if let Some(mut context) = state.context.take() {
            context.end();
        }
    }
}

impl<H: OpHandler> OpHandler for ServerCensusCall<H> {
    fn start_op_batch(&mut self, mut op: OpBatch) {
        if let Some(rim) = op.recv_initial_metadata.take() {
            op.recv_initial_metadata = Some(self.wrap_initial_metadata(rim));
        }

        if op.send_message.is_some() {
            // Counts attempts; eventual send success is not ours to judge.
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .sent_message_count += 1;
        }

        if let Some(rm) = op.recv_message.take() {
            op.recv_message = Some(self.wrap_message(rm));
        }

        // Trailing metadata going out marks the completion of the request.
        if let Some(trailing) = op.send_trailing_metadata.as_mut() {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let elapsed = state.start_time.elapsed();
            state.elapsed = Some(elapsed);
            let stats = ServerStats {
                elapsed_ns: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            };
            let mut buf = BytesMut::with_capacity(MAX_SERVER_STATS_LEN);
            let len = stats.encode(&mut buf, MAX_SERVER_STATS_LEN);
            if len > 0 {
                if let Err(e) = trailing.metadata.append(SERVER_STATS_KEY, buf.freeze()) {
                    warn!(error = %e, "failed to append server stats to trailing metadata");
                }
            }
        }

        self.next.start_op_batch(op);
    }
}
