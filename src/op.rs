//! Transport stream operations and the pipeline forwarding seam
//!
//! What this module provides
//! - The op-batch shape the transport pushes through the call pipeline,
//!   with completion callbacks the interception layer can substitute
//! - `OpHandler`, the "forward this batch to the next stage" abstraction
//! - `Status` and `CallFinalInfo`, the transport's completion record
//!
//! Exports
//! - Models
//!   - `OpBatch { recv_initial_metadata, recv_message, send_message, send_trailing_metadata }`
//!   - `RecvInitialMetadata`/`RecvMessage` carrying a shared completion slot
//!     plus a `ready` callback; `SendMessage`/`SendTrailingMetadata` for the
//!     outgoing direction
//!   - `Status`, `TransportError`, `CallFinalInfo`
//! - Services
//!   - `OpHandler::start_op_batch(&mut self, OpBatch)`
//!
//! Implementation strategy
//! - Receive ops complete asynchronously: the transport fills the shared
//!   slot, then invokes `ready` exactly once with the upstream result. A
//!   decorator substitutes `ready` with its own closure that chains to the
//!   original, which is how intercept-then-forward composes here
//! - Events for one call are serially delivered by the transport, so the
//!   slots' mutexes never contend within a call
//!
//! Testing strategy
//! - Fake transports in `tests/` construct batches by hand, fill slots, and
//!   fire callbacks to drive the state machine

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::metadata::MetadataBatch;

/// Final status of a completed call. The string form feeds the status tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Cancelled => "CANCELLED",
            Status::Unknown => "UNKNOWN",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Status::NotFound => "NOT_FOUND",
            Status::AlreadyExists => "ALREADY_EXISTS",
            Status::PermissionDenied => "PERMISSION_DENIED",
            Status::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Status::FailedPrecondition => "FAILED_PRECONDITION",
            Status::Aborted => "ABORTED",
            Status::OutOfRange => "OUT_OF_RANGE",
            Status::Unimplemented => "UNIMPLEMENTED",
            Status::Internal => "INTERNAL",
            Status::Unavailable => "UNAVAILABLE",
            Status::DataLoss => "DATA_LOSS",
            Status::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque error reported by the transport on an intercepted event. The
/// interception layer forwards it unchanged and never fabricates one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// Result the transport delivers with each completion event.
pub type EventResult = Result<(), TransportError>;

/// Completion callback for a receive op, invoked exactly once.
pub type EventCallback = Box<dyn FnOnce(EventResult) + Send>;

/// Slot the transport fills with the received initial metadata before
/// firing the op's `ready` callback.
pub type MetadataSlot = Arc<Mutex<MetadataBatch>>;

/// Slot the transport fills with each received message payload before
/// firing the op's `ready` callback. `None` is the final null read that
/// follows trailing metadata.
pub type MessageSlot = Arc<Mutex<Option<Bytes>>>;

/// Receive-initial-metadata op: completes asynchronously via `ready`.
pub struct RecvInitialMetadata {
    pub metadata: MetadataSlot,
    pub ready: EventCallback,
}

/// Receive-message op: completes asynchronously via `ready`.
pub struct RecvMessage {
    pub message: MessageSlot,
    pub ready: EventCallback,
}

/// Send-message op. Counted as an attempt regardless of eventual outcome.
pub struct SendMessage {
    pub payload: Bytes,
}

/// Send-trailing-metadata op. Owns its batch so mid-pipeline stages can
/// append entries before the batch goes out.
pub struct SendTrailingMetadata {
    pub metadata: MetadataBatch,
}

/// One batch of stream operations moving through the call pipeline.
#[derive(Default)]
pub struct OpBatch {
    pub recv_initial_metadata: Option<RecvInitialMetadata>,
    pub recv_message: Option<RecvMessage>,
    pub send_message: Option<SendMessage>,
    pub send_trailing_metadata: Option<SendTrailingMetadata>,
}

impl std::fmt::Debug for OpBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpBatch")
            .field("recv_initial_metadata", &self.recv_initial_metadata.is_some())
            .field("recv_message", &self.recv_message.is_some())
            .field("send_message", &self.send_message.is_some())
            .field("send_trailing_metadata", &self.send_trailing_metadata.is_some())
            .finish()
    }
}

/// A stage in the call pipeline. Decorators observe the batch, then forward
/// it to the inner stage exactly once.
pub trait OpHandler {
    fn start_op_batch(&mut self, op: OpBatch);
}

impl<H: OpHandler + ?Sized> OpHandler for Box<H> {
    fn start_op_batch(&mut self, op: OpBatch) {
        (**self).start_op_batch(op)
    }
}

/// The transport's final record for a destroyed call: status plus total
/// payload bytes in each direction.
#[derive(Debug, Clone, Copy)]
pub struct CallFinalInfo {
    pub status: Status,
    /// Total outgoing payload bytes (request side of the server measures).
    pub outgoing_bytes: u64,
    /// Total incoming payload bytes (response side of the server measures).
    pub incoming_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_forms() {
        assert_eq!(Status::Ok.as_str(), "OK");
        assert_eq!(Status::DeadlineExceeded.as_str(), "DEADLINE_EXCEEDED");
        assert_eq!(Status::Unauthenticated.to_string(), "UNAUTHENTICATED");
        assert!(Status::Ok.is_ok());
        assert!(!Status::Internal.is_ok());
    }

    #[test]
    fn op_batch_debug_reports_presence() {
        let batch = OpBatch {
            send_message: Some(SendMessage {
                payload: Bytes::from_static(b"x"),
            }),
            ..Default::default()
        };
        let dbg = format!("{batch:?}");
        assert!(dbg.contains("send_message: true"));
        assert!(dbg.contains("recv_message: false"));
    }
}
