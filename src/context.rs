//! Per-call derived census context and the transport call handle
//!
//! The derived context is built once per call from the incoming wire blobs
//! plus the method name, owned exclusively by the call's observation state,
//! and explicitly ended when the call is destroyed. The `CallHandle` is the
//! attachment point downstream consumers read it from.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tracing::trace;

use crate::codec::{TagContext, TraceContext, MAX_TAG_CONTEXT_LEN, MAX_TRACE_CONTEXT_LEN};

/// Opaque tracing/tagging context derived for one server call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CensusContext {
    trace: TraceContext,
    tags: TagContext,
    primary_role: String,
    method: String,
    ended: bool,
}

impl CensusContext {
    /// Build the server-side context from raw incoming blobs.
    ///
    /// Generation cannot fail: a parseable trace blob yields a child context
    /// (propagated trace id, fresh span id); anything else yields a fresh
    /// root context. Malformed tag blobs decode to the empty tag set.
    pub fn generate(trace_bytes: &Bytes, tag_bytes: &Bytes, primary_role: &str, method: &str) -> Self {
        let incoming = TraceContext::decode(trace_bytes, MAX_TRACE_CONTEXT_LEN);
        let trace = if incoming.is_empty() {
            TraceContext {
                trace_id: rand::random(),
                span_id: rand::random(),
                options: 0,
            }
        } else {
            TraceContext {
                trace_id: incoming.trace_id,
                span_id: rand::random(),
                options: incoming.options,
            }
        };
        Self {
            trace,
            tags: TagContext::decode(tag_bytes, MAX_TAG_CONTEXT_LEN),
            primary_role: primary_role.to_string(),
            method: method.to_string(),
            ended: false,
        }
    }

    pub fn trace(&self) -> &TraceContext {
        &self.trace
    }

    pub fn tags(&self) -> &TagContext {
        &self.tags
    }

    pub fn primary_role(&self) -> &str {
        &self.primary_role
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// End-of-life for the context. Idempotent.
    ///
    /// TODO: finish the server span and record tracing data here once span
    /// export is wired up; only the metrics path is live today.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        trace!(method = %self.method, "census context ended");
    }
}

/// Refcounted authentication properties of a call, captured at call init
/// and released when the observation state is destroyed.
#[derive(Debug, Default)]
pub struct AuthContext {
    pub peer_identity: Option<String>,
}

/// Stand-in for the transport's call object: carries the auth context and
/// the slot the interceptor fills with the derived census context so
/// downstream consumers can read it.
#[derive(Debug, Default)]
pub struct CallHandle {
    auth: Option<Arc<AuthContext>>,
    context: Mutex<Option<CensusContext>>,
}

impl CallHandle {
    pub fn new(auth: Option<Arc<AuthContext>>) -> Self {
        Self {
            auth,
            context: Mutex::new(None),
        }
    }

    pub fn auth_context(&self) -> Option<Arc<AuthContext>> {
        self.auth.clone()
    }

    /// Attach the derived context for downstream consumers.
    pub fn set_context(&self, ctx: CensusContext) {
        *self
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(ctx);
    }

    /// The context attached by the interception layer, if initial metadata
    /// has been processed.
    pub fn context(&self) -> Option<CensusContext> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAX_TRACE_CONTEXT_LEN;

    #[test]
    fn generate_keeps_propagated_trace_id_with_fresh_span() {
        let trace = TraceContext {
            trace_id: [5; 16],
            span_id: [6; 8],
            options: 1,
        };
        let mut trace_buf = Vec::new();
        trace.encode(&mut trace_buf, MAX_TRACE_CONTEXT_LEN);

        let ctx = CensusContext::generate(
            &Bytes::from(trace_buf),
            &Bytes::new(),
            "",
            "/svc/Method",
        );
        assert_eq!(ctx.trace().trace_id, trace.trace_id);
        assert_ne!(ctx.trace().span_id, trace.span_id);
        assert_eq!(ctx.trace().options, trace.options);
        assert!(ctx.tags().is_empty());
        assert_eq!(ctx.method(), "/svc/Method");
        assert!(!ctx.is_ended());
    }

    #[test]
    fn generate_with_garbage_blobs_starts_fresh_root() {
        let ctx = CensusContext::generate(
            &Bytes::from_static(b"\xFFgarbage"),
            &Bytes::from_static(b"\xFFgarbage"),
            "",
            "/svc/Method",
        );
        // Fresh root span: the trace context is live even without a usable
        // incoming blob, while the tag set degrades to empty.
        assert!(!ctx.trace().is_empty());
        assert!(ctx.tags().is_empty());
    }

    #[test]
    fn end_is_idempotent() {
        let mut ctx = CensusContext::generate(&Bytes::new(), &Bytes::new(), "", "/m");
        ctx.end();
        ctx.end();
        assert!(ctx.is_ended());
    }

    #[test]
    fn handle_round_trips_context() {
        let handle = CallHandle::new(Some(Arc::new(AuthContext {
            peer_identity: Some("spiffe://svc".to_string()),
        })));
        assert!(handle.context().is_none());

        let ctx = CensusContext::generate(&Bytes::new(), &Bytes::new(), "", "/m");
        handle.set_context(ctx.clone());
        assert_eq!(handle.context(), Some(ctx));
        assert_eq!(
            handle.auth_context().unwrap().peer_identity.as_deref(),
            Some("spiffe://svc")
        );
    }
}
