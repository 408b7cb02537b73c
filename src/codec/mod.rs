//! Bounded binary codec for census context blobs carried in call metadata
//!
//! What this module provides
//! - Deterministic, lossless conversions between in-memory census values and
//!   the length-bounded byte blobs that travel in metadata entries
//! - Pure utility types decoupled from the interception pipeline
//!
//! Exports
//! - Models
//!   - `TraceContext { trace_id, span_id, options }` (`grpc-trace-bin`)
//!   - `TagContext { tags }` (`grpc-tags-bin`)
//!   - `ServerStats { elapsed_ns }` (`grpc-server-stats-bin`)
//! - Utils (pure)
//!   - `encode(&self, buf, max_len) -> usize` on each model; refuses with 0
//!     and no partial write when the serialized form exceeds `max_len`
//!   - `decode(raw, max_len) -> Self` on each model; absent, oversized, or
//!     malformed input yields the empty value, never an error
//!   - `CodecError` for the internal parse paths
//!
//! Implementation strategy
//! - Every blob starts with a version byte (currently 0) followed by
//!   `(field id, payload)` pairs; fixed-width fields for trace and stats,
//!   varint-length-prefixed strings for tags
//! - `encoded_len` is computed up front so `encode` never partially writes
//! - The size ceilings exist because these blobs ride the wire on every
//!   call; an unbounded context is a resource-exhaustion risk
//!
//! Composition
//! - The metadata extractor hands raw blob bytes here; the server call state
//!   hands decoded values to the derived context. No Tower dependency.
//!
//! Testing strategy
//! - Golden-case unit tests for field layout and the three ceilings
//! - Property tests (`tests/codec_roundtrip.rs`) asserting round-trip
//!   identity and that server stats always fit their 32-byte ceiling

use bytes::BufMut;
use tracing::debug;

/// Ceiling for general stats/tag-set blobs sent on the wire.
pub const MAX_TAG_CONTEXT_LEN: usize = 2046;
/// Ceiling for tracing blobs sent on the wire.
pub const MAX_TRACE_CONTEXT_LEN: usize = 128;
/// Ceiling for server stats sent back on trailing metadata.
pub const MAX_SERVER_STATS_LEN: usize = 32;

const VERSION: u8 = 0;

const TRACE_ID_FIELD: u8 = 0;
const SPAN_ID_FIELD: u8 = 1;
const TRACE_OPTIONS_FIELD: u8 = 2;

const TAG_FIELD: u8 = 0;

const LATENCY_FIELD: u8 = 0;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown field id {0}")]
    UnknownField(u8),

    #[error("blob truncated")]
    Truncated,

    #[error("tag is not valid UTF-8")]
    InvalidTag,
}

fn varint_len(mut v: u64) -> usize {
    let mut n = 1;
    while v >= 0x80 {
        v >>= 7;
        n += 1;
    }
    n
}

fn put_varint<B: BufMut>(buf: &mut B, mut v: u64) {
    while v >= 0x80 {
        buf.put_u8((v as u8 & 0x7f) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn get_varint(raw: &[u8], pos: &mut usize) -> Result<u64, CodecError> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *raw.get(*pos).ok_or(CodecError::Truncated)?;
        *pos += 1;
        v |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(CodecError::Truncated);
        }
    }
}

fn take<'a>(raw: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], CodecError> {
    let end = pos.checked_add(n).ok_or(CodecError::Truncated)?;
    if end > raw.len() {
        return Err(CodecError::Truncated);
    }
    let out = &raw[*pos..end];
    *pos = end;
    Ok(out)
}

/// Distributed tracing context as carried in `grpc-trace-bin`.
///
/// The empty value (all-zero trace id) stands in for "no incoming context".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub options: u8,
}

impl TraceContext {
    pub fn is_empty(&self) -> bool {
        self.trace_id == [0; 16]
    }

    /// Serialized length: version + three (id, payload) fields.
    pub fn encoded_len(&self) -> usize {
        1 + (1 + 16) + (1 + 8) + (1 + 1)
    }

    /// Encode into `buf`. Returns the byte count, or 0 (nothing written)
    /// when the serialized form would exceed `max_len`.
    pub fn encode<B: BufMut>(&self, buf: &mut B, max_len: usize) -> usize {
        let len = self.encoded_len();
        if len > max_len {
            return 0;
        }
        buf.put_u8(VERSION);
        buf.put_u8(TRACE_ID_FIELD);
        buf.put_slice(&self.trace_id);
        buf.put_u8(SPAN_ID_FIELD);
        buf.put_slice(&self.span_id);
        buf.put_u8(TRACE_OPTIONS_FIELD);
        buf.put_u8(self.options);
        len
    }

    /// Decode, degrading to the empty context on any malformed input.
    pub fn decode(raw: &[u8], max_len: usize) -> Self {
        if raw.is_empty() || raw.len() > max_len {
            return Self::default();
        }
        Self::parse(raw).unwrap_or_else(|e| {
            debug!(error = %e, "dropping malformed trace context");
            Self::default()
        })
    }

    fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0usize;
        let version = *take(raw, &mut pos, 1)?.first().ok_or(CodecError::Truncated)?;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let mut ctx = Self::default();
        while pos < raw.len() {
            let field = raw[pos];
            pos += 1;
            match field {
                TRACE_ID_FIELD => ctx.trace_id.copy_from_slice(take(raw, &mut pos, 16)?),
                SPAN_ID_FIELD => ctx.span_id.copy_from_slice(take(raw, &mut pos, 8)?),
                TRACE_OPTIONS_FIELD => ctx.options = take(raw, &mut pos, 1)?[0],
                other => return Err(CodecError::UnknownField(other)),
            }
        }
        Ok(ctx)
    }
}

/// Census tag set as carried in `grpc-tags-bin`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagContext {
    pub tags: Vec<(String, String)>,
}

impl TagContext {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 1;
        for (k, v) in &self.tags {
            len += 1
                + varint_len(k.len() as u64)
                + k.len()
                + varint_len(v.len() as u64)
                + v.len();
        }
        len
    }

    /// Encode into `buf`. Returns the byte count, or 0 (nothing written)
    /// when the serialized form would exceed `max_len`.
    pub fn encode<B: BufMut>(&self, buf: &mut B, max_len: usize) -> usize {
        let len = self.encoded_len();
        if len > max_len {
            return 0;
        }
        buf.put_u8(VERSION);
        for (k, v) in &self.tags {
            buf.put_u8(TAG_FIELD);
            put_varint(buf, k.len() as u64);
            buf.put_slice(k.as_bytes());
            put_varint(buf, v.len() as u64);
            buf.put_slice(v.as_bytes());
        }
        len
    }

    /// Decode, degrading to the empty tag set on any malformed input.
    pub fn decode(raw: &[u8], max_len: usize) -> Self {
        if raw.is_empty() || raw.len() > max_len {
            return Self::default();
        }
        Self::parse(raw).unwrap_or_else(|e| {
            debug!(error = %e, "dropping malformed tag context");
            Self::default()
        })
    }

    fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0usize;
        let version = *take(raw, &mut pos, 1)?.first().ok_or(CodecError::Truncated)?;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let mut tags = Vec::new();
        while pos < raw.len() {
            let field = raw[pos];
            pos += 1;
            if field != TAG_FIELD {
                return Err(CodecError::UnknownField(field));
            }
            let klen = get_varint(raw, &mut pos)? as usize;
            let key = std::str::from_utf8(take(raw, &mut pos, klen)?)
                .map_err(|_| CodecError::InvalidTag)?
                .to_string();
            let vlen = get_varint(raw, &mut pos)? as usize;
            let value = std::str::from_utf8(take(raw, &mut pos, vlen)?)
                .map_err(|_| CodecError::InvalidTag)?
                .to_string();
            tags.push((key, value));
        }
        Ok(Self { tags })
    }
}

/// Server-side stats reported back to the client on trailing metadata.
///
/// The fixed 10-byte layout means any representable elapsed time fits the
/// 32-byte wire ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub elapsed_ns: u64,
}

impl ServerStats {
    pub fn encoded_len(&self) -> usize {
        1 + 1 + 8
    }

    /// Encode into `buf`. Returns the byte count, or 0 (nothing written)
    /// when `max_len` is below the fixed layout size.
    pub fn encode<B: BufMut>(&self, buf: &mut B, max_len: usize) -> usize {
        let len = self.encoded_len();
        if len > max_len {
            return 0;
        }
        buf.put_u8(VERSION);
        buf.put_u8(LATENCY_FIELD);
        buf.put_u64_le(self.elapsed_ns);
        len
    }

    /// Decode, degrading to zero elapsed time on any malformed input.
    pub fn decode(raw: &[u8], max_len: usize) -> Self {
        if raw.is_empty() || raw.len() > max_len {
            return Self::default();
        }
        Self::parse(raw).unwrap_or_else(|e| {
            debug!(error = %e, "dropping malformed server stats");
            Self::default()
        })
    }

    fn parse(raw: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0usize;
        let version = *take(raw, &mut pos, 1)?.first().ok_or(CodecError::Truncated)?;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let mut stats = Self::default();
        while pos < raw.len() {
            let field = raw[pos];
            pos += 1;
            match field {
                LATENCY_FIELD => {
                    let bytes = take(raw, &mut pos, 8)?;
                    let mut fixed = [0u8; 8];
                    fixed.copy_from_slice(bytes);
                    stats.elapsed_ns = u64::from_le_bytes(fixed);
                }
                other => return Err(CodecError::UnknownField(other)),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_context_round_trip() {
        let ctx = TraceContext {
            trace_id: [0xAB; 16],
            span_id: [0xCD; 8],
            options: 1,
        };
        let mut buf = Vec::new();
        let len = ctx.encode(&mut buf, MAX_TRACE_CONTEXT_LEN);
        assert_eq!(len, 29);
        assert_eq!(buf.len(), 29);
        assert_eq!(TraceContext::decode(&buf, MAX_TRACE_CONTEXT_LEN), ctx);
    }

    #[test]
    fn trace_context_field_layout() {
        let ctx = TraceContext {
            trace_id: [1; 16],
            span_id: [2; 8],
            options: 3,
        };
        let mut buf = Vec::new();
        ctx.encode(&mut buf, MAX_TRACE_CONTEXT_LEN);
        assert_eq!(buf[0], 0); // version
        assert_eq!(buf[1], 0); // trace id field
        assert_eq!(&buf[2..18], &[1; 16]);
        assert_eq!(buf[18], 1); // span id field
        assert_eq!(&buf[19..27], &[2; 8]);
        assert_eq!(buf[27], 2); // options field
        assert_eq!(buf[28], 3);
    }

    #[test]
    fn encode_refuses_over_ceiling_without_partial_write() {
        let ctx = TraceContext {
            trace_id: [7; 16],
            span_id: [8; 8],
            options: 0,
        };
        let mut buf = Vec::new();
        assert_eq!(ctx.encode(&mut buf, 28), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_empty_or_absent_yields_empty() {
        let trace = TraceContext::decode(&[], MAX_TRACE_CONTEXT_LEN);
        assert!(trace.is_empty());
        let tags = TagContext::decode(&[], MAX_TAG_CONTEXT_LEN);
        assert!(tags.is_empty());
        let stats = ServerStats::decode(&[], MAX_SERVER_STATS_LEN);
        assert_eq!(stats.elapsed_ns, 0);
    }

    #[test]
    fn decode_oversized_yields_empty() {
        let raw = vec![0u8; MAX_TRACE_CONTEXT_LEN + 1];
        assert!(TraceContext::decode(&raw, MAX_TRACE_CONTEXT_LEN).is_empty());
    }

    #[test]
    fn decode_wrong_version_yields_empty() {
        let mut buf = Vec::new();
        TraceContext {
            trace_id: [9; 16],
            ..Default::default()
        }
        .encode(&mut buf, MAX_TRACE_CONTEXT_LEN);
        buf[0] = 1;
        assert!(TraceContext::decode(&buf, MAX_TRACE_CONTEXT_LEN).is_empty());
    }

    #[test]
    fn decode_truncated_yields_empty() {
        let mut buf = Vec::new();
        TraceContext {
            trace_id: [9; 16],
            ..Default::default()
        }
        .encode(&mut buf, MAX_TRACE_CONTEXT_LEN);
        buf.truncate(10);
        assert!(TraceContext::decode(&buf, MAX_TRACE_CONTEXT_LEN).is_empty());
    }

    #[test]
    fn tag_context_round_trip() {
        let tags = TagContext {
            tags: vec![
                ("env".to_string(), "prod".to_string()),
                ("region".to_string(), "us-east1".to_string()),
            ],
        };
        let mut buf = Vec::new();
        let len = tags.encode(&mut buf, MAX_TAG_CONTEXT_LEN);
        assert_eq!(len, buf.len());
        assert_eq!(TagContext::decode(&buf, MAX_TAG_CONTEXT_LEN), tags);
    }

    #[test]
    fn tag_context_refuses_over_ceiling() {
        let tags = TagContext {
            tags: vec![("k".to_string(), "v".repeat(MAX_TAG_CONTEXT_LEN))],
        };
        let mut buf = Vec::new();
        assert_eq!(tags.encode(&mut buf, MAX_TAG_CONTEXT_LEN), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn tag_context_rejects_invalid_utf8() {
        // version, tag field, key len 1, 0xFF (not UTF-8), value len 0
        let raw = [0u8, 0, 1, 0xFF, 0];
        assert!(TagContext::decode(&raw, MAX_TAG_CONTEXT_LEN).is_empty());
    }

    #[test]
    fn server_stats_layout_and_round_trip() {
        let stats = ServerStats {
            elapsed_ns: 5_000_000,
        };
        let mut buf = Vec::new();
        let len = stats.encode(&mut buf, MAX_SERVER_STATS_LEN);
        assert_eq!(len, 10);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[1], 0);
        assert_eq!(u64::from_le_bytes(buf[2..10].try_into().unwrap()), 5_000_000);
        assert_eq!(ServerStats::decode(&buf, MAX_SERVER_STATS_LEN), stats);
    }

    #[test]
    fn server_stats_max_duration_fits_ceiling() {
        let stats = ServerStats {
            elapsed_ns: u64::MAX,
        };
        let mut buf = Vec::new();
        let len = stats.encode(&mut buf, MAX_SERVER_STATS_LEN);
        assert!(len > 0 && len <= MAX_SERVER_STATS_LEN);
    }

    #[test]
    fn varint_round_trip_boundaries() {
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            assert_eq!(buf.len(), varint_len(v));
            let mut pos = 0;
            assert_eq!(get_varint(&buf, &mut pos).unwrap(), v);
            assert_eq!(pos, buf.len());
        }
    }
}
