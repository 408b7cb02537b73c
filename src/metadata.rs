//! Call metadata batches and the initial-metadata extractor
//!
//! A `MetadataBatch` is the key/value collection attached to a call's
//! initial request and trailing completion. The extractor pulls the
//! census-internal entries (`grpc-trace-bin`, `grpc-tags-bin`) out of the
//! incoming batch so they never reach application code, and copies the call
//! path without removing it since later pipeline stages still route on it.

use bytes::Bytes;

use crate::error::CensusError;

/// Call path entry, e.g. `/svc/Method`.
pub const PATH_KEY: &str = ":path";
/// Incoming serialized tracing context.
pub const TRACE_CONTEXT_KEY: &str = "grpc-trace-bin";
/// Incoming serialized tag set.
pub const TAG_CONTEXT_KEY: &str = "grpc-tags-bin";
/// Outgoing serialized server stats, appended to trailing metadata.
pub const SERVER_STATS_KEY: &str = "grpc-server-stats-bin";

/// One key/value pair in a metadata batch. Values are owned byte buffers;
/// extraction copies out of transport memory rather than borrowing into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub key: String,
    pub value: Bytes,
}

/// Ordered metadata collection for one direction of one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataBatch {
    entries: Vec<MetadataEntry>,
}

impl MetadataBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Keys must be non-empty lowercase ASCII, the only
    /// form legal on the wire.
    pub fn append(&mut self, key: impl Into<String>, value: Bytes) -> Result<(), CensusError> {
        let key = key.into();
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b':' | b'.'));
        if !valid {
            return Err(CensusError::InvalidKey { key });
        }
        self.entries.push(MetadataEntry { key, value });
        Ok(())
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.iter().find(|e| e.key == key).map(|e| &e.value)
    }

    /// Remove the first entry for `key`, transferring ownership of its value
    /// to the caller. Later stages no longer see the entry.
    pub fn remove(&mut self, key: &str) -> Option<Bytes> {
        let idx = self.entries.iter().position(|e| e.key == key)?;
        Some(self.entries.remove(idx).value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataEntry> {
        self.entries.iter()
    }
}

/// The census-relevant pieces of a call's initial metadata. Absent entries
/// come back as empty buffers, never as errors.
#[derive(Debug, Clone, Default)]
pub struct InitialElements {
    pub path: Bytes,
    pub trace: Bytes,
    pub tags: Bytes,
}

/// Scan the incoming initial metadata for the well-known census entries.
///
/// The trace and tag blobs are removed from the batch (they are internal to
/// the observation layer); the path is copied but left in place. Runs at
/// most once per call, during initial-metadata processing.
pub fn extract_initial(batch: &mut MetadataBatch) -> InitialElements {
    let mut elements = InitialElements::default();
    if let Some(path) = batch.get(PATH_KEY) {
        elements.path = path.clone();
    }
    if let Some(trace) = batch.remove(TRACE_CONTEXT_KEY) {
        elements.trace = trace;
    }
    if let Some(tags) = batch.remove(TAG_CONTEXT_KEY) {
        elements.tags = tags;
    }
    elements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_with(entries: &[(&str, &[u8])]) -> MetadataBatch {
        let mut batch = MetadataBatch::new();
        for (k, v) in entries {
            batch.append(*k, Bytes::copy_from_slice(v)).unwrap();
        }
        batch
    }

    #[test]
    fn extract_removes_census_entries_and_keeps_path() {
        let mut batch = batch_with(&[
            (PATH_KEY, b"/svc/Method"),
            (TRACE_CONTEXT_KEY, b"\x00trace"),
            (TAG_CONTEXT_KEY, b"\x00tags"),
            ("user-agent", b"test"),
        ]);

        let elements = extract_initial(&mut batch);

        assert_eq!(elements.path.as_ref(), b"/svc/Method");
        assert_eq!(elements.trace.as_ref(), b"\x00trace");
        assert_eq!(elements.tags.as_ref(), b"\x00tags");

        // Census entries are gone downstream; path and unrelated entries stay.
        assert!(batch.get(TRACE_CONTEXT_KEY).is_none());
        assert!(batch.get(TAG_CONTEXT_KEY).is_none());
        assert!(batch.get(PATH_KEY).is_some());
        assert!(batch.get("user-agent").is_some());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn extract_tolerates_absent_entries() {
        let mut batch = batch_with(&[("user-agent", b"test")]);
        let elements = extract_initial(&mut batch);
        assert!(elements.path.is_empty());
        assert!(elements.trace.is_empty());
        assert!(elements.tags.is_empty());
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn append_rejects_uppercase_keys() {
        let mut batch = MetadataBatch::new();
        let err = batch.append("Grpc-Trace-Bin", Bytes::new()).unwrap_err();
        assert!(matches!(err, CensusError::InvalidKey { .. }));
        assert!(batch.is_empty());
    }

    #[test]
    fn append_rejects_empty_key() {
        let mut batch = MetadataBatch::new();
        assert!(batch.append("", Bytes::new()).is_err());
    }

    #[test]
    fn remove_transfers_first_match_only() {
        let mut batch = batch_with(&[("k", b"one"), ("k", b"two")]);
        assert_eq!(batch.remove("k").unwrap().as_ref(), b"one");
        assert_eq!(batch.get("k").unwrap().as_ref(), b"two");
    }
}
