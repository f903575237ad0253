//! The digest accumulator: the single durable store of pending digest
//! content.
//!
//! One JSON document in the blob store, append-only between digests. It is
//! only reset by `clear()`, which the digest path calls iff the send
//! succeeded. A pointer to the blob handle is cached in KV so passes don't
//! rescan the blob directory.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BlobHandle, BlobStore, KvStore};
use crate::error::StoreError;
use crate::types::Classification;

/// Fixed blob name, kept stable across versions so upgrades find prior
/// accumulation.
pub const ACCUMULATOR_FILE: &str = "gmail-fast-read-accumulated-results.json";

/// KV key caching the blob handle.
pub const ACCUMULATOR_POINTER_KEY: &str = "accumulatorFileId";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccumulatorFile {
    pub must_do: Vec<crate::types::Finding>,
    pub must_know: Vec<crate::types::Finding>,
    pub total_processed: u64,
    pub first_date: Option<DateTime<Utc>>,
    pub last_date: Option<DateTime<Utc>>,
}

impl AccumulatorFile {
    pub fn is_empty(&self) -> bool {
        self.must_do.is_empty() && self.must_know.is_empty()
    }

    pub fn finding_count(&self) -> usize {
        self.must_do.len() + self.must_know.len()
    }

    /// Append a pass's results. Concatenation only: the file grows
    /// monotonically between digests.
    pub fn merge(
        &mut self,
        new: Classification,
        processed: u64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) {
        self.must_do.extend(new.must_do);
        self.must_know.extend(new.must_know);
        self.total_processed += processed;
        if self.first_date.is_none() {
            self.first_date = Some(window_start);
        }
        self.last_date = Some(window_end);
    }
}

/// Accumulator persistence over the blob store, with the handle pointer
/// cached in KV.
#[derive(Clone)]
pub struct Accumulator {
    kv: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
}

impl Accumulator {
    pub fn new(kv: Arc<dyn KvStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { kv, blobs }
    }

    /// Load the accumulator, creating an empty one if missing. Unreadable
    /// content is treated as empty rather than wedging the passive engine;
    /// the old bytes stay on disk until the next store.
    pub fn load(&self) -> Result<(AccumulatorFile, BlobHandle), StoreError> {
        let (content, handle) = self.blobs.read_or_init(ACCUMULATOR_FILE, "{}")?;
        self.kv.set(ACCUMULATOR_POINTER_KEY, &handle.0)?;
        let file = match serde_json::from_str::<AccumulatorFile>(&content) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Accumulator unreadable ({e}), starting a fresh one");
                AccumulatorFile::default()
            }
        };
        Ok((file, handle))
    }

    pub fn store(&self, handle: &BlobHandle, file: &AccumulatorFile) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(file)?;
        self.blobs.write(handle, &content)
    }

    /// Delete the accumulator and its pointer. Called only after a
    /// successful digest send.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.blobs.trash(ACCUMULATOR_FILE)?;
        self.kv.delete(ACCUMULATOR_POINTER_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::types::Finding;

    fn finding(id: &str) -> Finding {
        Finding {
            email_id: id.to_string(),
            rfc822_id: None,
            subject: "s".to_string(),
            sender: "a@b.com".to_string(),
            topic: "t".to_string(),
            key_action: None,
            key_knowledge: None,
            date: None,
        }
    }

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_merge_appends_and_tracks_window() {
        let mut acc = AccumulatorFile::default();
        assert!(acc.is_empty());

        acc.merge(
            Classification {
                must_do: vec![finding("1")],
                must_know: vec![],
            },
            5,
            ts(14, 9),
            ts(14, 10),
        );
        acc.merge(
            Classification {
                must_do: vec![finding("2")],
                must_know: vec![finding("3")],
            },
            3,
            ts(15, 9),
            ts(15, 10),
        );

        assert_eq!(acc.must_do.len(), 2);
        assert_eq!(acc.must_know.len(), 1);
        assert_eq!(acc.total_processed, 8);
        // firstDate sticks to the earliest window; lastDate tracks the latest.
        assert_eq!(acc.first_date, Some(ts(14, 9)));
        assert_eq!(acc.last_date, Some(ts(15, 10)));
        assert_eq!(acc.finding_count(), 3);
    }

    #[test]
    fn test_wire_format() {
        let mut acc = AccumulatorFile::default();
        acc.merge(
            Classification {
                must_do: vec![finding("m1")],
                must_know: vec![],
            },
            1,
            ts(14, 0),
            ts(14, 1),
        );
        let json = serde_json::to_value(&acc).unwrap();
        assert!(json["mustDo"].is_array());
        assert!(json["mustKnow"].is_array());
        assert_eq!(json["totalProcessed"], 1);

        // Empty object round-trips to the default (lazily created file).
        let parsed: AccumulatorFile = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_empty());
        assert_eq!(parsed.total_processed, 0);
    }
}
