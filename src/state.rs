//! Typed facade over the persisted processing state.
//!
//! Every key the engine relies on across wake-ups lives in the KV store
//! under a stable name. This module owns parsing and defaults so the
//! engines never touch raw strings, and it partitions the surface: the
//! active engine gets the run/chunk setters, the passive engine only gets
//! the passive cursor. Absent keys are always legal.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, StoreError};
use crate::store::KvStore;
use crate::types::{RunStats, RunStatus};

/// KV key names. These are the durable schema; renaming one orphans state.
pub mod keys {
    pub const LOCK: &str = "lock";
    pub const STATUS: &str = "status";
    pub const STATUS_MSG: &str = "statusMsg";
    pub const STARTED_AT: &str = "startedAt";
    pub const TIME_RANGE: &str = "timeRange";
    pub const CHUNK_WINDOW_START: &str = "chunkWindowStart";
    pub const CHUNK_WINDOW_END: &str = "chunkWindowEnd";
    pub const CHUNK_INDEX: &str = "chunkIndex";
    pub const CHUNK_TOTAL: &str = "chunkTotal";
    pub const ACCUMULATED_IN_FLIGHT: &str = "accumulatedInFlight";
    pub const CHUNK_STARTED_AT: &str = "chunkStartedAt";
    pub const EXPECTED_CHUNK_START_BY: &str = "expectedChunkStartBy";
    pub const PASSIVE_LAST_MSG_TS: &str = "passiveLastMsgTs";
    pub const PASSIVE_LAST_MSG_ID: &str = "passiveLastMsgId";
    pub const PASSIVE_LAST_SUMMARY_DATE: &str = "passiveLastSummaryDate";
    pub const PASSIVE_LAST_RUN_AT: &str = "passiveLastRunAt";
    pub const LATEST_RUN_STATS: &str = "latestRunStats";
}

/// Which workflow holds the single-writer lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    Active,
    Passive,
}

impl std::fmt::Display for LockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LockKind::Active => "active",
            LockKind::Passive => "passive",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub kind: LockKind,
    pub acquired_at: DateTime<Utc>,
}

/// Position of an in-progress active run within its chunk sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCursor {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub index: u32,
    pub total: u32,
}

#[derive(Clone)]
pub struct ProcessingState {
    kv: Arc<dyn KvStore>,
}

impl ProcessingState {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    // ------------------------------------------------------------------
    // Generic typed accessors
    // ------------------------------------------------------------------

    fn get_ts(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(raw) = self.kv.get(key)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => {
                log::warn!("Unparseable timestamp in {key}: {raw} ({e})");
                Ok(None)
            }
        }
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>, StoreError> {
        Ok(self.kv.get(key)?.and_then(|raw| raw.parse().ok()))
    }

    // ------------------------------------------------------------------
    // Lock
    // ------------------------------------------------------------------

    pub fn lock_info(&self) -> Result<Option<LockInfo>, StoreError> {
        let Some(raw) = self.kv.get(keys::LOCK)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                log::warn!("Unparseable lock value ({e}); treating as held");
                // A lock we cannot read is still a lock. The timeout reaper
                // is the only thing allowed to break it.
                Ok(Some(LockInfo {
                    kind: LockKind::Active,
                    acquired_at: Utc::now(),
                }))
            }
        }
    }

    /// Take the single-writer lock. Refuses if any lock exists, whatever
    /// its kind.
    pub fn acquire_lock(&self, kind: LockKind, now: DateTime<Utc>) -> Result<(), EngineError> {
        if let Some(existing) = self.lock_info()? {
            return Err(EngineError::LockHeld {
                holder: existing.kind.to_string(),
            });
        }
        self.write_lock(kind, now)?;
        Ok(())
    }

    /// Re-assert a lock of the same kind (each chunk refreshes the active
    /// lock's timestamp). Absent lock is re-acquired; a conflicting kind is
    /// refused.
    pub fn refresh_lock(&self, kind: LockKind, now: DateTime<Utc>) -> Result<(), EngineError> {
        match self.lock_info()? {
            None => {}
            Some(existing) if existing.kind == kind => {}
            Some(existing) => {
                return Err(EngineError::LockHeld {
                    holder: existing.kind.to_string(),
                });
            }
        }
        self.write_lock(kind, now)?;
        Ok(())
    }

    fn write_lock(&self, kind: LockKind, now: DateTime<Utc>) -> Result<(), StoreError> {
        let info = LockInfo {
            kind,
            acquired_at: now,
        };
        self.kv.set(
            keys::LOCK,
            &serde_json::to_string(&info).expect("lock serializes"),
        )
    }

    pub fn release_lock(&self) -> Result<(), StoreError> {
        self.kv.delete(keys::LOCK)
    }

    // ------------------------------------------------------------------
    // Active run status
    // ------------------------------------------------------------------

    pub fn status(&self) -> Result<Option<RunStatus>, StoreError> {
        Ok(self.kv.get(keys::STATUS)?.and_then(|s| RunStatus::parse(&s)))
    }

    pub fn set_status(&self, status: RunStatus, msg: &str) -> Result<(), StoreError> {
        self.kv.set_many(&[
            (keys::STATUS, status.as_str().to_string()),
            (keys::STATUS_MSG, msg.to_string()),
        ])
    }

    pub fn status_msg(&self) -> Result<Option<String>, StoreError> {
        self.kv.get(keys::STATUS_MSG)
    }

    pub fn set_status_msg(&self, msg: &str) -> Result<(), StoreError> {
        self.kv.set(keys::STATUS_MSG, msg)
    }

    pub fn started_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.get_ts(keys::STARTED_AT)
    }

    pub fn time_range(&self) -> Result<Option<String>, StoreError> {
        self.kv.get(keys::TIME_RANGE)
    }

    // ------------------------------------------------------------------
    // Active run chunk state
    // ------------------------------------------------------------------

    /// Persist the initial state of a new active run as one atomic write.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_active_run(
        &self,
        now: DateTime<Utc>,
        time_range: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        chunk_total: u32,
        expected_start_by: DateTime<Utc>,
        status_msg: &str,
    ) -> Result<(), StoreError> {
        self.kv.set_many(&[
            (keys::STATUS, RunStatus::Running.as_str().to_string()),
            (keys::STATUS_MSG, status_msg.to_string()),
            (keys::STARTED_AT, now.to_rfc3339()),
            (keys::TIME_RANGE, time_range.to_string()),
            (keys::CHUNK_WINDOW_START, window_start.to_rfc3339()),
            (keys::CHUNK_WINDOW_END, window_end.to_rfc3339()),
            (keys::CHUNK_INDEX, "0".to_string()),
            (keys::CHUNK_TOTAL, chunk_total.to_string()),
            (keys::ACCUMULATED_IN_FLIGHT, "{}".to_string()),
            (keys::EXPECTED_CHUNK_START_BY, expected_start_by.to_rfc3339()),
        ])
    }

    pub fn chunk_cursor(&self) -> Result<Option<ChunkCursor>, StoreError> {
        let (Some(window_start), Some(window_end), Some(index), Some(total)) = (
            self.get_ts(keys::CHUNK_WINDOW_START)?,
            self.get_ts(keys::CHUNK_WINDOW_END)?,
            self.get_u32(keys::CHUNK_INDEX)?,
            self.get_u32(keys::CHUNK_TOTAL)?,
        ) else {
            return Ok(None);
        };
        Ok(Some(ChunkCursor {
            window_start,
            window_end,
            index,
            total,
        }))
    }

    pub fn advance_chunk(&self, new_index: u32) -> Result<(), StoreError> {
        self.kv.set(keys::CHUNK_INDEX, &new_index.to_string())
    }

    pub fn in_flight(&self) -> Result<crate::store::AccumulatorFile, StoreError> {
        let Some(raw) = self.kv.get(keys::ACCUMULATED_IN_FLIGHT)? else {
            return Ok(Default::default());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            log::warn!("Unparseable in-flight accumulation ({e}); resetting");
            Default::default()
        }))
    }

    pub fn set_in_flight(&self, acc: &crate::store::AccumulatorFile) -> Result<(), StoreError> {
        self.kv
            .set(keys::ACCUMULATED_IN_FLIGHT, &serde_json::to_string(acc)?)
    }

    /// A chunk is executing from here until `mark_chunk_ended`.
    pub fn mark_chunk_starting(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.kv.set(keys::CHUNK_STARTED_AT, &now.to_rfc3339())?;
        self.kv.delete(keys::EXPECTED_CHUNK_START_BY)
    }

    pub fn mark_chunk_ended(&self) -> Result<(), StoreError> {
        self.kv.delete(keys::CHUNK_STARTED_AT)
    }

    pub fn chunk_started_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.get_ts(keys::CHUNK_STARTED_AT)
    }

    pub fn set_expected_chunk_start_by(&self, deadline: DateTime<Utc>) -> Result<(), StoreError> {
        self.kv
            .set(keys::EXPECTED_CHUNK_START_BY, &deadline.to_rfc3339())
    }

    pub fn expected_chunk_start_by(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.get_ts(keys::EXPECTED_CHUNK_START_BY)
    }

    /// Remove all per-run keys on a terminal transition. The terminal
    /// `status`/`statusMsg` and `latestRunStats` survive for the status
    /// surface.
    pub fn clear_active_run(&self) -> Result<(), StoreError> {
        for key in [
            keys::STARTED_AT,
            keys::TIME_RANGE,
            keys::CHUNK_WINDOW_START,
            keys::CHUNK_WINDOW_END,
            keys::CHUNK_INDEX,
            keys::CHUNK_TOTAL,
            keys::ACCUMULATED_IN_FLIGHT,
            keys::CHUNK_STARTED_AT,
            keys::EXPECTED_CHUNK_START_BY,
        ] {
            self.kv.delete(key)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Passive cursor
    // ------------------------------------------------------------------

    pub fn passive_cursor(&self) -> Result<(Option<DateTime<Utc>>, Option<String>), StoreError> {
        Ok((
            self.get_ts(keys::PASSIVE_LAST_MSG_TS)?,
            self.kv.get(keys::PASSIVE_LAST_MSG_ID)?,
        ))
    }

    /// Advance the high-water mark. The timestamp never moves backwards:
    /// a pass that somehow observed an older message than a prior pass
    /// must not reopen already-processed ground.
    pub fn set_passive_cursor(&self, ts: DateTime<Utc>, msg_id: &str) -> Result<(), StoreError> {
        if let Some(existing) = self.get_ts(keys::PASSIVE_LAST_MSG_TS)? {
            if ts < existing {
                log::warn!(
                    "Refusing to move passive high-water mark backwards ({ts} < {existing})"
                );
                return Ok(());
            }
        }
        self.kv.set_many(&[
            (keys::PASSIVE_LAST_MSG_TS, ts.to_rfc3339()),
            (keys::PASSIVE_LAST_MSG_ID, msg_id.to_string()),
        ])
    }

    pub fn passive_last_run_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.get_ts(keys::PASSIVE_LAST_RUN_AT)
    }

    pub fn set_passive_last_run_at(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.kv.set(keys::PASSIVE_LAST_RUN_AT, &now.to_rfc3339())
    }

    pub fn passive_last_summary_date(&self) -> Result<Option<String>, StoreError> {
        self.kv.get(keys::PASSIVE_LAST_SUMMARY_DATE)
    }

    pub fn set_passive_last_summary_date(&self, date: &str) -> Result<(), StoreError> {
        self.kv.set(keys::PASSIVE_LAST_SUMMARY_DATE, date)
    }

    // ------------------------------------------------------------------
    // Run stats
    // ------------------------------------------------------------------

    pub fn latest_run_stats(&self) -> Result<Option<RunStats>, StoreError> {
        let Some(raw) = self.kv.get(keys::LATEST_RUN_STATS)? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    pub fn set_latest_run_stats(&self, stats: &RunStats) -> Result<(), StoreError> {
        self.kv
            .set(keys::LATEST_RUN_STATS, &serde_json::to_string(stats)?)
    }
}
