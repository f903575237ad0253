//! Trigger scheduling capability.
//!
//! The host grants a small budget of installed triggers, so the design rule
//! is: at steady state exactly one recurring dispatch trigger exists. The
//! active engine may temporarily trade it for a short-fuse one-off; every
//! path that could leave zero triggers installed re-runs
//! `Engine::ensure_dispatcher`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::TriggerError;

/// Default slot budget, mirroring the stingiest host we target.
pub const DEFAULT_TRIGGER_BUDGET: usize = 20;

/// What a trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerKind {
    /// The recurring dispatcher tick (the system's heartbeat).
    Dispatch,
    /// One-off kickoff of the next active chunk.
    ChunkKickoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerHandle {
    pub id: u64,
    pub kind: TriggerKind,
}

pub trait TriggerService: Send + Sync {
    fn list(&self) -> Vec<TriggerHandle>;
    fn create_recurring(&self, kind: TriggerKind, every: Duration)
        -> Result<TriggerHandle, TriggerError>;
    fn create_one_shot(&self, kind: TriggerKind, after: Duration)
        -> Result<TriggerHandle, TriggerError>;
    fn delete(&self, handle: &TriggerHandle) -> Result<(), TriggerError>;
}

struct Entry {
    id: u64,
    kind: TriggerKind,
    due: DateTime<Utc>,
    every: Option<Duration>,
}

struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// In-memory trigger table polled by the runtime loop. Enforces the slot
/// budget the way the host would.
pub struct InMemoryTriggers {
    clock: Arc<dyn Clock>,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl InMemoryTriggers {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            clock,
            capacity,
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: Vec::new(),
            }),
        }
    }

    fn insert(
        &self,
        kind: TriggerKind,
        delay: Duration,
        every: Option<Duration>,
    ) -> Result<TriggerHandle, TriggerError> {
        let due = self.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let mut inner = self.inner.lock().expect("trigger table mutex poisoned");
        if inner.entries.len() >= self.capacity {
            return Err(TriggerError::BudgetExhausted {
                capacity: self.capacity,
            });
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            kind,
            due,
            every,
        });
        Ok(TriggerHandle { id, kind })
    }

    /// Pop every trigger due at `now`. One-shots are consumed; recurring
    /// triggers are rescheduled past `now` before being returned, so a
    /// long host pause yields one firing, not a burst.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<TriggerHandle> {
        let mut inner = self.inner.lock().expect("trigger table mutex poisoned");
        let mut fired = Vec::new();
        inner.entries.retain_mut(|entry| {
            if entry.due > now {
                return true;
            }
            fired.push(TriggerHandle {
                id: entry.id,
                kind: entry.kind,
            });
            match entry.every {
                Some(every) => {
                    let every = chrono::Duration::from_std(every).unwrap_or_default();
                    if every <= chrono::Duration::zero() {
                        return false;
                    }
                    while entry.due <= now {
                        entry.due += every;
                    }
                    true
                }
                None => false,
            }
        });
        fired
    }
}

impl TriggerService for InMemoryTriggers {
    fn list(&self) -> Vec<TriggerHandle> {
        self.inner
            .lock()
            .expect("trigger table mutex poisoned")
            .entries
            .iter()
            .map(|e| TriggerHandle {
                id: e.id,
                kind: e.kind,
            })
            .collect()
    }

    fn create_recurring(
        &self,
        kind: TriggerKind,
        every: Duration,
    ) -> Result<TriggerHandle, TriggerError> {
        self.insert(kind, every, Some(every))
    }

    fn create_one_shot(
        &self,
        kind: TriggerKind,
        after: Duration,
    ) -> Result<TriggerHandle, TriggerError> {
        self.insert(kind, after, None)
    }

    fn delete(&self, handle: &TriggerHandle) -> Result<(), TriggerError> {
        let mut inner = self.inner.lock().expect("trigger table mutex poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != handle.id);
        if inner.entries.len() == before {
            return Err(TriggerError::NotFound);
        }
        Ok(())
    }
}
