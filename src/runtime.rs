//! Trigger poll loop.
//!
//! The engine is host-driven: it only executes when a trigger fires. This
//! loop is the host: it polls the in-memory trigger table once a minute,
//! fires whatever is due, and logs wall-clock jumps (sleep/wake) since a
//! jump usually means a burst of overdue work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::engine::Engine;
use crate::trigger::{InMemoryTriggers, TriggerKind};

/// Poll interval for the trigger loop (1 minute).
const POLL_INTERVAL_SECS: u64 = 60;

/// Time jump threshold to detect sleep/wake (5 minutes).
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Run the trigger loop forever.
pub async fn run_trigger_loop(engine: Arc<Engine>, triggers: Arc<InMemoryTriggers>) {
    engine.ensure_dispatcher();
    let mut last_check = Utc::now();

    loop {
        tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;

        let now = Utc::now();
        let jump = (now - last_check).num_seconds();
        if jump > TIME_JUMP_THRESHOLD_SECS {
            log::info!("runtime: detected wake after {jump}s pause, firing overdue triggers");
        }

        for handle in triggers.due(now) {
            match handle.kind {
                TriggerKind::Dispatch => engine.dispatch().await,
                TriggerKind::ChunkKickoff => {
                    if let Err(e) = engine.step().await {
                        // The run is already failed and reported; nothing
                        // more to do from the loop.
                        log::error!("runtime: kickoff step failed: {e}");
                    }
                }
            }
        }

        last_check = now;
    }
}
