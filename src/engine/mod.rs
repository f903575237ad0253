//! The orchestration engine.
//!
//! A persistent state machine driven by timer wake-ups. Two workflows
//! cooperate under a single-writer lock:
//! - the passive hourly scan (`passive`), feeding the daily digest
//! - the on-demand chunked active scan (`active`)
//!
//! The host model is unforgiving: every invocation is bounded, nothing in
//! memory survives a wake-up, and the trigger budget is scarce. Hence all
//! progress lives in `ProcessingState`, long work is chunked, stalls are
//! reaped by the timeout check, and every path that can tear triggers down
//! re-runs `ensure_dispatcher`.

pub mod active;
pub mod batch;
pub mod digest;
pub mod dispatcher;
pub mod passive;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::Config;
use crate::llm::LlmClient;
use crate::mail::{MailStore, Mailer};
use crate::state::ProcessingState;
use crate::store::{Accumulator, BlobStore, KvStore};
use crate::trigger::{TriggerKind, TriggerService};

// ---------------------------------------------------------------------------
// Behavioural constants
// ---------------------------------------------------------------------------

/// Active-scan chunk size.
pub const CHUNK_DAYS: i64 = 2;

/// Hard per-invocation budget; a chunk running past this is considered hung.
pub const PROCESSING_TIMEOUT_MINS: i64 = 10;

/// Recurring dispatcher cadence. The host cannot go finer than an hour.
pub const DISPATCH_INTERVAL: Duration = Duration::from_secs(3600);

/// Delay of the one-off trigger that starts the first chunk.
pub const KICKOFF_DELAY: Duration = Duration::from_secs(60);

/// Percentage slack added on top of the base delay when computing the
/// next-chunk deadline.
pub const EXPECTED_START_SLACK: f64 = 0.3;

/// Fixed grace added to the next-chunk deadline.
pub const EXPECTED_START_GRACE_MINS: i64 = 10;

/// Minimum spacing between passive passes.
pub const PASSIVE_CADENCE_MINS: i64 = 60;

/// Passive scans never look further back than this.
pub const PASSIVE_BACKSTOP_HOURS: i64 = 24;

/// Overlap re-scanned past the high-water mark to absorb clock skew between
/// the provider and the engine.
pub const PASSIVE_SAFETY_BUFFER_MINS: i64 = 30;

/// Local time at which the digest window opens. It closes at midnight.
pub const DIGEST_WINDOW_START: &str = "21:00";

/// Token budget per classifier batch.
pub const MAX_BATCH_TOKENS: usize = 200_000;

/// Cheap char-based token estimate.
pub const TOKENS_PER_CHAR: f64 = 0.25;

/// Fixed prompt overhead accounted to every batch.
pub const BATCH_OVERHEAD_TOKENS: usize = 2_000;

/// Thread fetch cap per search.
pub const SEARCH_LIMIT: usize = 100;

/// Deadline by which the next chunk must have started: base delay, plus a
/// fraction of it for scheduler jitter, plus fixed grace.
pub(crate) fn expected_start_by(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let padded = delay.as_secs_f64() * (1.0 + EXPECTED_START_SLACK);
    now + chrono::Duration::seconds(padded.round() as i64)
        + chrono::Duration::minutes(EXPECTED_START_GRACE_MINS)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// All capabilities wired together. Everything is injectable; the engine
/// itself holds no authoritative state.
pub struct Engine {
    pub(crate) config: Config,
    pub(crate) state: ProcessingState,
    pub(crate) accumulator: Accumulator,
    pub(crate) mail: Arc<dyn MailStore>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) triggers: Arc<dyn TriggerService>,
    pub(crate) mailer: Arc<dyn Mailer>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        kv: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        mail: Arc<dyn MailStore>,
        llm: Arc<dyn LlmClient>,
        triggers: Arc<dyn TriggerService>,
        mailer: Arc<dyn Mailer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            state: ProcessingState::new(kv.clone()),
            accumulator: Accumulator::new(kv, blobs),
            mail,
            llm,
            triggers,
            mailer,
            clock,
        }
    }

    pub fn state(&self) -> &ProcessingState {
        &self.state
    }

    /// Reinstate the recurring dispatch trigger if it is missing. Called
    /// from every entry point that can affect triggers; the steady-state
    /// invariant is exactly one dispatch trigger installed.
    pub fn ensure_dispatcher(&self) {
        let exists = self
            .triggers
            .list()
            .iter()
            .any(|h| h.kind == TriggerKind::Dispatch);
        if exists {
            return;
        }
        match self
            .triggers
            .create_recurring(TriggerKind::Dispatch, DISPATCH_INTERVAL)
        {
            Ok(_) => log::info!("dispatcher: trigger reinstated"),
            Err(e) => log::error!("dispatcher: could not reinstate trigger: {e}"),
        }
    }

    /// Send a notification email to the user's own address. Failures are
    /// logged and swallowed: notifications never fail a workflow.
    pub(crate) async fn notify(&self, subject: &str, html_body: &str) {
        let to = match self.mail.profile_email().await {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Cannot resolve own address for notification: {e}");
                return;
            }
        };
        let subject = format!("[{}] {}", self.config.addon_name, subject);
        if let Err(e) = self
            .mailer
            .send(&to, &subject, html_body, &self.config.addon_name)
            .await
        {
            log::warn!("Notification send failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_expected_start_by_formula() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        // 60s kickoff: 60 + 18 = 78s, plus 10 minutes.
        let deadline = expected_start_by(now, Duration::from_secs(60));
        assert_eq!(deadline, now + chrono::Duration::seconds(78 + 600));

        // Hourly dispatch: 3600 + 1080 = 4680s, plus 10 minutes.
        let deadline = expected_start_by(now, DISPATCH_INTERVAL);
        assert_eq!(deadline, now + chrono::Duration::seconds(4680 + 600));
    }
}
