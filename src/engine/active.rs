//! The chunked active engine.
//!
//! A user-initiated scan over an arbitrary historical range, processed in
//! fixed 2-day chunks, one chunk per wake-up. `start` seeds the persisted
//! chunk state and trades the dispatcher trigger for a short-fuse kickoff;
//! `step` advances exactly one chunk and either schedules the next or
//! finalizes. Any error fails the run explicitly; active runs are never
//! silently resumed across errors.

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::mail::MailQuery;
use crate::state::LockKind;
use crate::store::AccumulatorFile;
use crate::types::{RunStats, RunStatus};
use crate::util::parse_time_range;

use super::digest::{render_digest, render_notice};
use super::{
    expected_start_by, Engine, CHUNK_DAYS, DISPATCH_INTERVAL, KICKOFF_DELAY, SEARCH_LIMIT,
};
use crate::trigger::TriggerKind;

impl Engine {
    /// Kick off an active scan over a symbolic range like `7days`.
    ///
    /// Preconditions: complete config and no existing lock. On any failure
    /// past lock acquisition the lock is released, the dispatcher
    /// reinstated, and an error notification sent. No partial locks may
    /// outlive this call.
    pub async fn start_active_scan(&self, range: &str) -> Result<(), EngineError> {
        if !self.config.is_complete() {
            return Err(EngineError::Config(
                "openaiApiKey is not configured".to_string(),
            ));
        }
        let duration = parse_time_range(range)
            .ok_or_else(|| EngineError::Config(format!("Unrecognized time range '{range}'")))?;

        let now = self.clock.now();
        self.state.acquire_lock(LockKind::Active, now)?;

        if let Err(e) = self.init_run(now, range, duration) {
            log::error!("active scan: start failed: {e}");
            let _ = self.state.set_status(RunStatus::Error, &format!("Scan failed to start: {e}"));
            if let Err(e2) = self.state.clear_active_run() {
                log::error!("active scan: teardown could not clear state: {e2}");
            }
            if let Err(e2) = self.state.release_lock() {
                log::error!("active scan: teardown could not release lock: {e2}");
            }
            self.ensure_dispatcher();
            self.notify(
                "Scan failed to start",
                &render_notice("The scan could not be started.", &e.to_string()),
            )
            .await;
            return Err(e);
        }
        Ok(())
    }

    fn init_run(
        &self,
        now: DateTime<Utc>,
        range: &str,
        duration: chrono::Duration,
    ) -> Result<(), EngineError> {
        let window_end = now;
        let window_start = now - duration;
        let chunk_secs = chrono::Duration::days(CHUNK_DAYS).num_seconds();
        let span_secs = (window_end - window_start).num_seconds();
        let chunk_total =
            std::cmp::max(1, (span_secs as u64).div_ceil(chunk_secs as u64)) as u32;

        self.state.begin_active_run(
            now,
            range,
            window_start,
            window_end,
            chunk_total,
            expected_start_by(now, KICKOFF_DELAY),
            &format!("Starting scan of the last {range}"),
        )?;

        // Trade the dispatcher trigger for a short-fuse kickoff so the
        // first chunk starts in ~1 minute instead of up to an hour out.
        // The kickoff's first action is to restore the dispatcher.
        for handle in self.triggers.list() {
            if handle.kind == TriggerKind::Dispatch {
                let _ = self.triggers.delete(&handle);
            }
        }
        self.triggers
            .create_one_shot(TriggerKind::ChunkKickoff, KICKOFF_DELAY)?;

        log::info!("active scan: started over {range} ({chunk_total} chunks)");
        Ok(())
    }

    /// Advance the running scan by one chunk. Invoked by the kickoff
    /// one-off and by every dispatcher tick while `status=running`.
    pub async fn step(&self) -> Result<(), EngineError> {
        self.ensure_dispatcher();

        let now = self.clock.now();
        if self.state.status()? != Some(RunStatus::Running) {
            log::warn!("active scan: step invoked with no running scan; ignoring");
            return Ok(());
        }
        self.state.refresh_lock(LockKind::Active, now)?;
        self.state.mark_chunk_starting(now)?;

        match self.step_inner(now).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("active scan: chunk failed: {e}");
                let detail = if e.is_transient() {
                    format!("Scan failed: {e}. The provider error looks temporary; a fresh scan may succeed.")
                } else {
                    format!("Scan failed: {e}")
                };
                self.fail_run(RunStatus::Error, &detail).await;
                Err(e)
            }
        }
    }

    async fn step_inner(&self, _now: DateTime<Utc>) -> Result<(), EngineError> {
        let cursor = self
            .state
            .chunk_cursor()?
            .ok_or_else(|| EngineError::State("running scan has no chunk state".to_string()))?;

        let chunk = chrono::Duration::days(CHUNK_DAYS);
        let w0 = cursor.window_start + chunk * cursor.index as i32;
        if w0 >= cursor.window_end {
            return self.finalize_run().await;
        }
        let w1 = std::cmp::min(w0 + chunk, cursor.window_end);

        log::info!(
            "active scan: chunk {}/{} covering [{w0}, {w1})",
            cursor.index + 1,
            cursor.total
        );
        self.state.set_status_msg(&format!(
            "Processing chunk {} of {}",
            cursor.index + 1,
            cursor.total
        ))?;

        let query = MailQuery::new()
            .after(w0)
            .before(w1)
            .unread_only(self.config.unread_only)
            .inbox_only(self.config.inbox_only)
            .build();
        let threads = self.mail.search(&query, SEARCH_LIMIT).await?;
        // Same ignore rules as the passive engine, minus the high-water cut.
        let me = self.mail.profile_email().await?;
        let threads =
            super::passive::filter_new_messages(threads, &me, &self.config.addon_name, None);
        let outcome = self.run_batches(&threads).await?;

        let mut in_flight = self.state.in_flight()?;
        in_flight.merge(outcome.classification, outcome.threads_processed, w0, w1);
        self.state.set_in_flight(&in_flight)?;

        let next_index = cursor.index + 1;
        self.state.advance_chunk(next_index)?;
        self.state.mark_chunk_ended()?;

        if cursor.window_start + chunk * (next_index as i32) < cursor.window_end {
            // More chunks remain; the next dispatcher tick resumes.
            self.state
                .set_expected_chunk_start_by(expected_start_by(self.clock.now(), DISPATCH_INTERVAL))?;
            self.state.set_status_msg(&format!(
                "Waiting for chunk {} of {}",
                next_index + 1,
                cursor.total
            ))?;
            return Ok(());
        }

        self.finalize_run().await
    }

    async fn finalize_run(&self) -> Result<(), EngineError> {
        let in_flight = self.state.in_flight()?;
        let summary = format!(
            "Scan complete: {} must-do, {} must-know across {} threads",
            in_flight.must_do.len(),
            in_flight.must_know.len(),
            in_flight.total_processed
        );

        self.state.set_status(RunStatus::Completed, &summary)?;
        self.record_run_stats(RunStatus::Completed, &in_flight, &summary)?;
        self.state.clear_active_run()?;
        self.state.release_lock()?;

        self.notify("Scan complete", &render_digest(&in_flight, self.config.tz()))
            .await;
        self.ensure_dispatcher();
        log::info!("active scan: {summary}");
        Ok(())
    }

    /// Terminal transition for error and timeout paths. Best-effort: every
    /// teardown step runs even if an earlier one fails, the lock is
    /// released exactly once, and the dispatcher always comes back.
    pub(crate) async fn fail_run(&self, status: RunStatus, msg: &str) {
        debug_assert!(status.is_terminal());

        if let Err(e) = self.state.set_status(status, msg) {
            log::error!("active scan: could not persist terminal status: {e}");
        }
        let in_flight = self.state.in_flight().unwrap_or_default();
        if let Err(e) = self.record_run_stats(status, &in_flight, msg) {
            log::error!("active scan: could not persist run stats: {e}");
        }
        if let Err(e) = self.state.clear_active_run() {
            log::error!("active scan: could not clear run state: {e}");
        }
        if let Err(e) = self.state.release_lock() {
            log::error!("active scan: could not release lock: {e}");
        }

        let headline = match status {
            RunStatus::Timeout => "The scan timed out and was stopped.",
            _ => "The scan failed.",
        };
        self.notify(
            &format!("Scan {status}"),
            &render_notice(headline, msg),
        )
        .await;
        self.ensure_dispatcher();
    }

    /// Snapshot the run for the status surface. Reads the run keys, so it
    /// must run before `clear_active_run`.
    fn record_run_stats(
        &self,
        status: RunStatus,
        in_flight: &AccumulatorFile,
        msg: &str,
    ) -> Result<(), crate::error::StoreError> {
        let finished_at = self.clock.now();
        let cursor = self.state.chunk_cursor()?;
        let stats = RunStats {
            run_id: uuid::Uuid::new_v4().to_string(),
            status,
            time_range: self.state.time_range()?.unwrap_or_default(),
            started_at: self.state.started_at()?.unwrap_or(finished_at),
            finished_at,
            chunks_done: cursor.map(|c| c.index).unwrap_or(0),
            chunk_total: cursor.map(|c| c.total).unwrap_or(0),
            threads_processed: in_flight.total_processed,
            must_do: in_flight.must_do.len(),
            must_know: in_flight.must_know.len(),
            message: msg.to_string(),
        };
        self.state.set_latest_run_stats(&stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::Clock;
    use crate::error::LlmError;
    use crate::state::LockKind;
    use crate::testutil::{message, monday_morning, thread_with, TestHarness};
    use crate::trigger::{TriggerKind, TriggerService};
    use crate::types::RunStatus;

    /// One thread per day across the last week.
    fn seed_week_of_mail(h: &TestHarness) {
        let threads = (0..7)
            .map(|day| {
                let mut msg = message(
                    &format!("m{day}"),
                    "jane@customer.com",
                    &format!("subject {day}"),
                );
                msg.date = monday_morning() - chrono::Duration::days(day)
                    - chrono::Duration::hours(1);
                thread_with(&format!("t{day}"), vec![msg])
            })
            .collect();
        h.mail.seed(threads);
    }

    #[tokio::test]
    async fn test_seven_day_scan_runs_four_chunks_to_completion() {
        let h = TestHarness::new();
        seed_week_of_mail(&h);

        h.engine.start_active_scan("7days").await.unwrap();

        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Running));
        assert_eq!(
            h.engine.state.lock_info().unwrap().unwrap().kind,
            LockKind::Active
        );
        let cursor = h.engine.state.chunk_cursor().unwrap().unwrap();
        assert_eq!((cursor.index, cursor.total), (0, 4));

        // The dispatcher was traded for a short-fuse kickoff.
        let kinds: Vec<_> = h.triggers.list().iter().map(|t| t.kind).collect();
        assert!(kinds.contains(&TriggerKind::ChunkKickoff));
        assert!(!kinds.contains(&TriggerKind::Dispatch));

        for expected_index in 1..=4u32 {
            h.clock.advance(chrono::Duration::minutes(2));
            h.engine.step().await.unwrap();
            if expected_index < 4 {
                let cursor = h.engine.state.chunk_cursor().unwrap().unwrap();
                assert_eq!(cursor.index, expected_index);
                // Chunk done, next one scheduled.
                assert!(h.engine.state.chunk_started_at().unwrap().is_none());
                assert!(h.engine.state.expected_chunk_start_by().unwrap().is_some());
            }
        }

        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Completed));
        assert!(h.engine.state.chunk_cursor().unwrap().is_none());
        assert!(h.engine.state.lock_info().unwrap().is_none());
        assert!(h.dispatcher_installed());
        // Four chunk searches went out.
        assert_eq!(h.mail.queries.lock().unwrap().len(), 4);
        // Exactly one terminal email.
        assert_eq!(h.mailer.sent_subjects(), vec!["[Fast Read] Scan complete"]);

        let stats = h.engine.state.latest_run_stats().unwrap().unwrap();
        assert_eq!(stats.status, RunStatus::Completed);
        assert_eq!(stats.chunks_done, 4);
        assert_eq!(stats.chunk_total, 4);
        assert_eq!(stats.time_range, "7days");
        assert_eq!(stats.threads_processed, 7);
    }

    #[tokio::test]
    async fn test_one_day_scan_is_a_single_chunk() {
        let h = TestHarness::new();
        h.engine.start_active_scan("1day").await.unwrap();
        assert_eq!(h.engine.state.chunk_cursor().unwrap().unwrap().total, 1);
        h.engine.step().await.unwrap();
        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn test_start_refused_while_passive_lock_held() {
        let h = TestHarness::new();
        h.engine
            .state
            .acquire_lock(LockKind::Passive, h.clock.now())
            .unwrap();

        let err = h.engine.start_active_scan("7days").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Another passive workflow is already running"
        );
        // No state was mutated.
        assert!(h.engine.state.status().unwrap().is_none());
        assert!(h.engine.state.chunk_cursor().unwrap().is_none());
        assert_eq!(
            h.engine.state.lock_info().unwrap().unwrap().kind,
            LockKind::Passive
        );
        assert!(h.mailer.sent_subjects().is_empty());
    }

    #[tokio::test]
    async fn test_start_refused_without_api_key() {
        let config = crate::config::Config {
            openai_api_key: String::new(),
            ..TestHarness::default_config()
        };
        let h = TestHarness::with_config(config);
        let err = h.engine.start_active_scan("7days").await.unwrap_err();
        assert!(err.to_string().contains("openaiApiKey"));
        assert!(h.engine.state.lock_info().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_range() {
        let h = TestHarness::new();
        assert!(h.engine.start_active_scan("fortnight").await.is_err());
        assert!(h.engine.state.lock_info().unwrap().is_none());
        assert!(h.engine.state.status().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_classifier_failure_fails_run_and_cleans_up() {
        let h = TestHarness::new();
        seed_week_of_mail(&h);
        h.engine.start_active_scan("7days").await.unwrap();

        h.llm
            .push(Err(LlmError::MalformedResponse("not json".to_string())));
        let err = h.engine.step().await.unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Llm(_)));

        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Error));
        assert!(h.engine.state.lock_info().unwrap().is_none());
        assert!(h.engine.state.chunk_cursor().unwrap().is_none());
        assert!(h.dispatcher_installed());
        assert_eq!(h.mailer.sent_subjects(), vec!["[Fast Read] Scan error"]);
        let stats = h.engine.state.latest_run_stats().unwrap().unwrap();
        assert_eq!(stats.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_transient_provider_error_flagged_in_report() {
        let h = TestHarness::new();
        seed_week_of_mail(&h);
        h.engine.start_active_scan("7days").await.unwrap();

        h.llm.push(Err(LlmError::Api {
            status: 503,
            message: "backend unavailable".to_string(),
        }));
        assert!(h.engine.step().await.is_err());

        // A retryable provider failure is called out as such; a malformed
        // response (see above) is not.
        let stats = h.engine.state.latest_run_stats().unwrap().unwrap();
        assert_eq!(stats.status, RunStatus::Error);
        assert!(stats.message.contains("looks temporary"));
    }

    #[tokio::test]
    async fn test_active_scan_ignores_self_authored_mail() {
        let h = TestHarness::new();
        let mut mine = message("m-self", "Me <me@example.com>", "note to self");
        mine.date = monday_morning() - chrono::Duration::hours(2);
        h.mail.seed(vec![thread_with("t-self", vec![mine])]);

        h.engine.start_active_scan("1day").await.unwrap();
        h.engine.step().await.unwrap();

        // The only thread was self-authored, so the classifier saw nothing.
        assert!(h.llm.batches_seen.lock().unwrap().is_empty());
        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn test_step_without_running_scan_is_a_no_op() {
        let h = TestHarness::new();
        h.engine.step().await.unwrap();
        assert!(h.engine.state.status().unwrap().is_none());
        assert!(h.engine.state.lock_info().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_flight_accumulation_grows_per_chunk() {
        let h = TestHarness::new();
        seed_week_of_mail(&h);
        h.engine.start_active_scan("7days").await.unwrap();

        // Chunk 0 covers the oldest window, containing the day-6 thread.
        let old_msg = message("m6", "jane@customer.com", "subject 6");
        h.llm.push(Ok(crate::types::Classification {
            must_do: vec![crate::testutil::finding_for(&old_msg, "invoices", Some("pay"))],
            must_know: vec![],
        }));

        h.engine.step().await.unwrap();
        let in_flight = h.engine.state.in_flight().unwrap();
        assert_eq!(in_flight.must_do.len(), 1);
        // Chunk 0 covers days 5 and 6.
        assert_eq!(in_flight.total_processed, 2);

        h.engine.step().await.unwrap();
        let in_flight = h.engine.state.in_flight().unwrap();
        // Concatenation only: earlier findings survive later chunks.
        assert_eq!(in_flight.must_do.len(), 1);
        assert_eq!(in_flight.total_processed, 4);
    }
}
