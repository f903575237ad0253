//! The dispatcher: the system's heartbeat.
//!
//! One recurring trigger fires `dispatch` at a coarse cadence. Per tick:
//! 1. Reap a stalled active run (timeout check) and stop.
//! 2. If an active run is in progress, advance it one chunk and stop.
//! 3. Otherwise run a passive pass, at most once per hour and only with a
//!    complete config.

use chrono::{DateTime, Utc};

use crate::state::LockKind;
use crate::types::RunStatus;

use super::digest::render_notice;
use super::{Engine, PASSIVE_CADENCE_MINS, PROCESSING_TIMEOUT_MINS};

impl Engine {
    /// One dispatcher tick. Never propagates errors: every failure mode is
    /// handled here so the heartbeat survives anything.
    pub async fn dispatch(&self) {
        let now = self.clock.now();

        if self.check_and_handle_timeout(now).await {
            self.ensure_dispatcher();
            return;
        }

        match self.state.status() {
            Ok(Some(RunStatus::Running)) => {
                if let Err(e) = self.step().await {
                    // step() already failed the run and notified.
                    log::error!("dispatcher: chunk step failed: {e}");
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("dispatcher: cannot read status: {e}");
                return;
            }
        }

        self.maybe_passive_pass(now).await;
    }

    async fn maybe_passive_pass(&self, now: DateTime<Utc>) {
        if !self.config.is_complete() {
            log::debug!("dispatcher: config incomplete, skipping passive pass");
            return;
        }

        let due = match self.state.passive_last_run_at() {
            Ok(None) => true,
            Ok(Some(last)) => now - last >= chrono::Duration::minutes(PASSIVE_CADENCE_MINS),
            Err(e) => {
                log::error!("dispatcher: cannot read passive cadence: {e}");
                return;
            }
        };
        if !due {
            return;
        }

        if let Err(e) = self.state.acquire_lock(LockKind::Passive, now) {
            log::info!("dispatcher: passive pass skipped: {e}");
            return;
        }
        if let Err(e) = self.state.set_passive_last_run_at(now) {
            log::error!("dispatcher: cannot record passive run time: {e}");
        }

        let result = self.passive_pass().await;

        // Release on every path; the pass itself never touches the lock.
        if let Err(e) = self.state.release_lock() {
            log::error!("dispatcher: cannot release passive lock: {e}");
        }
        if let Err(e) = result {
            log::error!("passive scan: failed: {e}");
            let headline = if e.is_transient() {
                "The background scan hit a temporary provider error; the next hourly pass retries."
            } else {
                "The background scan hit an error."
            };
            self.notify(
                "Background scan failed",
                &render_notice(headline, &e.to_string()),
            )
            .await;
        }
    }

    /// Reap a stalled active run. Returns true iff it transitioned the run
    /// into `timeout`.
    ///
    /// Two kinds of evidence, same verdict: a chunk has been executing past
    /// the processing budget, or the next chunk missed its scheduled start.
    pub async fn check_and_handle_timeout(&self, now: DateTime<Utc>) -> bool {
        match self.state.status() {
            Ok(Some(RunStatus::Running)) => {}
            _ => return false,
        }
        let budget = chrono::Duration::minutes(PROCESSING_TIMEOUT_MINS);

        match self.state.chunk_started_at() {
            Ok(Some(started)) => {
                if now - started > budget {
                    log::warn!("dispatcher: chunk started {started} still running, reaping");
                    self.fail_run(
                        RunStatus::Timeout,
                        "Scan timed out: a chunk exceeded the 10 minute processing budget",
                    )
                    .await;
                    return true;
                }
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("dispatcher: cannot read chunk start: {e}");
                return false;
            }
        }

        if let Ok(Some(deadline)) = self.state.expected_chunk_start_by() {
            if now > deadline {
                log::warn!("dispatcher: chunk expected by {deadline} never started, reaping");
                self.fail_run(
                    RunStatus::Timeout,
                    "Scan timed out: the next chunk never started",
                )
                .await;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::Duration;

    use crate::clock::Clock;
    use crate::state::LockKind;
    use crate::testutil::TestHarness;
    use crate::types::RunStatus;

    /// Put the harness into a mid-run state: lock held, status running,
    /// chunk state seeded.
    fn running_scan(h: &TestHarness) {
        let now = h.clock.now();
        h.engine
            .state
            .acquire_lock(LockKind::Active, now)
            .unwrap();
        h.engine
            .state
            .begin_active_run(
                now,
                "7days",
                now - Duration::days(7),
                now,
                4,
                now + Duration::minutes(12),
                "Starting",
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_reaps_long_running_chunk() {
        let h = TestHarness::new();
        running_scan(&h);
        h.engine.state.mark_chunk_starting(h.clock.now()).unwrap();

        h.clock.advance(Duration::minutes(11));
        h.engine.dispatch().await;

        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Timeout));
        assert!(h.engine.state.chunk_started_at().unwrap().is_none());
        assert!(h.engine.state.lock_info().unwrap().is_none());
        assert!(h.dispatcher_installed());
        assert_eq!(h.mailer.sent_subjects(), vec!["[Fast Read] Scan timeout"]);
    }

    #[tokio::test]
    async fn test_no_timeout_inside_budget() {
        let h = TestHarness::new();
        running_scan(&h);
        h.engine.state.mark_chunk_starting(h.clock.now()).unwrap();

        h.clock.advance(Duration::minutes(5));
        assert!(!h.engine.check_and_handle_timeout(h.clock.now()).await);
        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Running));
    }

    #[tokio::test]
    async fn test_timeout_reaps_missed_chunk_start() {
        let h = TestHarness::new();
        running_scan(&h);
        // No chunk ever starts; the scheduled deadline passes.
        h.clock.advance(Duration::hours(2));
        h.engine.dispatch().await;

        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Timeout));
        assert!(h.engine.state.lock_info().unwrap().is_none());
        assert!(h.dispatcher_installed());
    }

    #[tokio::test]
    async fn test_timeout_check_ignores_terminal_states() {
        let h = TestHarness::new();
        h.engine
            .state
            .set_status(RunStatus::Completed, "done")
            .unwrap();
        assert!(!h.engine.check_and_handle_timeout(h.clock.now()).await);
    }

    #[tokio::test]
    async fn test_dispatch_advances_running_scan_instead_of_passive() {
        let h = TestHarness::new();
        h.engine.start_active_scan("1day").await.unwrap();

        h.engine.dispatch().await;

        assert_eq!(h.engine.state.status().unwrap(), Some(RunStatus::Completed));
        // The passive engine never ran.
        assert!(h.engine.state.passive_last_run_at().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_runs_passive_at_most_hourly() {
        let h = TestHarness::new();

        h.engine.dispatch().await;
        assert_eq!(h.mail.queries.lock().unwrap().len(), 1);
        assert!(h.engine.state.passive_last_run_at().unwrap().is_some());
        assert!(h.engine.state.lock_info().unwrap().is_none());

        // Thirty minutes later: not due.
        h.clock.advance(Duration::minutes(30));
        h.engine.dispatch().await;
        assert_eq!(h.mail.queries.lock().unwrap().len(), 1);

        // Past the hour: due again.
        h.clock.advance(Duration::minutes(31));
        h.engine.dispatch().await;
        assert_eq!(h.mail.queries.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_skips_passive_without_config() {
        let config = crate::config::Config {
            openai_api_key: String::new(),
            ..TestHarness::default_config()
        };
        let h = TestHarness::with_config(config);

        h.engine.dispatch().await;

        assert!(h.mail.queries.lock().unwrap().is_empty());
        assert!(h.engine.state.passive_last_run_at().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_skips_passive_when_lock_held() {
        let h = TestHarness::new();
        h.engine
            .state
            .acquire_lock(LockKind::Passive, h.clock.now())
            .unwrap();

        h.engine.dispatch().await;

        // The newcomer was refused; the holder's lock survives.
        assert!(h.mail.queries.lock().unwrap().is_empty());
        assert!(h.engine.state.lock_info().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_passive_failure_notifies_and_releases_lock() {
        let h = TestHarness::new();
        h.mail.fail_search.store(true, Ordering::Relaxed);

        h.engine.dispatch().await;

        assert!(h.engine.state.lock_info().unwrap().is_none());
        assert_eq!(
            h.mailer.sent_subjects(),
            vec!["[Fast Read] Background scan failed"]
        );
        // A 503 from the provider is reported as temporary.
        assert!(h.mailer.sent.lock().unwrap()[0]
            .html_body
            .contains("temporary provider error"));
        // Cadence was still recorded; the next try waits an hour.
        assert!(h.engine.state.passive_last_run_at().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ensure_dispatcher_is_idempotent() {
        use crate::trigger::{TriggerKind, TriggerService};

        let h = TestHarness::new();
        for handle in h.triggers.list() {
            h.triggers.delete(&handle).unwrap();
        }
        assert!(!h.dispatcher_installed());

        h.engine.ensure_dispatcher();
        assert!(h.dispatcher_installed());

        h.engine.ensure_dispatcher();
        let dispatch_count = h
            .triggers
            .list()
            .iter()
            .filter(|t| t.kind == TriggerKind::Dispatch)
            .count();
        assert_eq!(dispatch_count, 1);
    }
}
