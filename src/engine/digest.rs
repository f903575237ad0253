//! Daily digest gating and rendering.
//!
//! Gating rules, all anchored to the user's timezone:
//! - only inside the local `[21:00, 24:00)` window
//! - at most once per local day (`passiveLastSummaryDate`)
//! - never for an empty accumulator
//!
//! The accumulator is cleared and the summary date advanced only after the
//! send succeeded; a failed send changes nothing and the next pass retries.

use chrono_tz::Tz;

use crate::clock;
use crate::error::EngineError;
use crate::store::AccumulatorFile;
use crate::types::Finding;

use super::{Engine, DIGEST_WINDOW_START};

impl Engine {
    /// Returns true iff a digest was sent.
    pub(crate) async fn maybe_send_daily_digest(&self) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let tz = self.config.tz();

        let hhmm = clock::local_hhmm(now, tz);
        if hhmm.as_str() < DIGEST_WINDOW_START {
            return Ok(false);
        }

        let today = clock::local_date(now, tz);
        if self.state.passive_last_summary_date()?.as_deref() == Some(today.as_str()) {
            log::debug!("digest: already sent today ({today})");
            return Ok(false);
        }

        let (acc, _handle) = self.accumulator.load()?;
        if acc.is_empty() {
            return Ok(false);
        }

        let html = render_digest(&acc, tz);
        let to = self.mail.profile_email().await?;
        let subject = format!("[{}] Daily email digest", self.config.addon_name);
        self.mailer
            .send(&to, &subject, &html, &self.config.addon_name)
            .await?;

        // Send succeeded: only now is it safe to reset.
        self.accumulator.clear()?;
        self.state.set_passive_last_summary_date(&today)?;
        log::info!(
            "digest: sent {} findings covering {} threads",
            acc.finding_count(),
            acc.total_processed
        );
        Ok(true)
    }
}

/// Render the digest HTML. Pure function of the accumulated results.
pub fn render_digest(acc: &AccumulatorFile, tz: Tz) -> String {
    let mut out = String::new();
    out.push_str("<html><body>");

    out.push_str("<p>");
    match (acc.first_date, acc.last_date) {
        (Some(first), Some(last)) => {
            out.push_str(&format!(
                "Scanned {} threads between {} and {}.",
                acc.total_processed,
                clock::local_date(first, tz),
                clock::local_date(last, tz)
            ));
        }
        _ => out.push_str(&format!("Scanned {} threads.", acc.total_processed)),
    }
    out.push_str("</p>");

    render_section(&mut out, "Must do", &acc.must_do, |f| f.key_action.as_deref());
    render_section(&mut out, "Must know", &acc.must_know, |f| {
        f.key_knowledge.as_deref()
    });

    out.push_str("</body></html>");
    out
}

fn render_section(
    out: &mut String,
    title: &str,
    findings: &[Finding],
    detail: impl Fn(&Finding) -> Option<&str>,
) {
    if findings.is_empty() {
        return;
    }
    out.push_str(&format!("<h2>{} ({})</h2><ul>", title, findings.len()));
    for finding in findings {
        out.push_str("<li><b>");
        out.push_str(&html_escape(&finding.subject));
        out.push_str("</b> &mdash; ");
        out.push_str(&html_escape(&finding.sender));
        if !finding.topic.is_empty() {
            out.push_str(&format!(" <i>[{}]</i>", html_escape(&finding.topic)));
        }
        if let Some(text) = detail(finding) {
            out.push_str("<br>");
            out.push_str(&html_escape(text));
        }
        out.push_str("</li>");
    }
    out.push_str("</ul>");
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Simple notification body: a headline plus optional detail.
pub(crate) fn render_notice(headline: &str, detail: &str) -> String {
    let mut out = String::new();
    out.push_str("<html><body><p>");
    out.push_str(&html_escape(headline));
    out.push_str("</p>");
    if !detail.is_empty() {
        out.push_str("<p>");
        out.push_str(&html_escape(detail));
        out.push_str("</p>");
    }
    out.push_str("</body></html>");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::types::Classification;

    fn finding(subject: &str, action: Option<&str>) -> Finding {
        Finding {
            email_id: "m1".to_string(),
            rfc822_id: None,
            subject: subject.to_string(),
            sender: "jane@customer.com".to_string(),
            topic: "billing".to_string(),
            key_action: action.map(str::to_string),
            key_knowledge: None,
            date: None,
        }
    }

    #[test]
    fn test_render_digest_includes_findings_and_window() {
        let mut acc = AccumulatorFile::default();
        acc.merge(
            Classification {
                must_do: vec![finding("Invoice <overdue>", Some("pay & confirm"))],
                must_know: vec![],
            },
            7,
            Utc.with_ymd_and_hms(2024, 1, 14, 9, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap(),
        );
        let html = render_digest(&acc, chrono_tz::UTC);
        assert!(html.contains("Must do (1)"));
        assert!(html.contains("Invoice &lt;overdue&gt;"));
        assert!(html.contains("pay &amp; confirm"));
        assert!(html.contains("Scanned 7 threads between 2024-01-14 and 2024-01-15."));
        // Empty sections are omitted entirely.
        assert!(!html.contains("Must know"));
    }

    #[test]
    fn test_render_digest_empty_accumulator() {
        let html = render_digest(&AccumulatorFile::default(), chrono_tz::UTC);
        assert!(html.contains("Scanned 0 threads."));
        assert!(!html.contains("<h2>"));
    }

    // -- gating ------------------------------------------------------------

    use std::sync::atomic::Ordering;

    use crate::testutil::{finding_for, message, TestHarness};

    /// Accumulate one must-do and one must-know, with the given window.
    fn accumulate(h: &TestHarness, start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) {
        let msg = message("m1", "jane@customer.com", "Invoice");
        let (mut acc, handle) = h.engine.accumulator.load().unwrap();
        acc.merge(
            Classification {
                must_do: vec![finding_for(&msg, "billing", Some("pay"))],
                must_know: vec![finding_for(&msg, "ops", None)],
            },
            2,
            start,
            end,
        );
        h.engine.accumulator.store(&handle, &acc).unwrap();
    }

    /// January 2024 at the given New York wall-clock time, as UTC.
    fn ny(day: u32, hour: u32, minute: u32) -> chrono::DateTime<Utc> {
        chrono_tz::America::New_York
            .with_ymd_and_hms(2024, 1, day, hour, minute, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn test_digest_window_boundary() {
        let h = TestHarness::new();
        accumulate(&h, ny(15, 13, 0), ny(15, 14, 0));

        // 20:59 local: one minute early, nothing happens.
        h.clock.set(ny(15, 20, 59));
        assert!(!h.engine.maybe_send_daily_digest().await.unwrap());
        assert!(h.mailer.sent.lock().unwrap().is_empty());
        assert!(!h.engine.accumulator.load().unwrap().0.is_empty());

        // 21:00 local: the window opens.
        h.clock.set(ny(15, 21, 0));
        assert!(h.engine.maybe_send_daily_digest().await.unwrap());
        {
            let sent = h.mailer.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].to, "me@example.com");
            assert_eq!(sent[0].subject, "[Fast Read] Daily email digest");
            assert_eq!(sent[0].sender_name, "Fast Read");
            assert!(sent[0].html_body.contains("Must do (1)"));
        }
        assert!(h.engine.accumulator.load().unwrap().0.is_empty());
        assert_eq!(
            h.engine
                .state
                .passive_last_summary_date()
                .unwrap()
                .as_deref(),
            Some("2024-01-15")
        );

        // 21:05 same local day: once-per-day gate holds.
        h.clock.set(ny(15, 21, 5));
        accumulate(&h, ny(15, 21, 1), ny(15, 21, 4));
        assert!(!h.engine.maybe_send_daily_digest().await.unwrap());
        assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missed_window_carries_accumulation_to_next_day() {
        let h = TestHarness::new();
        // Day D accumulates but the engine never runs inside D's window.
        accumulate(&h, ny(14, 13, 0), ny(14, 14, 0));
        // Day D+1 accumulates more.
        accumulate(&h, ny(15, 9, 0), ny(15, 10, 0));

        h.clock.set(ny(15, 21, 0));
        assert!(h.engine.maybe_send_daily_digest().await.unwrap());

        let sent = h.mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        // Both days' findings went out together; the window header reaches
        // back to day D.
        assert!(sent[0].html_body.contains("Must do (2)"));
        assert!(sent[0].html_body.contains("2024-01-14"));
    }

    #[tokio::test]
    async fn test_empty_accumulator_sends_nothing_in_window() {
        let h = TestHarness::new();
        h.clock.set(ny(15, 21, 30));
        assert!(!h.engine.maybe_send_daily_digest().await.unwrap());
        assert!(h.mailer.sent.lock().unwrap().is_empty());
        assert!(h
            .engine
            .state
            .passive_last_summary_date()
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_send_failure_preserves_accumulator_and_date() {
        let h = TestHarness::new();
        accumulate(&h, ny(15, 13, 0), ny(15, 14, 0));
        h.mailer.fail.store(true, Ordering::Relaxed);

        h.clock.set(ny(15, 21, 0));
        assert!(h.engine.maybe_send_daily_digest().await.is_err());

        // Nothing was cleared or advanced; the next pass retries.
        assert!(!h.engine.accumulator.load().unwrap().0.is_empty());
        assert!(h
            .engine
            .state
            .passive_last_summary_date()
            .unwrap()
            .is_none());

        // The mailer recovers: the retry succeeds and clears.
        h.mailer.fail.store(false, Ordering::Relaxed);
        h.clock.set(ny(15, 21, 10));
        assert!(h.engine.maybe_send_daily_digest().await.unwrap());
        assert!(h.engine.accumulator.load().unwrap().0.is_empty());
    }

    #[tokio::test]
    async fn test_digest_closed_before_window_all_day() {
        let h = TestHarness::new();
        accumulate(&h, ny(15, 8, 0), ny(15, 9, 0));
        for hour in [0u32, 6, 12, 18, 20] {
            h.clock.set(ny(15, hour, 30));
            assert!(!h.engine.maybe_send_daily_digest().await.unwrap());
        }
        assert!(h.mailer.sent.lock().unwrap().is_empty());
    }
}
