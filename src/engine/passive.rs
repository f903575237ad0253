//! The passive engine: the hourly background scan.
//!
//! Processes only mail newer than the high-water mark (with a 30-minute
//! overlap), applies the ignore rules before anything reaches the
//! classifier, appends findings to the durable accumulator, and gives the
//! daily digest its chance to fire. The caller (dispatcher) holds the
//! passive lock for the duration and releases it on every path.

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::mail::{sender_address, MailQuery};
use crate::types::EmailThread;

use super::{Engine, PASSIVE_BACKSTOP_HOURS, PASSIVE_SAFETY_BUFFER_MINS, SEARCH_LIMIT};

impl Engine {
    /// One passive pass. Entered only while holding the passive lock.
    pub(crate) async fn passive_pass(&self) -> Result<(), EngineError> {
        let now = self.clock.now();
        let (last_ts, last_id) = self.state.passive_cursor()?;

        let backstop = now - chrono::Duration::hours(PASSIVE_BACKSTOP_HOURS);
        let start = match last_ts {
            Some(ts) => std::cmp::max(
                ts + chrono::Duration::minutes(PASSIVE_SAFETY_BUFFER_MINS),
                backstop,
            ),
            None => backstop,
        };
        let end = now;
        if start >= end {
            return Ok(());
        }

        let me = self.mail.profile_email().await?;
        let query = MailQuery::new()
            .after(start)
            .before(end)
            .unread_only(self.config.unread_only)
            .inbox_only(self.config.inbox_only)
            .build();
        let threads = self.mail.search(&query, SEARCH_LIMIT).await?;
        let threads = filter_new_messages(threads, &me, &self.config.addon_name, last_id.as_deref());

        let outcome = self.run_batches(&threads).await?;

        if !outcome.classification.is_empty() {
            // Advance the high-water mark from the earliest message this
            // pass actually observed; the next pass starts above it.
            if let Some((ts, id)) = earliest_message(&threads) {
                self.state.set_passive_cursor(ts, &id)?;
            }

            let (mut acc, handle) = self.accumulator.load()?;
            acc.merge(outcome.classification, outcome.threads_processed, start, end);
            self.accumulator.store(&handle, &acc)?;
            log::info!(
                "passive scan: {} findings accumulated ({} pending)",
                acc.finding_count(),
                acc.total_processed
            );
        }

        // Digest send failures leave the accumulator and summary date
        // untouched; the next pass retries.
        if let Err(e) = self.maybe_send_daily_digest().await {
            log::warn!("passive scan: digest not sent, will retry next pass: {e}");
        }
        Ok(())
    }
}

/// Apply the ignore rules and the high-water cut.
///
/// Messages authored by the user and messages whose subject contains the
/// addon name (case-insensitive) never reach the classifier. The latter
/// keeps prior digests and notifications from feeding back into
/// themselves. Traversal stops at the last processed message id
/// (exclusive); everything below it was handled by an earlier pass.
pub(crate) fn filter_new_messages(
    threads: Vec<EmailThread>,
    user_email: &str,
    addon_name: &str,
    stop_at: Option<&str>,
) -> Vec<EmailThread> {
    let user = user_email.to_lowercase();
    let addon = addon_name.to_lowercase();

    let mut out = Vec::new();
    let mut stopped = false;
    for mut thread in threads {
        if stopped {
            break;
        }
        let mut kept = Vec::new();
        for msg in thread.emails.drain(..) {
            if stop_at == Some(msg.id.as_str()) {
                stopped = true;
                break;
            }
            if sender_address(&msg.sender) == user {
                continue;
            }
            if !addon.is_empty() && msg.subject.to_lowercase().contains(&addon) {
                continue;
            }
            kept.push(msg);
        }
        if !kept.is_empty() {
            thread.emails = kept;
            out.push(thread);
        }
    }
    out
}

/// The earliest message across all processed threads.
pub(crate) fn earliest_message(threads: &[EmailThread]) -> Option<(DateTime<Utc>, String)> {
    threads
        .iter()
        .flat_map(|t| t.emails.iter())
        .min_by_key(|m| m.date)
        .map(|m| (m.date, m.id.clone()))
}
