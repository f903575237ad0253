//! Batch packing, classification, and side effects.
//!
//! Threads are packed most-recent-first into batches under the token
//! budget and submitted sequentially. At each batch boundary the result is
//! validated, merged, and its side effects (labels, mark-read) applied.
//! Archival of findingless threads runs once, after all batches, behind
//! the safety guards, since a wrongly archived thread is the most expensive
//! mistake this system can make.

use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::types::{Classification, EmailThread, Finding};

use super::{Engine, BATCH_OVERHEAD_TOKENS, MAX_BATCH_TOKENS, TOKENS_PER_CHAR};

/// Labels the provider owns; everything else counts as a user label for
/// the archival guard.
const SYSTEM_LABELS: &[&str] = &[
    "INBOX",
    "UNREAD",
    "SENT",
    "DRAFT",
    "SPAM",
    "TRASH",
    "STARRED",
    "IMPORTANT",
    "CHAT",
];

pub(crate) struct BatchOutcome {
    pub classification: Classification,
    pub threads_processed: u64,
    pub batches: usize,
}

impl BatchOutcome {
    fn empty() -> Self {
        Self {
            classification: Classification::default(),
            threads_processed: 0,
            batches: 0,
        }
    }
}

/// Estimated token cost of one thread.
pub(crate) fn estimate_tokens(thread: &EmailThread) -> usize {
    (thread.char_count() as f64 * TOKENS_PER_CHAR).ceil() as usize
}

/// Pack threads into batches under the token budget, preserving order.
/// A single thread exceeding the budget is submitted alone.
pub(crate) fn pack_batches(threads: &[EmailThread]) -> Vec<Vec<&EmailThread>> {
    let mut batches = Vec::new();
    let mut current: Vec<&EmailThread> = Vec::new();
    let mut used = BATCH_OVERHEAD_TOKENS;

    for thread in threads {
        let cost = estimate_tokens(thread);
        if !current.is_empty() && used + cost > MAX_BATCH_TOKENS {
            batches.push(std::mem::take(&mut current));
            used = BATCH_OVERHEAD_TOKENS;
        }
        current.push(thread);
        used += cost;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn is_user_label(label: &str) -> bool {
    !SYSTEM_LABELS.contains(&label) && !label.starts_with("CATEGORY_")
}

/// Archival guard: starred message, user label, or provider-important flag
/// anywhere in the thread makes it untouchable.
pub(crate) fn thread_is_protected(thread: &EmailThread) -> bool {
    thread.emails.iter().any(|m| {
        m.starred || m.important || m.labels.iter().any(|l| is_user_label(l))
    })
}

impl Engine {
    /// Run the classifier over the given threads and apply side effects.
    /// Label and mark-read failures are logged and swallowed; a classifier
    /// failure fails the whole invocation.
    pub(crate) async fn run_batches(
        &self,
        threads: &[EmailThread],
    ) -> Result<BatchOutcome, EngineError> {
        if threads.is_empty() {
            return Ok(BatchOutcome::empty());
        }

        let thread_by_email: HashMap<&str, &EmailThread> = threads
            .iter()
            .flat_map(|t| t.emails.iter().map(move |m| (m.id.as_str(), t)))
            .collect();
        let date_by_email: HashMap<&str, chrono::DateTime<chrono::Utc>> = threads
            .iter()
            .flat_map(|t| t.emails.iter().map(|m| (m.id.as_str(), m.date)))
            .collect();

        let batches = pack_batches(threads);
        let batch_count = batches.len();
        let mut merged = Classification::default();

        for (i, batch) in batches.into_iter().enumerate() {
            log::debug!(
                "classifier: submitting batch {}/{} ({} threads)",
                i + 1,
                batch_count,
                batch.len()
            );
            let mut result = self.llm.classify(&batch, &self.config).await?;

            // Dates come from the source messages, not the model.
            for finding in result.must_do.iter_mut().chain(result.must_know.iter_mut()) {
                finding.date = date_by_email.get(finding.email_id.as_str()).copied();
            }

            self.apply_labels(&result, &thread_by_email).await;

            if self.config.mark_processed_as_read {
                for email_id in result.email_ids() {
                    if let Err(e) = self.mail.mark_read(email_id).await {
                        log::warn!("Could not mark {email_id} read: {e}");
                    }
                }
            }

            merged.merge(result);
        }

        if self.config.remove_uninteresting_from_inbox {
            self.archive_uninteresting(threads, &merged).await;
        }

        Ok(BatchOutcome {
            classification: merged,
            threads_processed: threads.len() as u64,
            batches: batch_count,
        })
    }

    async fn apply_labels(
        &self,
        result: &Classification,
        thread_by_email: &HashMap<&str, &EmailThread>,
    ) {
        let buckets: [(&[Finding], &str); 2] = [
            (&result.must_do, &self.config.must_do_label),
            (&result.must_know, &self.config.must_know_label),
        ];
        for (findings, label) in buckets {
            if label.trim().is_empty() {
                continue;
            }
            for finding in findings {
                self.label_finding(finding, label, thread_by_email).await;
            }
        }
    }

    /// Label a finding's message: direct id first, RFC-822 lookup second,
    /// the containing thread as a last resort.
    async fn label_finding(
        &self,
        finding: &Finding,
        label: &str,
        thread_by_email: &HashMap<&str, &EmailThread>,
    ) {
        match self.mail.add_label(&finding.email_id, label).await {
            Ok(()) => return,
            Err(e) => log::debug!(
                "Label by id failed for {} ({e}), trying fallbacks",
                finding.email_id
            ),
        }

        if let Some(rfc822_id) = &finding.rfc822_id {
            if let Ok(Some(resolved)) = self.mail.lookup_rfc822(rfc822_id).await {
                if self.mail.add_label(&resolved, label).await.is_ok() {
                    return;
                }
            }
        }

        match thread_by_email.get(finding.email_id.as_str()) {
            Some(thread) => {
                if let Err(e) = self.mail.add_thread_label(&thread.thread_id, label).await {
                    log::warn!(
                        "Label '{label}' could not be applied for {}: {e}",
                        finding.email_id
                    );
                }
            }
            None => log::warn!(
                "Finding references unknown email {}, label skipped",
                finding.email_id
            ),
        }
    }

    /// Archive threads that produced no findings, unless protected.
    async fn archive_uninteresting(&self, threads: &[EmailThread], merged: &Classification) {
        let interesting: HashSet<&str> = merged.email_ids().collect();
        for thread in threads {
            if thread.emails.iter().any(|m| interesting.contains(m.id.as_str())) {
                continue;
            }
            if thread_is_protected(thread) {
                log::debug!("Thread {} protected, not archiving", thread.thread_id);
                continue;
            }
            match self.mail.archive_thread(&thread.thread_id).await {
                Ok(()) => log::debug!("Archived thread {}", thread.thread_id),
                Err(e) => log::warn!("Could not archive thread {}: {e}", thread.thread_id),
            }
        }
    }
}
