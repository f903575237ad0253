//! Mail provider capability.
//!
//! The engine only knows this trait surface; `gmail` is the production
//! adapter. The query grammar is the provider's search syntax restricted
//! to the operators the engine emits.

pub mod gmail;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailError;
use crate::types::EmailThread;

#[async_trait]
pub trait MailStore: Send + Sync {
    /// Search threads matching the query, most recent first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<EmailThread>, MailError>;

    /// Resolve an RFC-822 Message-ID to a provider message id.
    async fn lookup_rfc822(&self, rfc822_id: &str) -> Result<Option<String>, MailError>;

    async fn add_label(&self, message_id: &str, label: &str) -> Result<(), MailError>;

    async fn add_thread_label(&self, thread_id: &str, label: &str) -> Result<(), MailError>;

    async fn mark_read(&self, message_id: &str) -> Result<(), MailError>;

    /// Remove the thread from the inbox (it stays searchable).
    async fn archive_thread(&self, thread_id: &str) -> Result<(), MailError>;

    /// The authenticated user's own address.
    async fn profile_email(&self) -> Result<String, MailError>;
}

/// Outbound mail capability (digest and terminal notifications).
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        sender_name: &str,
    ) -> Result<(), MailError>;
}

/// Builder for the provider search grammar: `after:<unix>`,
/// `before:<unix>`, `is:unread`, `in:inbox`, `rfc822msgid:<id>`.
#[derive(Debug, Default, Clone)]
pub struct MailQuery {
    terms: Vec<String>,
}

impl MailQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn after(mut self, t: DateTime<Utc>) -> Self {
        self.terms.push(format!("after:{}", t.timestamp()));
        self
    }

    pub fn before(mut self, t: DateTime<Utc>) -> Self {
        self.terms.push(format!("before:{}", t.timestamp()));
        self
    }

    pub fn unread_only(mut self, enabled: bool) -> Self {
        if enabled {
            self.terms.push("is:unread".to_string());
        }
        self
    }

    pub fn inbox_only(mut self, enabled: bool) -> Self {
        if enabled {
            self.terms.push("in:inbox".to_string());
        }
        self
    }

    pub fn rfc822(mut self, id: &str) -> Self {
        self.terms.push(format!("rfc822msgid:{id}"));
        self
    }

    pub fn build(&self) -> String {
        self.terms.join(" ")
    }
}

/// Bare address from a "From" header value: either
/// `Display Name <user@host>` or a plain `user@host`. When angle brackets
/// are present the address is the content of the last bracket pair (a
/// quoted display name may itself contain `<`); a malformed header falls
/// back to the whole value.
pub fn sender_address(from_field: &str) -> String {
    let raw = from_field.trim();
    let inner = raw
        .rfind('<')
        .and_then(|open| {
            raw[open + 1..]
                .find('>')
                .map(|len| &raw[open + 1..open + 1 + len])
        })
        .unwrap_or(raw);
    inner.trim().to_ascii_lowercase()
}
