//! In-memory fakes for engine tests.
//!
//! Everything the engine touches has a scriptable stand-in here: KV and
//! blob stores, mail provider, classifier, mailer, and a fixed clock. The
//! `TestHarness` wires them into an `Engine` with a complete default
//! config.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::clock::Clock;
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{LlmError, MailError, StoreError};
use crate::llm::LlmClient;
use crate::mail::{MailStore, Mailer};
use crate::store::{BlobHandle, BlobStore, KvStore};
use crate::trigger::InMemoryTriggers;
use crate::types::{Classification, EmailMessage, EmailThread};

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// A plain unread inbox message with a fixed date; tweak fields as needed.
pub fn message(id: &str, sender: &str, subject: &str) -> EmailMessage {
    EmailMessage {
        id: id.to_string(),
        rfc822_id: Some(format!("{id}@mail.example")),
        sender: sender.to_string(),
        subject: subject.to_string(),
        body: format!("body of {id}"),
        date: Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap(),
        unread: true,
        starred: false,
        important: false,
        labels: vec!["INBOX".to_string(), "UNREAD".to_string()],
    }
}

pub fn thread_with(thread_id: &str, emails: Vec<EmailMessage>) -> EmailThread {
    let subject = emails
        .last()
        .map(|m| m.subject.clone())
        .unwrap_or_default();
    EmailThread {
        thread_id: thread_id.to_string(),
        subject,
        emails,
    }
}

pub fn finding_for(message: &EmailMessage, topic: &str, action: Option<&str>) -> crate::types::Finding {
    crate::types::Finding {
        email_id: message.id.clone(),
        rfc822_id: message.rfc822_id.clone(),
        subject: message.subject.clone(),
        sender: message.sender.clone(),
        topic: topic.to_string(),
        key_action: action.map(str::to_string),
        key_knowledge: None,
        date: None,
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemKv {
    map: Mutex<HashMap<String, String>>,
}

impl KvStore for MemKv {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.map.lock().unwrap().remove(key);
        Ok(())
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let mut map = self.map.lock().unwrap();
        for (key, value) in entries {
            map.insert(key.to_string(), value.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemBlob {
    map: Mutex<HashMap<String, String>>,
}

impl BlobStore for MemBlob {
    fn read_or_init(&self, name: &str, init: &str) -> Result<(String, BlobHandle), StoreError> {
        let mut map = self.map.lock().unwrap();
        let content = map
            .entry(name.to_string())
            .or_insert_with(|| init.to_string())
            .clone();
        Ok((content, BlobHandle(name.to_string())))
    }

    fn write(&self, handle: &BlobHandle, content: &str) -> Result<(), StoreError> {
        self.map
            .lock()
            .unwrap()
            .insert(handle.0.clone(), content.to_string());
        Ok(())
    }

    fn trash(&self, name: &str) -> Result<(), StoreError> {
        self.map.lock().unwrap().remove(name);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Mail
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemMail {
    pub threads: Mutex<Vec<EmailThread>>,
    pub queries: Mutex<Vec<String>>,
    pub labeled: Mutex<Vec<(String, String)>>,
    pub thread_labeled: Mutex<Vec<(String, String)>>,
    pub marked_read: Mutex<Vec<String>>,
    pub archived: Mutex<Vec<String>>,
    pub fail_search: AtomicBool,
    pub fail_message_labels: AtomicBool,
}

impl MemMail {
    pub fn seed(&self, threads: Vec<EmailThread>) {
        *self.threads.lock().unwrap() = threads;
    }

    /// Extract `after:`/`before:` unix bounds from a query string.
    fn query_bounds(query: &str) -> (Option<i64>, Option<i64>) {
        let mut after = None;
        let mut before = None;
        for term in query.split_whitespace() {
            if let Some(v) = term.strip_prefix("after:") {
                after = v.parse().ok();
            } else if let Some(v) = term.strip_prefix("before:") {
                before = v.parse().ok();
            }
        }
        (after, before)
    }
}

#[async_trait]
impl MailStore for MemMail {
    async fn search(&self, query: &str, _limit: usize) -> Result<Vec<EmailThread>, MailError> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail_search.load(Ordering::Relaxed) {
            return Err(MailError::Api {
                status: 503,
                message: "search backend unavailable".to_string(),
            });
        }
        let (after, before) = Self::query_bounds(query);
        let mut hits: Vec<EmailThread> = self
            .threads
            .lock()
            .unwrap()
            .iter()
            .filter(|t| {
                t.emails.iter().any(|m| {
                    let ts = m.date.timestamp();
                    after.map_or(true, |a| ts >= a) && before.map_or(true, |b| ts < b)
                })
            })
            .cloned()
            .collect();
        hits.sort_by_key(|t| std::cmp::Reverse(t.emails.first().map(|m| m.date)));
        Ok(hits)
    }

    async fn lookup_rfc822(&self, rfc822_id: &str) -> Result<Option<String>, MailError> {
        Ok(self
            .threads
            .lock()
            .unwrap()
            .iter()
            .flat_map(|t| t.emails.iter())
            .find(|m| m.rfc822_id.as_deref() == Some(rfc822_id))
            .map(|m| m.id.clone()))
    }

    async fn add_label(&self, message_id: &str, label: &str) -> Result<(), MailError> {
        if self.fail_message_labels.load(Ordering::Relaxed) {
            return Err(MailError::Api {
                status: 500,
                message: "label backend unavailable".to_string(),
            });
        }
        let known = self
            .threads
            .lock()
            .unwrap()
            .iter()
            .any(|t| t.contains_message(message_id));
        if !known {
            return Err(MailError::Api {
                status: 404,
                message: format!("unknown message {message_id}"),
            });
        }
        self.labeled
            .lock()
            .unwrap()
            .push((message_id.to_string(), label.to_string()));
        Ok(())
    }

    async fn add_thread_label(&self, thread_id: &str, label: &str) -> Result<(), MailError> {
        self.thread_labeled
            .lock()
            .unwrap()
            .push((thread_id.to_string(), label.to_string()));
        Ok(())
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), MailError> {
        self.marked_read.lock().unwrap().push(message_id.to_string());
        Ok(())
    }

    async fn archive_thread(&self, thread_id: &str) -> Result<(), MailError> {
        self.archived.lock().unwrap().push(thread_id.to_string());
        Ok(())
    }

    async fn profile_email(&self) -> Result<String, MailError> {
        Ok("me@example.com".to_string())
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Returns scripted responses in order; an exhausted script yields empty
/// classifications.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<Classification, LlmError>>>,
    pub batches_seen: Mutex<Vec<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn push(&self, response: Result<Classification, LlmError>) {
        self.responses.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn classify(
        &self,
        batch: &[&EmailThread],
        _config: &Config,
    ) -> Result<Classification, LlmError> {
        self.batches_seen
            .lock()
            .unwrap()
            .push(batch.iter().map(|t| t.thread_id.clone()).collect());
        match self.responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(Classification::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// Mailer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub sender_name: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<SentMail>>,
    pub fail: AtomicBool,
}

impl RecordingMailer {
    pub fn sent_subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.subject.clone())
            .collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        sender_name: &str,
    ) -> Result<(), MailError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(MailError::Api {
                status: 500,
                message: "send rejected".to_string(),
            });
        }
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            html_body: html_body.to_string(),
            sender_name: sender_name.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// 2024-01-15 09:00 in America/New_York (14:00 UTC).
pub fn monday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap()
}

pub struct TestHarness {
    pub engine: Engine,
    pub kv: Arc<MemKv>,
    pub blobs: Arc<MemBlob>,
    pub mail: Arc<MemMail>,
    pub llm: Arc<ScriptedLlm>,
    pub triggers: Arc<InMemoryTriggers>,
    pub mailer: Arc<RecordingMailer>,
    pub clock: Arc<FixedClock>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Self::default_config())
    }

    pub fn default_config() -> Config {
        Config {
            openai_api_key: "sk-test".to_string(),
            addon_name: "Fast Read".to_string(),
            time_zone: "America/New_York".to_string(),
            must_do_topics: "invoices".to_string(),
            must_know_topics: "outages".to_string(),
            ..Config::default()
        }
    }

    pub fn with_config(config: Config) -> Self {
        let kv = Arc::new(MemKv::default());
        let blobs = Arc::new(MemBlob::default());
        let mail = Arc::new(MemMail::default());
        let llm = Arc::new(ScriptedLlm::default());
        let mailer = Arc::new(RecordingMailer::default());
        let clock = Arc::new(FixedClock::new(monday_morning()));
        let triggers = Arc::new(InMemoryTriggers::new(clock.clone(), 20));

        let engine = Engine::new(
            config,
            kv.clone(),
            blobs.clone(),
            mail.clone(),
            llm.clone(),
            triggers.clone(),
            mailer.clone(),
            clock.clone(),
        );
        engine.ensure_dispatcher();

        Self {
            engine,
            kv,
            blobs,
            mail,
            llm,
            triggers,
            mailer,
            clock,
        }
    }

    pub fn dispatcher_installed(&self) -> bool {
        use crate::trigger::{TriggerKind, TriggerService};
        self.triggers
            .list()
            .iter()
            .any(|h| h.kind == TriggerKind::Dispatch)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
