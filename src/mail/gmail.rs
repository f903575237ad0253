//! Gmail API v1 adapter.
//!
//! Direct HTTP via reqwest. Thread search runs threads.list + threads.get
//! (format=full), walking MIME parts for a plain-text body. Label names
//! are resolved to ids lazily and created on first use. The OAuth token
//! file is compatible with the google-auth JSON format; only refresh is
//! handled here; initial consent provisioning is external.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{MailStore, Mailer};
use crate::error::MailError;
use crate::http::{send_with_retry, RetryPolicy};
use crate::types::{EmailMessage, EmailThread};
use crate::util::atomic_write_str;

const GMAIL_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

// ============================================================================
// OAuth token
// ============================================================================

/// OAuth2 token persisted to `~/.fastread/google/token.json`.
///
/// Field names match what google-auth writes; `access_token` is accepted as
/// an alias of `token` on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleToken {
    #[serde(alias = "access_token")]
    pub token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default, alias = "email")]
    pub account: Option<String>,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// Check if a token is expired based on its expiry field. Within 60
/// seconds of expiry counts as expired.
pub fn is_token_expired(token: &GoogleToken) -> bool {
    match &token.expiry {
        None => true,
        Some(expiry_str) => {
            match DateTime::parse_from_rfc3339(&expiry_str.replace('Z', "+00:00"))
                .or_else(|_| DateTime::parse_from_rfc3339(expiry_str))
            {
                Ok(expiry) => expiry <= Utc::now() + chrono::Duration::seconds(60),
                Err(_) => true,
            }
        }
    }
}

/// Loads, refreshes, and persists the OAuth token. Concurrent refreshes
/// are serialized so only one hits the token endpoint.
pub struct TokenManager {
    path: PathBuf,
    cached: Mutex<Option<GoogleToken>>,
}

impl TokenManager {
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .unwrap_or_default()
            .join(".fastread")
            .join("google")
            .join("token.json");
        Self::at(path)
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    fn load(&self) -> Result<GoogleToken, MailError> {
        if !self.path.exists() {
            return Err(MailError::TokenNotFound(self.path.clone()));
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, token: &GoogleToken) -> Result<(), MailError> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(token)?;
        atomic_write_str(&self.path, &content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Get a valid access token, refreshing if expired.
    pub async fn access_token(&self) -> Result<String, MailError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = Some(self.load()?);
        }
        let token = cached.as_ref().expect("token cached above");

        if !is_token_expired(token) {
            return Ok(token.token.clone());
        }

        let refreshed = self.refresh(token).await?;
        self.save(&refreshed)?;
        let access = refreshed.token.clone();
        *cached = Some(refreshed);
        Ok(access)
    }

    async fn refresh(&self, token: &GoogleToken) -> Result<GoogleToken, MailError> {
        let refresh_token = token.refresh_token.as_ref().ok_or(MailError::AuthExpired)?;

        let client = reqwest::Client::new();
        let resp = client
            .post(&token.token_uri)
            .form(&[
                ("client_id", token.client_id.as_str()),
                ("client_secret", token.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            if status == 400 || status == 401 {
                return Err(MailError::AuthExpired);
            }
            return Err(MailError::RefreshFailed(format!("HTTP {status}: {body}")));
        }

        let body: serde_json::Value = resp.json().await?;
        let access_token = body["access_token"]
            .as_str()
            .ok_or_else(|| MailError::RefreshFailed("No access_token in response".into()))?;
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600);
        let expiry = Utc::now() + chrono::Duration::seconds(expires_in as i64);

        let mut new_token = token.clone();
        new_token.token = access_token.to_string();
        new_token.expiry = Some(expiry.to_rfc3339());
        Ok(new_token)
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// API response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadListResponse {
    #[serde(default)]
    threads: Vec<ThreadStub>,
}

#[derive(Debug, Deserialize)]
struct ThreadStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    messages: Vec<MessageDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    internal_date: Option<String>,
    #[serde(default)]
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    #[serde(default)]
    body: Option<PayloadBody>,
    #[serde(default)]
    parts: Vec<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayloadBody {
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelListResponse {
    #[serde(default)]
    labels: Vec<LabelDetail>,
}

#[derive(Debug, Deserialize)]
struct LabelDetail {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: String,
}

// ============================================================================
// Message assembly
// ============================================================================

fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Recursively walk MIME parts to find body data matching the target type.
fn extract_body_text(payload: &MessagePayload, target_mime: &str) -> Option<String> {
    if payload.mime_type == target_mime {
        if let Some(body) = &payload.body {
            if let Some(data) = &body.data {
                return decode_url_safe_base64(data);
            }
        }
    }
    for part in &payload.parts {
        if let Some(text) = extract_body_text(part, target_mime) {
            return Some(text);
        }
    }
    None
}

/// Decode URL-safe base64 (no padding) as used by the Gmail API.
fn decode_url_safe_base64(data: &str) -> Option<String> {
    match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(data) {
        Ok(bytes) => String::from_utf8(bytes).ok(),
        Err(_) => None,
    }
}

fn build_message(detail: MessageDetail) -> EmailMessage {
    let headers = detail
        .payload
        .as_ref()
        .map(|p| &p.headers[..])
        .unwrap_or(&[]);

    let date = detail
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
        .or_else(|| {
            header_value(headers, "Date")
                .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
                .map(|d| d.with_timezone(&Utc))
        })
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch"));

    let body = detail
        .payload
        .as_ref()
        .and_then(|p| {
            extract_body_text(p, "text/plain").or_else(|| extract_body_text(p, "text/html"))
        })
        .unwrap_or_default();

    EmailMessage {
        id: detail.id,
        rfc822_id: header_value(headers, "Message-ID")
            .map(|v| v.trim().trim_matches(['<', '>']).to_string()),
        sender: header_value(headers, "From").unwrap_or_default().to_string(),
        subject: header_value(headers, "Subject")
            .unwrap_or_default()
            .to_string(),
        body,
        date,
        unread: detail.label_ids.iter().any(|l| l == "UNREAD"),
        starred: detail.label_ids.iter().any(|l| l == "STARRED"),
        important: detail.label_ids.iter().any(|l| l == "IMPORTANT"),
        labels: detail.label_ids,
    }
}

fn build_thread(detail: ThreadDetail) -> EmailThread {
    let mut emails: Vec<EmailMessage> = detail.messages.into_iter().map(build_message).collect();
    emails.sort_by(|a, b| b.date.cmp(&a.date));
    let subject = emails
        .last()
        .map(|m| m.subject.clone())
        .unwrap_or_default();
    EmailThread {
        thread_id: detail.id,
        subject,
        emails,
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct GmailStore {
    client: reqwest::Client,
    tokens: TokenManager,
    retry: RetryPolicy,
    /// Label name -> id, resolved lazily and created on first use.
    label_cache: Mutex<HashMap<String, String>>,
    profile_cache: Mutex<Option<String>>,
}

impl GmailStore {
    pub fn new(tokens: TokenManager) -> Self {
        Self {
            client: reqwest::Client::new(),
            tokens,
            retry: RetryPolicy::default(),
            label_cache: Mutex::new(HashMap::new()),
            profile_cache: Mutex::new(None),
        }
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, MailError> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(MailError::AuthExpired);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(resp)
    }

    async fn fetch_thread(
        &self,
        access_token: &str,
        thread_id: &str,
    ) -> Result<EmailThread, MailError> {
        let url = format!("{GMAIL_BASE}/threads/{thread_id}");
        let resp = send_with_retry(
            self.client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("format", "full")]),
            &self.retry,
        )
        .await?;
        let detail: ThreadDetail = self.check(resp).await?.json().await?;
        Ok(build_thread(detail))
    }

    async fn label_id(&self, access_token: &str, name: &str) -> Result<String, MailError> {
        {
            let cache = self.label_cache.lock().await;
            if let Some(id) = cache.get(name) {
                return Ok(id.clone());
            }
        }

        let resp = send_with_retry(
            self.client
                .get(format!("{GMAIL_BASE}/labels"))
                .bearer_auth(access_token),
            &self.retry,
        )
        .await?;
        let list: LabelListResponse = self.check(resp).await?.json().await?;

        let mut cache = self.label_cache.lock().await;
        for label in &list.labels {
            cache.insert(label.name.clone(), label.id.clone());
        }
        if let Some(id) = cache.get(name) {
            return Ok(id.clone());
        }

        // Not found: create it.
        let resp = send_with_retry(
            self.client
                .post(format!("{GMAIL_BASE}/labels"))
                .bearer_auth(access_token)
                .json(&serde_json::json!({
                    "name": name,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show",
                })),
            &self.retry,
        )
        .await?;
        let created: LabelDetail = self.check(resp).await?.json().await?;
        cache.insert(created.name, created.id.clone());
        Ok(created.id)
    }

    async fn modify_message(
        &self,
        access_token: &str,
        message_id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), MailError> {
        let resp = send_with_retry(
            self.client
                .post(format!("{GMAIL_BASE}/messages/{message_id}/modify"))
                .bearer_auth(access_token)
                .json(&serde_json::json!({
                    "addLabelIds": add,
                    "removeLabelIds": remove,
                })),
            &self.retry,
        )
        .await?;
        self.check(resp).await?;
        Ok(())
    }

    async fn modify_thread(
        &self,
        access_token: &str,
        thread_id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), MailError> {
        let resp = send_with_retry(
            self.client
                .post(format!("{GMAIL_BASE}/threads/{thread_id}/modify"))
                .bearer_auth(access_token)
                .json(&serde_json::json!({
                    "addLabelIds": add,
                    "removeLabelIds": remove,
                })),
            &self.retry,
        )
        .await?;
        self.check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl MailStore for GmailStore {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<EmailThread>, MailError> {
        let access_token = self.tokens.access_token().await?;

        let resp = send_with_retry(
            self.client
                .get(format!("{GMAIL_BASE}/threads"))
                .bearer_auth(&access_token)
                .query(&[("q", query), ("maxResults", &limit.to_string())]),
            &self.retry,
        )
        .await?;
        let list: ThreadListResponse = self.check(resp).await?.json().await?;

        let mut threads = Vec::with_capacity(list.threads.len());
        for stub in &list.threads {
            match self.fetch_thread(&access_token, &stub.id).await {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    log::debug!("Skipping thread {}: {}", stub.id, e);
                    continue;
                }
            }
        }

        // Most recent first, by newest message in each thread.
        threads.sort_by_key(|t| std::cmp::Reverse(t.emails.first().map(|m| m.date)));
        Ok(threads)
    }

    async fn lookup_rfc822(&self, rfc822_id: &str) -> Result<Option<String>, MailError> {
        let access_token = self.tokens.access_token().await?;
        let query = format!("rfc822msgid:{rfc822_id}");
        let resp = send_with_retry(
            self.client
                .get(format!("{GMAIL_BASE}/messages"))
                .bearer_auth(&access_token)
                .query(&[("q", query.as_str()), ("maxResults", "1")]),
            &self.retry,
        )
        .await?;
        let list: MessageListResponse = self.check(resp).await?.json().await?;
        Ok(list.messages.into_iter().next().map(|m| m.id))
    }

    async fn add_label(&self, message_id: &str, label: &str) -> Result<(), MailError> {
        let access_token = self.tokens.access_token().await?;
        let label_id = self.label_id(&access_token, label).await?;
        self.modify_message(&access_token, message_id, &[&label_id], &[])
            .await
    }

    async fn add_thread_label(&self, thread_id: &str, label: &str) -> Result<(), MailError> {
        let access_token = self.tokens.access_token().await?;
        let label_id = self.label_id(&access_token, label).await?;
        self.modify_thread(&access_token, thread_id, &[&label_id], &[])
            .await
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), MailError> {
        let access_token = self.tokens.access_token().await?;
        self.modify_message(&access_token, message_id, &[], &["UNREAD"])
            .await
    }

    async fn archive_thread(&self, thread_id: &str) -> Result<(), MailError> {
        let access_token = self.tokens.access_token().await?;
        self.modify_thread(&access_token, thread_id, &[], &["INBOX"])
            .await
    }

    async fn profile_email(&self) -> Result<String, MailError> {
        {
            let cache = self.profile_cache.lock().await;
            if let Some(email) = cache.as_ref() {
                return Ok(email.clone());
            }
        }
        let access_token = self.tokens.access_token().await?;
        let resp = send_with_retry(
            self.client
                .get(format!("{GMAIL_BASE}/profile"))
                .bearer_auth(&access_token),
            &self.retry,
        )
        .await?;
        let profile: Profile = self.check(resp).await?.json().await?;
        let mut cache = self.profile_cache.lock().await;
        *cache = Some(profile.email_address.clone());
        Ok(profile.email_address)
    }
}

#[async_trait]
impl Mailer for GmailStore {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html_body: &str,
        sender_name: &str,
    ) -> Result<(), MailError> {
        let access_token = self.tokens.access_token().await?;
        let me = self.profile_email().await?;
        let raw = encode_raw_message(&me, sender_name, to, subject, html_body);

        let resp = send_with_retry(
            self.client
                .post(format!("{GMAIL_BASE}/messages/send"))
                .bearer_auth(&access_token)
                .json(&serde_json::json!({ "raw": raw })),
            &self.retry,
        )
        .await?;
        self.check(resp).await?;
        Ok(())
    }
}

/// Assemble an RFC-2822 HTML message and encode it URL-safe base64 as the
/// send endpoint expects.
fn encode_raw_message(
    from_addr: &str,
    sender_name: &str,
    to: &str,
    subject: &str,
    html_body: &str,
) -> String {
    let message = format!(
        "From: {sender_name} <{from_addr}>\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/html; charset=UTF-8\r\n\
         \r\n\
         {html_body}"
    );
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(message.as_bytes())
}

// ============================================================================
// Tests
// ============================================================================
