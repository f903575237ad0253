use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single email within a thread, as fetched from the mail provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfc822_id: Option<String>,
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub unread: bool,
    #[serde(default)]
    pub starred: bool,
    #[serde(default)]
    pub important: bool,
    /// Provider label ids attached to this message.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A conversation thread: the unit of classification and archival.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailThread {
    pub thread_id: String,
    pub subject: String,
    pub emails: Vec<EmailMessage>,
}

impl EmailThread {
    /// Character count fed to the token estimator: sender + subject + body
    /// of every message.
    pub fn char_count(&self) -> usize {
        self.emails
            .iter()
            .map(|m| m.sender.len() + m.subject.len() + m.body.len())
            .sum()
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.emails.iter().any(|m| m.id == message_id)
    }
}

/// One classified email produced by the LLM.
///
/// `key_action` is populated for "must do" findings, `key_knowledge` for
/// "must know" findings. `date` is filled in by the engine from the source
/// message, not trusted from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub email_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfc822_id: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_knowledge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

/// The two-bucket result of one classifier call, and the merge unit for
/// run-level accumulation (concatenation, no deduplication).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Classification {
    pub must_do: Vec<Finding>,
    pub must_know: Vec<Finding>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.must_do.is_empty() && self.must_know.is_empty()
    }

    pub fn len(&self) -> usize {
        self.must_do.len() + self.must_know.len()
    }

    /// Append another classification. Order within each bucket is preserved.
    pub fn merge(&mut self, other: Classification) {
        self.must_do.extend(other.must_do);
        self.must_know.extend(other.must_know);
    }

    pub fn email_ids(&self) -> impl Iterator<Item = &str> {
        self.must_do
            .iter()
            .chain(self.must_know.iter())
            .map(|f| f.email_id.as_str())
    }
}

/// Terminal and non-terminal states of the active engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "error" => Some(RunStatus::Error),
            "timeout" => Some(RunStatus::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the most recently terminated active run, persisted for the
/// status surface. Replaced wholesale on each terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub run_id: String,
    pub status: RunStatus,
    pub time_range: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub chunks_done: u32,
    pub chunk_total: u32,
    pub threads_processed: u64,
    pub must_do: usize,
    pub must_know: usize,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(id: &str) -> Finding {
        Finding {
            email_id: id.to_string(),
            rfc822_id: None,
            subject: "s".to_string(),
            sender: "a@b.com".to_string(),
            topic: "t".to_string(),
            key_action: None,
            key_knowledge: None,
            date: None,
        }
    }

    #[test]
    fn test_classification_merge_concatenates_in_order() {
        let mut a = Classification {
            must_do: vec![finding("1")],
            must_know: vec![finding("2")],
        };
        let b = Classification {
            must_do: vec![finding("3")],
            must_know: vec![],
        };
        a.merge(b);
        assert_eq!(a.must_do.len(), 2);
        assert_eq!(a.must_do[0].email_id, "1");
        assert_eq!(a.must_do[1].email_id, "3");
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_run_status_roundtrip() {
        for s in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Error,
            RunStatus::Timeout,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
        assert!(RunStatus::Timeout.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_finding_wire_format_is_camel_case() {
        let mut f = finding("m1");
        f.key_action = Some("reply by Friday".to_string());
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["emailId"], "m1");
        assert_eq!(json["keyAction"], "reply by Friday");
        assert!(json.get("keyKnowledge").is_none());
    }
}
