//! Error types for the triage engine.
//!
//! Each subsystem gets its own enum; `EngineError` is the umbrella the
//! workflows propagate. Errors are classified by recoverability so the
//! dispatcher can decide between "fail the run" and "log and continue".

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the durable stores (KV and blob).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("State directory unavailable")]
    NoStateDir,
}

/// Errors from the mail provider adapter.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mail API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Token expired or revoked")]
    AuthExpired,

    #[error("Token not found at {0}")]
    TokenNotFound(PathBuf),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the LLM classifier.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed classifier response: {0}")]
    MalformedResponse(String),

    #[error("No API key configured")]
    MissingApiKey,
}

/// Errors from the trigger service.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Trigger budget exhausted ({capacity} slots)")]
    BudgetExhausted { capacity: usize },

    #[error("Trigger not found")]
    NotFound,
}

/// Errors loading or validating the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found at {0}")]
    NotFound(PathBuf),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Umbrella error for workflow execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another {holder} workflow is already running")]
    LockHeld { holder: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Trigger(#[from] TriggerError),

    #[error("Inconsistent persisted state: {0}")]
    State(String),
}

impl EngineError {
    /// True for provider-side failures that a later invocation may not hit
    /// again. The engine still fails the current run either way; this only
    /// colors the notification text.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Mail(MailError::Http(_)) => true,
            EngineError::Mail(MailError::Api { status, .. }) => *status == 429 || *status >= 500,
            EngineError::Llm(LlmError::Http(_)) => true,
            EngineError::Llm(LlmError::Api { status, .. }) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_held_message_names_holder() {
        let err = EngineError::LockHeld {
            holder: "passive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Another passive workflow is already running"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Mail(MailError::Api {
            status: 503,
            message: "backend error".into()
        })
        .is_transient());
        assert!(EngineError::Llm(LlmError::Api {
            status: 429,
            message: "rate limited".into()
        })
        .is_transient());
        assert!(!EngineError::Config("missing key".into()).is_transient());
        assert!(!EngineError::Llm(LlmError::MalformedResponse("not json".into())).is_transient());
    }
}
