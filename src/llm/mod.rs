//! LLM classifier capability.
//!
//! The model is an opaque classifier with a fixed JSON contract: given a
//! batch of threads and the topic config it returns
//! `{ "mustDo": [...], "mustKnow": [...] }`. Anything that does not parse
//! to that shape is a malformed response and fails the batch.

pub mod openai;
pub mod prompts;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::LlmError;
use crate::types::{Classification, EmailThread};

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn classify(
        &self,
        batch: &[&EmailThread],
        config: &Config,
    ) -> Result<Classification, LlmError>;
}

/// Validate the classifier's JSON structurally and deserialize it.
///
/// Requirements: top level is an object, `mustDo` and `mustKnow` are both
/// present as arrays, and every finding carries a non-empty `emailId`.
pub fn parse_classification(value: &serde_json::Value) -> Result<Classification, LlmError> {
    let obj = value
        .as_object()
        .ok_or_else(|| LlmError::MalformedResponse("top level is not an object".into()))?;

    for key in ["mustDo", "mustKnow"] {
        match obj.get(key) {
            Some(v) if v.is_array() => {}
            Some(_) => {
                return Err(LlmError::MalformedResponse(format!("{key} is not an array")));
            }
            None => return Err(LlmError::MalformedResponse(format!("missing {key}"))),
        }
    }

    let classification: Classification = serde_json::from_value(value.clone())
        .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

    for finding in classification
        .must_do
        .iter()
        .chain(classification.must_know.iter())
    {
        if finding.email_id.trim().is_empty() {
            return Err(LlmError::MalformedResponse(
                "finding without emailId".into(),
            ));
        }
    }

    Ok(classification)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_classification() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{
                "mustDo": [
                    {"emailId": "m1", "subject": "Invoice", "sender": "a@b.com",
                     "topic": "billing", "keyAction": "pay by Friday"}
                ],
                "mustKnow": []
            }"#,
        )
        .unwrap();
        let c = parse_classification(&value).unwrap();
        assert_eq!(c.must_do.len(), 1);
        assert_eq!(c.must_do[0].email_id, "m1");
        assert_eq!(c.must_do[0].key_action.as_deref(), Some("pay by Friday"));
        assert!(c.must_know.is_empty());
    }

    #[test]
    fn test_parse_rejects_missing_bucket() {
        let value: serde_json::Value = serde_json::from_str(r#"{"mustDo": []}"#).unwrap();
        assert!(matches!(
            parse_classification(&value),
            Err(LlmError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_rejects_non_array_bucket() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"mustDo": [], "mustKnow": "none"}"#).unwrap();
        assert!(parse_classification(&value).is_err());
    }

    #[test]
    fn test_parse_rejects_finding_without_email_id() {
        let value: serde_json::Value = serde_json::from_str(
            r#"{"mustDo": [{"emailId": "", "subject": "x"}], "mustKnow": []}"#,
        )
        .unwrap();
        assert!(parse_classification(&value).is_err());
    }

    #[test]
    fn test_parse_rejects_non_object() {
        let value = serde_json::json!(["mustDo"]);
        assert!(parse_classification(&value).is_err());
    }
}
