//! OpenAI chat-completions classifier.
//!
//! JSON-mode request at temperature 0; the response content is parsed and
//! validated against the two-bucket contract before anything downstream
//! sees it.

use async_trait::async_trait;
use serde::Deserialize;

use super::{parse_classification, prompts, LlmClient};
use crate::config::Config;
use crate::error::LlmError;
use crate::http::{send_with_retry, RetryPolicy};
use crate::types::{Classification, EmailThread};

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

impl OpenAiClient {
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        let api_key = config.openai_api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(LlmError::MissingApiKey);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: config.openai_model.clone(),
            retry: RetryPolicy::default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

/// Pull the classification JSON out of a completion response body.
fn extract_classification(body: &serde_json::Value) -> Result<Classification, LlmError> {
    let completion: CompletionResponse = serde_json::from_value(body.clone())
        .map_err(|e| LlmError::MalformedResponse(format!("unexpected response shape: {e}")))?;
    let content = completion
        .choices
        .first()
        .map(|c| c.message.content.as_str())
        .ok_or_else(|| LlmError::MalformedResponse("no choices in response".into()))?;
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| LlmError::MalformedResponse(format!("content is not JSON: {e}")))?;
    parse_classification(&value)
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn classify(
        &self,
        batch: &[&EmailThread],
        config: &Config,
    ) -> Result<Classification, LlmError> {
        let request = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": prompts::system_prompt(config) },
                { "role": "user", "content": prompts::batch_payload(batch) },
            ],
        });

        let resp = send_with_retry(
            self.client
                .post(COMPLETIONS_URL)
                .bearer_auth(&self.api_key)
                .json(&request),
            &self.retry,
        )
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(format!("response is not JSON: {e}")))?;
        extract_classification(&body)
    }
}
