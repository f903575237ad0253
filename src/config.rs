//! User configuration loaded from `~/.fastread/config.json`.
//!
//! Every field is optional on disk; absent keys take explicit defaults
//! rather than relying on truthiness. The only hard requirement for the
//! engine to do anything is `openaiApiKey`.

use std::path::PathBuf;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_addon_name() -> String {
    "Fast Read".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Required. Without it the active engine refuses to start and the
    /// passive engine silently skips.
    pub openai_api_key: String,
    pub openai_model: String,
    /// Used as the notification sender name and in the self-feedback
    /// ignore rule (messages whose subject contains this are skipped).
    pub addon_name: String,
    /// IANA timezone anchoring the digest window and the once-per-day gate.
    pub time_zone: String,
    /// Newline-separated topic lists.
    pub must_do_topics: String,
    pub must_know_topics: String,
    /// Allow the LLM to tag findings outside the listed topics as "other".
    pub must_do_other: bool,
    pub must_know_other: bool,
    /// Search filter flags.
    pub unread_only: bool,
    pub inbox_only: bool,
    /// Label names to apply to findings; empty disables labeling.
    pub must_do_label: String,
    pub must_know_label: String,
    pub mark_processed_as_read: bool,
    pub remove_uninteresting_from_inbox: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_model: default_model(),
            addon_name: default_addon_name(),
            time_zone: default_time_zone(),
            must_do_topics: String::new(),
            must_know_topics: String::new(),
            must_do_other: false,
            must_know_other: false,
            unread_only: false,
            inbox_only: false,
            must_do_label: String::new(),
            must_know_label: String::new(),
            mark_processed_as_read: false,
            remove_uninteresting_from_inbox: false,
        }
    }
}

impl Config {
    /// Canonical config path: `~/.fastread/config.json`.
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".fastread")
            .join("config.json")
    }

    pub fn load() -> Result<Config, ConfigError> {
        Self::load_from(&Config::default_path())
    }

    pub fn load_from(path: &PathBuf) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.clone()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// The minimum the engine needs before it will scan anything.
    pub fn is_complete(&self) -> bool {
        !self.openai_api_key.trim().is_empty()
    }

    pub fn must_do_topic_list(&self) -> Vec<String> {
        split_topics(&self.must_do_topics)
    }

    pub fn must_know_topic_list(&self) -> Vec<String> {
        split_topics(&self.must_know_topics)
    }

    /// Parse the configured timezone, falling back to UTC on nonsense so a
    /// typo degrades the digest schedule instead of killing the engine.
    pub fn tz(&self) -> Tz {
        match self.time_zone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                log::warn!("Invalid timeZone '{}', falling back to UTC", self.time_zone);
                chrono_tz::UTC
            }
        }
    }
}

fn split_topics(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}
