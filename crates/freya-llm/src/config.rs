//! Language-model settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Ollama base URL. A missing scheme is taken as `http://`.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Deadline for a single model call, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,

    /// Model calls allowed per user turn before giving up with a fallback.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,

    /// Conversation messages kept between turns.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Name the assistant introduces itself with.
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,

    /// Replaces the built-in system prompt when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout_secs() -> f64 {
    120.0
}

fn default_max_tool_iterations() -> u32 {
    5
}

fn default_max_history() -> usize {
    20
}

fn default_assistant_name() -> String {
    "Freya".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_tool_iterations: default_max_tool_iterations(),
            max_history: default_max_history(),
            assistant_name: default_assistant_name(),
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    /// Base URL with a scheme and without a trailing slash.
    pub fn base_url(&self) -> String {
        let host = self.host.trim().trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        }
    }

    /// Model call deadline. Non-positive values fall back to the default.
    pub fn model_timeout(&self) -> Duration {
        positive_secs(self.timeout_secs)
            .unwrap_or_else(|| Duration::from_secs_f64(default_timeout_secs()))
    }

    pub fn system_prompt(&self) -> String {
        match &self.system_prompt {
            Some(prompt) => prompt.clone(),
            None => format!(
                "You are {}, a personal AI assistant.\n\n\
                 You have access to tools and can use them to look things up \
                 or perform actions. Use a tool whenever it gives a better \
                 answer than guessing.\n\n\
                 Keep replies short and conversational: they are spoken aloud.",
                self.assistant_name
            ),
        }
    }
}

pub(crate) fn positive_secs(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}
