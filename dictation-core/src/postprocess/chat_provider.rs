//! Chat-completion-shaped HTTP post-process provider (§4.5, wire format §6).
//!
//! Request/response shapes grounded on an OpenAI-compatible chat completions
//! endpoint: `{model, messages, temperature, max_tokens, stream: false}` in,
//! `choices[0].message.content` out, with `choices[0].text` and a top-level
//! `text` field as fallbacks for providers that don't nest under `message`.

use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{PostProcessContext, PostProcessProvider};
use crate::error::{DictationError, Result};

const SYSTEM_PROMPT: &str = "format raw dictation into conventional prose with punctuation and capitalization; correct obvious homophones; preserve meaning; do not add commentary.";
const TERMINAL_MARKER: &str = "[terminal input — preserve shell syntax verbatim]";

#[derive(Debug, Clone)]
pub struct ChatProviderConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub tag: String,
}

impl Default for ChatProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            api_key: None,
            model: "gpt-4o-mini".into(),
            temperature: 0.1,
            max_tokens: 1024,
            timeout: Duration::from_secs(10),
            tag: "chat-cleanup".into(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatProvider {
    config: ChatProviderConfig,
    client: Client,
}

impl ChatProvider {
    pub fn new(config: ChatProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DictationError::Internal(format!("http client build failed: {e}")))?;
        Ok(Self { config, client })
    }
}

impl PostProcessProvider for ChatProvider {
    fn tag(&self) -> &str {
        &self.config.tag
    }

    fn refine(&mut self, text: &str, ctx: &PostProcessContext) -> Result<(String, Duration)> {
        let started = Instant::now();
        let user_content = if ctx.is_terminal() {
            format!("{TERMINAL_MARKER}\n{text}")
        } else {
            text.to_string()
        };

        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user_content,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: false,
        };

        let mut builder = self.client.post(&self.config.endpoint).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .map_err(|e| DictationError::NetworkTransient(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DictationError::from_http_status(status.as_u16(), body));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .map_err(|e| DictationError::Internal(format!("invalid JSON response: {e}")))?;

        let refined = parsed
            .choices
            .into_iter()
            .find_map(|c| c.message.and_then(|m| m.content).or(c.text))
            .or(parsed.text)
            .ok_or_else(|| DictationError::Internal("empty chat completion response".into()))?;

        Ok((refined.trim().to_string(), started.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_context_prefixes_the_user_content_marker() {
        let ctx_terminal = PostProcessContext::from_surface(crate::session::SurfaceClass::Terminal, None);
        let ctx_default = PostProcessContext::from_surface(crate::session::SurfaceClass::Default, None);
        // Marker text itself is a stable contract other providers can match on.
        assert!(TERMINAL_MARKER.contains("shell syntax"));
        assert!(ctx_terminal.is_terminal());
        assert!(!ctx_default.is_terminal());
    }
}
