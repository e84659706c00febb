//! CloudBatchProvider — HTTP multipart/form-data batch transcription (§4.4).
//!
//! Grounded on the teacher's OpenAI fallback call: build a WAV, POST it as
//! multipart/form-data, bearer-auth, map non-2xx statuses through
//! [`DictationError::from_http_status`].

use std::time::{Duration, Instant};

use reqwest::blocking::{multipart, Client};
use tracing::warn;

use serde::Deserialize;

use super::{BatchProvider, TranscribeRequest, TranscribeResult, WordTiming};
use crate::error::{DictationError, Result};

/// §6 response shape: `{text, language_code?, language_probability?, words?}`.
#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language_code: Option<String>,
    #[serde(default)]
    language_probability: Option<f32>,
    #[serde(default)]
    words: Option<Vec<WordResponse>>,
}

#[derive(Deserialize)]
struct WordResponse {
    word: String,
    start_time: f64,
    end_time: f64,
}

pub struct CloudBatchConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model_id: String,
    pub tag: String,
    pub timeout: Duration,
}

impl CloudBatchConfig {
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/audio/transcriptions".into(),
            api_key: api_key.into(),
            model_id: "gpt-4o-mini-transcribe".into(),
            tag: "cloud-batch-openai".into(),
            timeout: Duration::from_secs(20),
        }
    }
}

pub struct CloudBatchProvider {
    config: CloudBatchConfig,
    client: Client,
}

impl CloudBatchProvider {
    pub fn new(config: CloudBatchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DictationError::Internal(format!("http client build failed: {e}")))?;
        Ok(Self { config, client })
    }
}

impl BatchProvider for CloudBatchProvider {
    fn tag(&self) -> &str {
        &self.config.tag
    }

    fn transcribe_batch(&mut self, request: &TranscribeRequest) -> Result<TranscribeResult> {
        let started = Instant::now();
        if request.audio.is_empty() {
            return Err(DictationError::Internal("empty audio buffer".into()));
        }

        let file_part = multipart::Part::bytes(request.audio.clone())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| DictationError::Internal(format!("multipart build failed: {e}")))?;

        let mut form = multipart::Form::new()
            .text("model_id", self.config.model_id.clone())
            .text("response_format", "json")
            .part("audio", file_part);
        if let Some(language) = &request.language {
            form = form.text("language_code", language.clone());
        }

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .map_err(|e| DictationError::NetworkTransient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().unwrap_or_default();
            warn!(%status, "cloud batch request returned non-success status");
            let mut err = DictationError::from_http_status(status.as_u16(), body);
            if let (DictationError::RateLimited { retry_after: slot }, Some(d)) =
                (&mut err, retry_after)
            {
                *slot = Some(d);
            }
            return Err(err);
        }

        let payload: TranscriptionResponse = response
            .json()
            .map_err(|e| DictationError::Internal(format!("invalid JSON response: {e}")))?;

        let words = payload.words.map(|ws| {
            ws.into_iter()
                .map(|w| WordTiming {
                    word: w.word,
                    start_time: w.start_time,
                    end_time: w.end_time,
                })
                .collect()
        });

        Ok(TranscribeResult {
            text: payload.text.trim().to_string(),
            confidence: None,
            language: payload.language_code.or_else(|| request.language.clone()),
            duration_s: request.duration_s,
            latency_ms: started.elapsed().as_millis() as u64,
            provider_tag: self.config.tag.clone(),
            language_probability: payload.language_probability,
            words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_audio_without_network_call() {
        let mut provider = CloudBatchProvider::new(CloudBatchConfig::openai("sk-test")).unwrap();
        let request = TranscribeRequest {
            audio: Vec::new(),
            sample_rate: 16_000,
            language: None,
            model_id: None,
            duration_s: 0.0,
        };
        let err = provider.transcribe_batch(&request).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }
}
