//! STTDispatcher and the provider capability contract (§4.4).
//!
//! Providers are a closed set of variants behind one capability trait —
//! no runtime reflection, no plugin registry. The dispatcher owns fallback
//! policy; providers only know how to satisfy one request.

pub mod cloud_batch;
pub mod cloud_streaming;
#[cfg(feature = "onnx")]
pub mod local;
pub mod stub;

use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{DictationError, ErrorKind, Result};

/// What the dispatcher asks a provider to do. `audio_ref` is the sealed WAV
/// bytes for batch providers, or the PCM stream for streaming ones.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub audio: Vec<u8>,
    pub sample_rate: u32,
    pub language: Option<String>,
    pub model_id: Option<String>,
    pub duration_s: f64,
}

#[derive(Debug, Clone)]
pub struct TranscribeResult {
    pub text: String,
    pub confidence: Option<f32>,
    pub language: Option<String>,
    pub duration_s: f64,
    pub latency_ms: u64,
    pub provider_tag: String,
    pub language_probability: Option<f32>,
    pub words: Option<Vec<WordTiming>>,
}

/// One word-level timing entry, when a provider reports them (§6).
#[derive(Debug, Clone)]
pub struct WordTiming {
    pub word: String,
    pub start_time: f64,
    pub end_time: f64,
}

/// One interim or final update from a streaming provider (§4.4).
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Interim { text: String, confidence: Option<f32> },
    Final { text: String, confidence: Option<f32> },
    Info(String),
}

/// Batch capability: hand over the whole sealed utterance, get one result back.
pub trait BatchProvider: Send + 'static {
    fn tag(&self) -> &str;
    fn transcribe_batch(&mut self, request: &TranscribeRequest) -> Result<TranscribeResult>;
}

/// Streaming capability: chunks are pushed as they arrive; updates come back
/// as a lazy sequence via the callback. `end()` signals no more audio.
pub trait StreamProvider: Send + 'static {
    fn tag(&self) -> &str;
    fn start(&mut self, language: Option<&str>, model_id: Option<&str>) -> Result<()>;
    fn push_chunk(&mut self, pcm16le: &[u8]) -> Result<Vec<StreamUpdate>>;
    fn end(&mut self) -> Result<Vec<StreamUpdate>>;
}

pub enum Provider {
    Local(Box<dyn BatchProvider>),
    CloudBatch(Box<dyn BatchProvider>),
    CloudStreaming(Box<dyn StreamProvider>),
}

impl Provider {
    pub fn tag(&self) -> &str {
        match self {
            Provider::Local(p) => p.tag(),
            Provider::CloudBatch(p) => p.tag(),
            Provider::CloudStreaming(p) => p.tag(),
        }
    }
}

/// Selects and invokes a provider variant, implementing the hybrid
/// fallback policy of §4.4.
pub struct STTDispatcher {
    providers: Vec<Provider>,
    cloud_fallback_threshold: f32,
    streaming_enabled: bool,
}

impl STTDispatcher {
    pub fn new(providers: Vec<Provider>, cloud_fallback_threshold: f32) -> Self {
        Self {
            providers,
            cloud_fallback_threshold,
            streaming_enabled: false,
        }
    }

    pub fn set_streaming_enabled(&mut self, enabled: bool) {
        self.streaming_enabled = enabled;
    }

    /// True if a streaming provider is configured and streaming should be
    /// preferred for this surface (policy point 1). `surface_allows_streaming`
    /// is false for surfaces the caller has pinned to batch-only behavior.
    pub fn should_stream(&self, surface_allows_streaming: bool) -> bool {
        self.streaming_enabled
            && surface_allows_streaming
            && self
                .providers
                .iter()
                .any(|p| matches!(p, Provider::CloudStreaming(_)))
    }

    pub fn has_batch_provider(&self) -> bool {
        self.providers
            .iter()
            .any(|p| matches!(p, Provider::Local(_) | Provider::CloudBatch(_)))
    }

    pub fn streaming_provider(&mut self) -> Option<&mut dyn StreamProvider> {
        self.providers.iter_mut().find_map(|p| match p {
            Provider::CloudStreaming(sp) => Some(sp.as_mut()),
            _ => None,
        })
    }

    /// Runs the declared-priority batch chain (policy points 2-5). Returns
    /// `Ok(None)` for an empty transcript (policy point 5: the session ends
    /// quietly); `Err` only for a short-circuiting error.
    pub fn dispatch_batch(
        &mut self,
        request: &TranscribeRequest,
    ) -> Result<(Option<TranscribeResult>, bool)> {
        let mut used_fallback = false;
        let mut last_err: Option<DictationError> = None;
        let mut best: Option<TranscribeResult> = None;

        for (idx, provider) in self.providers.iter_mut().enumerate() {
            let batch = match provider {
                Provider::Local(p) => p.as_mut(),
                Provider::CloudBatch(p) => p.as_mut(),
                Provider::CloudStreaming(_) => continue,
            };

            let started = Instant::now();
            match batch.transcribe_batch(request) {
                Ok(result) => {
                    debug!(
                        provider = batch.tag(),
                        confidence = ?result.confidence,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "provider returned transcript"
                    );
                    if result.text.trim().is_empty() {
                        debug!(provider = batch.tag(), "provider returned an empty transcript");
                        if idx > 0 {
                            used_fallback = true;
                        }
                        return Ok((best, used_fallback));
                    }
                    let below_threshold = result
                        .confidence
                        .map(|c| c < self.cloud_fallback_threshold)
                        .unwrap_or(false);

                    let is_better = match &best {
                        None => true,
                        Some(current) => {
                            result.confidence.unwrap_or(0.0) > current.confidence.unwrap_or(0.0)
                        }
                    };
                    if is_better {
                        best = Some(result);
                    }

                    if idx > 0 {
                        used_fallback = true;
                    }
                    if below_threshold && idx + 1 < self.providers.len() {
                        used_fallback = true;
                        continue;
                    }
                    return Ok((best, used_fallback));
                }
                Err(e) => {
                    if e.is_fallback_eligible() {
                        warn!(provider = batch.tag(), error = %e, "provider failed, yielding to next");
                        last_err = Some(e);
                        continue;
                    }
                    warn!(provider = batch.tag(), error = %e, "provider failed, short-circuiting");
                    return Err(e);
                }
            }
        }

        if let Some(result) = best {
            return Ok((Some(result), used_fallback));
        }
        if let Some(err) = last_err {
            return Err(err);
        }
        Ok((None, used_fallback))
    }
}

pub(crate) fn classify_http_status(status: u16, body_hint: impl Into<String>) -> DictationError {
    DictationError::from_http_status(status, body_hint)
}

pub(crate) fn kind_is_fallback_eligible(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::NetworkTransient | ErrorKind::RateLimited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct ScriptedProvider {
        tag: String,
        result: Result<TranscribeResult>,
    }

    impl BatchProvider for ScriptedProvider {
        fn tag(&self) -> &str {
            &self.tag
        }
        fn transcribe_batch(&mut self, _request: &TranscribeRequest) -> Result<TranscribeResult> {
            match &self.result {
                Ok(r) => Ok(r.clone()),
                Err(e) => Err(clone_err(e)),
            }
        }
    }

    fn clone_err(e: &DictationError) -> DictationError {
        match e {
            DictationError::NetworkTransient(s) => DictationError::NetworkTransient(s.clone()),
            DictationError::Auth(s) => DictationError::Auth(s.clone()),
            other => DictationError::Internal(other.to_string()),
        }
    }

    fn req() -> TranscribeRequest {
        TranscribeRequest {
            audio: vec![0; 10],
            sample_rate: 16_000,
            language: None,
            model_id: None,
            duration_s: 1.0,
        }
    }

    fn result(text: &str, confidence: f32, tag: &str) -> TranscribeResult {
        TranscribeResult {
            text: text.into(),
            confidence: Some(confidence),
            language: None,
            duration_s: 1.0,
            latency_ms: 5,
            provider_tag: tag.into(),
            language_probability: None,
            words: None,
        }
    }

    #[test]
    fn low_confidence_local_falls_back_to_cloud() {
        let mut dispatcher = STTDispatcher::new(
            vec![
                Provider::Local(Box::new(ScriptedProvider {
                    tag: "local".into(),
                    result: Ok(result("hallo", 0.4, "local")),
                })),
                Provider::CloudBatch(Box::new(ScriptedProvider {
                    tag: "cloud".into(),
                    result: Ok(result("hello", 0.95, "cloud")),
                })),
            ],
            0.85,
        );
        let (out, used_fallback) = dispatcher.dispatch_batch(&req()).unwrap();
        let out = out.unwrap();
        assert_eq!(out.text, "hello");
        assert!(used_fallback);
    }

    #[test]
    fn network_transient_yields_to_next_provider() {
        let mut dispatcher = STTDispatcher::new(
            vec![
                Provider::Local(Box::new(ScriptedProvider {
                    tag: "local".into(),
                    result: Err(DictationError::NetworkTransient("timeout".into())),
                })),
                Provider::CloudBatch(Box::new(ScriptedProvider {
                    tag: "cloud".into(),
                    result: Ok(result("recovered", 0.9, "cloud")),
                })),
            ],
            0.85,
        );
        let (out, _) = dispatcher.dispatch_batch(&req()).unwrap();
        assert_eq!(out.unwrap().text, "recovered");
    }

    #[test]
    fn auth_error_short_circuits() {
        let mut dispatcher = STTDispatcher::new(
            vec![Provider::CloudBatch(Box::new(ScriptedProvider {
                tag: "cloud".into(),
                result: Err(DictationError::Auth("bad key".into())),
            }))],
            0.85,
        );
        let err = dispatcher.dispatch_batch(&req()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn empty_transcript_ends_without_further_fallback() {
        let mut dispatcher = STTDispatcher::new(
            vec![
                Provider::Local(Box::new(ScriptedProvider {
                    tag: "local".into(),
                    result: Ok(result("", 0.2, "local")),
                })),
                Provider::CloudBatch(Box::new(ScriptedProvider {
                    tag: "cloud".into(),
                    result: Ok(result("should not run", 0.95, "cloud")),
                })),
            ],
            0.85,
        );
        let (out, used_fallback) = dispatcher.dispatch_batch(&req()).unwrap();
        assert!(out.is_none());
        assert!(!used_fallback);
    }

    #[test]
    fn rate_limited_is_fallback_eligible() {
        assert!(DictationError::RateLimited {
            retry_after: Some(Duration::from_secs(1))
        }
        .is_fallback_eligible());
        assert!(!DictationError::NetworkFatal("x".into()).is_fallback_eligible());
    }
}
