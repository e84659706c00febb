//! `StubProvider` — placeholder backend that echoes metadata without real
//! inference. Lets the full dispatcher/pipeline/delivery chain be exercised
//! end-to-end before a model is installed.

use std::time::Instant;

use tracing::debug;

use super::{BatchProvider, TranscribeRequest, TranscribeResult};
use crate::error::Result;

pub struct StubProvider {
    utterance_count: u32,
}

impl StubProvider {
    pub fn new() -> Self {
        Self { utterance_count: 0 }
    }
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchProvider for StubProvider {
    fn tag(&self) -> &str {
        "stub"
    }

    fn transcribe_batch(&mut self, request: &TranscribeRequest) -> Result<TranscribeResult> {
        let started = Instant::now();
        self.utterance_count += 1;
        debug!(
            utterance = self.utterance_count,
            bytes = request.audio.len(),
            "StubProvider transcribing"
        );

        let text = format!(
            "[stub: {} bytes @ {} Hz]",
            request.audio.len(),
            request.sample_rate
        );

        Ok(TranscribeResult {
            text,
            confidence: Some(1.0),
            language: request.language.clone(),
            duration_s: request.duration_s,
            latency_ms: started.elapsed().as_millis() as u64,
            provider_tag: self.tag().to_string(),
            language_probability: None,
            words: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_byte_count_and_sample_rate() {
        let mut provider = StubProvider::new();
        let request = TranscribeRequest {
            audio: vec![0; 3200],
            sample_rate: 16_000,
            language: None,
            model_id: None,
            duration_s: 0.1,
        };
        let result = provider.transcribe_batch(&request).unwrap();
        assert!(result.text.contains("3200 bytes"));
        assert!(result.text.contains("16000 Hz"));
        assert_eq!(result.confidence, Some(1.0));
    }
}
