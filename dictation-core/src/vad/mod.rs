//! SilenceDetector / VAD (§4.3).
//!
//! Two parts: a per-chunk classifier ([`VoiceActivityDetector`], pluggable
//! energy or neural backend) and the hysteresis state machine
//! ([`SilenceDetector`]) that turns a stream of per-chunk verdicts into
//! `Speaking ↔ Silent` transitions and fires `silence-timeout`.

pub mod energy;
#[cfg(feature = "onnx")]
pub mod silero;

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        matches!(self, VadDecision::Speech)
    }
}

/// Per-chunk speech/non-speech classifier. Implementations must not block —
/// callbacks into the chunk-emission thread run synchronously (§4.3).
pub trait VoiceActivityDetector: Send + 'static {
    fn classify(&mut self, samples: &[f32]) -> VadDecision;
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Speaking,
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechOnset,
    SpeechContinued,
    SilenceStart,
    SilenceTimeout,
}

/// Wraps a [`VoiceActivityDetector`] with the hysteresis state machine from
/// §4.3: enter `Silent` on ≥3 consecutive non-speech chunks, enter
/// `Speaking` on ≥1 speech chunk, and fire a one-shot `silence-timeout` once
/// accumulated silence crosses `silence_timeout`. A timeout of zero
/// disables that path entirely.
pub struct SilenceDetector {
    classifier: Box<dyn VoiceActivityDetector>,
    state: VoiceState,
    consecutive_non_speech: u32,
    hysteresis_chunks: u32,
    silence_started_at: Option<Instant>,
    silence_timeout: Duration,
    timeout_fired: bool,
}

impl SilenceDetector {
    pub fn new(
        classifier: Box<dyn VoiceActivityDetector>,
        hysteresis_chunks: u32,
        silence_timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            state: VoiceState::Silent,
            consecutive_non_speech: 0,
            hysteresis_chunks: hysteresis_chunks.max(1),
            silence_started_at: None,
            silence_timeout,
            timeout_fired: false,
        }
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn set_threshold_timeout(&mut self, silence_timeout: Duration) {
        self.silence_timeout = silence_timeout;
    }

    /// Feeds one chunk's samples, returning every event that fired. Order
    /// matters: a chunk can both continue speech and (if it is the chunk
    /// that crosses the hysteresis boundary) start silence, but never both
    /// start and continue in the same call.
    pub fn process(&mut self, samples: &[f32], now: Instant) -> Vec<VadEvent> {
        let verdict = self.classifier.classify(samples);
        let mut events = Vec::new();

        match verdict {
            VadDecision::Speech => {
                self.consecutive_non_speech = 0;
                self.timeout_fired = false;
                self.silence_started_at = None;
                match self.state {
                    VoiceState::Silent => {
                        self.state = VoiceState::Speaking;
                        events.push(VadEvent::SpeechOnset);
                    }
                    VoiceState::Speaking => {
                        events.push(VadEvent::SpeechContinued);
                    }
                }
            }
            VadDecision::Silence => {
                self.consecutive_non_speech += 1;
                if self.state == VoiceState::Speaking
                    && self.consecutive_non_speech >= self.hysteresis_chunks
                {
                    self.state = VoiceState::Silent;
                    self.silence_started_at = Some(now);
                    events.push(VadEvent::SilenceStart);
                }
                if self.state == VoiceState::Silent && !self.silence_timeout.is_zero() {
                    let started = *self.silence_started_at.get_or_insert(now);
                    if !self.timeout_fired && now.duration_since(started) >= self.silence_timeout {
                        self.timeout_fired = true;
                        events.push(VadEvent::SilenceTimeout);
                    }
                }
            }
        }

        events
    }

    pub fn reset(&mut self) {
        self.classifier.reset();
        self.state = VoiceState::Silent;
        self.consecutive_non_speech = 0;
        self.silence_started_at = None;
        self.timeout_fired = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedVad(std::collections::VecDeque<VadDecision>);
    impl VoiceActivityDetector for ScriptedVad {
        fn classify(&mut self, _samples: &[f32]) -> VadDecision {
            self.0.pop_front().unwrap_or(VadDecision::Silence)
        }
        fn reset(&mut self) {}
    }

    #[test]
    fn silence_timeout_zero_never_fires() {
        let script = std::iter::repeat(VadDecision::Silence).take(100).collect();
        let mut det = SilenceDetector::new(
            Box::new(ScriptedVad(script)),
            3,
            Duration::from_secs(0),
        );
        let mut t = Instant::now();
        for _ in 0..100 {
            let events = det.process(&[], t);
            assert!(!events.contains(&VadEvent::SilenceTimeout));
            t += Duration::from_millis(100);
        }
    }

    #[test]
    fn enters_silent_after_hysteresis_window() {
        let script: std::collections::VecDeque<_> = vec![
            VadDecision::Speech,
            VadDecision::Silence,
            VadDecision::Silence,
            VadDecision::Silence,
        ]
        .into();
        let mut det = SilenceDetector::new(Box::new(ScriptedVad(script)), 3, Duration::from_secs(0));
        let t = Instant::now();
        assert_eq!(det.process(&[], t)[0], VadEvent::SpeechOnset);
        assert!(det.process(&[], t).is_empty());
        assert!(det.process(&[], t).is_empty());
        assert_eq!(det.process(&[], t)[0], VadEvent::SilenceStart);
        assert_eq!(det.state(), VoiceState::Silent);
    }

    #[test]
    fn fires_silence_timeout_exactly_once() {
        let script = std::iter::repeat(VadDecision::Silence).take(10).collect();
        let mut det = SilenceDetector::new(
            Box::new(ScriptedVad(script)),
            1,
            Duration::from_millis(300),
        );
        let mut t = Instant::now();
        let mut fired = 0;
        for _ in 0..10 {
            let events = det.process(&[], t);
            fired += events.iter().filter(|e| **e == VadEvent::SilenceTimeout).count();
            t += Duration::from_millis(100);
        }
        assert_eq!(fired, 1);
    }
}
