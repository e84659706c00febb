//! Session identity, timestamps, and the lossless audio accumulator (§4.2, §4.7, §5).
//!
//! Exactly one [`Session`] is active at a time (§8: "the number of non-Idle
//! active sessions is 0 or 1"). The [`Engine`](crate::engine::Engine) owns
//! that invariant; this module only holds the session's data.

use std::io::Cursor;
use std::time::Instant;

use crate::chunker::StreamingAudioBuffer;
use crate::error::{DictationError, Result};

/// Monotonically increasing identifier, minted by the engine's session counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Coarse classification of the focused surface, used by post-processing
/// (Terminal prompt prefix, §4.5) and delivery (paste chord selection, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceClass {
    Default,
    Terminal,
    Editor,
    Browser,
}

/// The four monotonic timestamps of §4.8. `capture_start` is set when the
/// session is allocated; the rest fill in as the session advances. All are
/// `Instant`s so latency derivations can never go negative from clock skew.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimestamps {
    pub capture_start: Instant,
    pub stt_complete: Option<Instant>,
    pub post_complete: Option<Instant>,
    pub injection_complete: Option<Instant>,
}

impl SessionTimestamps {
    pub fn new(now: Instant) -> Self {
        Self {
            capture_start: now,
            stt_complete: None,
            post_complete: None,
            injection_complete: None,
        }
    }

    fn clamped_ms(from: Instant, to: Instant) -> u64 {
        to.saturating_duration_since(from).as_millis() as u64
    }

    /// `stt = stt_complete - capture_start`
    pub fn stt_ms(&self) -> Option<u64> {
        self.stt_complete
            .map(|t| Self::clamped_ms(self.capture_start, t))
    }

    /// `post = post_complete - stt_complete`
    pub fn post_ms(&self) -> Option<u64> {
        match (self.stt_complete, self.post_complete) {
            (Some(a), Some(b)) => Some(Self::clamped_ms(a, b)),
            _ => None,
        }
    }

    /// `injection = injection_complete - post_complete`
    pub fn injection_ms(&self) -> Option<u64> {
        match (self.post_complete, self.injection_complete) {
            (Some(a), Some(b)) => Some(Self::clamped_ms(a, b)),
            _ => None,
        }
    }

    /// `total = injection_complete - capture_start`
    pub fn total_ms(&self) -> Option<u64> {
        self.injection_complete
            .map(|t| Self::clamped_ms(self.capture_start, t))
    }
}

/// A single dictation session. Created on `start`, discarded (or reported)
/// by the time the state machine returns to `Idle`.
pub struct Session {
    pub id: SessionId,
    pub timestamps: SessionTimestamps,
    pub buffer: StreamingAudioBuffer,
    pub surface: SurfaceClass,
    pub is_terminal_paste: bool,
    pub language: Option<String>,
    pub raw_text: Option<String>,
    pub final_text: Option<String>,
    pub used_fallback: bool,
    pub provider_tag: Option<String>,
    pub confidence: Option<f32>,
    pub audio_duration_s: f64,
    /// Set once the VAD observes the session's first speech onset — the
    /// signal that an empty final transcript is a provider failure, not
    /// genuine silence (§4.4 policy point 5 vs. the rescue path).
    pub speech_detected: bool,
    /// True once a streaming provider has been started for this session;
    /// `dispatch_stt` skips the batch chain entirely when set.
    pub streaming: bool,
    pub streaming_final_text: String,
}

impl Session {
    pub fn new(id: SessionId, surface: SurfaceClass, max_bytes: usize, now: Instant) -> Self {
        Self {
            id,
            timestamps: SessionTimestamps::new(now),
            buffer: StreamingAudioBuffer::new(max_bytes),
            surface,
            is_terminal_paste: false,
            language: None,
            raw_text: None,
            final_text: None,
            used_fallback: false,
            provider_tag: None,
            confidence: None,
            audio_duration_s: 0.0,
            speech_detected: false,
            streaming: false,
            streaming_final_text: String::new(),
        }
    }

    /// Takes the accumulated audio out of the session (leaving an empty
    /// buffer behind) and seals it into an in-memory WAV container. This is
    /// the `audio` field of a `TranscribeRequest` for batch providers.
    ///
    /// Unlike consuming `self`, this lets the engine hold onto the rest of
    /// the session (id, timestamps, surface) while the sealed bytes go off
    /// to a dispatcher on another thread.
    pub fn take_wav(&mut self, sample_rate: u32) -> Result<Vec<u8>> {
        let buffer = std::mem::replace(&mut self.buffer, StreamingAudioBuffer::new(0));
        seal_pcm_to_wav(buffer, sample_rate)
    }

    /// Seals a snapshot of the audio accumulated so far without disturbing
    /// the buffer, for a periodic partial transcript while capture continues.
    pub fn peek_wav(&self, sample_rate: u32) -> Result<Vec<u8>> {
        seal_pcm_bytes_to_wav(self.buffer.snapshot(), sample_rate)
    }
}

/// Wraps accumulated PCM16LE mono audio into an in-memory RIFF/WAVE
/// container, consuming the buffer.
pub fn seal_pcm_to_wav(buffer: StreamingAudioBuffer, sample_rate: u32) -> Result<Vec<u8>> {
    seal_pcm_bytes_to_wav(buffer.seal(), sample_rate)
}

fn seal_pcm_bytes_to_wav(pcm: Vec<u8>, sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 64));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| DictationError::Internal(format!("wav header write: {e}")))?;
        for frame in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([frame[0], frame[1]]);
            writer
                .write_sample(sample)
                .map_err(|e| DictationError::Internal(format!("wav sample write: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| DictationError::Internal(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;
    use std::time::Duration;

    #[test]
    fn timestamps_clamp_and_derive_correctly() {
        let t0 = Instant::now();
        let mut ts = SessionTimestamps::new(t0);
        assert_eq!(ts.stt_ms(), None);
        ts.stt_complete = Some(t0 + Duration::from_millis(100));
        ts.post_complete = Some(t0 + Duration::from_millis(150));
        ts.injection_complete = Some(t0 + Duration::from_millis(160));
        assert_eq!(ts.stt_ms(), Some(100));
        assert_eq!(ts.post_ms(), Some(50));
        assert_eq!(ts.injection_ms(), Some(10));
        assert_eq!(ts.total_ms(), Some(160));
    }

    #[test]
    fn seal_to_wav_produces_a_valid_riff_header() {
        let mut session = Session::new(SessionId(1), SurfaceClass::Default, 1 << 20, Instant::now());
        session
            .buffer
            .push(Chunk {
                samples: vec![0u8; 3200],
                seq: 0,
                is_final: true,
                rms_db: -100.0,
            })
            .unwrap();
        let wav = session.take_wav(16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }
}
