//! Energy-based VAD: RMS threshold + hangover counter.
//!
//! 1. Compute RMS of the incoming chunk.
//! 2. If RMS ≥ `threshold` → emit `Speech`, reset hangover counter.
//! 3. If RMS < `threshold` and hangover counter > 0 → emit `Speech`,
//!    decrement counter (prevents clipping syllable endings).
//! 4. Otherwise → emit `Silence`.
//!
//! This is the cheap policy of §4.3's "Energy threshold" option; the
//! hysteresis/silence-timeout state machine itself lives one layer up in
//! [`super::SilenceDetector`] — this type only answers "is this one chunk
//! speech or not".

use super::{VadDecision, VoiceActivityDetector};

#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS amplitude threshold. Frames above this are considered speech.
    threshold: f32,
    /// Consecutive below-threshold frames to still emit `Speech` for, so a
    /// trailing syllable doesn't get clipped.
    hangover_frames: u32,
    hangover_counter: u32,
}

impl EnergyVad {
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            hangover_counter: 0,
        }
    }

    /// Runtime-updatable threshold, per §4.3's contract.
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(0.02, 8)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, samples: &[f32]) -> VadDecision {
        let rms = Self::rms(samples);

        if rms >= self.threshold {
            self.hangover_counter = self.hangover_frames;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_chunk(len: usize) -> Vec<f32> {
        vec![0.0f32; len]
    }

    fn loud_chunk(amplitude: f32, len: usize) -> Vec<f32> {
        vec![amplitude; len]
    }

    #[test]
    fn silence_below_threshold() {
        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(vad.classify(&silent_chunk(160)), VadDecision::Silence);
    }

    #[test]
    fn speech_above_threshold() {
        let mut vad = EnergyVad::new(0.02, 0);
        assert_eq!(vad.classify(&loud_chunk(0.5, 160)), VadDecision::Speech);
    }

    #[test]
    fn hangover_extends_speech() {
        let mut vad = EnergyVad::new(0.02, 3);
        assert_eq!(vad.classify(&loud_chunk(0.5, 160)), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_chunk(160)), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_chunk(160)), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_chunk(160)), VadDecision::Speech);
        assert_eq!(vad.classify(&silent_chunk(160)), VadDecision::Silence);
    }

    #[test]
    fn reset_clears_hangover() {
        let mut vad = EnergyVad::new(0.02, 5);
        vad.classify(&loud_chunk(0.5, 160));
        vad.reset();
        assert_eq!(vad.classify(&silent_chunk(160)), VadDecision::Silence);
    }

    #[test]
    fn empty_chunk_is_silence() {
        let mut vad = EnergyVad::default();
        assert_eq!(vad.classify(&[]), VadDecision::Silence);
    }

    #[test]
    fn rms_of_square_wave() {
        let samples: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let rms = EnergyVad::rms(&samples);
        assert!((rms - 0.5).abs() < 1e-5, "rms={rms}");
    }
}
