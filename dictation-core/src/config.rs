//! The configuration record (§6) and the engine's audio/VAD tuning knobs.
//!
//! `EngineConfig` is the in-process, already-validated form; `ConfigRecord`
//! is the serde-facing shape a [`crate::interfaces::SettingsStore`] yields.
//! Only `normalize()` is the core's job — reading/writing the backing file
//! is the host's.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferredProvider {
    Local,
    CloudBatch,
    CloudStreaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadMode {
    Energy,
    Neural,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttConfig {
    pub preferred_provider: PreferredProvider,
    pub providers: Vec<String>,
    pub cloud_fallback_threshold: f32,
    pub language: Option<String>,
    pub streaming_chunk_ms: u32,
    /// Overrides `CloudBatchConfig`/`CloudStreamingConfig`'s built-in
    /// defaults when set; `None` means "use the provider's own default".
    pub cloud_endpoint: Option<String>,
    pub cloud_model_id: Option<String>,
    pub cloud_ws_url: Option<String>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            preferred_provider: PreferredProvider::Local,
            providers: vec!["local".into()],
            cloud_fallback_threshold: 0.85,
            language: None,
            streaming_chunk_ms: 100,
            cloud_endpoint: None,
            cloud_model_id: None,
            cloud_ws_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub device: Option<String>,
    pub silence_timeout_s: u32,
    pub silence_threshold_db: f32,
    pub vad_mode: VadMode,
    pub mute_while_recording: bool,
    pub gain: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            silence_timeout_s: 30,
            silence_threshold_db: -40.0,
            vad_mode: VadMode::Energy,
            mute_while_recording: false,
            gain: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub name: String,
    pub provider_tag: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostProcessConfig {
    pub enabled: bool,
    pub stages: Vec<StageConfig>,
    pub continue_on_error: bool,
    pub total_budget_ms: u64,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stages: Vec::new(),
            continue_on_error: true,
            total_budget_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    pub terminal_paste_chord: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            terminal_paste_chord: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsThresholds {
    pub stt_ms: u64,
    pub post_ms: u64,
    pub total_ms: u64,
}

impl Default for MetricsThresholds {
    fn default() -> Self {
        Self {
            stt_ms: 1500,
            post_ms: 250,
            total_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyConfig {
    pub log_transcripts: bool,
    pub store_audio_locally: bool,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            log_transcripts: false,
            store_audio_locally: false,
        }
    }
}

/// The full configuration record, §6. `#[serde(default)]` lets a settings
/// store yield a partial JSON document and still get sane fallbacks for
/// every field, the same contract `AppSettings` uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigRecord {
    pub stt: SttConfig,
    pub audio: AudioConfig,
    pub postprocess: PostProcessConfig,
    pub delivery: DeliveryConfig,
    pub metrics: MetricsThresholds,
    pub privacy: PrivacyConfig,
}

impl ConfigRecord {
    /// Clamps out-of-range values rather than rejecting the whole record.
    pub fn normalize(&mut self) {
        self.stt.cloud_fallback_threshold = self.stt.cloud_fallback_threshold.clamp(0.0, 1.0);
        self.audio.gain = self.audio.gain.clamp(0.0, 2.0);
        if !matches!(self.audio.silence_timeout_s, 0 | 30 | 60) {
            self.audio.silence_timeout_s = 30;
        }
        self.postprocess.total_budget_ms = self.postprocess.total_budget_ms.max(1);
    }
}

/// Runtime tuning derived from [`ConfigRecord`] plus hardcoded operational
/// defaults the spec leaves to implementation discretion (hysteresis
/// window sizes, chunk duration). Grounded on the teacher's `EngineConfig`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub target_sample_rate: u32,
    pub chunk_ms: u32,
    /// consecutive non-speech chunks required to enter Silent (§4.3: ≥3)
    pub silence_hysteresis_chunks: u32,
    /// hard byte ceiling for a SessionBuffer (§5: default 10 minutes of audio)
    pub max_utterance_bytes: usize,
    pub config: ConfigRecord,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let target_sample_rate = 16_000;
        let bytes_per_second = target_sample_rate as usize * 2; // mono, 16-bit
        Self {
            target_sample_rate,
            chunk_ms: 100,
            silence_hysteresis_chunks: 3,
            max_utterance_bytes: bytes_per_second * 600,
            config: ConfigRecord::default(),
        }
    }
}

impl EngineConfig {
    pub fn chunk_bytes(&self) -> usize {
        // floor(sample_rate * channels * (bits/8) * chunk_ms / 1000), channels=1, bits=16
        (self.target_sample_rate as u64 * 2 * self.chunk_ms as u64 / 1000) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chunk_bytes_is_3200() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk_bytes(), 3200);
    }

    #[test]
    fn normalize_clamps_out_of_range_fields() {
        let mut record = ConfigRecord::default();
        record.stt.cloud_fallback_threshold = 4.0;
        record.audio.gain = -1.0;
        record.audio.silence_timeout_s = 45;
        record.normalize();
        assert_eq!(record.stt.cloud_fallback_threshold, 1.0);
        assert_eq!(record.audio.gain, 0.0);
        assert_eq!(record.audio.silence_timeout_s, 30);
    }
}
