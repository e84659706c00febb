//! LocalProvider — Whisper ONNX backend via the `ort` crate (§4.4).
//!
//! Targets the HuggingFace `optimum` separate encoder + decoder export:
//! - `encoder_model.onnx` — input `[1,80,3000]` → `last_hidden_state [1,1500,384]`
//! - `decoder_model.onnx` — `input_ids [1,seq]` + `encoder_hidden_states [1,1500,384]`
//!   → `logits [1,seq,vocab]`
//! - `tokenizer.json`     — HuggingFace fast tokenizer
//!
//! Mel frontend: 400-sample Hann window, 400-point FFT, 160-sample hop,
//! 80 mel bands over 0-8 kHz, 3000 frames (30 s). Greedy (argmax) decode,
//! stopping at EOT or `MAX_TOKENS`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array3;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::{TensorRef, Value};
use ort::{ep, inputs};
use rustfft::{num_complex::Complex, FftPlanner};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::{BatchProvider, TranscribeRequest, TranscribeResult};
use crate::error::{DictationError, Result};

const N_FFT: usize = 400;
const FFT_SIZE: usize = N_FFT;
const N_FREQS: usize = FFT_SIZE / 2 + 1;
const HOP: usize = 160;
const N_MELS: usize = 80;
const N_FRAMES: usize = 3_000;
const MEL_SAMPLES: usize = 480_000;

const EOT: i64 = 50257;
const SOT_FALLBACK: i64 = 50258;
const ENGLISH_FALLBACK: i64 = 50259;
const TRANSCRIBE_FALLBACK: i64 = 50359;
const NOTIMESTAMPS_FALLBACK: i64 = 50363;
const MAX_TOKENS: usize = 224;
const MIN_DECODE_STEPS_BEFORE_EOT: usize = 2;
const REPEAT_TOKEN_BREAK_THRESHOLD: usize = 14;

/// Where provider-specific env overrides and platform defaults put models.
/// `DICTATION_MODEL_DIR` wins outright; otherwise platform data dirs.
pub fn default_models_dir() -> PathBuf {
    if let Ok(explicit) = std::env::var("DICTATION_MODEL_DIR") {
        let trimmed = explicit.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("Dictation Engine").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("dictation-engine")
            .join("models")
    }
}

pub struct LocalModelConfig {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub decoder_with_past_path: Option<PathBuf>,
    pub tokenizer_path: PathBuf,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        let dir = default_models_dir();
        let decoder_with_past = dir.join("decoder_with_past_model.onnx");
        Self {
            encoder_path: dir.join("encoder_model.onnx"),
            decoder_path: dir.join("decoder_model.onnx"),
            decoder_with_past_path: decoder_with_past.exists().then_some(decoder_with_past),
            tokenizer_path: dir.join("tokenizer.json"),
        }
    }
}

fn create_session(model_path: &Path) -> Result<Session> {
    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = std::env::var("DICTATION_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(logical_cores.clamp(2, 12))
        .clamp(1, 32);

    let builder = SessionBuilder::new()
        .map_err(|e| DictationError::Device(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| DictationError::Device(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| DictationError::Device(e.to_string()))?
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(|e| DictationError::Device(e.to_string()))?;
    info!(intra_threads, logical_cores, "ONNX session threading configured");

    builder
        .commit_from_file(model_path)
        .map_err(|e| DictationError::Device(e.to_string()))
}

/// Whisper ONNX encoder/decoder, loaded lazily on first `transcribe_batch`
/// so constructing the dispatcher never touches the filesystem.
pub struct LocalProvider {
    config: LocalModelConfig,
    encoder: Option<Session>,
    decoder: Option<Session>,
    decoder_with_past: Option<Session>,
    tokenizer: Option<Tokenizer>,
    n_mels: usize,
    mel_filters: Vec<Vec<f32>>,
    hann_window: Vec<f32>,
    fft: Arc<dyn rustfft::Fft<f32>>,
    utterance_count: u64,
}

impl LocalProvider {
    pub fn new(config: LocalModelConfig) -> Self {
        let hann_window = build_hann_window(N_FFT);
        let mel_filters = build_mel_filters(FFT_SIZE, 16_000, N_MELS, 0.0, 8_000.0);
        let fft = Arc::from(FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE));
        Self {
            config,
            encoder: None,
            decoder: None,
            decoder_with_past: None,
            tokenizer: None,
            n_mels: N_MELS,
            mel_filters,
            hann_window,
            fft,
            utterance_count: 0,
        }
    }

    pub fn warm_up(&mut self) -> Result<()> {
        for path in [
            &self.config.encoder_path,
            &self.config.decoder_path,
            &self.config.tokenizer_path,
        ] {
            if !path.exists() {
                return Err(DictationError::ModelNotFound { path: path.clone() });
            }
        }
        info!(encoder = ?self.config.encoder_path, "loading local Whisper encoder");
        self.encoder = Some(create_session(&self.config.encoder_path)?);
        info!(decoder = ?self.config.decoder_path, "loading local Whisper decoder");
        self.decoder = Some(create_session(&self.config.decoder_path)?);
        if let Some(path) = self
            .config
            .decoder_with_past_path
            .as_ref()
            .filter(|p| p.exists())
        {
            self.decoder_with_past = Some(create_session(path)?);
        }
        self.tokenizer = Some(
            Tokenizer::from_file(&self.config.tokenizer_path)
                .map_err(|e| DictationError::Device(e.to_string()))?,
        );
        info!("local Whisper warm-up complete");
        Ok(())
    }

    fn is_warm(&self) -> bool {
        self.encoder.is_some() && self.decoder.is_some() && self.tokenizer.is_some()
    }

    fn log_mel_spectrogram(&self, samples: &[f32], active_samples: usize) -> Array3<f32> {
        let mut normalized = samples.to_vec();
        normalize_rms_in_place(&mut normalized, 0.10);
        let centered = reflect_pad(&normalized, N_FFT / 2);
        let active_samples = active_samples.min(MEL_SAMPLES);
        let active_frames = ((active_samples + N_FFT + HOP - 1) / HOP).clamp(1, N_FRAMES);

        let mut mel = Array3::<f32>::zeros((1, self.n_mels, N_FRAMES));
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); FFT_SIZE];

        for frame in 0..active_frames {
            let start = frame * HOP;
            for v in fft_buf.iter_mut() {
                *v = Complex::new(0.0, 0.0);
            }
            for i in 0..N_FFT {
                let s = centered.get(start + i).copied().unwrap_or(0.0);
                fft_buf[i] = Complex::new(s * self.hann_window[i], 0.0);
            }
            self.fft.process(&mut fft_buf);
            for m in 0..self.n_mels {
                let mut energy = 0.0f32;
                for k in 0..N_FREQS {
                    energy += self.mel_filters[m][k] * fft_buf[k].norm_sqr();
                }
                mel[[0, m, frame]] = energy;
            }
        }

        mel.mapv_inplace(|v| v.max(1e-10).log10());
        let max_val = mel.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        mel.mapv_inplace(|v| v.max(max_val - 8.0));
        mel.mapv_inplace(|v| (v + 4.0) / 4.0);
        mel
    }

    fn greedy_decode(&mut self, enc_data: &[f32], enc_n_frames: usize, enc_d_model: usize) -> Result<Vec<i64>> {
        let tokenizer = self.tokenizer.as_ref().expect("warmed up");
        let sot = token_id_or(tokenizer, "<|startoftranscript|>", SOT_FALLBACK);
        let lang = token_id_or(tokenizer, "<|en|>", ENGLISH_FALLBACK);
        let task = token_id_or(tokenizer, "<|transcribe|>", TRANSCRIBE_FALLBACK);
        let notimestamps = token_id_or(tokenizer, "<|notimestamps|>", NOTIMESTAMPS_FALLBACK);
        let prefix = vec![sot, lang, task, notimestamps];

        let decoder = self.decoder.as_mut().expect("warmed up");
        let mut tokens = prefix.clone();
        let mut repeated_token_count = 0usize;

        for step in 0..MAX_TOKENS {
            let seq = tokens.len();
            let input_ids = TensorRef::from_array_view(([1_i64, seq as i64], tokens.as_slice()))
                .map_err(|e| DictationError::Device(e.to_string()))?;
            let encoder_hidden_states = TensorRef::from_array_view((
                [1_i64, enc_n_frames as i64, enc_d_model as i64],
                enc_data,
            ))
            .map_err(|e| DictationError::Device(e.to_string()))?;
            let dec_out = decoder
                .run(inputs![
                    "input_ids" => input_ids,
                    "encoder_hidden_states" => encoder_hidden_states,
                ])
                .map_err(|e| DictationError::Device(e.to_string()))?;

            let (_, logit_data) = dec_out["logits"]
                .try_extract_tensor::<f32>()
                .map_err(|e| DictationError::Device(e.to_string()))?;
            let vocab_size = logit_data.len() / seq;
            let start = (seq - 1) * vocab_size;
            let last_row = &logit_data[start..start + vocab_size];

            let next = last_row
                .iter()
                .enumerate()
                .filter(|(i, _)| !(*i as i64 == EOT && step < MIN_DECODE_STEPS_BEFORE_EOT))
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(i, _)| i as i64)
                .unwrap_or(EOT);

            tokens.push(next);
            if tokens.len() >= 2 && tokens[tokens.len() - 2] == next {
                repeated_token_count += 1;
            } else {
                repeated_token_count = 0;
            }

            if next == EOT {
                break;
            }
            if repeated_token_count >= REPEAT_TOKEN_BREAK_THRESHOLD {
                debug!(repeated_token_count, "breaking decode early on repeated-token loop");
                break;
            }
        }

        Ok(tokens[prefix.len()..].to_vec())
    }
}

impl BatchProvider for LocalProvider {
    fn tag(&self) -> &str {
        "local"
    }

    fn transcribe_batch(&mut self, request: &TranscribeRequest) -> Result<TranscribeResult> {
        let started = Instant::now();
        if !self.is_warm() {
            self.warm_up()?;
        }

        let samples = decode_wav_to_f32(&request.audio)?;
        let active_samples = samples.len();
        let mel = self.log_mel_spectrogram(&samples, active_samples);
        let mel_val =
            Value::from_array(mel).map_err(|e: ort::Error| DictationError::Device(e.to_string()))?;

        let encoder = self.encoder.as_mut().expect("warmed up");
        let enc_out = encoder
            .run(inputs!["input_features" => mel_val])
            .map_err(|e| DictationError::Device(e.to_string()))?;
        let (shape, enc_data) = enc_out["last_hidden_state"]
            .try_extract_tensor::<f32>()
            .map_err(|e| DictationError::Device(e.to_string()))?;
        let enc_n_frames = shape[1] as usize;
        let enc_d_model = shape[2] as usize;
        let enc_data = enc_data.to_vec();

        let token_ids = self.greedy_decode(&enc_data, enc_n_frames, enc_d_model)?;
        let token_ids_u32: Vec<u32> = token_ids
            .iter()
            .filter(|&&t| t != EOT)
            .map(|&t| t as u32)
            .collect();
        let raw_text = self
            .tokenizer
            .as_ref()
            .expect("warmed up")
            .decode(&token_ids_u32, true)
            .map_err(|e| DictationError::Device(e.to_string()))?;
        let text = postprocess_transcript_text(&raw_text);

        self.utterance_count += 1;
        let audio_seconds = request.duration_s as f32;
        let confidence = estimate_segment_confidence(&text, audio_seconds);

        if confidence.map(|c| c < 0.1).unwrap_or(false) {
            warn!(text = %text, "local transcript scored very low confidence");
        }

        Ok(TranscribeResult {
            text,
            confidence,
            language: request.language.clone(),
            duration_s: request.duration_s,
            latency_ms: started.elapsed().as_millis() as u64,
            provider_tag: self.tag().to_string(),
            language_probability: None,
            words: None,
        })
    }
}

fn decode_wav_to_f32(wav_bytes: &[u8]) -> Result<Vec<f32>> {
    let reader = hound::WavReader::new(std::io::Cursor::new(wav_bytes))
        .map_err(|e| DictationError::Internal(format!("invalid WAV: {e}")))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .into_samples::<i16>()
            .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| DictationError::Internal(format!("invalid WAV samples: {e}")))?,
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| DictationError::Internal(format!("invalid WAV samples: {e}")))?,
    };
    Ok(samples)
}

fn token_id_or(tokenizer: &Tokenizer, token: &str, fallback: i64) -> i64 {
    tokenizer
        .token_to_id(token)
        .map(|id| id as i64)
        .unwrap_or(fallback)
}

fn postprocess_transcript_text(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let mut compact = String::with_capacity(trimmed.len() + 8);
    let mut prev_was_space = false;
    for ch in trimmed.chars() {
        if ch.is_whitespace() {
            if !prev_was_space {
                compact.push(' ');
            }
            prev_was_space = true;
            continue;
        }
        if matches!(ch, '.' | ',' | '!' | '?' | ';' | ':') && compact.ends_with(' ') {
            compact.pop();
        }
        compact.push(ch);
        prev_was_space = false;
    }
    let mut out = compact.trim().to_string();

    out = out
        .trim_start_matches(|ch: char| matches!(ch, ',' | ';' | ':' | '.' | '!' | '?'))
        .trim_start()
        .to_string();

    out = out
        .split_whitespace()
        .map(|w| if w == "i" { "I" } else { w })
        .collect::<Vec<_>>()
        .join(" ");

    out = capitalize_sentence_starts(&out);

    let has_terminal_punct = out.ends_with('.') || out.ends_with('!') || out.ends_with('?');
    let word_count = out.split_whitespace().count();
    if !has_terminal_punct && word_count >= 8 {
        out.push('.');
    }

    out
}

fn capitalize_sentence_starts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cap_next = true;
    for ch in text.chars() {
        if cap_next && ch.is_ascii_alphabetic() {
            out.push(ch.to_ascii_uppercase());
            cap_next = false;
        } else {
            out.push(ch);
            if ch.is_ascii_alphabetic() {
                cap_next = false;
            }
        }
        if matches!(ch, '.' | '!' | '?') {
            cap_next = true;
        }
    }
    out
}

fn is_degenerate_transcript_text(text: &str) -> bool {
    let words: Vec<String> = text
        .split_whitespace()
        .map(normalize_word_for_repetition)
        .filter(|w| !w.is_empty())
        .collect();
    if words.len() < 6 {
        return false;
    }
    let unique: HashSet<&str> = words.iter().map(|w| w.as_str()).collect();
    if unique.len() <= 2 && words.len() >= 6 {
        return true;
    }
    if words.len() >= 12 && unique.len().saturating_mul(100) / words.len() <= 30 {
        return true;
    }
    max_same_word_run(&words) >= 4
}

fn normalize_word_for_repetition(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '\'')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn max_same_word_run(words: &[String]) -> usize {
    if words.is_empty() {
        return 0;
    }
    let mut max_run = 1usize;
    let mut run = 1usize;
    for i in 1..words.len() {
        if words[i] == words[i - 1] {
            run += 1;
            max_run = max_run.max(run);
        } else {
            run = 1;
        }
    }
    max_run
}

fn likely_truncated_transcript(text: &str, audio_seconds: f32) -> bool {
    let words = text.split_whitespace().count();
    if audio_seconds >= 10.0 && words <= 8 {
        return true;
    }
    audio_seconds >= 6.0 && words <= 4
}

fn is_low_quality_transcript_text(text: &str, audio_seconds: f32) -> bool {
    if is_degenerate_transcript_text(text) {
        return true;
    }
    let words = text.split_whitespace().count();
    if audio_seconds >= 8.0 && words <= 1 {
        return true;
    }
    audio_seconds >= 14.0 && words <= 2
}

fn estimate_segment_confidence(text: &str, audio_seconds: f32) -> Option<f32> {
    if text.trim().is_empty() {
        return None;
    }
    let words = text.split_whitespace().count() as f32;
    let mut confidence = 0.52 + (words.min(18.0) * 0.02);
    if likely_truncated_transcript(text, audio_seconds) {
        confidence -= 0.18;
    }
    if is_low_quality_transcript_text(text, audio_seconds) {
        confidence -= 0.24;
    }
    Some(confidence.clamp(0.05, 0.98))
}

fn build_hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / n as f32).cos()))
        .collect()
}

fn build_mel_filters(fft_size: usize, sr: u32, n_mels: usize, fmin: f32, fmax: f32) -> Vec<Vec<f32>> {
    let n_freqs = fft_size / 2 + 1;
    let mel_min = hz_to_mel_slaney(fmin);
    let mel_max = hz_to_mel_slaney(fmax);

    let mel_pts: Vec<f32> = (0..=(n_mels + 1))
        .map(|i| mel_min + (mel_max - mel_min) * i as f32 / (n_mels + 1) as f32)
        .collect();
    let hz_pts: Vec<f32> = mel_pts.iter().map(|&m| mel_to_hz_slaney(m)).collect();
    let fft_freqs: Vec<f32> = (0..n_freqs)
        .map(|k| k as f32 * sr as f32 / fft_size as f32)
        .collect();

    let mut filters = vec![vec![0f32; n_freqs]; n_mels];
    for m in 0..n_mels {
        let lower = hz_pts[m];
        let center = hz_pts[m + 1];
        let upper = hz_pts[m + 2];
        let down_denom = (center - lower).max(1e-10);
        let up_denom = (upper - center).max(1e-10);
        let enorm = 2.0 / (upper - lower).max(1e-10);

        for (k, &freq) in fft_freqs.iter().enumerate() {
            let w = if freq >= lower && freq <= center {
                (freq - lower) / down_denom
            } else if freq > center && freq <= upper {
                (upper - freq) / up_denom
            } else {
                0.0
            };
            filters[m][k] = (w * enorm).max(0.0);
        }
    }
    filters
}

fn normalize_rms_in_place(samples: &mut [f32], target_rms: f32) {
    if samples.is_empty() {
        return;
    }
    let sum_sq = samples.iter().map(|s| s * s).sum::<f32>();
    let rms = (sum_sq / samples.len() as f32).sqrt();
    if rms <= 1e-6 {
        return;
    }
    let gain = (target_rms / rms).clamp(0.8, 15.0);
    if (gain - 1.0).abs() < 1e-3 {
        return;
    }
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    if pad == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return vec![0.0; pad * 2];
    }
    if samples.len() == 1 {
        return vec![samples[0]; samples.len() + pad * 2];
    }
    let n = samples.len() as isize;
    let mut out = Vec::with_capacity(samples.len() + 2 * pad);
    for i in -(pad as isize)..(n + pad as isize) {
        out.push(samples[reflect_index(i, samples.len())]);
    }
    out
}

fn reflect_index(mut i: isize, len: usize) -> usize {
    let max = len as isize - 1;
    while i < 0 || i > max {
        i = if i < 0 { -i } else { 2 * max - i };
    }
    i as usize
}

fn hz_to_mel_slaney(hz: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4_f32).ln() / 27.0;
    if hz >= min_log_hz {
        min_log_mel + (hz / min_log_hz).ln() / logstep
    } else {
        hz / f_sp
    }
}

fn mel_to_hz_slaney(mel: f32) -> f32 {
    let f_sp = 200.0 / 3.0;
    let min_log_hz = 1_000.0;
    let min_log_mel = min_log_hz / f_sp;
    let logstep = (6.4_f32).ln() / 27.0;
    if mel >= min_log_mel {
        min_log_hz * ((mel - min_log_mel) * logstep).exp()
    } else {
        mel * f_sp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hann_window_is_symmetric_and_zero_at_edges() {
        let win = build_hann_window(400);
        assert!(win[0].abs() < 1e-5);
        assert!((win[0] - win[399]).abs() < 1e-3);
    }

    #[test]
    fn mel_filters_cover_expected_band_count() {
        let filters = build_mel_filters(400, 16_000, 80, 0.0, 8_000.0);
        assert_eq!(filters.len(), 80);
        assert_eq!(filters[0].len(), 201);
    }

    #[test]
    fn reflect_pad_preserves_center_samples() {
        let samples = vec![1.0, 2.0, 3.0, 4.0];
        let padded = reflect_pad(&samples, 2);
        assert_eq!(&padded[2..6], &samples[..]);
    }

    #[test]
    fn degenerate_repetition_is_flagged() {
        assert!(is_degenerate_transcript_text("the the the the the the the"));
        assert!(!is_degenerate_transcript_text("the quick brown fox jumps over the lazy dog"));
    }

    #[test]
    fn confidence_drops_for_likely_truncated_text() {
        let full = estimate_segment_confidence("a reasonably long sentence with several words in it", 3.0);
        let truncated = estimate_segment_confidence("just four words here", 12.0);
        assert!(full.unwrap() > truncated.unwrap());
    }

    #[test]
    fn postprocess_adds_terminal_punctuation_for_long_phrases() {
        let out = postprocess_transcript_text("this is a reasonably long dictated sentence without punctuation");
        assert!(out.ends_with('.'));
        assert!(out.starts_with('T'));
    }
}
