//! Audio capture via cpal backend (§4.1).
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated (TIME_CRITICAL on
//! Windows) priority. It **must not**:
//! - Allocate heap memory
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! This module satisfies that contract by writing directly into an SPSC ring buffer
//! producer whose `push_slice` is lock-free and allocation-free. Gain and resampling
//! happen on the consuming (pipeline) side, where allocation is fine.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! The low-level [`AudioCapture`] handle therefore must be created and dropped on the
//! same thread. [`AudioSource`] is the higher-level, spec-facing handle built on top.

pub mod device;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use ringbuf::{traits::Split, HeapRb};
pub use ringbuf::traits::{Consumer, Producer};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{DictationError, Result};
use resample::RateConverter;

pub type AudioProducer = ringbuf::HeapProd<f32>;
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// 2^22 f32 samples ≈ 87.4 s at 48 kHz — enough headroom for a long utterance
/// to survive while final inference runs without the callback stalling.
const RING_CAPACITY: usize = 1 << 22;

fn create_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// The target format `AudioSource::frames()` always produces: mono PCM16LE.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Device selection per §4.1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    Default,
    Named(String),
}

#[derive(Debug, Clone)]
pub struct AudioSourceConfig {
    pub device: DeviceSelector,
    pub mute_during_other_output: bool,
    pub gain: f32,
}

impl Default for AudioSourceConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::Default,
            mute_during_other_output: false,
            gain: 1.0,
        }
    }
}

/// Handle to an active audio capture stream.
///
/// **Not `Send`** — `cpal::Stream` is bound to its creation thread on Windows/macOS.
/// Create and drop this type on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    running: Arc<AtomicBool>,
    pub sample_rate: u32,
}

impl AudioCapture {
    /// Opens an input device by preferred name, otherwise falls back to the
    /// default input device and then the first available device.
    #[cfg(feature = "audio-cpal")]
    pub fn open_with_preference(
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
        gain: f32,
    ) -> Result<Self> {
        use cpal::traits::HostTrait;

        let host = cpal::default_host();
        let mut devices: Vec<(String, cpal::Device)> = host
            .input_devices()
            .map_err(|e| DictationError::Device(e.to_string()))?
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                (name, device)
            })
            .collect();
        if devices.is_empty() {
            return Err(DictationError::NoDefaultInputDevice);
        }

        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let preferred_idx = preferred_device_name.and_then(|preferred| {
            devices
                .iter()
                .position(|(name, _)| name.as_str() == preferred)
        });
        let default_idx = default_name
            .as_deref()
            .and_then(|name| devices.iter().position(|(n, _)| n.as_str() == name));
        let best_non_loopback_idx = devices
            .iter()
            .enumerate()
            .filter(|(_, (name, _))| !device::is_loopback_like_name(name))
            .max_by_key(|(_, (name, _))| device::mic_preference_score(name))
            .map(|(idx, _)| idx);

        if preferred_device_name.is_some() && preferred_idx.is_none() {
            warn!(
                "preferred input device '{}' not found, falling back",
                preferred_device_name.unwrap_or_default()
            );
        }

        let selected_idx = if let Some(idx) = preferred_idx {
            if device::is_loopback_like_name(&devices[idx].0) {
                best_non_loopback_idx.unwrap_or(idx)
            } else {
                idx
            }
        } else if let Some(idx) = default_idx {
            if device::is_loopback_like_name(&devices[idx].0) {
                best_non_loopback_idx.unwrap_or(idx)
            } else {
                idx
            }
        } else if let Some(idx) = best_non_loopback_idx {
            warn!("no default input device, falling back to best available microphone input");
            idx
        } else {
            warn!("no default microphone input device, falling back to first available input");
            0
        };

        let (selected_name, device) = devices.swap_remove(selected_idx);
        info!(device = selected_name.as_str(), "opening input device");

        let supported = device
            .default_input_config()
            .map_err(|e| DictationError::Device(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "audio config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let running_f32 = Arc::clone(&running);
        let running_i16 = Arc::clone(&running);
        let running_u8 = Arc::clone(&running);
        // Wider than the config-level 0..2 clamp so the runtime gain boost
        // (`adaptive_input_gain_boost`) isn't silently clipped away here.
        let gain = gain.clamp(0.0, 8.0);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _info| {
                        if !running_f32.load(Ordering::Relaxed) {
                            return;
                        }
                        downmix_and_gain(data, ch, gain, &mut mix_buf);
                        push_or_warn(&mut producer, &mix_buf, "f32");
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }
            SampleFormat::I16 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _info| {
                        if !running_i16.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        if ch == 1 {
                            for (idx, sample) in data.iter().take(frames).enumerate() {
                                mix_buf[idx] = *sample as f32 / 32768.0 * gain;
                            }
                        } else {
                            for f in 0..frames {
                                let mut sum = 0f32;
                                let base = f * ch;
                                for c in 0..ch {
                                    sum += data[base + c] as f32 / 32768.0;
                                }
                                mix_buf[f] = sum / ch as f32 * gain;
                            }
                        }
                        push_or_warn(&mut producer, &mix_buf, "i16");
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }
            SampleFormat::U8 => {
                let ch = channels as usize;
                let mut mix_buf: Vec<f32> = Vec::new();
                device.build_input_stream(
                    &config,
                    move |data: &[u8], _info| {
                        if !running_u8.load(Ordering::Relaxed) {
                            return;
                        }
                        let frames = data.len() / ch;
                        mix_buf.resize(frames, 0.0);
                        if ch == 1 {
                            for (idx, sample) in data.iter().take(frames).enumerate() {
                                mix_buf[idx] = (*sample as f32 - 128.0) / 128.0 * gain;
                            }
                        } else {
                            for f in 0..frames {
                                let mut sum = 0f32;
                                let base = f * ch;
                                for c in 0..ch {
                                    sum += (data[base + c] as f32 - 128.0) / 128.0;
                                }
                                mix_buf[f] = sum / ch as f32 * gain;
                            }
                        }
                        push_or_warn(&mut producer, &mix_buf, "u8");
                    },
                    |err| error!("audio stream error: {err}"),
                    None,
                )
            }
            fmt => {
                return Err(DictationError::Device(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| DictationError::Device(e.to_string()))?;

        stream.play().map_err(|e| DictationError::Device(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }

    #[cfg(feature = "audio-cpal")]
    pub fn open_default(producer: AudioProducer, running: Arc<AtomicBool>, gain: f32) -> Result<Self> {
        Self::open_with_preference(producer, running, None, gain)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
        _gain: f32,
    ) -> Result<Self> {
        Err(DictationError::Device(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn open_default(_producer: AudioProducer, _running: Arc<AtomicBool>, _gain: f32) -> Result<Self> {
        Err(DictationError::Device(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

const ADAPTIVE_GAIN_ENV_VAR: &str = "DICTATION_INPUT_GAIN_BOOST";
const ADAPTIVE_GAIN_MIN: f32 = 0.5;
const ADAPTIVE_GAIN_MAX: f32 = 4.0;

/// Runtime-adjustable multiplier layered on top of the configured gain, so a
/// quiet microphone can be boosted without touching the settings file. Reads
/// `DICTATION_INPUT_GAIN_BOOST` fresh on every `AudioSource::start()` call;
/// unset or unparsable falls back to 1.0 (no boost).
fn adaptive_input_gain_boost() -> f32 {
    std::env::var(ADAPTIVE_GAIN_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .map(|v| v.clamp(ADAPTIVE_GAIN_MIN, ADAPTIVE_GAIN_MAX))
        .unwrap_or(1.0)
}

#[cfg(feature = "audio-cpal")]
fn downmix_and_gain(data: &[f32], channels: usize, gain: f32, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.clear();
        out.extend(data.iter().map(|s| s * gain));
        return;
    }
    let frames = data.len() / channels;
    out.resize(frames, 0.0);
    for f in 0..frames {
        let mut sum = 0f32;
        let base = f * channels;
        for c in 0..channels {
            sum += data[base + c];
        }
        out[f] = sum / channels as f32 * gain;
    }
}

#[cfg(feature = "audio-cpal")]
fn push_or_warn(producer: &mut AudioProducer, samples: &[f32], format_tag: &str) {
    let written = producer.push_slice(samples);
    if written < samples.len() {
        warn!(
            "ring buffer full: dropped {} {format_tag} frames",
            samples.len() - written
        );
    }
}

/// The spec-facing capture handle: opens a device, produces mono PCM16LE at
/// [`TARGET_SAMPLE_RATE`], and delivers `Device`-class errors via `on_error`.
///
/// `start`/`stop`/`frames`/`on_error` — §4.1. The cpal stream lives on its own
/// OS thread (spawned internally) so the handle itself stays `Send`.
pub struct AudioSource {
    config: AudioSourceConfig,
    running: Arc<AtomicBool>,
    consumer: Option<AudioConsumer>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
    resampler: RateConverter,
    error_sink: Arc<Mutex<Option<Box<dyn Fn(DictationError) + Send>>>>,
    last_error: Arc<Mutex<Option<DictationError>>>,
    capture_rate: Arc<std::sync::atomic::AtomicU32>,
}

impl AudioSource {
    pub fn new(config: AudioSourceConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            consumer: None,
            capture_thread: None,
            resampler: RateConverter::new(TARGET_SAMPLE_RATE, TARGET_SAMPLE_RATE, 1600)
                .expect("identity resampler never fails to construct"),
            error_sink: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
            capture_rate: Arc::new(std::sync::atomic::AtomicU32::new(TARGET_SAMPLE_RATE)),
        }
    }

    /// Registers a callback for `Device`-class errors (device lost, overrun).
    pub fn on_error(&mut self, callback: impl Fn(DictationError) + Send + 'static) {
        *self.error_sink.lock().unwrap() = Some(Box::new(callback));
    }

    /// Idempotent against an already-running source: calling `start` twice
    /// without an intervening `stop` is a `Device`-kind failure.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(DictationError::Device(
                "audio source already running".into(),
            ));
        }
        self.running.store(true, Ordering::Release);

        if self.config.mute_during_other_output {
            // Best-effort hint only; no cross-platform ducking API is wired up.
            tracing::debug!("mute_during_other_output requested (no-op on this backend)");
        }

        let (producer, consumer) = create_ring();
        self.consumer = Some(consumer);

        let running = Arc::clone(&self.running);
        let gain = self.config.gain.clamp(0.0, 2.0) * adaptive_input_gain_boost();
        let preferred = match &self.config.device {
            DeviceSelector::Default => None,
            DeviceSelector::Named(name) => Some(name.clone()),
        };
        let error_sink = Arc::clone(&self.error_sink);
        let last_error = Arc::clone(&self.last_error);
        let capture_rate = Arc::clone(&self.capture_rate);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32>>();

        let handle = std::thread::Builder::new()
            .name("dictation-audio-capture".into())
            .spawn(move || {
                let opened = AudioCapture::open_with_preference(
                    producer,
                    Arc::clone(&running),
                    preferred.as_deref(),
                    gain,
                );
                match opened {
                    Ok(capture) => {
                        capture_rate.store(capture.sample_rate, Ordering::Release);
                        let _ = ready_tx.send(Ok(capture.sample_rate));
                        while running.load(Ordering::Acquire) {
                            std::thread::sleep(Duration::from_millis(20));
                        }
                        capture.stop();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(clone_device_err(&e)));
                        *last_error.lock().unwrap() = Some(clone_device_err(&e));
                        if let Some(cb) = error_sink.lock().unwrap().as_ref() {
                            cb(e);
                        }
                    }
                }
            })
            .map_err(|e| DictationError::Device(format!("spawn capture thread: {e}")))?;

        self.capture_thread = Some(handle);

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(capture_rate)) => {
                self.resampler = RateConverter::new(capture_rate, TARGET_SAMPLE_RATE, 1600)?;
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::Release);
                Err(DictationError::Device(
                    "timed out waiting for capture device to open".into(),
                ))
            }
        }
    }

    /// Graceful stop: signals the callback to quiesce and joins the capture
    /// thread, capped at 200 ms per §4.1.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.capture_thread.take() {
            let deadline = Instant::now() + Duration::from_millis(200);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            // Join regardless — by now the callback has either quiesced or
            // the 200 ms cap has elapsed and joining is just a formality.
            let _ = handle.join();
        }
    }

    /// Drains whatever capture has produced so far, resampled to 16 kHz and
    /// gain-applied already at capture time, returned as PCM16LE bytes ready
    /// for [`crate::chunker::Chunker::append`]. Empty until capture delivers
    /// its first frame; finite once `stop` has completed.
    pub fn frames(&mut self) -> Vec<u8> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Vec::new();
        };
        const SCRATCH: usize = 8192;
        let mut raw = Vec::new();
        let mut scratch = vec![0f32; SCRATCH];
        loop {
            let popped = consumer.pop_slice(&mut scratch);
            raw.extend_from_slice(&scratch[..popped]);
            if popped < SCRATCH {
                break;
            }
        }
        if raw.is_empty() {
            return Vec::new();
        }

        let resampled = self.resampler.process(&raw);
        resampled
            .iter()
            .flat_map(|s| {
                let clamped = s.clamp(-1.0, 1.0);
                let sample = (clamped * i16::MAX as f32).round() as i16;
                sample.to_le_bytes()
            })
            .collect()
    }

    /// The most recent `Device`-class error observed by the capture thread, if any.
    pub fn last_error(&self) -> Option<DictationError> {
        self.last_error.lock().unwrap().as_ref().map(clone_device_err)
    }
}

fn clone_device_err(e: &DictationError) -> DictationError {
    match e {
        DictationError::Device(s) => DictationError::Device(s.clone()),
        DictationError::NoDefaultInputDevice => DictationError::NoDefaultInputDevice,
        other => DictationError::Device(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_twice_without_stop_is_a_device_error() {
        let mut source = AudioSource::new(AudioSourceConfig::default());
        // Force the running flag as if a prior start succeeded, without
        // actually opening a device (keeps this test hardware-independent).
        source.running.store(true, Ordering::Release);
        let err = source.start().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Device);
    }

    #[test]
    fn frames_before_start_is_empty() {
        let mut source = AudioSource::new(AudioSourceConfig::default());
        assert!(source.frames().is_empty());
    }

    #[test]
    fn gain_is_clamped_into_range() {
        let config = AudioSourceConfig {
            gain: 5.0,
            ..AudioSourceConfig::default()
        };
        assert_eq!(config.gain, 5.0); // config itself is unclamped...
        assert_eq!(config.gain.clamp(0.0, 2.0), 2.0); // ...clamping happens at use site
    }
}
