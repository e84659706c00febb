//! Dictation engine core.
//!
//! ```text
//! Microphone
//!   └─ AudioSource (spawn_blocking, !Send cpal::Stream)
//!        └─ SPSC ring buffer
//!             └─ Chunker (fixed-size PCM blocks, rolling RMS)
//!                  ├─ VAD (energy or neural) ──┐
//!                  └─ SessionBuffer            │ speech/silence verdicts drive
//!                       └─ sealed WAV ──► STTDispatcher ──► PostProcessPipeline
//!                                                                   │
//!                                                                   ▼
//!                                                            TextDelivery
//! ```
//!
//! The Engine is the single coordinator: a `SessionStateMachine` processing
//! one event at a time (external commands and worker completions share one
//! event sum type). Nothing outside the Engine mutates session state
//! directly. Long-running work — device I/O, model inference, HTTP/WS calls,
//! paste attempts — runs on worker contexts and reports back by channel.
#![warn(clippy::all)]

pub mod audio;
pub mod chunker;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod interfaces;
pub mod logging;
pub mod metrics;
pub mod postprocess;
pub mod session;
pub mod stt;
pub mod vad;

pub use chunker::{Chunk, Chunker, StreamingAudioBuffer};
pub use config::EngineConfig;
pub use engine::events::{
    DictationState, EngineEvent, LatencyMetrics, SessionCompleted, SessionTimestamps,
};
pub use engine::Engine;
pub use error::{DictationError, ErrorKind, Result};
pub use session::{Session, SessionId};
