//! `Engine` — the single coordinator implementing the session state machine
//! (§4.7) and the concurrency model of §5.
//!
//! ## Threading
//!
//! One dedicated coordinator thread owns all session state and processes
//! events one at a time, exactly as §5 requires. Three kinds of work leave
//! that thread:
//!
//! - **Capture** gets its own thread for the lifetime of a session (it's the
//!   only stage genuinely concurrent with everything else — audio keeps
//!   arriving from hardware regardless of what the coordinator is doing).
//! - **STT dispatch**, **post-processing**, and **delivery** are strictly
//!   sequential — each needs the previous stage's output — so nothing is
//!   gained by fanning them out in parallel. They still run off the
//!   coordinator thread (via `std::thread::spawn`, guarded by
//!   `parking_lot::Mutex`) so a `cancel` arriving mid-stage is handled
//!   immediately rather than queued behind a blocking call.
//!
//! Public methods (`toggle`, `cancel`, `paste_as_terminal`) only push a
//! command into an unbounded channel and return; they never block on the
//! coordinator.

pub mod events;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::audio::{AudioSource, AudioSourceConfig, DeviceSelector};
use crate::chunker::{Chunk, Chunker};
use crate::config::{AudioConfig, EngineConfig, VadMode};
use crate::delivery::{DeliveryOutcome, TextDelivery};
use crate::error::{DictationError, ErrorKind, Result};
use crate::postprocess::{PostProcessContext, PostProcessPipeline, PostProcessResult};
use crate::session::{Session, SessionId, SurfaceClass};
use crate::stt::{STTDispatcher, StreamUpdate, TranscribeRequest, TranscribeResult};
use crate::vad::energy::EnergyVad;
use crate::vad::{SilenceDetector, VadEvent, VoiceActivityDetector};

use events::{DictationState, EngineEvent, LatencyMetrics, SessionCompleted, TranscriptEvent, TranscriptKind};

const BROADCAST_CAP: usize = 256;
/// Soft deadline for the capture thread to notice `stop` and exit (§5).
const CAPTURE_STOP_DEADLINE: Duration = Duration::from_millis(200);
const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Placeholder text substituted when every STT provider returns an empty
/// transcript despite the VAD having observed genuine speech — better than
/// silently discarding a session the user clearly spoke into.
const RESCUE_PLACEHOLDER_TEXT: &str = "[inaudible]";
/// Local-batch partial-transcript throttle (mirrors the streaming path's
/// natural interim cadence without hammering the provider every chunk).
const PARTIAL_MIN_INTERVAL: Duration = Duration::from_millis(1200);
const PARTIAL_MIN_NEW_BYTES: usize = 16_000;

/// External commands, sent by `Engine`'s public API.
enum Command {
    Toggle,
    PasteAsTerminal,
    Cancel,
    Reset,
}

/// Completions reported back by worker threads.
enum WorkerMsg {
    CaptureStarted,
    CaptureFailed(SessionId, DictationError),
    AudioChunk(SessionId, Chunk),
    /// Sent exactly once, on the session's first VAD speech onset.
    SpeechDetected(SessionId),
    SilenceTimeout(SessionId),
    CaptureStopped(SessionId),
    SttComplete(SessionId, Result<(Option<TranscribeResult>, bool)>),
    /// A throttled partial transcript from the local batch path.
    PartialTranscript(SessionId, String),
    PostComplete(SessionId, PostProcessResult),
    InjectionComplete(SessionId, Result<DeliveryOutcome>),
}

enum CoordinatorMsg {
    Command(Command),
    Worker(WorkerMsg),
}

/// Handle to the running engine. Cheap to clone the channel senders; the
/// coordinator thread itself is joined on `Drop`... no — `Engine` owns the
/// coordinator thread directly and is not `Clone`; share it behind an `Arc`
/// if multiple call sites need it (the host does this).
pub struct Engine {
    cmd_tx: Sender<CoordinatorMsg>,
    event_tx: broadcast::Sender<EngineEvent>,
    state: Arc<Mutex<DictationState>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        dispatcher: STTDispatcher,
        postprocess: PostProcessPipeline,
        delivery: TextDelivery,
    ) -> Self {
        let (cmd_tx, cmd_rx) = unbounded::<CoordinatorMsg>();
        let (event_tx, _) = broadcast::channel(BROADCAST_CAP);
        let state = Arc::new(Mutex::new(DictationState::Idle));

        let worker_tx = cmd_tx.clone();
        let coordinator_event_tx = event_tx.clone();
        let coordinator_state = Arc::clone(&state);

        let handle = thread::Builder::new()
            .name("dictation-engine-coordinator".into())
            .spawn(move || {
                let mut coordinator = Coordinator {
                    state: DictationState::Idle,
                    state_handle: coordinator_state,
                    session: None,
                    session_stop_flag: None,
                    pending_terminal_paste: false,
                    pending_budget_exceeded: false,
                    session_counter: 0,
                    config,
                    dispatcher: Arc::new(Mutex::new(dispatcher)),
                    postprocess: Arc::new(Mutex::new(postprocess)),
                    delivery: Arc::new(delivery),
                    event_tx: coordinator_event_tx,
                    msg_tx: worker_tx,
                    last_final_text: None,
                    last_partial_emit: None,
                    bytes_at_last_partial: 0,
                };
                for msg in cmd_rx.iter() {
                    coordinator.handle(msg);
                }
            })
            .expect("failed to spawn coordinator thread");

        Self {
            cmd_tx,
            event_tx,
            state,
            coordinator: Mutex::new(Some(handle)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> DictationState {
        *self.state.lock()
    }

    /// Starts a session from `Idle`, or requests a graceful stop from
    /// `Listening`. A no-op in any other state (§4.7: transitional states
    /// ignore `toggle`).
    pub fn toggle(&self) {
        let _ = self.cmd_tx.send(CoordinatorMsg::Command(Command::Toggle));
    }

    /// Same gesture as `toggle`, but marks the session for terminal-style
    /// delivery regardless of surface auto-detection (bound to its own
    /// hotkey per §6).
    pub fn paste_as_terminal(&self) {
        let _ = self
            .cmd_tx
            .send(CoordinatorMsg::Command(Command::PasteAsTerminal));
    }

    /// Valid in `{Listening, Stopping, Processing, Injecting}`; a no-op
    /// (not an error) in `Idle` (§8).
    pub fn cancel(&self) {
        let _ = self.cmd_tx.send(CoordinatorMsg::Command(Command::Cancel));
    }

    /// The only transition out of `Error` (§4.7).
    pub fn reset(&self) {
        let _ = self.cmd_tx.send(CoordinatorMsg::Command(Command::Reset));
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Dropping `cmd_tx`'s last clone would end the coordinator's `iter()`
        // loop, but `Coordinator` itself also holds a clone (`msg_tx`) so it
        // never observes a closed channel from the outside. Detach instead
        // of joining: a running capture thread may still be shutting down,
        // and `Engine` should never block its own destructor on it.
        if let Some(handle) = self.coordinator.lock().take() {
            drop(handle);
        }
    }
}

/// All state the coordinator thread owns exclusively. Never shared outside
/// this module — that's the point of routing everything through `handle`.
struct Coordinator {
    state: DictationState,
    state_handle: Arc<Mutex<DictationState>>,
    session: Option<Session>,
    session_stop_flag: Option<Arc<AtomicBool>>,
    pending_terminal_paste: bool,
    pending_budget_exceeded: bool,
    session_counter: u64,
    config: EngineConfig,
    dispatcher: Arc<Mutex<STTDispatcher>>,
    postprocess: Arc<Mutex<PostProcessPipeline>>,
    delivery: Arc<TextDelivery>,
    event_tx: broadcast::Sender<EngineEvent>,
    msg_tx: Sender<CoordinatorMsg>,
    /// The previous session's delivered text, for `PostProcessContext::previous_text`.
    last_final_text: Option<String>,
    last_partial_emit: Option<Instant>,
    bytes_at_last_partial: usize,
}

impl Coordinator {
    fn handle(&mut self, msg: CoordinatorMsg) {
        match msg {
            CoordinatorMsg::Command(cmd) => self.handle_command(cmd),
            CoordinatorMsg::Worker(msg) => self.handle_worker(msg),
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Toggle => match self.state {
                DictationState::Idle => self.start_session(),
                DictationState::Listening => self.begin_stop(),
                _ => {}
            },
            Command::PasteAsTerminal => match self.state {
                DictationState::Idle => {
                    self.pending_terminal_paste = true;
                    self.start_session();
                }
                DictationState::Listening => self.begin_stop(),
                _ => {}
            },
            Command::Cancel => {
                if matches!(
                    self.state,
                    DictationState::Listening
                        | DictationState::Stopping
                        | DictationState::Processing
                        | DictationState::Injecting
                ) {
                    self.abandon_session(DictationError::Cancelled);
                }
                // Idle/Error: no-op, returns success by construction (no error channel).
            }
            Command::Reset => {
                if matches!(self.state, DictationState::Error) {
                    self.session = None;
                    self.set_state(DictationState::Idle, None);
                }
            }
        }
    }

    fn handle_worker(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::CaptureStarted => {
                if matches!(self.state, DictationState::Starting) {
                    self.set_state(DictationState::Listening, None);
                }
            }
            WorkerMsg::CaptureFailed(session_id, err) => {
                if self.is_current(session_id) {
                    warn!(error = %err, "capture failed to start");
                    self.session = None;
                    self.session_stop_flag = None;
                    self.set_state(DictationState::Error, Some(err.to_string()));
                    self.emit(EngineEvent::Error {
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
            WorkerMsg::AudioChunk(session_id, chunk) => {
                if !self.is_current(session_id) {
                    return;
                }
                let samples = chunk.samples.clone();
                let is_streaming = self.session.as_ref().is_some_and(|s| s.streaming);
                if let Some(session) = &mut self.session {
                    if session.buffer.push(chunk).is_err() {
                        warn!("session buffer exceeded the byte ceiling; aborting session");
                        self.abandon_session(DictationError::Device(
                            "utterance exceeded the maximum buffered duration".into(),
                        ));
                        return;
                    }
                }
                if is_streaming {
                    self.forward_stream_chunk(session_id, &samples);
                } else if matches!(self.state, DictationState::Listening) {
                    self.maybe_dispatch_partial(session_id);
                }
            }
            WorkerMsg::SpeechDetected(session_id) => {
                if self.is_current(session_id) {
                    if let Some(session) = &mut self.session {
                        session.speech_detected = true;
                    }
                }
            }
            WorkerMsg::PartialTranscript(session_id, text) => {
                if self.is_current(session_id) {
                    self.emit(EngineEvent::Transcript(TranscriptEvent {
                        session_id: session_id.0,
                        text,
                        kind: TranscriptKind::Partial,
                    }));
                }
            }
            WorkerMsg::SilenceTimeout(session_id) => {
                if self.is_current(session_id) && matches!(self.state, DictationState::Listening) {
                    info!(%session_id, "silence timeout reached; stopping capture");
                    self.begin_stop();
                }
            }
            WorkerMsg::CaptureStopped(session_id) => {
                if self.is_current(session_id) && matches!(self.state, DictationState::Stopping) {
                    self.session_stop_flag = None;
                    self.set_state(DictationState::Processing, None);
                    self.dispatch_stt();
                }
                // Otherwise this is a stale notification from an already-cancelled
                // session; the capture thread still had to report in, but there's
                // nothing left to advance.
            }
            WorkerMsg::SttComplete(session_id, result) => {
                if !self.is_current(session_id) {
                    return;
                }
                self.on_stt_complete(result);
            }
            WorkerMsg::PostComplete(session_id, result) => {
                if !self.is_current(session_id) {
                    return;
                }
                self.on_post_complete(result);
            }
            WorkerMsg::InjectionComplete(session_id, result) => {
                if !self.is_current(session_id) {
                    return;
                }
                self.on_injection_complete(result);
            }
        }
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == session_id)
    }

    fn set_state(&mut self, new_state: DictationState, detail: Option<String>) {
        self.state = new_state;
        *self.state_handle.lock() = new_state;
        self.emit(EngineEvent::StateChanged {
            state: new_state,
            detail,
        });
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    // ── Session lifecycle ────────────────────────────────────────────────

    fn start_session(&mut self) {
        self.session_counter += 1;
        let id = SessionId(self.session_counter);
        let surface = SurfaceClass::Default; // host supplies real focus detection via interfaces
        let mut session = Session::new(id, surface, self.config.max_utterance_bytes, Instant::now());
        session.is_terminal_paste = std::mem::take(&mut self.pending_terminal_paste);
        session.language = self.config.config.stt.language.clone();

        let wants_streaming = self.dispatcher.lock().should_stream(true);
        if wants_streaming {
            let mut dispatcher = self.dispatcher.lock();
            session.streaming = match dispatcher.streaming_provider() {
                Some(provider) => match provider.start(session.language.as_deref(), None) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "streaming provider failed to start; using batch dispatch");
                        false
                    }
                },
                None => false,
            };
        }

        self.bytes_at_last_partial = 0;
        self.last_partial_emit = None;
        self.session = Some(session);
        self.set_state(DictationState::Starting, None);
        self.emit(EngineEvent::SessionStarted { session_id: id });

        let stop_flag = Arc::new(AtomicBool::new(false));
        self.session_stop_flag = Some(Arc::clone(&stop_flag));

        let audio_config = AudioSourceConfig {
            device: match &self.config.config.audio.device {
                Some(name) => DeviceSelector::Named(name.clone()),
                None => DeviceSelector::Default,
            },
            mute_during_other_output: self.config.config.audio.mute_while_recording,
            gain: self.config.config.audio.gain,
        };
        let vad = build_vad(&self.config.config.audio);
        let hysteresis = self.config.silence_hysteresis_chunks;
        let silence_timeout = Duration::from_secs(self.config.config.audio.silence_timeout_s as u64);
        let chunk_bytes = self.config.chunk_bytes();
        let msg_tx = self.msg_tx.clone();

        thread::Builder::new()
            .name("dictation-session-capture".into())
            .spawn(move || {
                run_session_capture(
                    id,
                    msg_tx,
                    stop_flag,
                    audio_config,
                    vad,
                    hysteresis,
                    silence_timeout,
                    chunk_bytes,
                )
            })
            .expect("failed to spawn capture thread");
    }

    /// Requests the capture thread wind down. `Stopping` covers both a
    /// user-initiated stop and a silence timeout (§4.7 — both transition the
    /// same way).
    fn begin_stop(&mut self) {
        if let Some(flag) = &self.session_stop_flag {
            flag.store(true, Ordering::Release);
        }
        self.set_state(DictationState::Stopping, None);
    }

    /// Drops the current session immediately — used by `cancel` and by hard
    /// failures. Per §8, `cancel` is silent: no notification, no
    /// `session-completed`.
    fn abandon_session(&mut self, reason: DictationError) {
        if let Some(flag) = &self.session_stop_flag {
            flag.store(true, Ordering::Release);
        }
        self.session_stop_flag = None;
        self.session = None;
        if matches!(reason.kind(), ErrorKind::Cancelled) {
            self.set_state(DictationState::Idle, None);
        } else {
            self.set_state(DictationState::Error, Some(reason.to_string()));
            self.emit(EngineEvent::Error {
                kind: reason.kind(),
                message: reason.to_string(),
            });
        }
    }

    fn dispatch_stt(&mut self) {
        let Some(session) = &self.session else { return };
        if session.streaming {
            self.finish_streaming_session();
            return;
        }

        let Some(session) = &mut self.session else { return };
        let id = session.id;
        let language = session.language.clone();
        let sample_rate = self.config.target_sample_rate;
        let wav = match session.take_wav(sample_rate) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.abandon_session(e);
                return;
            }
        };
        let duration_s = wav.len() as f64 / (sample_rate as f64 * 2.0);
        session.audio_duration_s = duration_s;
        let request = TranscribeRequest {
            audio: wav,
            sample_rate,
            language,
            model_id: None,
            duration_s,
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let msg_tx = self.msg_tx.clone();
        thread::spawn(move || {
            let result = dispatcher.lock().dispatch_batch(&request);
            let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::SttComplete(id, result)));
        });
    }

    /// Pushes an arriving chunk into the active streaming provider and
    /// forwards whatever `StreamUpdate`s come back. Non-blocking: the
    /// provider's socket I/O runs on its own tokio runtime, this call only
    /// enqueues bytes and drains already-ready updates.
    fn forward_stream_chunk(&mut self, session_id: SessionId, samples: &[u8]) {
        let updates = {
            let mut dispatcher = self.dispatcher.lock();
            match dispatcher.streaming_provider() {
                Some(provider) => match provider.push_chunk(samples) {
                    Ok(updates) => updates,
                    Err(e) => {
                        warn!(error = %e, "streaming provider rejected a chunk");
                        return;
                    }
                },
                None => return,
            }
        };
        for update in updates {
            self.on_stream_update(session_id, update);
        }
    }

    fn on_stream_update(&mut self, session_id: SessionId, update: StreamUpdate) {
        match update {
            StreamUpdate::Interim { text, .. } => {
                self.emit(EngineEvent::Transcript(TranscriptEvent {
                    session_id: session_id.0,
                    text,
                    kind: TranscriptKind::Partial,
                }));
            }
            StreamUpdate::Final { text, confidence } => {
                let accumulated = if let Some(session) = &mut self.session {
                    if !session.streaming_final_text.is_empty() && !text.is_empty() {
                        session.streaming_final_text.push(' ');
                    }
                    session.streaming_final_text.push_str(&text);
                    session.confidence = confidence.or(session.confidence);
                    session.streaming_final_text.clone()
                } else {
                    text
                };
                self.emit(EngineEvent::Transcript(TranscriptEvent {
                    session_id: session_id.0,
                    text: accumulated,
                    kind: TranscriptKind::Final,
                }));
            }
            StreamUpdate::Info(message) => {
                info!(message = message.as_str(), "streaming provider info message");
            }
        }
    }

    /// Ends the streaming session: signals `end()` to the provider, drains
    /// its last updates, and routes the accumulated final text straight to
    /// post-processing — the batch chain never runs for a streamed session.
    fn finish_streaming_session(&mut self) {
        let Some(id) = self.session.as_ref().map(|s| s.id) else { return };
        let updates = {
            let mut dispatcher = self.dispatcher.lock();
            match dispatcher.streaming_provider() {
                Some(provider) => provider.end().unwrap_or_default(),
                None => Vec::new(),
            }
        };
        for update in updates {
            self.on_stream_update(id, update);
        }

        let Some(session) = &mut self.session else { return };
        session.timestamps.stt_complete = Some(Instant::now());
        session.audio_duration_s = session.buffer.duration_s(self.config.target_sample_rate as usize * 2);
        let final_text = session.streaming_final_text.trim().to_string();
        if final_text.is_empty() {
            self.end_empty_transcript(false);
            return;
        }
        session.provider_tag = Some(
            self.dispatcher
                .lock()
                .streaming_provider()
                .map(|p| p.tag().to_string())
                .unwrap_or_else(|| "cloud-streaming".into()),
        );
        session.raw_text = Some(final_text.clone());
        session.final_text = Some(final_text.clone());
        self.dispatch_post(final_text);
    }

    /// Periodically seals a snapshot of the not-yet-final local-batch buffer
    /// and dispatches it for a throttled partial transcript, mirroring the
    /// cadence a streaming provider's interim updates would give for free.
    fn maybe_dispatch_partial(&mut self, session_id: SessionId) {
        let Some(session) = &self.session else { return };
        if !self.dispatcher.lock().has_batch_provider() {
            return;
        }
        let total_bytes = session.buffer.total_bytes();
        if total_bytes < self.bytes_at_last_partial + PARTIAL_MIN_NEW_BYTES {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_partial_emit {
            if now.duration_since(last) < PARTIAL_MIN_INTERVAL {
                return;
            }
        }
        let sample_rate = self.config.target_sample_rate;
        let wav = match session.peek_wav(sample_rate) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        self.bytes_at_last_partial = total_bytes;
        self.last_partial_emit = Some(now);
        let duration_s = wav.len() as f64 / (sample_rate as f64 * 2.0);
        let language = session.language.clone();
        let request = TranscribeRequest {
            audio: wav,
            sample_rate,
            language,
            model_id: None,
            duration_s,
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let msg_tx = self.msg_tx.clone();
        thread::spawn(move || {
            if let Ok((Some(result), _)) = dispatcher.lock().dispatch_batch(&request) {
                if !result.text.trim().is_empty() {
                    let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::PartialTranscript(
                        session_id,
                        result.text,
                    )));
                }
            }
        });
    }

    fn on_stt_complete(&mut self, result: Result<(Option<TranscribeResult>, bool)>) {
        let Some(session) = &mut self.session else { return };
        session.timestamps.stt_complete = Some(Instant::now());

        match result {
            Ok((None, used_fallback)) => self.end_empty_transcript(used_fallback),
            Ok((Some(transcribed), used_fallback)) => {
                session.raw_text = Some(transcribed.text.clone());
                session.final_text = Some(transcribed.text.clone());
                session.used_fallback = used_fallback;
                session.provider_tag = Some(transcribed.provider_tag.clone());
                session.confidence = transcribed.confidence;
                self.dispatch_post(transcribed.text);
            }
            Err(e) => self.abandon_session(e),
        }
    }

    /// Handles an empty final transcript (§4.4 policy point 5): ends the
    /// session quietly when the VAD never saw speech, or substitutes the
    /// rescue placeholder and continues through post-processing/delivery
    /// when the user clearly spoke and every provider still came back empty.
    fn end_empty_transcript(&mut self, used_fallback: bool) {
        let Some(session) = &mut self.session else { return };
        session.used_fallback = used_fallback;
        if session.speech_detected {
            warn!(id = %session.id, "providers returned an empty transcript after speech was detected; using rescue placeholder");
            session.raw_text = Some(String::new());
            session.final_text = Some(RESCUE_PLACEHOLDER_TEXT.to_string());
            session.provider_tag = Some("rescue".into());
            self.dispatch_post(RESCUE_PLACEHOLDER_TEXT.to_string());
        } else {
            self.session = None;
            self.session_stop_flag = None;
            self.set_state(DictationState::Idle, None);
        }
    }

    /// The surface delivery/post-processing should actually target: a
    /// terminal-paste request pins this regardless of surface auto-detection.
    fn effective_surface(session: &Session) -> SurfaceClass {
        if session.is_terminal_paste {
            SurfaceClass::Terminal
        } else {
            session.surface
        }
    }

    fn dispatch_post(&mut self, text: String) {
        let Some(session) = &self.session else { return };
        let id = session.id;
        let ctx = PostProcessContext::new(
            Self::effective_surface(session),
            session.language.clone(),
            session.confidence,
            session.audio_duration_s,
            self.last_final_text.clone(),
        );
        let postprocess = Arc::clone(&self.postprocess);
        let msg_tx = self.msg_tx.clone();
        thread::spawn(move || {
            let result = postprocess.lock().run(&text, &ctx);
            let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::PostComplete(id, result)));
        });
    }

    fn on_post_complete(&mut self, result: PostProcessResult) {
        let Some(session) = &mut self.session else { return };
        session.timestamps.post_complete = Some(Instant::now());
        session.final_text = Some(result.text.clone());
        self.pending_budget_exceeded = result.budget_exceeded;
        self.dispatch_delivery(result.text, result.budget_exceeded);
    }

    fn dispatch_delivery(&mut self, text: String, budget_exceeded: bool) {
        let Some(session) = &self.session else { return };
        let id = session.id;
        let surface = Self::effective_surface(session);
        let delivery = Arc::clone(&self.delivery);
        let msg_tx = self.msg_tx.clone();
        self.set_state(DictationState::Injecting, None);
        thread::spawn(move || {
            let result = delivery.deliver(&text, surface);
            let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::InjectionComplete(id, result)));
            if budget_exceeded {
                warn!(%id, "post-process budget exceeded; delivered best-effort text");
            }
        });
    }

    fn on_injection_complete(&mut self, result: Result<DeliveryOutcome>) {
        let Some(mut session) = self.session.take() else { return };
        session.timestamps.injection_complete = Some(Instant::now());
        self.session_stop_flag = None;
        self.last_final_text = session.final_text.clone();

        match result {
            Ok(DeliveryOutcome::ClipboardOnly { reason }) => {
                self.emit(EngineEvent::ClipboardOnly {
                    session_id: session.id,
                    text: session.final_text.clone().unwrap_or_default(),
                    reason,
                });
            }
            Err(e) => {
                self.emit(EngineEvent::Error {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
            Ok(DeliveryOutcome::Pasted) => {}
        }

        let latency = LatencyMetrics::from_timestamps(&session.timestamps);
        self.emit(EngineEvent::SessionCompleted(SessionCompleted {
            session_id: session.id.0,
            text: session.final_text.clone().unwrap_or_default(),
            latency,
            used_fallback: session.used_fallback,
            provider: session.provider_tag.clone(),
            budget_exceeded: std::mem::take(&mut self.pending_budget_exceeded),
        }));
        self.set_state(DictationState::Idle, None);
    }
}

/// Converts the configured dB threshold into the linear-amplitude unit
/// `EnergyVad` (and, clamped to `[0, 1]`, `SileroVad`'s probability
/// threshold) expect.
fn linear_threshold_from_db(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

fn build_vad(audio: &AudioConfig) -> Box<dyn VoiceActivityDetector> {
    let linear_threshold = linear_threshold_from_db(audio.silence_threshold_db);
    match audio.vad_mode {
        VadMode::Energy => Box::new(EnergyVad::new(linear_threshold, 8)),
        VadMode::Neural => {
            #[cfg(feature = "onnx")]
            {
                use crate::stt::local::default_models_dir;
                use crate::vad::silero::SileroVad;
                let path = default_models_dir().join("silero_vad.onnx");
                let neural_threshold = linear_threshold.clamp(0.0, 1.0);
                match SileroVad::new(&path, neural_threshold) {
                    Ok(vad) => return Box::new(vad),
                    Err(e) => {
                        warn!(error = %e, "SileroVad load failed, falling back to EnergyVad");
                    }
                }
            }
            #[cfg(not(feature = "onnx"))]
            warn!("neural VAD requested but built without the onnx feature; using EnergyVad");
            Box::new(EnergyVad::new(linear_threshold, 8))
        }
    }
}

/// Owns the capture/VAD/chunking loop for one session's lifetime. Runs on
/// its own thread, reports back exclusively via `msg_tx` — it never touches
/// `Session` or coordinator state directly (§5: chunks dropped here under
/// backpressure are dropped from the VAD path, never from `SessionBuffer`,
/// which this function never sees — the coordinator owns that).
#[allow(clippy::too_many_arguments)]
fn run_session_capture(
    id: SessionId,
    msg_tx: Sender<CoordinatorMsg>,
    stop_flag: Arc<AtomicBool>,
    audio_config: AudioSourceConfig,
    vad: Box<dyn VoiceActivityDetector>,
    hysteresis: u32,
    silence_timeout: Duration,
    chunk_bytes: usize,
) {
    let mut audio = AudioSource::new(audio_config);
    if let Err(e) = audio.start() {
        let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::CaptureFailed(id, e)));
        return;
    }
    let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::CaptureStarted));

    let mut chunker = Chunker::new(chunk_bytes);
    let mut detector = SilenceDetector::new(vad, hysteresis, silence_timeout);
    let mut silence_notified = false;
    let mut speech_notified = false;

    loop {
        if stop_flag.load(Ordering::Acquire) {
            break;
        }
        let bytes = audio.frames();
        if bytes.is_empty() {
            thread::sleep(CAPTURE_POLL_INTERVAL);
            continue;
        }
        for chunk in chunker.append(&bytes) {
            let samples = chunk.as_f32_samples();
            let events = detector.process(&samples, Instant::now());
            if !speech_notified && events.contains(&VadEvent::SpeechOnset) {
                speech_notified = true;
                let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::SpeechDetected(id)));
            }
            if msg_tx
                .send(CoordinatorMsg::Worker(WorkerMsg::AudioChunk(id, chunk)))
                .is_err()
            {
                return;
            }
            if !silence_notified && events.contains(&VadEvent::SilenceTimeout) {
                silence_notified = true;
                let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::SilenceTimeout(id)));
            }
        }
    }

    audio.stop();
    if let Some(last) = chunker.flush() {
        let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::AudioChunk(id, last)));
    }
    let _ = msg_tx.send(CoordinatorMsg::Worker(WorkerMsg::CaptureStopped(id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_from_idle_enters_starting_then_listening_or_error() {
        // Real hardware may not be present in CI; this only asserts the
        // coordinator accepts the command and leaves `Idle` without panicking.
        let config = EngineConfig::default();
        let dispatcher = STTDispatcher::new(Vec::new(), 0.85);
        let postprocess = PostProcessPipeline::new(false, Vec::new(), true, 1000);
        let delivery = TextDelivery::new(None);
        let engine = Engine::new(config, dispatcher, postprocess, delivery);
        engine.toggle();
        thread::sleep(Duration::from_millis(50));
        assert_ne!(engine.state(), DictationState::Idle);
    }

    #[test]
    fn cancel_in_idle_is_a_silent_no_op() {
        let config = EngineConfig::default();
        let dispatcher = STTDispatcher::new(Vec::new(), 0.85);
        let postprocess = PostProcessPipeline::new(false, Vec::new(), true, 1000);
        let delivery = TextDelivery::new(None);
        let engine = Engine::new(config, dispatcher, postprocess, delivery);
        engine.cancel();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.state(), DictationState::Idle);
    }
}
