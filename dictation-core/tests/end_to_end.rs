//! End-to-end seed scenarios, driven against the public API directly rather
//! than through a live `Engine` + `AudioSource`: there's no microphone in a
//! test environment, so these stitch the same stages the coordinator runs
//! (seal → dispatch → post-process → deliver) using scripted providers, the
//! way `dictum_core`'s own pipeline tests stub out the model and VAD.

use std::time::{Duration, Instant};

use dictation_core::config::StageConfig;
use dictation_core::delivery::{ClipboardOnlyReason, DeliveryOutcome, TextDelivery};
use dictation_core::postprocess::{PostProcessContext, PostProcessPipeline, PostProcessProvider};
use dictation_core::session::{Session, SessionId, SurfaceClass};
use dictation_core::stt::{BatchProvider, Provider, STTDispatcher, TranscribeRequest, TranscribeResult};
use dictation_core::{DictationError, ErrorKind};

struct ScriptedBatch {
    tag: &'static str,
    result: Result<TranscribeResult, DictationError>,
}

impl BatchProvider for ScriptedBatch {
    fn tag(&self) -> &str {
        self.tag
    }

    fn transcribe_batch(&mut self, _request: &TranscribeRequest) -> dictation_core::Result<TranscribeResult> {
        match &self.result {
            Ok(r) => Ok(r.clone()),
            Err(DictationError::Auth(s)) => Err(DictationError::Auth(s.clone())),
            Err(DictationError::NetworkTransient(s)) => Err(DictationError::NetworkTransient(s.clone())),
            Err(other) => Err(DictationError::Internal(other.to_string())),
        }
    }
}

fn transcribed(text: &str, confidence: f32, tag: &str) -> TranscribeResult {
    TranscribeResult {
        text: text.into(),
        confidence: Some(confidence),
        language: None,
        duration_s: 3.0,
        latency_ms: 5,
        provider_tag: tag.into(),
        language_probability: None,
        words: None,
    }
}

/// Builds a session with 3 seconds of silent PCM16LE already buffered, as if
/// capture had just stopped on a VAD silence timeout.
fn session_with_speech() -> Session {
    let mut session = Session::new(SessionId(1), SurfaceClass::Default, 1 << 20, Instant::now());
    session
        .buffer
        .push(dictation_core::Chunk {
            samples: vec![0u8; 16_000 * 2 * 3],
            seq: 0,
            is_final: true,
            rms_db: -20.0,
        })
        .expect("buffer within ceiling");
    session
}

fn request_from(session: &mut Session) -> TranscribeRequest {
    let wav = session.take_wav(16_000).unwrap();
    let duration_s = wav.len() as f64 / (16_000.0 * 2.0);
    TranscribeRequest {
        audio: wav,
        sample_rate: 16_000,
        language: session.language.clone(),
        model_id: None,
        duration_s,
    }
}

/// Scenario 1: happy batch local — single confident provider, post-process
/// disabled, delivery succeeds (clipboard-only on this platform, which is
/// itself still a successful delivery per §4.6/§8, not an error).
#[test]
fn happy_batch_local() {
    let mut session = session_with_speech();
    let request = request_from(&mut session);

    let mut dispatcher = STTDispatcher::new(
        vec![Provider::Local(Box::new(ScriptedBatch {
            tag: "local",
            result: Ok(transcribed("hello world", 0.92, "local")),
        }))],
        0.85,
    );
    let (result, used_fallback) = dispatcher.dispatch_batch(&request).unwrap();
    let result = result.expect("non-empty transcript");
    assert_eq!(result.text, "hello world");
    assert!(!used_fallback);
    session.timestamps.stt_complete = Some(Instant::now());

    let mut pipeline = PostProcessPipeline::new(false, Vec::new(), true, 1000);
    let ctx = PostProcessContext::new(
        session.surface,
        session.language.clone(),
        result.confidence,
        session.audio_duration_s,
        None,
    );
    let post = pipeline.run(&result.text, &ctx);
    assert!(!post.processed);
    assert_eq!(post.text, "hello world");
    session.timestamps.post_complete = Some(Instant::now());

    let delivery = TextDelivery::new(None);
    let outcome = delivery.deliver(&post.text, session.surface).unwrap();
    session.timestamps.injection_complete = Some(Instant::now());

    assert!(matches!(
        outcome,
        DeliveryOutcome::Pasted | DeliveryOutcome::ClipboardOnly { .. }
    ));
    assert!(session.timestamps.capture_start <= session.timestamps.stt_complete.unwrap());
    assert!(session.timestamps.stt_complete.unwrap() <= session.timestamps.post_complete.unwrap());
    assert!(session.timestamps.post_complete.unwrap() <= session.timestamps.injection_complete.unwrap());
}

/// Scenario 2: hybrid fallback — low-confidence local yields to a confident
/// cloud provider; the dispatcher records `used_fallback`.
#[test]
fn hybrid_fallback_on_low_confidence() {
    let mut session = session_with_speech();
    let request = request_from(&mut session);

    let mut dispatcher = STTDispatcher::new(
        vec![
            Provider::Local(Box::new(ScriptedBatch {
                tag: "local",
                result: Ok(transcribed("hllo wrld", 0.60, "local")),
            })),
            Provider::CloudBatch(Box::new(ScriptedBatch {
                tag: "cloud",
                result: Ok(transcribed("hello world", 0.97, "cloud")),
            })),
        ],
        0.85,
    );
    let (result, used_fallback) = dispatcher.dispatch_batch(&request).unwrap();
    let result = result.unwrap();
    assert_eq!(result.text, "hello world");
    assert_eq!(result.provider_tag, "cloud");
    assert!(used_fallback);
}

/// Scenario 3: streaming cancel — a session abandoned mid-flight never
/// reaches a terminal `SessionCompleted`; this is the dispatcher-level half
/// of that guarantee — nothing downstream of cancellation runs at all
/// because the coordinator never calls it (`Coordinator::abandon_session`
/// drops the session before dispatch). What's left to verify here is that a
/// session with no sealed audio (capture aborted before any chunk arrived)
/// cannot even produce a non-empty request — there's nothing to dispatch.
#[test]
fn cancelled_before_any_audio_yields_nothing_to_dispatch() {
    let mut session = Session::new(SessionId(7), SurfaceClass::Default, 1 << 20, Instant::now());
    let wav = session.take_wav(16_000).unwrap();
    // An empty buffer still seals to a valid (header-only) WAV; dispatch is
    // simply never invoked by a coordinator that abandoned the session first.
    assert_eq!(&wav[0..4], b"RIFF");
}

struct SlowThenFast;
impl PostProcessProvider for SlowThenFast {
    fn tag(&self) -> &str {
        "slow"
    }
    fn refine(&mut self, text: &str, _ctx: &PostProcessContext) -> dictation_core::Result<(String, Duration)> {
        std::thread::sleep(Duration::from_millis(1100));
        Ok((text.to_string(), Duration::from_millis(1100)))
    }
}

struct Annotate;
impl PostProcessProvider for Annotate {
    fn tag(&self) -> &str {
        "annotate"
    }
    fn refine(&mut self, text: &str, _ctx: &PostProcessContext) -> dictation_core::Result<(String, Duration)> {
        Ok((format!("{text}!"), Duration::from_millis(1)))
    }
}

/// Scenario 4: post-process budget overrun — stage one takes 1100ms against
/// a 1000ms total budget; stage two is skipped and the overrun is flagged.
#[test]
fn post_process_budget_overrun_skips_remaining_stages() {
    let mut pipeline = PostProcessPipeline::new(
        true,
        vec![
            StageConfig {
                name: "slow".into(),
                provider_tag: "slow".into(),
                enabled: true,
            },
            StageConfig {
                name: "annotate".into(),
                provider_tag: "annotate".into(),
                enabled: true,
            },
        ],
        true,
        1000,
    );
    pipeline.register_provider("slow", Box::new(SlowThenFast));
    pipeline.register_provider("annotate", Box::new(Annotate));

    let ctx = PostProcessContext::from_surface(SurfaceClass::Default, None);
    let result = pipeline.run("hello world", &ctx);

    assert!(result.budget_exceeded);
    assert_eq!(result.stages.len(), 1);
    assert!(result.stages[0].succeeded);
    assert_eq!(result.text, "hello world");
}

/// Scenario 5: clipboard-only fallback — on a platform with no paste
/// backend wired up, delivery always reports `clipboard-only` with
/// `paste_unavailable`, never an `error`.
#[test]
fn clipboard_only_when_paste_is_unavailable() {
    let delivery = TextDelivery::new(None);
    let outcome = delivery.deliver("hello world", SurfaceClass::Default).unwrap();
    assert_eq!(
        outcome,
        DeliveryOutcome::ClipboardOnly {
            reason: ClipboardOnlyReason::PasteUnavailable
        }
    );
}

/// Scenario 6: auth failure short-circuits the chain — the first of two
/// cloud providers returns 401; the second must never be invoked.
#[test]
fn auth_failure_short_circuits_before_second_provider() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TrackedBatch {
        tag: &'static str,
        invoked: Arc<AtomicBool>,
        result: Result<TranscribeResult, DictationError>,
    }
    impl BatchProvider for TrackedBatch {
        fn tag(&self) -> &str {
            self.tag
        }
        fn transcribe_batch(&mut self, _request: &TranscribeRequest) -> dictation_core::Result<TranscribeResult> {
            self.invoked.store(true, Ordering::SeqCst);
            match &self.result {
                Ok(r) => Ok(r.clone()),
                Err(DictationError::Auth(s)) => Err(DictationError::Auth(s.clone())),
                Err(other) => Err(DictationError::Internal(other.to_string())),
            }
        }
    }

    let second_invoked = Arc::new(AtomicBool::new(false));
    let mut dispatcher = STTDispatcher::new(
        vec![
            Provider::CloudBatch(Box::new(TrackedBatch {
                tag: "cloud-a",
                invoked: Arc::new(AtomicBool::new(false)),
                result: Err(DictationError::Auth("invalid api key".into())),
            })),
            Provider::CloudBatch(Box::new(TrackedBatch {
                tag: "cloud-b",
                invoked: Arc::clone(&second_invoked),
                result: Ok(transcribed("unreachable", 0.99, "cloud-b")),
            })),
        ],
        0.85,
    );

    let mut session = session_with_speech();
    let request = request_from(&mut session);
    let err = dispatcher.dispatch_batch(&request).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(!second_invoked.load(Ordering::SeqCst));
}
