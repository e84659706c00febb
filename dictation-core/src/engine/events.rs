//! Event types the engine broadcasts to subscribers (§4.7, §6).
//!
//! Mirrors the teacher's `ipc::events` shape — camelCase/lowercase serde so
//! the host can forward these to a UI unchanged — minus the IPC-channel
//! framing, which is the host's concern, not the core's.

use serde::{Deserialize, Serialize};

pub use crate::session::SessionTimestamps;
use crate::delivery::ClipboardOnlyReason;
use crate::error::ErrorKind;
use crate::session::SessionId;

/// The state machine's states (§4.7's transition table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DictationState {
    Idle,
    Starting,
    Listening,
    Stopping,
    Processing,
    Injecting,
    Error,
}

/// Derived latency view over a session's timestamps, the shape `MetricsTracker`
/// hands to `session-completed` subscribers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMetrics {
    pub stt_ms: Option<u64>,
    pub post_ms: Option<u64>,
    pub injection_ms: Option<u64>,
    pub total_ms: Option<u64>,
}

impl LatencyMetrics {
    pub fn from_timestamps(ts: &SessionTimestamps) -> Self {
        Self {
            stt_ms: ts.stt_ms(),
            post_ms: ts.post_ms(),
            injection_ms: ts.injection_ms(),
            total_ms: ts.total_ms(),
        }
    }
}

/// Emitted once a session reaches `Idle` with delivered (or clipboard-only)
/// text — the `session-completed` event of §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCompleted {
    pub session_id: u64,
    pub text: String,
    pub latency: LatencyMetrics,
    pub used_fallback: bool,
    pub provider: Option<String>,
    pub budget_exceeded: bool,
}

/// Whether a [`TranscriptEvent`] is a live, still-revisable guess or the
/// settled text for its stage (§4.4/§8 — interim updates during `Listening`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Partial,
    Final,
}

/// An interim or final transcript surfaced while a session is still in
/// flight — streamed providers emit these as updates arrive; the local batch
/// path emits a throttled partial against the accumulated (unsealed) audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub session_id: u64,
    pub text: String,
    pub kind: TranscriptKind,
}

/// The single sum-type the engine broadcasts; one coordinator, one channel,
/// consumers filter by variant rather than subscribing to many channels.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged {
        state: DictationState,
        detail: Option<String>,
    },
    SessionStarted {
        session_id: SessionId,
    },
    Transcript(TranscriptEvent),
    SessionCompleted(SessionCompleted),
    ClipboardOnly {
        session_id: SessionId,
        text: String,
        reason: ClipboardOnlyReason,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}
