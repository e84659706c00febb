//! Error taxonomy.
//!
//! One [`DictationError`] variant per [`ErrorKind`], following the same
//! closed-enum-plus-anyhow-catch-all shape the rest of the workspace uses.
//! `kind()` is how the dispatcher and state machine classify an error
//! without matching on variant names.

use std::path::PathBuf;
use std::time::Duration;

/// Coarse classification used for fallback/propagation policy (§7). Kept
/// distinct from the variant itself so callers can match on kind without
/// caring which concrete error produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Device,
    NetworkTransient,
    NetworkFatal,
    Auth,
    RateLimited,
    Cancelled,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum DictationError {
    #[error("configuration invalid or incomplete: {0}")]
    Config(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("no default input device available")]
    NoDefaultInputDevice,

    #[error("model not found at {path:?}")]
    ModelNotFound { path: PathBuf },

    #[error("network error: {0}")]
    NetworkTransient(String),

    #[error("network error (non-retryable): {0}")]
    NetworkFatal(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("rate limited{}", retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("engine already running")]
    AlreadyRunning,

    #[error("engine not running")]
    NotRunning,

    #[error("invalid state transition: {event} while in {state}")]
    IllegalTransition { state: String, event: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DictationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DictationError::Config(_) => ErrorKind::Config,
            DictationError::Device(_)
            | DictationError::NoDefaultInputDevice
            | DictationError::ModelNotFound { .. } => ErrorKind::Device,
            DictationError::NetworkTransient(_) => ErrorKind::NetworkTransient,
            DictationError::NetworkFatal(_) => ErrorKind::NetworkFatal,
            DictationError::Auth(_) => ErrorKind::Auth,
            DictationError::RateLimited { .. } => ErrorKind::RateLimited,
            DictationError::Cancelled => ErrorKind::Cancelled,
            DictationError::Internal(_)
            | DictationError::AlreadyRunning
            | DictationError::NotRunning
            | DictationError::IllegalTransition { .. }
            | DictationError::Io(_)
            | DictationError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Per §4.4 point 4: whether this error yields to the next provider in
    /// the fallback chain rather than short-circuiting the whole dispatch.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NetworkTransient | ErrorKind::RateLimited
        )
    }

    /// Maps an HTTP status code to an `ErrorKind` per §4.4's CloudBatchProvider table.
    pub fn from_http_status(status: u16, body_hint: impl Into<String>) -> Self {
        let hint = body_hint.into();
        match status {
            401 | 403 => DictationError::Auth(hint),
            429 => DictationError::RateLimited { retry_after: None },
            500..=599 => DictationError::NetworkTransient(hint),
            _ => DictationError::Internal(format!("unexpected status {status}: {hint}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, DictationError>;
