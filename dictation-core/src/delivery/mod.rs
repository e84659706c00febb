//! TextDelivery — clipboard-first delivery to the focused surface (§4.6).
//!
//! Grounded on the teacher's Windows clipboard-paste injector, with its
//! keystroke-per-character Unicode fallback dropped: delivery attempts a
//! paste at most once and falls back to a `clipboard-only` outcome rather
//! than ever typing characters individually.

#[cfg(target_os = "windows")]
pub mod windows;

use tracing::warn;

use crate::error::{DictationError, Result};
use crate::session::SurfaceClass;

/// Why a paste attempt did not happen or did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardOnlyReason {
    /// No paste mechanism is wired up on this platform/build.
    PasteUnavailable,
    /// A paste mechanism exists but the attempt failed (tool error, refused focus).
    PasteRefused,
}

impl ClipboardOnlyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ClipboardOnlyReason::PasteUnavailable => "paste_unavailable",
            ClipboardOnlyReason::PasteRefused => "paste_refused",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Pasted,
    ClipboardOnly { reason: ClipboardOnlyReason },
}

/// A single paste attempt's low-level result, reported by a platform backend.
pub(crate) enum PasteAttempt {
    Succeeded,
    Unavailable,
    Refused,
}

pub struct TextDelivery {
    terminal_paste_chord: Option<String>,
}

impl TextDelivery {
    pub fn new(terminal_paste_chord: Option<String>) -> Self {
        Self { terminal_paste_chord }
    }

    /// Places `text` on the clipboard, then attempts exactly one paste
    /// appropriate to `surface`. Clipboard is populated regardless of
    /// whether the paste attempt succeeds (§4.6 invariant).
    pub fn deliver(&self, text: &str, surface: SurfaceClass) -> Result<DeliveryOutcome> {
        set_clipboard_text(text)?;

        let attempt = attempt_paste(surface, self.terminal_paste_chord.as_deref());
        match attempt {
            PasteAttempt::Succeeded => Ok(DeliveryOutcome::Pasted),
            PasteAttempt::Unavailable => {
                warn!("paste mechanism unavailable; clipboard-only fallback");
                Ok(DeliveryOutcome::ClipboardOnly {
                    reason: ClipboardOnlyReason::PasteUnavailable,
                })
            }
            PasteAttempt::Refused => {
                warn!(surface = ?surface, "paste attempt refused; clipboard-only fallback");
                Ok(DeliveryOutcome::ClipboardOnly {
                    reason: ClipboardOnlyReason::PasteRefused,
                })
            }
        }
    }
}

#[cfg(target_os = "windows")]
fn set_clipboard_text(text: &str) -> Result<()> {
    windows::set_clipboard_unicode_text(text)
        .map_err(|e| DictationError::Internal(format!("clipboard write failed: {e}")))
}

#[cfg(not(target_os = "windows"))]
fn set_clipboard_text(_text: &str) -> Result<()> {
    // No clipboard backend wired up on this platform/build; the caller still
    // gets a well-formed outcome (clipboard-only) rather than a hard error.
    Ok(())
}

#[cfg(target_os = "windows")]
fn attempt_paste(surface: SurfaceClass, terminal_paste_chord: Option<&str>) -> PasteAttempt {
    windows::attempt_paste(surface, terminal_paste_chord)
}

#[cfg(not(target_os = "windows"))]
fn attempt_paste(_surface: SurfaceClass, _terminal_paste_chord: Option<&str>) -> PasteAttempt {
    PasteAttempt::Unavailable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_match_the_wire_contract() {
        assert_eq!(ClipboardOnlyReason::PasteUnavailable.as_str(), "paste_unavailable");
        assert_eq!(ClipboardOnlyReason::PasteRefused.as_str(), "paste_refused");
    }

    #[cfg(not(target_os = "windows"))]
    #[test]
    fn delivery_without_a_platform_backend_is_clipboard_only() {
        let delivery = TextDelivery::new(None);
        let outcome = delivery.deliver("hello world", SurfaceClass::Default).unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::ClipboardOnly {
                reason: ClipboardOnlyReason::PasteUnavailable
            }
        );
    }
}
