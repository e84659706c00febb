//! Collaborator interfaces the core consumes but never implements (§6).
//!
//! The core is host-agnostic: a hotkey, a settings file, an OS credential
//! vault, a model download manager, and a notification tray icon are all
//! platform concerns. These traits are the seam — `dictation-host` supplies
//! concrete implementations; the core only ever holds a `Box<dyn Trait>`.

use crate::config::ConfigRecord;
use crate::error::Result;

/// Delivers `toggle`/`paste-as-terminal` gestures from a global hotkey
/// registration. The core never polls; it reacts to `poll_event` only when
/// the host's event loop calls it (or the host wires a callback directly
/// into `Engine::toggle`/`Engine::paste_as_terminal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotkeyEvent {
    ToggleDictation,
    PasteAsTerminal,
}

pub trait HotkeySource: Send {
    /// Returns the next pending hotkey event, if any, without blocking.
    fn poll_event(&mut self) -> Option<HotkeyEvent>;
}

/// Read-only accessor for the configuration record. The core re-reads on
/// every `on_changed` notification rather than caching indefinitely —
/// settings changes take effect on the next session, never mid-session.
pub trait SettingsStore: Send + Sync {
    fn read(&self) -> Result<ConfigRecord>;
}

/// `get(provider_tag)` → secret, or `None` if absent. The core never writes
/// credentials — provisioning is entirely the host's/UI's responsibility.
pub trait CredentialStore: Send + Sync {
    fn get(&self, provider_tag: &str) -> Result<Option<String>>;
}

/// One entry in a model catalog. Opaque beyond identity and a display name —
/// download/extraction progress is the host's business, not the core's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
}

/// Opaque handle to a loaded model. The core only needs it to exist; what it
/// points to is provider-specific.
pub struct ModelHandle(pub String);

pub trait ModelCatalog: Send + Sync {
    fn list(&self) -> Result<Vec<ModelInfo>>;
    fn active(&self) -> Result<Option<String>>;
    fn load(&self, id: &str) -> Result<ModelHandle>;
}

/// Surfaces a non-fatal, user-visible event (e.g. the `clipboard-only`
/// fallback, or a `Config`/`Auth`/terminal `NetworkFatal` error per §7).
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHotkeySource(Option<HotkeyEvent>);
    impl HotkeySource for StubHotkeySource {
        fn poll_event(&mut self) -> Option<HotkeyEvent> {
            self.0.take()
        }
    }

    #[test]
    fn hotkey_source_yields_its_event_once() {
        let mut source = StubHotkeySource(Some(HotkeyEvent::ToggleDictation));
        assert_eq!(source.poll_event(), Some(HotkeyEvent::ToggleDictation));
        assert_eq!(source.poll_event(), None);
    }
}
