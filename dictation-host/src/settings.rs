//! Host-side implementations of the core's collaborator traits (§6):
//! a JSON-file `SettingsStore`, an environment-variable `CredentialStore`,
//! and a stdout `Notifier`. Grounded on the teacher's `settings.rs` —
//! same `read_to_string` + `serde_json` + `unwrap_or_default` shape —
//! minus the Tauri-specific `save_settings`/`RuntimeSettings` split, since
//! this host never writes settings back (that's a future settings UI's job).

use std::fs;
use std::path::{Path, PathBuf};

use dictation_core::config::ConfigRecord;
use dictation_core::error::{DictationError, Result};
use dictation_core::interfaces::{CredentialStore, Notifier, SettingsStore};

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Dictation Engine")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("dictation-engine")
            .join("settings.json")
    }
}

pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SettingsStore for FileSettingsStore {
    fn read(&self) -> Result<ConfigRecord> {
        read_config(&self.path)
    }
}

fn read_config(path: &Path) -> Result<ConfigRecord> {
    let raw = fs::read_to_string(path)
        .map_err(|e| DictationError::Config(format!("reading {path:?}: {e}")))?;
    let mut record: ConfigRecord = serde_json::from_str(&raw)
        .map_err(|e| DictationError::Config(format!("parsing {path:?}: {e}")))?;
    record.normalize();
    Ok(record)
}

/// Looks up `DICTATION_<PROVIDER>_API_KEY` (provider tag upper-cased, `-`
/// turned into `_`). Provisioning credentials any other way is a future
/// settings UI's job, not this host's.
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn get(&self, provider_tag: &str) -> Result<Option<String>> {
        let var = format!(
            "DICTATION_{}_API_KEY",
            provider_tag.to_ascii_uppercase().replace('-', "_")
        );
        Ok(std::env::var(var).ok().filter(|s| !s.is_empty()))
    }
}

pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn notify(&self, title: &str, body: &str) {
        println!("[{title}] {body}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_file_is_a_config_error() {
        let store = FileSettingsStore::new(PathBuf::from("/nonexistent/dictation-settings.json"));
        assert!(store.read().is_err());
    }

    #[test]
    fn unset_credential_env_var_yields_none() {
        std::env::remove_var("DICTATION_TESTPROVIDER_API_KEY");
        let store = EnvCredentialStore;
        assert_eq!(store.get("testprovider").unwrap(), None);
    }
}
