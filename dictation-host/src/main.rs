//! Dictation engine host — a thin CLI binding over `dictation-core`.
//!
//! There's no desktop shell here (no tray icon, no global hotkey hook, no
//! webview): the host reads commands from stdin and forwards engine events
//! to structured log lines. It exists to prove the core's external seam
//! (§6) end to end, the same way the teacher's Tauri app wires hotkeys and
//! windows to `DictumEngine` — just without the windowing.

mod settings;

use std::io::BufRead;

use clap::Parser;
use dictation_core::config::ConfigRecord;
use dictation_core::delivery::TextDelivery;
use dictation_core::engine::events::EngineEvent;
use dictation_core::interfaces::{CredentialStore, Notifier, SettingsStore};
use dictation_core::postprocess::chat_provider::{ChatProvider, ChatProviderConfig};
use dictation_core::postprocess::PostProcessPipeline;
use dictation_core::stt::cloud_batch::{CloudBatchConfig, CloudBatchProvider};
use dictation_core::stt::cloud_streaming::{AudioFormat, CloudStreamingConfig, CloudStreamingProvider};
use dictation_core::stt::local::{LocalModelConfig, LocalProvider};
use dictation_core::stt::stub::StubProvider;
use dictation_core::stt::{Provider, STTDispatcher};
use dictation_core::{Engine, EngineConfig};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use settings::{default_settings_path, EnvCredentialStore, FileSettingsStore, StdoutNotifier};

#[derive(Parser)]
#[command(name = "dictation-host", about = "CLI host for the dictation engine core")]
struct Cli {
    /// Path to the JSON settings file (defaults to the platform config dir).
    #[arg(long)]
    settings: Option<std::path::PathBuf>,

    /// Log transcript text (overrides the settings file's privacy.logTranscripts).
    #[arg(long)]
    log_transcripts: bool,
}

fn build_dispatcher(config: &ConfigRecord) -> STTDispatcher {
    use dictation_core::config::PreferredProvider;

    let mut providers = Vec::new();
    for tag in &config.stt.providers {
        match tag.as_str() {
            "local" => {
                providers.push(Provider::Local(Box::new(LocalProvider::new(
                    LocalModelConfig::default(),
                ))));
            }
            "cloud-batch" | "cloud" => match EnvCredentialStore.get("openai") {
                Ok(Some(api_key)) => {
                    let mut cloud_config = CloudBatchConfig::openai(api_key);
                    if let Some(endpoint) = &config.stt.cloud_endpoint {
                        cloud_config.endpoint = endpoint.clone();
                    }
                    if let Some(model_id) = &config.stt.cloud_model_id {
                        cloud_config.model_id = model_id.clone();
                    }
                    match CloudBatchProvider::new(cloud_config) {
                        Ok(provider) => providers.push(Provider::CloudBatch(Box::new(provider))),
                        Err(e) => warn!(error = %e, "failed to construct the configured cloud batch provider"),
                    }
                }
                _ => warn!("cloud-batch provider configured but no openai credential is available"),
            },
            "cloud-streaming" | "streaming" => match &config.stt.cloud_ws_url {
                Some(ws_url) => {
                    let streaming_config = CloudStreamingConfig {
                        ws_url: ws_url.clone(),
                        model_id: config
                            .stt
                            .cloud_model_id
                            .clone()
                            .unwrap_or_else(|| "default".into()),
                        audio_format: AudioFormat::Pcm,
                        vad: true,
                        tag: "cloud-streaming".into(),
                    };
                    match CloudStreamingProvider::new(streaming_config) {
                        Ok(provider) => providers.push(Provider::CloudStreaming(Box::new(provider))),
                        Err(e) => warn!(error = %e, "failed to construct the configured cloud streaming provider"),
                    }
                }
                None => warn!("cloud-streaming provider configured but no websocket URL is set"),
            },
            other => warn!(tag = other, "unknown STT provider tag, skipping"),
        }
    }
    if providers.is_empty() {
        warn!("no STT provider could be constructed, falling back to the stub provider");
        providers.push(Provider::Local(Box::new(StubProvider::new())));
    }

    let mut dispatcher = STTDispatcher::new(providers, config.stt.cloud_fallback_threshold);
    dispatcher.set_streaming_enabled(matches!(
        config.stt.preferred_provider,
        PreferredProvider::CloudStreaming
    ));
    dispatcher
}

fn build_postprocess(config: &ConfigRecord) -> PostProcessPipeline {
    let mut pipeline = PostProcessPipeline::new(
        config.postprocess.enabled,
        config.postprocess.stages.clone(),
        config.postprocess.continue_on_error,
        config.postprocess.total_budget_ms,
    );
    if let Ok(Some(api_key)) = EnvCredentialStore.get("openai") {
        let chat_config = ChatProviderConfig {
            api_key: Some(api_key),
            tag: "chat-openai".into(),
            ..ChatProviderConfig::default()
        };
        match ChatProvider::new(chat_config) {
            Ok(provider) => pipeline.register_provider("chat-openai", Box::new(provider)),
            Err(e) => warn!(error = %e, "failed to construct the configured chat post-process provider"),
        }
    }
    pipeline
}

fn log_event(event: EngineEvent, notifier: &dyn Notifier) {
    match event {
        EngineEvent::StateChanged { state, detail } => {
            info!(?state, ?detail, "state-changed");
        }
        EngineEvent::SessionStarted { session_id } => {
            info!(%session_id, "session-started");
        }
        EngineEvent::Transcript(update) => {
            info!(
                session_id = update.session_id,
                kind = ?update.kind,
                text = update.text.as_str(),
                "transcript-update"
            );
        }
        EngineEvent::SessionCompleted(completed) => {
            info!(
                session_id = completed.session_id,
                used_fallback = completed.used_fallback,
                provider = ?completed.provider,
                budget_exceeded = completed.budget_exceeded,
                total_ms = ?completed.latency.total_ms,
                "session-completed"
            );
        }
        EngineEvent::ClipboardOnly { session_id, text, reason } => {
            warn!(%session_id, reason = reason.as_str(), "clipboard-only");
            notifier.notify("Dictation copied to clipboard", &text);
        }
        EngineEvent::Error { kind, message } => {
            warn!(?kind, detail = message.as_str(), "engine-error");
            notifier.notify("Dictation error", &message);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let store = FileSettingsStore::new(settings_path.clone());
    let mut config = store.read().unwrap_or_else(|e| {
        warn!(error = %e, path = ?settings_path, "falling back to default configuration");
        ConfigRecord::default()
    });
    config.normalize();

    let log_transcripts = cli.log_transcripts || config.privacy.log_transcripts;
    tracing_subscriber::registry()
        .with(dictation_core::logging::RedactingLogger::stdout(
            "dictation-host",
            log_transcripts,
        ))
        .init();

    info!(path = ?settings_path, "dictation-host starting");

    let mut engine_config = EngineConfig::default();
    engine_config.config = config.clone();

    let dispatcher = build_dispatcher(&config);
    let postprocess = build_postprocess(&config);
    let delivery = TextDelivery::new(config.delivery.terminal_paste_chord.clone());

    let engine = Engine::new(engine_config, dispatcher, postprocess, delivery);
    let notifier = StdoutNotifier;

    let mut events = engine.subscribe();
    std::thread::spawn(move || {
        loop {
            match events.try_recv() {
                Ok(event) => log_event(event, &notifier),
                Err(tokio::sync::broadcast::error::TryRecvError::Empty) => {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "event receiver lagged");
                }
                Err(tokio::sync::broadcast::error::TryRecvError::Closed) => break,
            }
        }
    });

    println!("commands: toggle | paste | cancel | reset | quit");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match line.trim() {
            "toggle" => engine.toggle(),
            "paste" => engine.paste_as_terminal(),
            "cancel" => engine.cancel(),
            "reset" => engine.reset(),
            "quit" | "exit" => break,
            "" => continue,
            other => println!("unknown command: {other}"),
        }
    }

    Ok(())
}
