//! CloudStreamingProvider — persistent bidirectional WebSocket STT (§4.4).
//!
//! Grounded on the teacher pack's speech-proxy command: a background task
//! owns the socket, forwarding outgoing audio from an mpsc channel and
//! incoming provider messages to an unbounded channel the sync
//! [`super::StreamProvider`] boundary drains non-blockingly.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::{StreamProvider, StreamUpdate};
use crate::error::{DictationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Pcm,
    Mulaw,
}

impl AudioFormat {
    fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Pcm => "pcm",
            AudioFormat::Mulaw => "mulaw",
        }
    }
}

pub struct CloudStreamingConfig {
    pub ws_url: String,
    pub model_id: String,
    pub audio_format: AudioFormat,
    pub vad: bool,
    pub tag: String,
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    #[serde(default)]
    is_final: bool,
    confidence: Option<f32>,
    language: Option<String>,
    message: Option<String>,
}

enum Outgoing {
    Audio(String),
    End,
}

pub struct CloudStreamingProvider {
    config: CloudStreamingConfig,
    runtime: Runtime,
    outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
    incoming: Option<mpsc::UnboundedReceiver<Result<StreamUpdate>>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CloudStreamingProvider {
    pub fn new(config: CloudStreamingConfig) -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| DictationError::Internal(format!("tokio runtime init failed: {e}")))?;
        Ok(Self {
            config,
            runtime,
            outgoing: None,
            incoming: None,
            task: None,
        })
    }

    fn drain_ready(&mut self) -> Vec<StreamUpdate> {
        let mut out = Vec::new();
        let Some(rx) = self.incoming.as_mut() else {
            return out;
        };
        while let Ok(item) = rx.try_recv() {
            match item {
                Ok(update) => out.push(update),
                Err(_) => break,
            }
        }
        out
    }
}

impl StreamProvider for CloudStreamingProvider {
    fn tag(&self) -> &str {
        &self.config.tag
    }

    fn start(&mut self, language: Option<&str>, model_id: Option<&str>) -> Result<()> {
        let url = self.config.ws_url.clone();
        let config_msg = json!({
            "type": "config",
            "model_id": model_id.unwrap_or(&self.config.model_id),
            "audio_format": self.config.audio_format.as_str(),
            "vad": self.config.vad,
            "language": language,
        });

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Result<StreamUpdate>>();

        let (ws_stream, _response) = self
            .runtime
            .block_on(tokio_tungstenite::connect_async(&url))
            .map_err(|e| DictationError::NetworkTransient(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        self.runtime.block_on(async {
            let _ = write.send(Message::Text(config_msg.to_string())).await;
        });

        let task = self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outgoing_rx.recv() => {
                        match outgoing {
                            Some(Outgoing::Audio(b64)) => {
                                let msg = json!({ "type": "audio", "data": b64 });
                                if write.send(Message::Text(msg.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            Some(Outgoing::End) => {
                                let msg = json!({ "type": "end" });
                                let _ = write.send(Message::Text(msg.to_string())).await;
                                let _ = write.send(Message::Close(None)).await;
                            }
                            None => break,
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerMessage>(&text) {
                                    Ok(parsed) => {
                                        let update = match parsed.kind.as_str() {
                                            "transcript" if parsed.is_final => StreamUpdate::Final {
                                                text: parsed.text.unwrap_or_default(),
                                                confidence: parsed.confidence,
                                            },
                                            "transcript" => StreamUpdate::Interim {
                                                text: parsed.text.unwrap_or_default(),
                                                confidence: parsed.confidence,
                                            },
                                            "info" => StreamUpdate::Info(
                                                parsed.message.unwrap_or_default(),
                                            ),
                                            "error" => {
                                                let _ = incoming_tx.send(Err(DictationError::NetworkFatal(
                                                    parsed.message.unwrap_or_default(),
                                                )));
                                                continue;
                                            }
                                            _ => continue,
                                        };
                                        let _ = incoming_tx.send(Ok(update));
                                    }
                                    Err(e) => {
                                        let _ = incoming_tx.send(Err(DictationError::Internal(format!(
                                            "malformed server message: {e}"
                                        ))));
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                let _ = incoming_tx.send(Err(DictationError::NetworkTransient(e.to_string())));
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        self.outgoing = Some(outgoing_tx);
        self.incoming = Some(incoming_rx);
        self.task = Some(task);
        Ok(())
    }

    fn push_chunk(&mut self, pcm16le: &[u8]) -> Result<Vec<StreamUpdate>> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let Some(tx) = self.outgoing.as_ref() else {
            return Err(DictationError::Internal("stream not started".into()));
        };
        tx.send(Outgoing::Audio(STANDARD.encode(pcm16le)))
            .map_err(|_| DictationError::NetworkFatal("streaming socket closed".into()))?;
        Ok(self.drain_ready())
    }

    fn end(&mut self) -> Result<Vec<StreamUpdate>> {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(Outgoing::End);
        }
        if let Some(task) = self.task.take() {
            let _ = self.runtime.block_on(async {
                tokio::time::timeout(Duration::from_secs(5), task).await
            });
        }
        Ok(self.drain_ready())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_chunk_before_start_is_an_internal_error() {
        let mut provider = CloudStreamingProvider::new(CloudStreamingConfig {
            ws_url: "wss://example.invalid/stream".into(),
            model_id: "default".into(),
            audio_format: AudioFormat::Pcm,
            vad: true,
            tag: "cloud-streaming".into(),
        })
        .unwrap();
        let err = provider.push_chunk(&[0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }
}
