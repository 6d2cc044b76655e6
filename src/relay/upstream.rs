//! # Upstream Provider Sessions
//!
//! The broker never talks to the provider directly. It holds an
//! [`UpstreamSession`], a pair of channels to a task that owns the real
//! provider connection:
//!
//! - **commands** (broker → task): audio, text turns, close
//! - **events** (task → broker): open, raw provider messages, errors, closed
//!
//! [`UpstreamConnector`] is the seam: production uses [`GeminiLiveConnector`],
//! tests plug in connectors that hand back the other end of
//! [`UpstreamSession::channel`].
//!
//! ## Gemini Live protocol:
//! 1. Connect to the `BidiGenerateContent` WebSocket with the API key
//! 2. Send `setup` (model, AUDIO modality, voice, system instruction, transcription)
//! 3. Wait for `setupComplete`; only then is the session "open"
//! 4. Stream `realtimeInput` audio and `clientContent` text turns

use crate::audio::codec::pcm_mime_type;
use crate::config::AppConfig;
use crate::protocol::provider::ProviderMessage;
use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// How long the provider gets to accept the WebSocket upgrade.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Context supplied by the client's `INITIAL_SETUP` frame.
#[derive(Debug, Clone)]
pub struct UpstreamSetup {
    pub system_instruction: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamCommand {
    /// Base64 PCM16 at the capture rate
    Audio(String),
    /// A complete user text turn
    Text(String),
    /// A client frame the relay does not interpret, sent as is
    Raw(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Provider session is ready for input
    Open,
    /// One provider message, forwarded verbatim
    Message(String),
    Error(String),
    Closed,
}

/// The broker's end of an upstream session.
pub struct UpstreamSession {
    commands: UnboundedSender<UpstreamCommand>,
    events: Option<UnboundedReceiver<UpstreamEvent>>,
}

/// The provider side of an upstream session.
pub struct UpstreamPeer {
    pub commands: UnboundedReceiver<UpstreamCommand>,
    pub events: UnboundedSender<UpstreamEvent>,
}

impl UpstreamSession {
    /// Create a connected session/peer pair.
    pub fn channel() -> (UpstreamSession, UpstreamPeer) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            UpstreamSession {
                commands: command_tx,
                events: Some(event_rx),
            },
            UpstreamPeer {
                commands: command_rx,
                events: event_tx,
            },
        )
    }

    /// Returns false once the provider task has gone away.
    pub fn send(&self, command: UpstreamCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Hand the event stream to whoever drives this session (once).
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<UpstreamEvent>> {
        self.events.take()
    }

    pub fn close(&self) {
        let _ = self.commands.send(UpstreamCommand::Close);
    }
}

/// Opens one upstream session per client connection.
///
/// `open` must return immediately; connection establishment happens in the
/// background and is reported through [`UpstreamEvent::Open`] or
/// [`UpstreamEvent::Error`].
pub trait UpstreamConnector: Send + Sync {
    fn open(&self, setup: UpstreamSetup) -> UpstreamSession;
}

/// Connector for the Gemini Live bidirectional streaming API.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    endpoint: String,
    model_id: String,
    voice_name: String,
    api_key: String,
    input_sample_rate: u32,
}

impl GeminiLiveConnector {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.upstream.endpoint.clone(),
            model_id: config.upstream.model_id.clone(),
            voice_name: config.upstream.voice_name.clone(),
            api_key: config.upstream.api_key.clone(),
            input_sample_rate: config.session.input_sample_rate,
        }
    }

    fn setup_message(&self, setup: &UpstreamSetup) -> Value {
        json!({
            "setup": {
                "model": format!("models/{}", self.model_id),
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {
                            "prebuiltVoiceConfig": { "voiceName": self.voice_name }
                        }
                    }
                },
                "systemInstruction": {
                    "parts": [{ "text": setup.system_instruction }]
                },
                "inputAudioTranscription": {},
                "outputAudioTranscription": {}
            }
        })
    }

    fn command_message(&self, command: &UpstreamCommand) -> Option<Value> {
        match command {
            UpstreamCommand::Audio(data) => Some(json!({
                "realtimeInput": {
                    "audio": { "data": data, "mimeType": pcm_mime_type(self.input_sample_rate) }
                }
            })),
            UpstreamCommand::Text(text) => Some(json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                    "turnComplete": true
                }
            })),
            UpstreamCommand::Raw(_) | UpstreamCommand::Close => None,
        }
    }

    /// Wire text for a command; `None` for `Close`.
    fn command_text(&self, command: UpstreamCommand) -> Option<String> {
        match command {
            UpstreamCommand::Raw(raw) => Some(raw),
            UpstreamCommand::Close => None,
            command => self.command_message(&command).map(|message| message.to_string()),
        }
    }

    /// Drive one provider connection until either side closes.
    async fn run(self, setup: UpstreamSetup, mut peer: UpstreamPeer) {
        match self.drive(&setup, &mut peer).await {
            Ok(()) => debug!("Upstream session finished"),
            Err(e) => {
                error!("Upstream session failed: {:#}", e);
                let _ = peer.events.send(UpstreamEvent::Error(e.to_string()));
            }
        }
        let _ = peer.events.send(UpstreamEvent::Closed);
    }

    async fn drive(&self, setup: &UpstreamSetup, peer: &mut UpstreamPeer) -> anyhow::Result<()> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .context("Timed out connecting to Gemini Live")?
            .context("Failed to connect to Gemini Live")?;
        let (mut sink, mut source) = stream.split();

        sink.send(Message::Text(self.setup_message(setup).to_string()))
            .await
            .context("Failed to send session setup")?;
        info!(model = %self.model_id, "Gemini Live setup sent");

        let mut ready = false;
        loop {
            tokio::select! {
                // The broker dropped its end of the session
                _ = peer.events.closed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }

                incoming = source.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Dropping non-UTF-8 binary frame from provider");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "Provider closed the session");
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e).context("Provider stream error"),
                        None => return Ok(()),
                    };

                    if !ready && is_setup_complete(&text) {
                        ready = true;
                        info!("Gemini Live session ready");
                        if peer.events.send(UpstreamEvent::Open).is_err() {
                            return Ok(());
                        }
                    }
                    if peer.events.send(UpstreamEvent::Message(text)).is_err() {
                        return Ok(());
                    }
                }

                // Input is only accepted once the provider acknowledged setup
                command = peer.commands.recv(), if ready => {
                    let Some(command) = command else {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(());
                    };
                    match self.command_text(command) {
                        Some(text) => sink
                            .send(Message::Text(text))
                            .await
                            .context("Failed to send to provider")?,
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

fn is_setup_complete(text: &str) -> bool {
    serde_json::from_str::<ProviderMessage>(text)
        .map(|message| message.setup_complete.is_some())
        .unwrap_or(false)
}

impl UpstreamConnector for GeminiLiveConnector {
    fn open(&self, setup: UpstreamSetup) -> UpstreamSession {
        let (session, peer) = UpstreamSession::channel();
        tokio::spawn(self.clone().run(setup, peer));
        session
    }
}
