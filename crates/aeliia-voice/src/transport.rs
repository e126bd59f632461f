//! Live duplex transport to the realtime speech service.
//!
//! A [`LiveConnector`] yields a [`DuplexChannel`]: PCM16 frames go out, parsed
//! [`ServerEvent`]s come in. The Gemini Live connector speaks JSON over a websocket.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aeliia_core::CoreConfig;

use crate::error::{VoiceError, VoiceResult};

/// Mime type of outbound microphone frames.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// What the session asks the remote side for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSetup {
    pub model: String,
    pub system_instruction: String,
    pub voice_name: String,
}

/// Something the remote side told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SetupComplete,
    /// Transcript of what the user said.
    Transcription(String),
    /// PCM16 little-endian, 24 kHz mono.
    Audio(Vec<u8>),
    /// The user spoke over the model; drop queued playback.
    Interrupted,
    TurnComplete,
    /// The remote side ended the session.
    Closed(Option<String>),
}

/// Both directions of an open live session.
#[derive(Debug)]
pub struct DuplexChannel {
    /// PCM16 frames at 16 kHz.
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub inbound: mpsc::Receiver<ServerEvent>,
    /// Cancel to tear the connection down.
    pub shutdown: CancellationToken,
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, setup: LiveSetup) -> VoiceResult<DuplexChannel>;
}

/// Parse one inbound JSON message. Transcription always comes first so it can be
/// screened before any audio from the same message is played.
pub fn parse_server_message(text: &str) -> VoiceResult<Vec<ServerEvent>> {
    let v: Value = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if v.get("setupComplete").is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = v.get("serverContent") {
        if let Some(t) = content
            .pointer("/inputTranscription/text")
            .and_then(Value::as_str)
            .filter(|t| !t.trim().is_empty())
        {
            events.push(ServerEvent::Transcription(t.to_string()));
        }
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for part in parts {
                let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) else {
                    continue;
                };
                let bytes = B64
                    .decode(data)
                    .map_err(|e| VoiceError::Protocol(format!("bad audio payload: {}", e)))?;
                events.push(ServerEvent::Audio(bytes));
            }
        }
        if content.get("interrupted").and_then(Value::as_bool).unwrap_or(false) {
            events.push(ServerEvent::Interrupted);
        }
        if content.get("turnComplete").and_then(Value::as_bool).unwrap_or(false) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    if let Some(go_away) = v.get("goAway") {
        events.push(ServerEvent::Closed(Some(format!("goAway {}", go_away))));
    }
    if let Some(err) = v.get("error") {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        events.push(ServerEvent::Closed(Some(msg)));
    }
    Ok(events)
}

pub fn setup_message(setup: &LiveSetup) -> Value {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };
    json!({
        "setup": {
            "model": model,
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": setup.voice_name } }
                }
            },
            "systemInstruction": { "parts": [{ "text": setup.system_instruction }] },
            "inputAudioTranscription": {}
        }
    })
}

pub fn audio_message(pcm16: &[u8]) -> Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{ "mimeType": INPUT_MIME_TYPE, "data": B64.encode(pcm16) }]
        }
    })
}

/// Gemini Live over websocket.
#[derive(Clone)]
pub struct GeminiLiveConnector {
    live_url: String,
    api_key: String,
}

impl std::fmt::Debug for GeminiLiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveConnector")
            .field("live_url", &self.live_url)
            .finish_non_exhaustive()
    }
}

impl GeminiLiveConnector {
    pub fn new(live_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            live_url: live_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_config(config: &CoreConfig) -> VoiceResult<Self> {
        let key = config.require_api_key()?;
        Ok(Self::new(config.live_url.clone(), key))
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveConnector {
    async fn connect(&self, setup: LiveSetup) -> VoiceResult<DuplexChannel> {
        let url = format!("{}?key={}", self.live_url, self.api_key);
        let request = url
            .into_client_request()
            .map_err(|e| VoiceError::Transport(format!("bad live endpoint: {}", e)))?;
        info!(model = %setup.model, "🔌 connecting live session");
        let (ws, _resp) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        ws_tx.send(Message::Text(setup_message(&setup).to_string().into())).await?;

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
        let (in_tx, in_rx) = mpsc::channel::<ServerEvent>(256);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = token.cancelled() => break None,
                    frame = out_rx.recv() => {
                        let Some(pcm) = frame else { break None };
                        if let Err(e) = ws_tx.send(Message::Text(audio_message(&pcm).to_string().into())).await {
                            break Some(e.to_string());
                        }
                    }
                    msg = ws_rx.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(t))) => t.as_str().to_string(),
                            // Live sends JSON in binary frames too.
                            Some(Ok(Message::Binary(b))) => match std::str::from_utf8(&b) {
                                Ok(s) => s.to_string(),
                                Err(_) => {
                                    debug!(len = b.len(), "ignoring non-utf8 binary frame");
                                    continue;
                                }
                            },
                            Some(Ok(Message::Close(frame))) => {
                                break Some(frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed".to_string()));
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => break Some(e.to_string()),
                            None => break Some("connection lost".to_string()),
                        };
                        match parse_server_message(&text) {
                            Ok(events) => {
                                for event in events {
                                    if in_tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => warn!("live: unreadable server message: {}", e),
                        }
                    }
                }
            };
            let _ = ws_tx.send(Message::Close(None)).await;
            if let Some(reason) = reason {
                warn!(%reason, "live session closed by transport");
                let _ = in_tx.send(ServerEvent::Closed(Some(reason))).await;
            } else {
                info!("live session closed");
            }
        });

        Ok(DuplexChannel {
            outbound: out_tx,
            inbound: in_rx,
            shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcription_precedes_audio() {
        let audio = B64.encode([1u8, 2, 3, 4]);
        let msg = json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": audio } }] },
                "inputTranscription": { "text": "je suis là" },
                "turnComplete": true
            }
        });
        let events = parse_server_message(&msg.to_string()).unwrap();
        assert_eq!(
            events,
            vec![
                ServerEvent::Transcription("je suis là".into()),
                ServerEvent::Audio(vec![1, 2, 3, 4]),
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn interruption_and_setup() {
        let events = parse_server_message(r#"{"setupComplete":{}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::SetupComplete]);
        let events = parse_server_message(r#"{"serverContent":{"interrupted":true}}"#).unwrap();
        assert_eq!(events, vec![ServerEvent::Interrupted]);
    }

    #[test]
    fn blank_transcription_is_skipped() {
        let events = parse_server_message(r#"{"serverContent":{"inputTranscription":{"text":"  "}}}"#).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(parse_server_message("not json"), Err(VoiceError::Protocol(_))));
        let bad = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"@@@"}}]}}}"#;
        assert!(matches!(parse_server_message(bad), Err(VoiceError::Protocol(_))));
    }

    #[test]
    fn setup_requests_audio_with_transcription() {
        let setup = LiveSetup {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".into(),
            system_instruction: "Sois brève.".into(),
            voice_name: "Zephyr".into(),
        };
        let v = setup_message(&setup);
        assert_eq!(v["setup"]["model"], "models/gemini-2.5-flash-native-audio-preview-09-2025");
        assert_eq!(v["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            v["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Zephyr"
        );
        assert_eq!(v["setup"]["systemInstruction"]["parts"][0]["text"], "Sois brève.");
        assert!(v["setup"]["inputAudioTranscription"].is_object());
    }

    #[test]
    fn audio_frames_are_base64_pcm() {
        let v = audio_message(&[0, 1]);
        assert_eq!(v["realtimeInput"]["mediaChunks"][0]["mimeType"], INPUT_MIME_TYPE);
        assert_eq!(v["realtimeInput"]["mediaChunks"][0]["data"], "AAE=");
    }
}
