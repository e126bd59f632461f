//! Live duplex voice session.
//!
//! Opening runs in a fixed order: take the microphone, build the instruction, connect,
//! start capture. Any failure releases what was already taken. Once open, one task
//! pumps microphone frames out and server events in. Every user transcription is
//! screened for crisis language before anything else from that message is handled; a
//! match dials the emergency line once and ends the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aeliia_core::prompts::{build_voice_instruction, LIVE_INTERRUPTED_MESSAGE, MICROPHONE_ERROR_MESSAGE};
use aeliia_core::{CoreConfig, CrisisDetector, EmergencyProtocol, UserProfile};

use crate::audio::{encode_pcm16, decode_pcm16, AudioChunk, AudioConfig, CaptureHandle, CaptureSource, Microphone, MicrophoneLease, OUTPUT_SAMPLE_RATE};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{frame_duration, AudioSink, PlaybackClock, ScheduledFrame};
use crate::transport::{DuplexChannel, LiveConnector, LiveSetup, ServerEvent};

/// Services a voice session runs on. Cheap to clone.
#[derive(Clone)]
pub struct VoiceDeps {
    pub connector: Arc<dyn LiveConnector>,
    pub capture: Arc<dyn CaptureSource>,
    pub sink: Arc<dyn AudioSink>,
    pub microphone: Microphone,
    pub emergency: EmergencyProtocol,
    pub detector: CrisisDetector,
}

impl VoiceDeps {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        capture: Arc<dyn CaptureSource>,
        sink: Arc<dyn AudioSink>,
        microphone: Microphone,
        emergency: EmergencyProtocol,
    ) -> Self {
        Self {
            connector,
            capture,
            sink,
            microphone,
            emergency,
            detector: CrisisDetector::default(),
        }
    }
}

/// Per-session parameters.
#[derive(Debug, Clone)]
pub struct VoiceContext {
    pub profile: Option<UserProfile>,
    pub model: String,
    pub voice_name: String,
    /// Cancelled by the controller when voice is no longer allowed.
    pub activation: CancellationToken,
    pub audio: AudioConfig,
    pub output_sample_rate: u32,
}

impl VoiceContext {
    pub fn from_config(config: &CoreConfig, profile: Option<UserProfile>, activation: CancellationToken) -> Self {
        Self {
            profile,
            model: config.voice_model.clone(),
            voice_name: config.voice_name.clone(),
            activation,
            audio: AudioConfig::default(),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the user or by the controller.
    Requested,
    /// A crisis was detected in the user's speech.
    Crisis,
    /// The remote side went away.
    Transport,
    /// The microphone stopped delivering audio.
    Capture,
}

/// What the host sees of a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEvent {
    Connected,
    Transcription(String),
    Interrupted,
    TurnComplete,
    /// The emergency line was dialed; the session is ending.
    Crisis { transcript: String },
    /// User-facing message for a failure.
    Error(String),
    Closed(CloseReason),
}

/// Handle to an open session. Dropping it cancels the session.
pub struct VoiceDuplexSession {
    cancel: CancellationToken,
    events: mpsc::UnboundedReceiver<VoiceEvent>,
    task: Option<JoinHandle<CloseReason>>,
    reason: Option<CloseReason>,
}

impl std::fmt::Debug for VoiceDuplexSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceDuplexSession")
            .field("closed", &self.is_closed())
            .field("reason", &self.reason)
            .finish()
    }
}

impl VoiceDuplexSession {
    pub async fn open(context: VoiceContext, deps: VoiceDeps) -> VoiceResult<Self> {
        if context.activation.is_cancelled() {
            return Err(VoiceError::Capability("voice is not active".to_string()));
        }

        let lease = deps.microphone.try_acquire()?;
        let instruction = build_voice_instruction(context.profile.as_ref());
        let setup = LiveSetup {
            model: context.model.clone(),
            system_instruction: instruction,
            voice_name: context.voice_name.clone(),
        };

        // The lease is dropped on every early return below.
        let channel = tokio::select! {
            _ = context.activation.cancelled() => {
                return Err(VoiceError::Capability("voice deactivated while connecting".to_string()));
            }
            connected = deps.connector.connect(setup) => connected?,
        };

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let capture = match deps.capture.start(&context.audio, chunk_tx) {
            Ok(handle) => handle,
            Err(e) => {
                channel.shutdown.cancel();
                return Err(e);
            }
        };

        let cancel = context.activation.child_token();
        let (event_tx, events) = mpsc::unbounded_channel();
        let _ = event_tx.send(VoiceEvent::Connected);
        info!(model = %context.model, "🎙️ voice session open");

        let runner = SessionRunner {
            cancel: cancel.clone(),
            channel,
            chunks: chunk_rx,
            capture,
            lease: Some(lease),
            sink: deps.sink,
            clock: PlaybackClock::new(),
            output_sample_rate: context.output_sample_rate,
            emergency: deps.emergency,
            detector: deps.detector,
            events: event_tx,
        };
        let task = tokio::spawn(runner.run());

        Ok(Self {
            cancel,
            events,
            task: Some(task),
            reason: None,
        })
    }

    pub async fn next_event(&mut self) -> Option<VoiceEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<VoiceEvent> {
        self.events.try_recv().ok()
    }

    /// Stop capture, playback and transport. Safe to call more than once.
    pub async fn close(&mut self) -> Option<CloseReason> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(reason) => self.reason = Some(reason),
                Err(e) => warn!("voice session task failed: {}", e),
            }
        }
        self.reason
    }

    /// Request shutdown without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.reason.is_some() || self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for VoiceDuplexSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct SessionRunner {
    cancel: CancellationToken,
    channel: DuplexChannel,
    chunks: mpsc::UnboundedReceiver<AudioChunk>,
    capture: CaptureHandle,
    lease: Option<MicrophoneLease>,
    sink: Arc<dyn AudioSink>,
    clock: PlaybackClock,
    output_sample_rate: u32,
    emergency: EmergencyProtocol,
    detector: CrisisDetector,
    events: mpsc::UnboundedSender<VoiceEvent>,
}

impl SessionRunner {
    async fn run(mut self) -> CloseReason {
        let origin = Instant::now();
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break CloseReason::Requested,
                event = self.channel.inbound.recv() => {
                    let Some(event) = event else {
                        break self.transport_lost("inbound channel closed");
                    };
                    if let Some(reason) = self.on_server_event(event, origin.elapsed()) {
                        break reason;
                    }
                }
                chunk = self.chunks.recv() => {
                    let Some(chunk) = chunk else {
                        warn!("voice: capture ended unexpectedly");
                        self.emit(VoiceEvent::Error(MICROPHONE_ERROR_MESSAGE.to_string()));
                        break CloseReason::Capture;
                    };
                    match self.channel.outbound.try_send(encode_pcm16(&chunk.samples)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => debug!("voice: outbound full, dropping frame"),
                        Err(TrySendError::Closed(_)) => break self.transport_lost("outbound channel closed"),
                    }
                }
            }
        };
        self.teardown(reason);
        reason
    }

    fn on_server_event(&mut self, event: ServerEvent, now: Duration) -> Option<CloseReason> {
        match event {
            ServerEvent::Transcription(text) => {
                if let Some(keyword) = self.detector.matched_keyword(&text) {
                    warn!(%keyword, "🚨 crisis detected in live transcription");
                    self.emergency.trigger();
                    self.emit(VoiceEvent::Crisis { transcript: text });
                    return Some(CloseReason::Crisis);
                }
                self.emit(VoiceEvent::Transcription(text));
            }
            ServerEvent::Audio(bytes) => {
                let samples = decode_pcm16(&bytes);
                let length = frame_duration(samples.len(), self.output_sample_rate);
                let start = self.clock.schedule(now, length);
                let frame = ScheduledFrame {
                    start,
                    samples,
                    sample_rate: self.output_sample_rate,
                };
                if let Err(e) = self.sink.play(frame) {
                    warn!("voice: playback failed: {}", e);
                }
            }
            ServerEvent::Interrupted => {
                info!("voice: interrupted, clearing playback");
                self.sink.stop();
                self.clock.reset();
                self.emit(VoiceEvent::Interrupted);
            }
            ServerEvent::TurnComplete => self.emit(VoiceEvent::TurnComplete),
            ServerEvent::SetupComplete => debug!("voice: setup complete"),
            ServerEvent::Closed(reason) => {
                return Some(self.transport_lost(reason.as_deref().unwrap_or("closed by server")));
            }
        }
        None
    }

    fn transport_lost(&self, reason: &str) -> CloseReason {
        warn!(%reason, "voice: transport lost");
        self.emit(VoiceEvent::Error(LIVE_INTERRUPTED_MESSAGE.to_string()));
        CloseReason::Transport
    }

    fn teardown(&mut self, reason: CloseReason) {
        self.capture.stop();
        self.channel.shutdown.cancel();
        self.sink.stop();
        self.clock.reset();
        self.lease.take();
        info!(?reason, "🎙️ voice session closed");
        self.emit(VoiceEvent::Closed(reason));
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }
}
