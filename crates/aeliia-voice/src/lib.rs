//! # AELIIA Voice - live duplex speech
//!
//! Streams microphone audio to a realtime speech model and plays its spoken replies
//! gaplessly. Every user transcription passes the crisis detector first; a match dials
//! the emergency line and ends the session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   VoiceDuplexSession                        │
//! │  ┌──────────────┐  PCM16 16k   ┌──────────────┐             │
//! │  │  Microphone  │────────────→ │ LiveConnector│             │
//! │  │ (cpal, lease)│              │ (websocket)  │             │
//! │  └──────────────┘              └──────┬───────┘             │
//! │                                       │ transcription first │
//! │  ┌──────────────┐  PCM16 24k   ┌──────▼───────┐             │
//! │  │  AudioSink   │←──────────── │ Crisis check │→ emergency  │
//! │  │ (rodio, clock│   interrupt  │              │   dial      │
//! │  └──────────────┘              └──────────────┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod error;
pub mod playback;
pub mod recorder;
pub mod session;
pub mod transport;

pub use audio::{
    decode_pcm16, encode_pcm16, pcm_f32_to_wav, AudioChunk, AudioConfig, CaptureHandle, CaptureSource,
    CpalCapture, Microphone, MicrophoneLease, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};
pub use error::{VoiceError, VoiceResult};
pub use playback::{AudioSink, PlaybackClock, RodioPlayback, ScheduledFrame};
pub use recorder::{Recording, VoiceNoteRecorder, VOICE_NOTE_MIME_TYPE};
pub use session::{CloseReason, VoiceContext, VoiceDeps, VoiceDuplexSession, VoiceEvent};
pub use transport::{
    parse_server_message, DuplexChannel, GeminiLiveConnector, LiveConnector, LiveSetup, ServerEvent,
};
