//! Error types for the AELIIA voice session

use aeliia_core::CoreError;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while opening or running a voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone busy, missing or denied.
    #[error("Capability unavailable: {0}")]
    Capability(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// The remote side sent something we cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}

impl From<CoreError> for VoiceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Configuration(m) => VoiceError::Config(m),
            CoreError::Capability(m) => VoiceError::Capability(m),
            other => VoiceError::Transport(other.to_string()),
        }
    }
}

impl From<VoiceError> for CoreError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Capability(m) | VoiceError::AudioDevice(m) | VoiceError::AudioStream(m) => {
                CoreError::Capability(m)
            }
            VoiceError::Config(m) => CoreError::Configuration(m),
            other => CoreError::Transport(other.to_string()),
        }
    }
}
