//! Voice notes for the chat surface: record while the button is held, then hand back
//! a WAV clip.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::audio::{pcm_f32_to_wav, AudioChunk, AudioConfig, CaptureHandle, CaptureSource, Microphone, MicrophoneLease};
use crate::error::VoiceResult;

pub const VOICE_NOTE_MIME_TYPE: &str = "audio/wav";

/// Starts recordings on the shared microphone.
#[derive(Clone)]
pub struct VoiceNoteRecorder {
    microphone: Microphone,
    capture: Arc<dyn CaptureSource>,
    config: AudioConfig,
}

impl VoiceNoteRecorder {
    pub fn new(microphone: Microphone, capture: Arc<dyn CaptureSource>) -> Self {
        Self {
            microphone,
            capture,
            config: AudioConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AudioConfig) -> Self {
        self.config = config;
        self
    }

    /// Fails with a capability error while a live session holds the microphone.
    pub fn start(&self) -> VoiceResult<Recording> {
        let lease = self.microphone.try_acquire()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.capture.start(&self.config, tx)?;
        info!("⏺️ voice note recording");
        Ok(Recording {
            _lease: lease,
            handle,
            chunks: rx,
            sample_rate: self.config.sample_rate,
        })
    }
}

/// A recording in progress. Dropping it discards the audio.
#[derive(Debug)]
pub struct Recording {
    _lease: MicrophoneLease,
    handle: CaptureHandle,
    chunks: mpsc::UnboundedReceiver<AudioChunk>,
    sample_rate: u32,
}

impl Recording {
    /// Stop and return the clip as WAV bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.handle.stop();
        let mut samples = Vec::new();
        while let Ok(chunk) = self.chunks.try_recv() {
            samples.extend_from_slice(&chunk.samples);
        }
        info!(samples = samples.len(), "⏹️ voice note recorded");
        pcm_f32_to_wav(&samples, self.sample_rate)
    }

    pub fn cancel(mut self) {
        self.handle.stop();
        info!("voice note discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;

    struct TwoChunks;

    impl CaptureSource for TwoChunks {
        fn start(&self, _config: &AudioConfig, tx: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<CaptureHandle> {
            tx.send(AudioChunk::new(vec![0.5; 4])).ok();
            tx.send(AudioChunk::new(vec![-0.5; 4])).ok();
            Ok(CaptureHandle::new(|| {}))
        }
    }

    #[test]
    fn finish_produces_wav_with_all_samples() {
        let recorder = VoiceNoteRecorder::new(Microphone::new(), Arc::new(TwoChunks));
        let wav = recorder.start().unwrap().finish();
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 8 * 2);
    }

    #[test]
    fn recording_holds_the_microphone() {
        let mic = Microphone::new();
        let recorder = VoiceNoteRecorder::new(mic.clone(), Arc::new(TwoChunks));
        let recording = recorder.start().unwrap();
        assert!(matches!(recorder.start(), Err(VoiceError::Capability(_))));
        recording.cancel();
        assert!(mic.is_available());
    }
}
