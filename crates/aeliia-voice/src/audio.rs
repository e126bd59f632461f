//! Microphone lease, capture and PCM helpers.
//!
//! The microphone is a single-permit resource: at most one live session or voice-note
//! recording holds it. Capture runs on CPAL in its own thread (CPAL streams are not
//! `Send`) and hands fixed-size chunks to an async channel.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::error::{VoiceError, VoiceResult};

/// Sample rate the live service expects for input.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of synthesized output.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Samples per chunk handed to the session (default: 4096, ~256ms at 16kHz)
    pub buffer_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            channels: 1,
            buffer_size: 4096,
        }
    }
}

/// Audio chunk sent from the capture thread
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Timestamp when captured
    pub timestamp: std::time::Instant,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            timestamp: std::time::Instant::now(),
        }
    }
}

/// Exclusive access to the input device.
#[derive(Debug, Clone)]
pub struct Microphone {
    permit: Arc<Semaphore>,
}

impl Default for Microphone {
    fn default() -> Self {
        Self::new()
    }
}

impl Microphone {
    pub fn new() -> Self {
        Self {
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    /// Take the microphone, or fail immediately if someone else holds it.
    pub fn try_acquire(&self) -> VoiceResult<MicrophoneLease> {
        let permit = Arc::clone(&self.permit)
            .try_acquire_owned()
            .map_err(|_| VoiceError::Capability("microphone already in use".to_string()))?;
        info!("🎤 microphone acquired");
        Ok(MicrophoneLease { _permit: permit })
    }

    pub fn is_available(&self) -> bool {
        self.permit.available_permits() > 0
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct MicrophoneLease {
    _permit: OwnedSemaphorePermit,
}

impl Drop for MicrophoneLease {
    fn drop(&mut self) {
        info!("🎤 microphone released");
    }
}

/// Stops a running capture. Idempotent; also stops on drop.
pub struct CaptureHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_some()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Something that produces microphone chunks.
pub trait CaptureSource: Send + Sync {
    fn start(&self, config: &AudioConfig, chunk_tx: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<CaptureHandle>;
}

/// Default input device through CPAL.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCapture;

impl CpalCapture {
    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn build_stream(config: &AudioConfig, chunk_tx: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<cpal::Stream> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::Capability("No input device available".to_string()))?;
        info!(
            "🎤 capture on {} ({}Hz, {} ch)",
            device.name().unwrap_or_else(|_| "Unknown".to_string()),
            config.sample_rate,
            config.channels
        );
        // Probe: fails early with a device error when input is unusable.
        device.default_input_config()?;

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let buffer_size = config.buffer_size.max(1);
        let channels = usize::from(config.channels.max(1));
        let mut sample_buffer = Vec::with_capacity(buffer_size);

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // first channel only
                for frame in data.chunks(channels) {
                    sample_buffer.push(frame[0]);
                    if sample_buffer.len() >= buffer_size {
                        let chunk = AudioChunk::new(std::mem::replace(
                            &mut sample_buffer,
                            Vec::with_capacity(buffer_size),
                        ));
                        if chunk_tx.send(chunk).is_err() {
                            return;
                        }
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        Ok(stream)
    }
}

impl CaptureSource for CpalCapture {
    fn start(&self, config: &AudioConfig, chunk_tx: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<CaptureHandle> {
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<()>>();
        let config = config.clone();

        std::thread::Builder::new()
            .name("aeliia-capture".to_string())
            .spawn(move || match Self::build_stream(&config, chunk_tx) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until stop is requested or the handle is dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                    info!("⏹️ audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::AudioStream("capture thread exited during startup".to_string()))??;
        info!("✅ audio capture started");
        Ok(CaptureHandle::new(move || {
            let _ = stop_tx.send(());
        }))
    }
}

/// f32 samples to little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Little-endian PCM16 bytes to f32 samples. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
        .collect()
}

/// Mono 16-bit WAV container around `samples`.
pub fn pcm_f32_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data = encode_pcm16(samples);
    let data_len = data.len() as u32;
    let mut buf = Vec::with_capacity(44 + data.len());
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(&data);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.buffer_size, 4096);
    }

    #[test]
    fn microphone_is_exclusive() {
        let mic = Microphone::new();
        let lease = mic.try_acquire().unwrap();
        assert!(matches!(mic.clone().try_acquire(), Err(VoiceError::Capability(_))));
        drop(lease);
        assert!(mic.is_available());
        assert!(mic.try_acquire().is_ok());
    }

    #[test]
    fn pcm16_encoding_clamps_and_is_little_endian() {
        assert_eq!(encode_pcm16(&[0.0, 1.0, 2.0, -1.0]), vec![0, 0, 0xff, 0x7f, 0xff, 0x7f, 0x01, 0x80]);
        let back = decode_pcm16(&[0x00, 0x40, 0x00, 0xc0, 0x07]);
        assert_eq!(back, vec![0.5, -0.5]);
    }

    #[test]
    fn wav_header_describes_mono_pcm16() {
        let wav = pcm_f32_to_wav(&[0.0; 10], 16_000);
        assert_eq!(wav.len(), 44 + 20);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 56);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 20);
    }

    #[test]
    fn capture_handle_stops_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let mut handle = CaptureHandle::new(move || {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        handle.stop();
        handle.stop();
        drop(handle);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    #[ignore] // needs an input device
    fn test_list_devices() {
        if let Ok(devices) = CpalCapture::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}
