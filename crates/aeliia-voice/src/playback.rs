//! Gapless playback of synthesized speech.
//!
//! Each frame gets a slot on a [`PlaybackClock`]: it starts at `max(now, end of previous
//! frame)`. The clock is bookkeeping for the session (tests and logs read it); it does not
//! time the output. Gapless output comes from the sink's own queue: [`RodioPlayback`]
//! appends frames to one `rodio::Sink`, which plays them back to back. An interruption
//! clears that queue and resets the clock so the next frame plays immediately.

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use tracing::{debug, info, warn};

use crate::error::{VoiceError, VoiceResult};

/// Running end-time of the playback queue, measured from session start.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackClock {
    next_start: Duration,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `length` of playback and return when it starts.
    pub fn schedule(&mut self, now: Duration, length: Duration) -> Duration {
        let start = self.next_start.max(now);
        self.next_start = start + length;
        start
    }

    pub fn reset(&mut self) {
        self.next_start = Duration::ZERO;
    }

    /// End of everything scheduled so far.
    pub fn horizon(&self) -> Duration {
        self.next_start
    }
}

/// One decoded frame with its slot on the clock. The slot is informational; sinks play
/// frames in arrival order.
#[derive(Debug, Clone)]
pub struct ScheduledFrame {
    pub start: Duration,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl ScheduledFrame {
    pub fn duration(&self) -> Duration {
        frame_duration(self.samples.len(), self.sample_rate)
    }
}

pub fn frame_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(samples as f64 / f64::from(sample_rate))
}

/// Output device seam.
pub trait AudioSink: Send + Sync {
    fn play(&self, frame: ScheduledFrame) -> VoiceResult<()>;

    /// Drop everything queued or playing.
    fn stop(&self);
}

enum PlaybackCommand {
    Play(ScheduledFrame),
    Stop,
}

/// Default output device through rodio, driven from a dedicated thread.
///
/// `ScheduledFrame::start` is only logged here. Frames play in the order they are sent,
/// with no gap between them, because `Sink::append` queues each buffer behind the last.
pub struct RodioPlayback {
    tx: std_mpsc::Sender<PlaybackCommand>,
}

impl RodioPlayback {
    pub fn new() -> VoiceResult<Self> {
        let (tx, rx) = std_mpsc::channel::<PlaybackCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();

        std::thread::Builder::new()
            .name("aeliia-playback".to_string())
            .spawn(move || {
                let (_stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                let new_sink = || Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()));
                let mut sink = match new_sink() {
                    Ok(sink) => sink,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Ends when every sender is dropped.
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        PlaybackCommand::Play(frame) => {
                            debug!(start_ms = frame.start.as_millis() as u64, samples = frame.samples.len(), "queue frame");
                            sink.append(SamplesBuffer::new(1, frame.sample_rate, frame.samples));
                        }
                        PlaybackCommand::Stop => {
                            sink.stop();
                            match new_sink() {
                                Ok(fresh) => sink = fresh,
                                Err(e) => {
                                    warn!("Playback: could not recreate sink: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }
                info!("Playback: output thread finished");
            })?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("playback thread exited during startup".to_string()))??;
        info!("Playback: sink ready");
        Ok(Self { tx })
    }
}

impl AudioSink for RodioPlayback {
    fn play(&self, frame: ScheduledFrame) -> VoiceResult<()> {
        if frame.samples.is_empty() {
            return Ok(());
        }
        self.tx
            .send(PlaybackCommand::Play(frame))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    fn stop(&self) {
        if self.tx.send(PlaybackCommand::Stop).is_ok() {
            info!("Playback: stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn frames_are_back_to_back() {
        let mut clock = PlaybackClock::new();
        assert_eq!(clock.schedule(ms(0), ms(100)), ms(0));
        // arrives before the first one ends
        assert_eq!(clock.schedule(ms(40), ms(100)), ms(100));
        assert_eq!(clock.schedule(ms(150), ms(50)), ms(200));
        assert_eq!(clock.horizon(), ms(250));
    }

    #[test]
    fn late_frame_starts_now() {
        let mut clock = PlaybackClock::new();
        clock.schedule(ms(0), ms(100));
        assert_eq!(clock.schedule(ms(500), ms(100)), ms(500));
    }

    #[test]
    fn reset_forgets_queued_audio() {
        let mut clock = PlaybackClock::new();
        clock.schedule(ms(0), ms(1000));
        clock.reset();
        assert_eq!(clock.schedule(ms(10), ms(20)), ms(10));
    }

    #[test]
    fn frame_duration_uses_sample_rate() {
        assert_eq!(frame_duration(24_000, 24_000), Duration::from_secs(1));
        assert_eq!(frame_duration(12_000, 24_000), ms(500));
        assert_eq!(frame_duration(10, 0), Duration::ZERO);
    }
}
