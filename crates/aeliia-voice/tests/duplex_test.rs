//! Integration tests for the live duplex voice session.
//!
//! The connector, capture and sink are in-process fakes, so these run without audio
//! hardware or network. The last tests need real devices and are ignored by default.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aeliia_core::prompts::LIVE_INTERRUPTED_MESSAGE;
use aeliia_core::{CancellationToken, EmergencyProtocol, LogDialer, UserProfile};
use aeliia_voice::{
    encode_pcm16, AudioChunk, AudioConfig, AudioSink, CaptureHandle, CaptureSource, CloseReason, DuplexChannel,
    LiveConnector, LiveSetup, Microphone, ScheduledFrame, ServerEvent, VoiceContext, VoiceDeps, VoiceDuplexSession,
    VoiceError, VoiceEvent, VoiceResult,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// The service side of a fake live connection.
struct FarEnd {
    outbound: mpsc::Receiver<Vec<u8>>,
    inbound: mpsc::Sender<ServerEvent>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct FakeConnector {
    fail: bool,
    connects: AtomicUsize,
    setups: Mutex<Vec<LiveSetup>>,
    far: Mutex<Option<FarEnd>>,
}

impl FakeConnector {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn take_far(&self) -> FarEnd {
        self.far.lock().unwrap().take().expect("not connected")
    }
}

#[async_trait]
impl LiveConnector for FakeConnector {
    async fn connect(&self, setup: LiveSetup) -> VoiceResult<DuplexChannel> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.setups.lock().unwrap().push(setup);
        if self.fail {
            return Err(VoiceError::Transport("refused".into()));
        }
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        *self.far.lock().unwrap() = Some(FarEnd {
            outbound: out_rx,
            inbound: in_tx,
            shutdown: shutdown.clone(),
        });
        Ok(DuplexChannel {
            outbound: out_tx,
            inbound: in_rx,
            shutdown,
        })
    }
}

#[derive(Default)]
struct FakeCapture {
    tx: Mutex<Option<mpsc::UnboundedSender<AudioChunk>>>,
    starts: AtomicUsize,
    stopped: Arc<AtomicBool>,
}

impl CaptureSource for FakeCapture {
    fn start(&self, _config: &AudioConfig, chunk_tx: mpsc::UnboundedSender<AudioChunk>) -> VoiceResult<CaptureHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.tx.lock().unwrap() = Some(chunk_tx);
        let stopped = Arc::clone(&self.stopped);
        Ok(CaptureHandle::new(move || stopped.store(true, Ordering::SeqCst)))
    }
}

#[derive(Default)]
struct FakeSink {
    frames: Mutex<Vec<ScheduledFrame>>,
    stops: AtomicUsize,
}

impl AudioSink for FakeSink {
    fn play(&self, frame: ScheduledFrame) -> VoiceResult<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct Rig {
    connector: Arc<FakeConnector>,
    capture: Arc<FakeCapture>,
    sink: Arc<FakeSink>,
    microphone: Microphone,
    dialer: LogDialer,
    deps: VoiceDeps,
}

fn rig_with(connector: FakeConnector) -> Rig {
    let connector = Arc::new(connector);
    let capture = Arc::new(FakeCapture::default());
    let sink = Arc::new(FakeSink::default());
    let microphone = Microphone::new();
    let dialer = LogDialer::new();
    let deps = VoiceDeps::new(
        connector.clone(),
        capture.clone(),
        sink.clone(),
        microphone.clone(),
        EmergencyProtocol::new(Arc::new(dialer.clone())),
    );
    Rig {
        connector,
        capture,
        sink,
        microphone,
        dialer,
        deps,
    }
}

fn rig() -> Rig {
    rig_with(FakeConnector::default())
}

fn context(activation: CancellationToken) -> VoiceContext {
    VoiceContext {
        profile: Some(UserProfile::new("Léa", "30", "femme")),
        model: "live-test".into(),
        voice_name: "Zephyr".into(),
        activation,
        audio: AudioConfig::default(),
        output_sample_rate: 24_000,
    }
}

/// One second of silence at 24 kHz, as PCM16.
fn one_second() -> Vec<u8> {
    vec![0u8; 48_000]
}

async fn collect_until_closed(session: &mut VoiceDuplexSession) -> Vec<VoiceEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), session.next_event())
            .await
            .expect("session should keep reporting")
            .expect("event channel ended before close");
        let done = matches!(event, VoiceEvent::Closed(_));
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn wait_for(session: &mut VoiceDuplexSession, wanted: &VoiceEvent) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), session.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("event channel ended");
        if &event == wanted {
            return;
        }
    }
}

#[tokio::test]
async fn crisis_in_transcription_dials_once_and_ends_session() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let r = rig();
    let mut session = VoiceDuplexSession::open(context(CancellationToken::new()), r.deps.clone())
        .await
        .unwrap();
    let far = r.connector.take_far();

    far.inbound
        .send(ServerEvent::Transcription("je n'ai plus envie de vivre".into()))
        .await
        .unwrap();
    // Audio that arrives behind the crisis must never play.
    let _ = far.inbound.send(ServerEvent::Audio(one_second())).await;

    let events = collect_until_closed(&mut session).await;
    assert_eq!(events.first(), Some(&VoiceEvent::Connected));
    assert!(events.contains(&VoiceEvent::Crisis {
        transcript: "je n'ai plus envie de vivre".into()
    }));
    assert!(!events.iter().any(|e| matches!(e, VoiceEvent::Error(_))));
    assert_eq!(events.last(), Some(&VoiceEvent::Closed(CloseReason::Crisis)));

    assert_eq!(r.dialer.dialed(), vec!["3114".to_string()]);
    assert!(r.sink.frames.lock().unwrap().is_empty());
    assert!(r.capture.stopped.load(Ordering::SeqCst));
    assert!(far.shutdown.is_cancelled());
    assert_eq!(session.close().await, Some(CloseReason::Crisis));
    assert!(r.microphone.is_available());
}

#[tokio::test]
async fn playback_is_gapless_and_interruption_resets_it() {
    let r = rig();
    let mut session = VoiceDuplexSession::open(context(CancellationToken::new()), r.deps.clone())
        .await
        .unwrap();
    let far = r.connector.take_far();

    far.inbound.send(ServerEvent::Audio(one_second())).await.unwrap();
    far.inbound.send(ServerEvent::Audio(one_second())).await.unwrap();
    far.inbound.send(ServerEvent::Transcription("il fait beau".into())).await.unwrap();
    wait_for(&mut session, &VoiceEvent::Transcription("il fait beau".into())).await;

    {
        let frames = r.sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].duration(), Duration::from_secs(1));
        assert_eq!(frames[1].start, frames[0].start + Duration::from_secs(1));
    }

    far.inbound.send(ServerEvent::Interrupted).await.unwrap();
    wait_for(&mut session, &VoiceEvent::Interrupted).await;
    assert_eq!(r.sink.stops.load(Ordering::SeqCst), 1);

    far.inbound.send(ServerEvent::Audio(one_second())).await.unwrap();
    far.inbound.send(ServerEvent::TurnComplete).await.unwrap();
    wait_for(&mut session, &VoiceEvent::TurnComplete).await;
    {
        let frames = r.sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 3);
        // queue was cleared, so the new frame does not wait behind the old ones
        assert!(frames[2].start < frames[1].start + Duration::from_secs(1));
    }

    session.close().await;
}

#[tokio::test]
async fn microphone_frames_reach_the_service() {
    let r = rig();
    let mut session = VoiceDuplexSession::open(context(CancellationToken::new()), r.deps.clone())
        .await
        .unwrap();
    let mut far = r.connector.take_far();

    let samples = vec![0.25f32; 8];
    let tx = r.capture.tx.lock().unwrap().clone().unwrap();
    tx.send(AudioChunk::new(samples.clone())).unwrap();

    let sent = tokio::time::timeout(Duration::from_secs(2), far.outbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent, encode_pcm16(&samples));

    let setups = r.connector.setups.lock().unwrap().clone();
    assert_eq!(setups.len(), 1);
    assert!(setups[0].system_instruction.contains("Léa"));
    session.close().await;
}

#[tokio::test]
async fn failed_connect_releases_the_microphone() {
    let r = rig_with(FakeConnector::failing());
    let err = VoiceDuplexSession::open(context(CancellationToken::new()), r.deps.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, VoiceError::Transport(_)));
    assert!(r.microphone.is_available());
    assert_eq!(r.capture.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn busy_microphone_refuses_before_connecting() {
    let r = rig();
    let _held = r.microphone.try_acquire().unwrap();
    let err = VoiceDuplexSession::open(context(CancellationToken::new()), r.deps.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, VoiceError::Capability(_)));
    assert_eq!(r.connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn close_is_idempotent() {
    let r = rig();
    let mut session = VoiceDuplexSession::open(context(CancellationToken::new()), r.deps.clone())
        .await
        .unwrap();
    let far = r.connector.take_far();

    assert_eq!(session.close().await, Some(CloseReason::Requested));
    assert_eq!(session.close().await, Some(CloseReason::Requested));
    assert!(session.is_closed());
    assert!(far.shutdown.is_cancelled());
    assert!(r.capture.stopped.load(Ordering::SeqCst));
    assert!(r.microphone.is_available());

    // microphone can be reused right away
    let again = VoiceDuplexSession::open(context(CancellationToken::new()), r.deps.clone()).await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn deactivation_ends_the_session() {
    let r = rig();
    let activation = CancellationToken::new();
    let mut session = VoiceDuplexSession::open(context(activation.clone()), r.deps.clone())
        .await
        .unwrap();

    activation.cancel();
    let events = collect_until_closed(&mut session).await;
    assert_eq!(events.last(), Some(&VoiceEvent::Closed(CloseReason::Requested)));
    assert!(r.dialer.dialed().is_empty());

    let err = VoiceDuplexSession::open(context(activation), r.deps.clone()).await.unwrap_err();
    assert!(matches!(err, VoiceError::Capability(_)));
}

#[tokio::test]
async fn transport_loss_reports_and_closes() {
    let r = rig();
    let mut session = VoiceDuplexSession::open(context(CancellationToken::new()), r.deps.clone())
        .await
        .unwrap();
    let far = r.connector.take_far();

    far.inbound.send(ServerEvent::Closed(Some("bye".into()))).await.unwrap();
    let events = collect_until_closed(&mut session).await;
    assert!(events.contains(&VoiceEvent::Error(LIVE_INTERRUPTED_MESSAGE.to_string())));
    assert_eq!(events.last(), Some(&VoiceEvent::Closed(CloseReason::Transport)));
    assert!(r.microphone.is_available());
}

#[test]
#[ignore] // Requires an output device
fn rodio_playback_starts() {
    let sink = aeliia_voice::RodioPlayback::new().expect("output device");
    sink.play(ScheduledFrame {
        start: Duration::ZERO,
        samples: vec![0.0; 2400],
        sample_rate: 24_000,
    })
    .unwrap();
    sink.stop();
}

#[test]
#[ignore] // Requires an input device
fn cpal_capture_delivers_chunks() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handle = aeliia_voice::CpalCapture.start(&AudioConfig::default(), tx).expect("input device");
    std::thread::sleep(Duration::from_millis(600));
    handle.stop();
    assert!(rx.try_recv().is_ok());
}
