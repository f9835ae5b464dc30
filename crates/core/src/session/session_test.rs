use super::*;
use crate::capture::{AudioFrame, CaptureDevice, ScriptController, ScriptedCaptureDevice};
use crate::emotion::EmotionLabel;
use crate::pause::SpeechPattern;
use std::sync::atomic::AtomicUsize;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::sleep;

fn scripted_device() -> (ExclusiveDevice, ScriptController) {
    let (device, controller) = ScriptedCaptureDevice::new(16_000, 512);
    (ExclusiveDevice::new(Arc::new(device)), controller)
}

fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn pauses(events: &[EngineEvent]) -> Vec<PauseAnalysis> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Pause(p) => Some(p.clone()),
            _ => None,
        })
        .collect()
}

fn emotions(events: &[EngineEvent]) -> Vec<EmotionSample> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Emotion { sample, .. } => Some(sample.clone()),
            _ => None,
        })
        .collect()
}

async fn start(
    device: &ExclusiveDevice,
    mode: DetectionMode,
    transcript: TranscriptBuffer,
) -> DetectionSession {
    DetectionSession::start(device, mode, &EngineConfig::default(), transcript, None)
        .await
        .expect("session starts")
}

/// Speaks for 600 ms, then goes quiet.
async fn speak_then_pause(controller: &ScriptController) {
    controller.set_voice(300.0, 0.9);
    sleep(Duration::from_millis(600)).await;
    controller.silence();
}

#[derive(Default)]
struct RecordingMotion {
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail: bool,
}

impl MotionDetector for RecordingMotion {
    fn start(&self) -> Result<(), MotionError> {
        if self.fail {
            return Err(MotionError::Start("sensor unavailable".into()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn classifies_once_per_interval() {
    let (device, controller) = scripted_device();
    controller.set_voice(300.0, 0.9);
    let mut session = start(&device, DetectionMode::Emotion, TranscriptBuffer::new()).await;
    let mut rx = session.subscribe();

    sleep(Duration::from_millis(1050)).await;
    let samples = emotions(&drain(&mut rx));
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].emotion, EmotionLabel::Excited);
    // features are extracted on every feature tick, not only when classifying
    assert!(controller.frames_read() >= 10);

    let summary = session.summary().expect("summary after first sample");
    assert_eq!(summary.dominant, EmotionLabel::Excited);
    assert_eq!(summary.sample_count, 1);

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn battery_saver_halves_classification_rate() {
    let (device, controller) = scripted_device();
    controller.set_voice(300.0, 0.9);
    let mut session = start(&device, DetectionMode::BatterySaver, TranscriptBuffer::new()).await;
    let mut rx = session.subscribe();

    sleep(Duration::from_millis(1500)).await;
    assert!(emotions(&drain(&mut rx)).is_empty());

    sleep(Duration::from_millis(600)).await;
    assert_eq!(emotions(&drain(&mut rx)).len(), 1);

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn motion_mode_skips_emotion_loop() {
    let (device, controller) = scripted_device();
    controller.set_voice(300.0, 0.9);
    let mut session = start(&device, DetectionMode::Motion, TranscriptBuffer::new()).await;
    let mut rx = session.subscribe();

    sleep(Duration::from_millis(2500)).await;
    assert!(emotions(&drain(&mut rx)).is_empty());
    assert_eq!(controller.frames_read(), 0);

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn short_silence_produces_no_pause_analysis() {
    let (device, controller) = scripted_device();
    let mut session = start(&device, DetectionMode::Emotion, TranscriptBuffer::new()).await;
    let mut rx = session.subscribe();

    speak_then_pause(&controller).await;
    // the envelope needs ~500 ms to settle, so this is well under the short pause
    sleep(Duration::from_millis(1300)).await;
    controller.set_voice(300.0, 0.9);
    sleep(Duration::from_millis(3000)).await;

    assert!(pauses(&drain(&mut rx)).is_empty());
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn trailing_conjunction_is_not_complete() {
    let (device, controller) = scripted_device();
    let transcript = TranscriptBuffer::new();
    transcript.append("I think that");
    let mut session = start(&device, DetectionMode::Emotion, transcript).await;
    let mut rx = session.subscribe();

    speak_then_pause(&controller).await;
    sleep(Duration::from_millis(4000)).await;

    let analyses = pauses(&drain(&mut rx));
    assert_eq!(analyses.len(), 2, "one provisional and one final: {analyses:?}");
    assert!(!analyses[0].is_final);
    let last = &analyses[1];
    assert!(last.is_final);
    assert!(!last.is_likely_complete);
    assert_eq!(last.speech_pattern, SpeechPattern::Incomplete);

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn closing_phrase_is_complete() {
    let (device, controller) = scripted_device();
    let transcript = TranscriptBuffer::new();
    let mut session = start(&device, DetectionMode::Emotion, transcript.clone()).await;
    let mut rx = session.subscribe();

    transcript.append("Thanks, bye!");
    speak_then_pause(&controller).await;
    sleep(Duration::from_millis(4000)).await;

    let analyses = pauses(&drain(&mut rx));
    let last = analyses.last().expect("final analysis");
    assert!(last.is_final);
    assert!(last.is_likely_complete);
    assert!(last.confidence >= 0.8);

    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn nothing_after_stop_with_pending_final() {
    let (device, controller) = scripted_device();
    let mut session = start(&device, DetectionMode::Both, TranscriptBuffer::new()).await;
    let mut rx = session.subscribe();

    speak_then_pause(&controller).await;
    // past the provisional analysis, before the final deadline
    sleep(Duration::from_millis(1800)).await;
    let analyses = pauses(&drain(&mut rx));
    assert_eq!(analyses.len(), 1);
    assert!(!analyses[0].is_final);

    session.stop().await;
    assert!(!session.is_running());
    assert_eq!(drain(&mut rx), vec![EngineEvent::Stopped]);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test(start_paused = true)]
async fn stop_releases_device_and_clears_history() {
    let (device, controller) = scripted_device();
    controller.set_voice(300.0, 0.9);
    let mut session = start(&device, DetectionMode::Emotion, TranscriptBuffer::new()).await;

    sleep(Duration::from_millis(2100)).await;
    assert_eq!(session.history_len(), 2);

    session.stop().await;
    assert_eq!(session.history_len(), 0);
    assert!(session.summary().is_none());
    assert!(!device.is_in_use());
    assert_eq!(controller.active_sources(), 0);

    // idempotent
    session.stop().await;
}

#[tokio::test(start_paused = true)]
async fn device_loss_reports_once_and_ends_loops() {
    let (device, controller) = scripted_device();
    controller.set_voice(300.0, 0.9);
    let mut session = start(&device, DetectionMode::Emotion, TranscriptBuffer::new()).await;
    let mut rx = session.subscribe();

    sleep(Duration::from_millis(200)).await;
    controller.disconnect("usb unplugged");
    sleep(Duration::from_millis(200)).await;

    let errors: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::Error { .. }))
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(!session.is_running());

    // loops are gone: no more reads, no more events
    let reads = controller.frames_read();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(controller.frames_read(), reads);
    assert!(drain(&mut rx).is_empty());

    session.stop().await;
    assert!(!device.is_in_use());
}

#[tokio::test(start_paused = true)]
async fn second_session_is_busy() {
    let (device, _controller) = scripted_device();
    let mut first = start(&device, DetectionMode::Emotion, TranscriptBuffer::new()).await;

    let err = DetectionSession::start(
        &device,
        DetectionMode::Emotion,
        &EngineConfig::default(),
        TranscriptBuffer::new(),
        None,
    )
    .await
    .err()
    .expect("second start must fail");
    assert!(matches!(err, SessionError::Capture(CaptureError::Busy)));

    first.stop().await;
    let mut again = start(&device, DetectionMode::Emotion, TranscriptBuffer::new()).await;
    again.stop().await;
}

#[tokio::test(start_paused = true)]
async fn permission_denied_fails_start() {
    let (device, controller) = scripted_device();
    controller.deny_permission("blocked in system settings");

    let err = DetectionSession::start(
        &device,
        DetectionMode::Emotion,
        &EngineConfig::default(),
        TranscriptBuffer::new(),
        None,
    )
    .await
    .err()
    .expect("denied");
    assert!(matches!(
        err,
        SessionError::Capture(CaptureError::PermissionDenied(_))
    ));
    assert!(!device.is_in_use());
}

#[tokio::test(start_paused = true)]
async fn motion_detector_follows_mode() {
    let (device, _controller) = scripted_device();
    let motion = Arc::new(RecordingMotion::default());

    let mut session = DetectionSession::start(
        &device,
        DetectionMode::Emotion,
        &EngineConfig::default(),
        TranscriptBuffer::new(),
        Some(motion.clone() as Arc<dyn MotionDetector>),
    )
    .await
    .expect("start");
    session.stop().await;
    assert_eq!(motion.starts.load(Ordering::SeqCst), 0);

    let mut session = DetectionSession::start(
        &device,
        DetectionMode::Both,
        &EngineConfig::default(),
        TranscriptBuffer::new(),
        Some(motion.clone() as Arc<dyn MotionDetector>),
    )
    .await
    .expect("start");
    assert_eq!(motion.starts.load(Ordering::SeqCst), 1);
    session.stop().await;
    assert_eq!(motion.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_motion_detector_releases_device() {
    let (device, _controller) = scripted_device();
    let motion = Arc::new(RecordingMotion {
        fail: true,
        ..RecordingMotion::default()
    });

    let err = DetectionSession::start(
        &device,
        DetectionMode::Motion,
        &EngineConfig::default(),
        TranscriptBuffer::new(),
        Some(motion as Arc<dyn MotionDetector>),
    )
    .await
    .err()
    .expect("motion start fails");
    assert!(matches!(err, SessionError::Motion(_)));
    assert!(!device.is_in_use());
}

#[tokio::test(start_paused = true)]
async fn dropping_session_aborts_loops() {
    let (device, controller) = scripted_device();
    let session = start(&device, DetectionMode::Both, TranscriptBuffer::new()).await;
    sleep(Duration::from_millis(300)).await;
    drop(session);

    sleep(Duration::from_millis(100)).await;
    assert!(!device.is_in_use());
    assert_eq!(controller.active_sources(), 0);
}

/// Records which thread released it.
struct ReleaseTracking {
    released_on: Arc<Mutex<Option<std::thread::ThreadId>>>,
}

impl CaptureDevice for ReleaseTracking {
    fn acquire(&self) -> BoxFuture<'_, Result<Box<dyn AudioSource>, CaptureError>> {
        let released_on = Arc::clone(&self.released_on);
        async move {
            Ok(Box::new(TrackedSource { released_on }) as Box<dyn AudioSource>)
        }
        .boxed()
    }
}

struct TrackedSource {
    released_on: Arc<Mutex<Option<std::thread::ThreadId>>>,
}

impl AudioSource for TrackedSource {
    fn sample_rate(&self) -> u32 {
        16_000
    }

    fn frequency_frame(&self) -> Result<AudioFrame, CaptureError> {
        Ok(AudioFrame {
            captured_at: Instant::now(),
            sample_rate: 16_000,
            magnitudes: vec![0.0; 16],
            samples: Vec::new(),
        })
    }

    fn amplitude(&self) -> Result<f32, CaptureError> {
        Ok(0.0)
    }
}

impl Drop for TrackedSource {
    fn drop(&mut self) {
        *lock_unpoisoned(&self.released_on, "release thread") = Some(std::thread::current().id());
    }
}

#[tokio::test(start_paused = true)]
async fn stop_releases_source_off_the_runtime_thread() {
    let released_on = Arc::new(Mutex::new(None));
    let device = ExclusiveDevice::new(Arc::new(ReleaseTracking {
        released_on: Arc::clone(&released_on),
    }));
    let mut session = start(&device, DetectionMode::Emotion, TranscriptBuffer::new()).await;
    sleep(Duration::from_millis(300)).await;

    session.stop().await;
    assert!(!device.is_in_use());
    let thread = (*lock_unpoisoned(&released_on, "release thread")).expect("source released");
    assert_ne!(thread, std::thread::current().id());
}

#[test]
fn events_serialize_with_type_tag() {
    let json = serde_json::to_value(EngineEvent::Error {
        message: "gone".into(),
    })
    .expect("serialize");
    assert_eq!(json["type"], "error");
    assert_eq!(json["message"], "gone");

    let json = serde_json::to_value(EngineEvent::Stopped).expect("serialize");
    assert_eq!(json["type"], "stopped");
}
