//! One activation of the detectors.
//!
//! A [`DetectionSession`] holds the device lease for its whole lifetime and
//! runs up to two tokio tasks over it: the feature/emotion loop and the
//! envelope/pause loop. Both read the same leased source through an `Arc` and
//! keep their own state. Results go out on a broadcast channel owned by the
//! session.

use crate::arbiter::DetectionMode;
use crate::capture::{AudioSource, CaptureError, DeviceLease, ExclusiveDevice};
use crate::config::EngineConfig;
use crate::emotion::{self, EmotionHistory, EmotionSample, EmotionSummary};
use crate::features::{self, FeatureVector};
use crate::pause::{PauseAnalysis, PauseDetector, CONTEXT_FRAGMENTS};
use crate::transcript::TranscriptBuffer;
use crate::util::lock_unpoisoned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub const LOG_TARGET: &str = "voice_state::session";
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Emotion {
        sample: EmotionSample,
        summary: Option<EmotionSummary>,
    },
    Pause(PauseAnalysis),
    Error {
        message: String,
    },
    /// Last event of a session, sent by [`DetectionSession::stop`].
    Stopped,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MotionError {
    #[error("motion detector failed to start: {0}")]
    Start(String),
}

/// Start/stop seam for an external motion detector.
pub trait MotionDetector: Send + Sync {
    fn start(&self) -> Result<(), MotionError>;
    fn stop(&self);
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Motion(#[from] MotionError),
}

pub struct DetectionSession {
    mode: DetectionMode,
    events: broadcast::Sender<EngineEvent>,
    /// Created with the channel so the first subscriber sees every event.
    first_receiver: Mutex<Option<broadcast::Receiver<EngineEvent>>>,
    history: Arc<Mutex<EmotionHistory>>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    motion: Option<Arc<dyn MotionDetector>>,
    source: Option<Arc<DeviceLease>>,
    running: Arc<AtomicBool>,
}

impl DetectionSession {
    /// Leases `device` and starts the loops `mode` calls for.
    ///
    /// Fails without side effects if the device is busy, unavailable or
    /// denied, or if the motion detector refuses to start.
    pub async fn start(
        device: &ExclusiveDevice,
        mode: DetectionMode,
        config: &EngineConfig,
        transcript: TranscriptBuffer,
        motion: Option<Arc<dyn MotionDetector>>,
    ) -> Result<Self, SessionError> {
        let lease = device.acquire().await?;
        let source = Arc::new(lease);

        let motion = if mode.runs_motion() {
            match motion {
                Some(detector) => {
                    detector.start()?;
                    Some(detector)
                }
                None => {
                    tracing::warn!(target: LOG_TARGET, %mode, "mode includes motion but no motion detector is attached");
                    None
                }
            }
        } else {
            None
        };

        let (events, first_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown_tx);
        let running = Arc::new(AtomicBool::new(true));
        let history = Arc::new(Mutex::new(EmotionHistory::new()));

        let loop_ctx = || LoopContext {
            source: Arc::clone(&source),
            events: events.clone(),
            shutdown_tx: Arc::clone(&shutdown),
            shutdown_rx: shutdown.subscribe(),
            running: Arc::clone(&running),
        };

        let mut tasks = Vec::with_capacity(2);

        if mode.runs_emotion() {
            let classify_every = config.sampling.classify_interval() * mode.classify_interval_factor();
            tasks.push(tokio::spawn(run_emotion_loop(
                loop_ctx(),
                Arc::clone(&history),
                config.sampling.feature_interval(),
                classify_every,
            )));
        }

        tasks.push(tokio::spawn(run_pause_loop(
            loop_ctx(),
            PauseDetector::new(config.detection),
            transcript,
            config.sampling.envelope_interval(),
        )));

        tracing::info!(
            target: LOG_TARGET,
            %mode,
            sample_rate = source.sample_rate(),
            motion = motion.is_some(),
            "detection session started"
        );

        Ok(Self {
            mode,
            events,
            first_receiver: Mutex::new(Some(first_rx)),
            history,
            shutdown,
            tasks,
            motion,
            source: Some(source),
            running,
        })
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    /// `false` once stopped or after the device was lost.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The first call receives every event since start; later calls only
    /// see events sent after they subscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        lock_unpoisoned(&self.first_receiver, "session receiver")
            .take()
            .unwrap_or_else(|| self.events.subscribe())
    }

    pub fn summary(&self) -> Option<EmotionSummary> {
        lock_unpoisoned(&self.history, "emotion history").summary()
    }

    pub fn history_len(&self) -> usize {
        lock_unpoisoned(&self.history, "emotion history").len()
    }

    /// Stops both loops, releases the device and clears the history, then
    /// sends [`EngineEvent::Stopped`]. Nothing else is emitted once this
    /// returns. Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if self.source.is_none() {
            return;
        }
        let _ = self.shutdown.send(true);

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(target: LOG_TARGET, error = %e, "detection loop panicked");
                }
            }
        }

        if let Some(motion) = self.motion.take() {
            motion.stop();
        }
        // both loops have exited, so this is the last reference to the lease;
        // a hardware source joins its capture thread when released
        if let Some(source) = self.source.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || drop(source)).await {
                tracing::warn!(target: LOG_TARGET, error = %e, "device release failed");
            }
        }
        lock_unpoisoned(&self.history, "emotion history").clear();
        self.running.store(false, Ordering::Release);

        let _ = self.events.send(EngineEvent::Stopped);
        tracing::info!(target: LOG_TARGET, mode = %self.mode, "detection session stopped");
    }
}

impl Drop for DetectionSession {
    fn drop(&mut self) {
        if self.tasks.is_empty() && self.motion.is_none() {
            return;
        }
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
        if let Some(motion) = self.motion.take() {
            motion.stop();
        }
        self.running.store(false, Ordering::Release);
        tracing::debug!(target: LOG_TARGET, "session dropped without stop, loops aborted");
    }
}

struct LoopContext {
    source: Arc<DeviceLease>,
    events: broadcast::Sender<EngineEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
}

impl LoopContext {
    fn emit(&self, event: EngineEvent) {
        // no receivers is fine; events are fire-and-forget
        let _ = self.events.send(event);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Returns `true` when the loop must exit.
    fn on_capture_error(&self, error: CaptureError, what: &str) -> bool {
        match error {
            CaptureError::Disconnected(_)
            | CaptureError::PermissionDenied(_)
            | CaptureError::NoDevice(_) => {
                // only the first loop to notice reports it
                if self.running.swap(false, Ordering::AcqRel) {
                    tracing::error!(target: LOG_TARGET, error = %error, "capture device lost");
                    self.emit(EngineEvent::Error {
                        message: error.to_string(),
                    });
                }
                let _ = self.shutdown_tx.send(true);
                true
            }
            other => {
                tracing::warn!(target: LOG_TARGET, error = %other, read = what, "capture read failed, skipping");
                false
            }
        }
    }
}

async fn run_emotion_loop(
    mut ctx: LoopContext,
    history: Arc<Mutex<EmotionHistory>>,
    feature_every: Duration,
    classify_every: Duration,
) {
    let mut ticker = tokio::time::interval(feature_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut previous: Option<FeatureVector> = None;
    let mut last_classified = Instant::now();

    loop {
        tokio::select! {
            biased;
            changed = ctx.shutdown_rx.changed() => {
                if changed.is_err() || *ctx.shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }
        if ctx.is_shutting_down() {
            break;
        }

        let frame = match ctx.source.frequency_frame() {
            Ok(frame) => frame,
            Err(e) => {
                if ctx.on_capture_error(e, "frequency frame") {
                    break;
                }
                continue;
            }
        };

        let vector = features::extract(&frame, previous.as_ref());
        previous = Some(vector);

        let now = Instant::now();
        if now.saturating_duration_since(last_classified) < classify_every {
            continue;
        }
        last_classified = now;

        let sample = emotion::classify(&vector);
        let summary = {
            let mut history = lock_unpoisoned(&history, "emotion history");
            history.push(sample.clone());
            history.summary()
        };
        tracing::debug!(
            target: LOG_TARGET,
            emotion = %sample.emotion,
            confidence = sample.confidence,
            "emotion sample"
        );
        ctx.emit(EngineEvent::Emotion { sample, summary });
    }
    tracing::debug!(target: LOG_TARGET, "emotion loop exited");
}

async fn run_pause_loop(
    mut ctx: LoopContext,
    mut detector: PauseDetector,
    transcript: TranscriptBuffer,
    envelope_every: Duration,
) {
    let mut ticker = tokio::time::interval(envelope_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let deadline = detector.pending_deadline();
        tokio::select! {
            biased;
            changed = ctx.shutdown_rx.changed() => {
                if changed.is_err() || *ctx.shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if ctx.is_shutting_down() {
                    break;
                }
                let fragments = transcript.trailing(CONTEXT_FRAGMENTS);
                if let Some(analysis) = detector.fire_final(Instant::now(), &fragments) {
                    ctx.emit(EngineEvent::Pause(analysis));
                }
            }
            _ = ticker.tick() => {
                if ctx.is_shutting_down() {
                    break;
                }
                let amplitude = match ctx.source.amplitude() {
                    Ok(a) => a,
                    Err(e) => {
                        if ctx.on_capture_error(e, "amplitude") {
                            break;
                        }
                        continue;
                    }
                };
                let fragments = transcript.trailing(CONTEXT_FRAGMENTS);
                if let Some(analysis) = detector.observe(amplitude, Instant::now(), &fragments) {
                    ctx.emit(EngineEvent::Pause(analysis));
                }
            }
        }
    }
    detector.cancel();
    tracing::debug!(target: LOG_TARGET, "pause loop exited");
}

#[cfg(test)]
mod session_test;
