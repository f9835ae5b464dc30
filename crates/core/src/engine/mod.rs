use crate::arbiter::{DetectionMode, DeviceResourceState, ModeArbiter};
use crate::capture::{CaptureDevice, ExclusiveDevice};
use crate::config::EngineConfig;
use crate::resources::{self, ResourceMonitor};
use crate::session::{DetectionSession, MotionDetector, SessionError};
use crate::transcript::TranscriptBuffer;
use crate::util::lock_unpoisoned;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Long-lived entry point: owns the device, configuration, mode arbiter and
/// transcript buffer, and starts [`DetectionSession`]s.
///
/// Cheap to clone; clones share the same device, arbiter and transcript.
#[derive(Clone)]
pub struct VoiceStateEngine {
    device: ExclusiveDevice,
    config: EngineConfig,
    arbiter: Arc<Mutex<ModeArbiter>>,
    transcript: TranscriptBuffer,
    motion: Option<Arc<dyn MotionDetector>>,
}

impl VoiceStateEngine {
    pub fn new(device: Arc<dyn CaptureDevice>, config: EngineConfig) -> Self {
        Self {
            device: ExclusiveDevice::new(device),
            arbiter: Arc::new(Mutex::new(ModeArbiter::new(
                config.initial_mode,
                config.auto_switch,
            ))),
            config,
            transcript: TranscriptBuffer::new(),
            motion: None,
        }
    }

    pub fn with_motion_detector(mut self, motion: Arc<dyn MotionDetector>) -> Self {
        self.motion = Some(motion);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle for appending transcribed speech.
    pub fn transcript(&self) -> TranscriptBuffer {
        self.transcript.clone()
    }

    pub fn mode(&self) -> DetectionMode {
        lock_unpoisoned(&self.arbiter, "arbiter").mode()
    }

    /// Manual override; applies to the next [`start`](Self::start).
    pub fn set_mode(&self, mode: DetectionMode) {
        lock_unpoisoned(&self.arbiter, "arbiter").set_mode(mode);
    }

    pub fn set_auto_switch(&self, enabled: bool) {
        lock_unpoisoned(&self.arbiter, "arbiter").set_auto_switch(enabled);
    }

    /// Feeds a resource reading to the arbiter. Returns the new mode if it
    /// changed; a running session keeps its mode until restarted.
    pub fn update_resources(&self, state: DeviceResourceState) -> Option<DetectionMode> {
        lock_unpoisoned(&self.arbiter, "arbiter").update_resources(state)
    }

    pub fn recommended_mode(&self) -> DetectionMode {
        lock_unpoisoned(&self.arbiter, "arbiter").recommended_mode()
    }

    pub fn is_device_in_use(&self) -> bool {
        self.device.is_in_use()
    }

    /// Polls `monitor` in the background until `shutdown` is set.
    pub fn watch_resources(
        &self,
        monitor: Arc<dyn ResourceMonitor>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        resources::watch_resources(monitor, Arc::clone(&self.arbiter), interval, shutdown)
    }

    /// Starts a session in the current mode. The engine does not retry; a
    /// busy, missing or denied device is returned as is.
    pub async fn start(&self) -> Result<DetectionSession, SessionError> {
        let mode = self.mode();
        tracing::info!(%mode, "starting detection session");
        DetectionSession::start(
            &self.device,
            mode,
            &self.config,
            self.transcript.clone(),
            self.motion.clone(),
        )
        .await
    }
}
