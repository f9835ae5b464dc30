use crate::capture::{AudioFrame, AudioSource, CaptureDevice, CaptureError};
use crate::util::lock_unpoisoned;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// A capture device whose output is set programmatically through a
/// [`ScriptController`]. Used by tests and by the CLI's synthetic input.
#[derive(Clone)]
pub struct ScriptedCaptureDevice {
    controller: ScriptController,
    sample_rate: u32,
    bin_count: usize,
}

impl ScriptedCaptureDevice {
    pub fn new(sample_rate: u32, bin_count: usize) -> (Self, ScriptController) {
        let controller = ScriptController {
            state: Arc::new(Mutex::new(ScriptState {
                magnitudes: vec![0.0; bin_count],
                ..ScriptState::default()
            })),
            bin_count,
            sample_rate,
        };
        let device = Self {
            controller: controller.clone(),
            sample_rate,
            bin_count,
        };
        (device, controller)
    }

    pub fn bin_count(&self) -> usize {
        self.bin_count
    }
}

impl CaptureDevice for ScriptedCaptureDevice {
    fn acquire(&self) -> BoxFuture<'_, Result<Box<dyn AudioSource>, CaptureError>> {
        async move {
            {
                let mut state = lock_unpoisoned(&self.controller.state, "scripted capture");
                if let Some(reason) = state.denied.clone() {
                    return Err(CaptureError::PermissionDenied(reason));
                }
                state.disconnected = None;
                state.active_sources += 1;
            }
            Ok(Box::new(ScriptedSource {
                controller: self.controller.clone(),
                sample_rate: self.sample_rate,
            }) as Box<dyn AudioSource>)
        }
        .boxed()
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    amplitude: f32,
    magnitudes: Vec<f32>,
    samples: Vec<f32>,
    denied: Option<String>,
    disconnected: Option<String>,
    active_sources: usize,
    frames_read: usize,
}

/// Shared handle that drives what a [`ScriptedCaptureDevice`] reports.
#[derive(Clone)]
pub struct ScriptController {
    state: Arc<Mutex<ScriptState>>,
    bin_count: usize,
    sample_rate: u32,
}

impl ScriptController {
    fn with_state<R>(&self, f: impl FnOnce(&mut ScriptState) -> R) -> R {
        let mut state = lock_unpoisoned(&self.state, "scripted capture");
        f(&mut state)
    }

    pub fn set_amplitude(&self, amplitude: f32) {
        self.with_state(|s| s.amplitude = amplitude.clamp(0.0, 1.0));
    }

    pub fn set_spectrum(&self, magnitudes: Vec<f32>) {
        self.with_state(|s| s.magnitudes = magnitudes);
    }

    pub fn set_samples(&self, samples: Vec<f32>) {
        self.with_state(|s| s.samples = samples);
    }

    /// Approximates a voiced frame: a flat floor at `level` with a full-scale
    /// peak at the bin nearest `pitch_hz`. Also sets the amplitude to `level`.
    pub fn set_voice(&self, pitch_hz: f32, level: f32) {
        let level = level.clamp(0.0, 1.0);
        let floor = level.min(0.95);
        let mut magnitudes = vec![floor; self.bin_count];
        if self.bin_count > 0 && self.sample_rate > 0 {
            let bin_hz = self.sample_rate as f32 / (2 * self.bin_count) as f32;
            let peak = ((pitch_hz / bin_hz).round() as usize).min(self.bin_count - 1);
            magnitudes[peak] = 1.0;
        }
        self.with_state(|s| {
            s.magnitudes = magnitudes;
            s.amplitude = level;
        });
    }

    /// Zeroes spectrum and amplitude.
    pub fn silence(&self) {
        let bins = self.bin_count;
        self.with_state(|s| {
            s.magnitudes = vec![0.0; bins];
            s.samples.clear();
            s.amplitude = 0.0;
        });
    }

    /// Every later read fails with [`CaptureError::Disconnected`] until the
    /// device is acquired again.
    pub fn disconnect(&self, reason: &str) {
        self.with_state(|s| s.disconnected = Some(reason.to_owned()));
    }

    pub fn deny_permission(&self, reason: &str) {
        self.with_state(|s| s.denied = Some(reason.to_owned()));
    }

    pub fn grant_permission(&self) {
        self.with_state(|s| s.denied = None);
    }

    /// Number of acquired sources not yet dropped.
    pub fn active_sources(&self) -> usize {
        self.with_state(|s| s.active_sources)
    }

    pub fn frames_read(&self) -> usize {
        self.with_state(|s| s.frames_read)
    }
}

struct ScriptedSource {
    controller: ScriptController,
    sample_rate: u32,
}

impl AudioSource for ScriptedSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frequency_frame(&self) -> Result<AudioFrame, CaptureError> {
        let sample_rate = self.sample_rate;
        self.controller.with_state(|s| {
            if let Some(reason) = &s.disconnected {
                return Err(CaptureError::Disconnected(reason.clone()));
            }
            s.frames_read += 1;
            Ok(AudioFrame {
                captured_at: Instant::now(),
                sample_rate,
                magnitudes: s.magnitudes.clone(),
                samples: s.samples.clone(),
            })
        })
    }

    fn amplitude(&self) -> Result<f32, CaptureError> {
        self.controller.with_state(|s| match &s.disconnected {
            Some(reason) => Err(CaptureError::Disconnected(reason.clone())),
            None => Ok(s.amplitude),
        })
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.controller
            .with_state(|s| s.active_sources = s.active_sources.saturating_sub(1));
    }
}
