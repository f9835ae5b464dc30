#[cfg(feature = "device-capture")]
mod microphone;
mod scripted;
#[cfg(feature = "device-capture")]
pub mod spectrum;

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

#[cfg(feature = "device-capture")]
pub use microphone::CpalCaptureDevice;
pub use scripted::{ScriptController, ScriptedCaptureDevice};

/// One snapshot of the capture stream.
///
/// `magnitudes` holds one normalized `[0, 1]` value per frequency bin (half the
/// FFT size). `samples` is the time-domain block the spectrum was computed
/// from, in `[-1, 1]`; it may be empty for sources that only expose a spectrum.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    pub captured_at: Instant,
    pub sample_rate: u32,
    pub magnitudes: Vec<f32>,
    pub samples: Vec<f32>,
}

impl AudioFrame {
    pub fn bin_count(&self) -> usize {
        self.magnitudes.len()
    }

    /// Width of one frequency bin in Hz.
    pub fn bin_hz(&self) -> f32 {
        if self.magnitudes.is_empty() {
            return 0.0;
        }
        self.sample_rate as f32 / (2 * self.magnitudes.len()) as f32
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no input device available: {0}")]
    NoDevice(String),

    #[error("capture device is already in use by another session")]
    Busy,

    #[error("capture device disconnected: {0}")]
    Disconnected(String),

    #[error("audio stream error: {0}")]
    Stream(String),
}

impl CaptureError {
    /// Whether a caller-side retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Busy | CaptureError::NoDevice(_))
    }
}

/// A live, acquired input stream. Reads are non-blocking snapshots.
pub trait AudioSource: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn frequency_frame(&self) -> Result<AudioFrame, CaptureError>;

    /// Current volume level in `[0, 1]`.
    fn amplitude(&self) -> Result<f32, CaptureError>;
}

pub trait CaptureDevice: Send + Sync {
    /// May prompt the user or OS for permission; dropping the returned source
    /// releases the hardware.
    fn acquire(&self) -> BoxFuture<'_, Result<Box<dyn AudioSource>, CaptureError>>;
}

/// Hands out at most one live [`DeviceLease`] at a time for the wrapped device.
#[derive(Clone)]
pub struct ExclusiveDevice {
    inner: Arc<dyn CaptureDevice>,
    in_use: Arc<AtomicBool>,
}

impl ExclusiveDevice {
    pub fn new(inner: Arc<dyn CaptureDevice>) -> Self {
        Self {
            inner,
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// Fails fast with [`CaptureError::Busy`] while another lease is alive.
    pub async fn acquire(&self) -> Result<DeviceLease, CaptureError> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("capture device requested while already leased");
            return Err(CaptureError::Busy);
        }
        // Released on drop, including when this future is cancelled mid-acquire.
        let flag = LeaseFlag(Arc::clone(&self.in_use));
        let source = self.inner.acquire().await?;
        tracing::debug!(sample_rate = source.sample_rate(), "capture device leased");
        Ok(DeviceLease {
            source,
            _flag: flag,
        })
    }
}

struct LeaseFlag(Arc<AtomicBool>);

impl Drop for LeaseFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exclusive ownership of an acquired source. Field order matters: the source
/// is dropped (hardware released) before the lease flag is cleared.
pub struct DeviceLease {
    source: Box<dyn AudioSource>,
    _flag: LeaseFlag,
}

impl AudioSource for DeviceLease {
    fn sample_rate(&self) -> u32 {
        self.source.sample_rate()
    }

    fn frequency_frame(&self) -> Result<AudioFrame, CaptureError> {
        self.source.frequency_frame()
    }

    fn amplitude(&self) -> Result<f32, CaptureError> {
        self.source.amplitude()
    }
}
