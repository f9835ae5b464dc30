use crate::capture::spectrum::{SpectrumAnalyzer, DEFAULT_FFT_SIZE};
use crate::capture::{AudioFrame, AudioSource, CaptureDevice, CaptureError};
use crate::util::lock_unpoisoned;
use futures::future::BoxFuture;
use futures::FutureExt;
use rodio::cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rodio::cpal::{
    BuildStreamError, DefaultStreamConfigError, Device, FromSample, InputCallbackInfo, Sample,
    SampleFormat, SizedSample, Stream, StreamConfig, StreamError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tokio::time::Instant;

const LOG_TARGET: &str = "capture::microphone";
/// Samples averaged for one amplitude reading.
const AMPLITUDE_WINDOW: usize = 1024;

/// Microphone input through cpal.
///
/// The cpal stream is not `Send` on every platform, so it lives on a dedicated
/// thread for the lifetime of the acquired source; the callback writes into a
/// shared sample ring that the sampling loops read from.
#[derive(Clone, Debug)]
pub struct CpalCaptureDevice {
    input_device_name: Option<String>,
    fft_size: usize,
}

impl CpalCaptureDevice {
    pub fn new() -> Self {
        Self {
            input_device_name: None,
            fft_size: DEFAULT_FFT_SIZE,
        }
    }

    pub fn with_input_device_name<S: Into<String>>(mut self, name: S) -> Self {
        self.input_device_name = Some(name.into());
        self
    }

    pub fn with_fft_size(mut self, fft_size: usize) -> Self {
        self.fft_size = fft_size.max(2);
        self
    }
}

impl Default for CpalCaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for CpalCaptureDevice {
    fn acquire(&self) -> BoxFuture<'_, Result<Box<dyn AudioSource>, CaptureError>> {
        let wanted = self.input_device_name.clone();
        let fft_size = self.fft_size;
        async move {
            let shared = Arc::new(SharedCapture::new(fft_size.max(AMPLITUDE_WINDOW)));
            let (ready_tx, ready_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = mpsc::channel::<()>();

            let thread_shared = Arc::clone(&shared);
            let thread = std::thread::Builder::new()
                .name("voice-state-capture".to_owned())
                .spawn(move || run_capture_thread(wanted, thread_shared, ready_tx, stop_rx))
                .map_err(|e| CaptureError::Stream(format!("spawn capture thread: {e}")))?;

            let sample_rate = ready_rx
                .await
                .map_err(|_| CaptureError::Stream("capture thread exited early".to_owned()))??;

            tracing::info!(target: LOG_TARGET, sample_rate, fft_size, "microphone acquired");

            Ok(Box::new(CpalSource {
                shared,
                sample_rate,
                analyzer: SpectrumAnalyzer::new(fft_size),
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            }) as Box<dyn AudioSource>)
        }
        .boxed()
    }
}

struct SharedCapture {
    ring: Mutex<VecDeque<f32>>,
    capacity: usize,
    disconnected: AtomicBool,
    disconnect_details: OnceLock<String>,
}

impl SharedCapture {
    fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            disconnected: AtomicBool::new(false),
            disconnect_details: OnceLock::new(),
        }
    }

    /// Downmixes interleaved frames to mono and appends them.
    fn push_interleaved<T>(&self, data: &[T], channels: usize)
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let mut ring = lock_unpoisoned(&self.ring, "capture ring");
        for frame in data.chunks(channels.max(1)) {
            let sum: f32 = frame.iter().map(|s| f32::from_sample(*s)).sum();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(sum / frame.len() as f32);
        }
    }

    fn newest(&self, n: usize) -> Vec<f32> {
        let ring = lock_unpoisoned(&self.ring, "capture ring");
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).copied().collect()
    }

    fn mark_disconnected(&self, details: String) {
        let _ = self.disconnect_details.set(details);
        self.disconnected.store(true, Ordering::Release);
    }

    fn check_connected(&self) -> Result<(), CaptureError> {
        if self.disconnected.load(Ordering::Acquire) {
            let details = self
                .disconnect_details
                .get()
                .cloned()
                .unwrap_or_else(|| "input device no longer available".to_owned());
            return Err(CaptureError::Disconnected(details));
        }
        Ok(())
    }
}

struct CpalSource {
    shared: Arc<SharedCapture>,
    sample_rate: u32,
    analyzer: SpectrumAnalyzer,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frequency_frame(&self) -> Result<AudioFrame, CaptureError> {
        self.shared.check_connected()?;
        let samples = self.shared.newest(self.analyzer.fft_size());
        let magnitudes = self.analyzer.magnitudes(&samples);
        Ok(AudioFrame {
            captured_at: Instant::now(),
            sample_rate: self.sample_rate,
            magnitudes,
            samples,
        })
    }

    fn amplitude(&self) -> Result<f32, CaptureError> {
        self.shared.check_connected()?;
        let samples = self.shared.newest(AMPLITUDE_WINDOW);
        if samples.is_empty() {
            return Ok(0.0);
        }
        let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
        Ok((sum_squares / samples.len() as f32).sqrt().clamp(0.0, 1.0))
    }
}

/// Blocks until the capture thread has dropped its stream. The thread only
/// waits on the stop channel, so the join is bounded by the backend's stream
/// teardown. `DetectionSession::stop` releases sources on the blocking pool.
impl Drop for CpalSource {
    fn drop(&mut self) {
        // Dropping the sender wakes the capture thread, which drops the stream.
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(target: LOG_TARGET, "capture thread panicked during shutdown");
            }
        }
        tracing::info!(target: LOG_TARGET, "microphone released");
    }
}

fn run_capture_thread(
    wanted: Option<String>,
    shared: Arc<SharedCapture>,
    ready_tx: oneshot::Sender<Result<u32, CaptureError>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let stream = match open_input_stream(wanted.as_deref(), &shared) {
        Ok((stream, sample_rate)) => {
            if ready_tx.send(Ok(sample_rate)).is_err() {
                // Acquire was cancelled while the stream was opening.
                return;
            }
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Blocks until the source is dropped.
    let _ = stop_rx.recv();
    drop(stream);
}

fn open_input_stream(
    wanted: Option<&str>,
    shared: &Arc<SharedCapture>,
) -> Result<(Stream, u32), CaptureError> {
    let device = select_input_device(wanted)?;
    let supported = device.default_input_config().map_err(map_config_error)?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let sample_rate = config.sample_rate.0;

    tracing::debug!(
        target: LOG_TARGET,
        device = %device.name().unwrap_or_else(|_| "<unnamed>".to_owned()),
        sample_rate,
        channels = config.channels,
        ?sample_format,
        "opening input stream"
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, shared),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, shared),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, shared),
        SampleFormat::I32 => build_stream::<i32>(&device, &config, shared),
        other => {
            return Err(CaptureError::Stream(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    }
    .map_err(map_build_error)?;

    stream
        .play()
        .map_err(|e| classify_backend_message(e.to_string()))?;

    Ok((stream, sample_rate))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    shared: &Arc<SharedCapture>,
) -> Result<Stream, BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels);
    let data_shared = Arc::clone(shared);
    let err_shared = Arc::clone(shared);
    device.build_input_stream(
        config,
        move |data: &[T], _: &InputCallbackInfo| data_shared.push_interleaved(data, channels),
        move |err| match err {
            StreamError::DeviceNotAvailable => {
                tracing::error!(target: LOG_TARGET, "input device disappeared");
                err_shared.mark_disconnected("input device not available".to_owned());
            }
            other => {
                tracing::warn!(target: LOG_TARGET, error = %other, "input stream error");
            }
        },
        None,
    )
}

fn select_input_device(wanted: Option<&str>) -> Result<Device, CaptureError> {
    let host = rodio::cpal::default_host();
    let Some(wanted) = wanted else {
        return host
            .default_input_device()
            .ok_or_else(|| CaptureError::NoDevice("no default input device".to_owned()));
    };

    let wanted_norm = normalize_device_name(wanted);
    let mut available = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for d in devices {
            let name = d.name().unwrap_or_else(|_| "<unnamed>".to_owned());
            if normalize_device_name(&name) == wanted_norm {
                return Ok(d);
            }
            available.push(name);
        }
    }
    Err(CaptureError::NoDevice(format!(
        "input device '{wanted}' not found (available: {})",
        format_device_list(&available)
    )))
}

fn map_config_error(err: DefaultStreamConfigError) -> CaptureError {
    match err {
        DefaultStreamConfigError::DeviceNotAvailable => {
            CaptureError::NoDevice("input device not available".to_owned())
        }
        other => classify_backend_message(other.to_string()),
    }
}

fn map_build_error(err: BuildStreamError) -> CaptureError {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            CaptureError::NoDevice("input device not available".to_owned())
        }
        other => classify_backend_message(other.to_string()),
    }
}

/// Backends report a refused microphone permission as a generic backend
/// error; recognise it from the message.
fn classify_backend_message(message: String) -> CaptureError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::Stream(message)
    }
}

fn normalize_device_name(s: &str) -> String {
    s.trim().to_ascii_lowercase()
}

fn format_device_list(devices: &[String]) -> String {
    if devices.is_empty() {
        return "<none>".to_owned();
    }
    devices.join(", ")
}
