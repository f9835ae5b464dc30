//! Time-domain block -> normalized magnitude spectrum.
//!
//! Magnitudes are mapped from decibels onto `[0, 1]` over a fixed
//! `MIN_DECIBELS..MAX_DECIBELS` window, the same scaling a browser analyser
//! node applies, so the classifier thresholds see comparable values whatever
//! the capture backend.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

pub const DEFAULT_FFT_SIZE: usize = 2048;
pub const MIN_DECIBELS: f32 = -100.0;
pub const MAX_DECIBELS: f32 = -30.0;

pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = fft_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        Self {
            fft,
            window: hann_window(fft_size),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size() / 2
    }

    /// `samples` shorter than the FFT size are zero-padded; longer ones are
    /// truncated to their newest `fft_size` values.
    pub fn magnitudes(&self, samples: &[f32]) -> Vec<f32> {
        let n = self.fft_size();
        let tail = &samples[samples.len().saturating_sub(n)..];
        let mut buf: Vec<Complex<f32>> = self
            .window
            .iter()
            .enumerate()
            .map(|(i, w)| Complex::new(tail.get(i).copied().unwrap_or(0.0) * w, 0.0))
            .collect();

        self.fft.process(&mut buf);

        let scale = 1.0 / n as f32;
        buf[..self.bin_count()]
            .iter()
            .map(|c| normalize_db(c.norm() * scale))
            .collect()
    }
}

fn hann_window(n: usize) -> Vec<f32> {
    if n < 2 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (n - 1) as f32).cos()))
        .collect()
}

/// Linear magnitude -> `[0, 1]` across the analyser decibel window.
pub fn normalize_db(linear: f32) -> f32 {
    if !linear.is_finite() || linear <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * linear.log10();
    ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 1.0)
}
