//! Per-frame spectral and temporal descriptors.
//!
//! Everything here is relative: energy is the RMS of normalized bin
//! magnitudes rather than a physical level, and the cepstral projection skips
//! the mel filterbank. Values are only comparable across frames from the same
//! source.

use crate::capture::AudioFrame;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

pub const CEPSTRAL_COEFFS: usize = 13;
pub const ROLLOFF_FRACTION: f32 = 0.85;
/// Speech rate reported for the first frame of a session.
pub const DEFAULT_SPEECH_RATE: f32 = 1.0;
const SPEECH_RATE_SCALE: f32 = 100.0;
const LOG_FLOOR: f32 = 1e-6;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeatureVector {
    pub pitch_hz: f32,
    pub energy: f32,
    pub spectral_centroid: f32,
    pub spectral_rolloff: f32,
    pub zero_crossing_rate: f32,
    /// Frame-to-frame energy change scaled by 100.
    pub speech_rate: f32,
    pub cepstral_coeffs: [f32; CEPSTRAL_COEFFS],
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self {
            pitch_hz: 0.0,
            energy: 0.0,
            spectral_centroid: 0.0,
            spectral_rolloff: 0.0,
            zero_crossing_rate: 0.0,
            speech_rate: DEFAULT_SPEECH_RATE,
            cepstral_coeffs: [0.0; CEPSTRAL_COEFFS],
        }
    }
}

impl FeatureVector {
    /// Replaces non-finite values with zero and clamps energy to `>= 0`.
    pub fn sanitized(mut self) -> Self {
        self.pitch_hz = finite_or_zero(self.pitch_hz);
        self.energy = finite_or_zero(self.energy).max(0.0);
        self.spectral_centroid = finite_or_zero(self.spectral_centroid);
        self.spectral_rolloff = finite_or_zero(self.spectral_rolloff);
        self.zero_crossing_rate = finite_or_zero(self.zero_crossing_rate);
        self.speech_rate = finite_or_zero(self.speech_rate);
        for c in self.cepstral_coeffs.iter_mut() {
            *c = finite_or_zero(*c);
        }
        self
    }

    pub fn is_finite(&self) -> bool {
        [
            self.pitch_hz,
            self.energy,
            self.spectral_centroid,
            self.spectral_rolloff,
            self.zero_crossing_rate,
            self.speech_rate,
        ]
        .iter()
        .chain(self.cepstral_coeffs.iter())
        .all(|v| v.is_finite())
    }
}

/// Computes the feature vector for `frame`. `previous` is only consulted for
/// the speech-rate delta.
pub fn extract(frame: &AudioFrame, previous: Option<&FeatureVector>) -> FeatureVector {
    let mags = frame.magnitudes.as_slice();
    let bin_hz = frame.bin_hz();

    let energy = rms(mags);
    let speech_rate = previous
        .map(|p| (energy - p.energy).abs() * SPEECH_RATE_SCALE)
        .unwrap_or(DEFAULT_SPEECH_RATE);

    FeatureVector {
        pitch_hz: peak_bin(mags).map_or(0.0, |i| i as f32 * bin_hz),
        energy,
        spectral_centroid: spectral_centroid(mags, bin_hz),
        spectral_rolloff: spectral_rolloff(mags, bin_hz, ROLLOFF_FRACTION),
        zero_crossing_rate: zero_crossing_rate(&frame.samples),
        speech_rate,
        cepstral_coeffs: cepstral_coeffs(mags),
    }
    .sanitized()
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

pub fn rms(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = values.iter().map(|v| v * v).sum();
    (sum_squares / values.len() as f32).sqrt()
}

/// First index holding the maximum magnitude.
fn peak_bin(mags: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &m) in mags.iter().enumerate() {
        if best.map_or(true, |(_, b)| m > b) {
            best = Some((i, m));
        }
    }
    best.map(|(i, _)| i)
}

fn spectral_centroid(mags: &[f32], bin_hz: f32) -> f32 {
    let total: f32 = mags.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let weighted: f32 = mags
        .iter()
        .enumerate()
        .map(|(i, m)| i as f32 * bin_hz * m)
        .sum();
    weighted / total
}

fn spectral_rolloff(mags: &[f32], bin_hz: f32, fraction: f32) -> f32 {
    let total: f32 = mags.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let threshold = total * fraction;
    let mut cumulative = 0.0;
    for (i, m) in mags.iter().enumerate() {
        cumulative += m;
        if cumulative >= threshold {
            return i as f32 * bin_hz;
        }
    }
    mags.len().saturating_sub(1) as f32 * bin_hz
}

fn zero_crossing_rate(samples: &[f32]) -> f32 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
        .count();
    crossings as f32 / (samples.len() - 1) as f32
}

/// DCT-II of the log magnitudes, normalized by the bin count.
fn cepstral_coeffs(mags: &[f32]) -> [f32; CEPSTRAL_COEFFS] {
    let mut out = [0.0; CEPSTRAL_COEFFS];
    if mags.is_empty() {
        return out;
    }
    let n = mags.len() as f32;
    let log_mags: Vec<f32> = mags.iter().map(|m| (m.max(0.0) + LOG_FLOOR).ln()).collect();
    for (k, coeff) in out.iter_mut().enumerate() {
        *coeff = log_mags
            .iter()
            .enumerate()
            .map(|(i, l)| l * (PI * k as f32 * (i as f32 + 0.5) / n).cos())
            .sum::<f32>()
            / n;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn frame(magnitudes: Vec<f32>, samples: Vec<f32>) -> AudioFrame {
        AudioFrame {
            captured_at: Instant::now(),
            sample_rate: 16_000,
            magnitudes,
            samples,
        }
    }

    #[test]
    fn pitch_is_peak_bin_in_hz() {
        // 16 kHz over 8 bins -> 1000 Hz per bin
        let f = extract(&frame(vec![0.1, 0.2, 0.9, 0.3, 0.0, 0.0, 0.0, 0.0], vec![]), None);
        assert_eq!(f.pitch_hz, 2000.0);
    }

    #[test]
    fn energy_is_rms_of_magnitudes() {
        let f = extract(&frame(vec![0.6, 0.8], vec![]), None);
        // sqrt((0.36 + 0.64) / 2)
        assert!((f.energy - 0.5f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn centroid_and_rolloff_follow_magnitude_mass() {
        // 4 bins of 2000 Hz; all mass in bins 1 and 3
        let f = extract(&frame(vec![0.0, 1.0, 0.0, 1.0], vec![]), None);
        assert!((f.spectral_centroid - 4000.0).abs() < 1e-3);
        // 85% of the mass is only reached at bin 3
        assert!((f.spectral_rolloff - 6000.0).abs() < 1e-3);
    }

    #[test]
    fn zero_crossing_rate_counts_sign_changes() {
        let f = extract(&frame(vec![0.0; 4], vec![0.5, -0.5, 0.5, -0.5, -0.5]), None);
        assert!((f.zero_crossing_rate - 0.75).abs() < 1e-6);
    }

    #[test]
    fn speech_rate_defaults_without_predecessor() {
        let f = extract(&frame(vec![0.5; 8], vec![]), None);
        assert_eq!(f.speech_rate, DEFAULT_SPEECH_RATE);
    }

    #[test]
    fn speech_rate_scales_energy_delta() {
        let prev = FeatureVector {
            energy: 0.2,
            ..FeatureVector::default()
        };
        let f = extract(&frame(vec![0.5; 8], vec![]), Some(&prev));
        assert!((f.speech_rate - 30.0).abs() < 1e-3);
    }

    #[test]
    fn silent_frame_is_finite_and_zero_energy() {
        let f = extract(&frame(vec![0.0; 512], vec![0.0; 1024]), None);
        assert!(f.is_finite());
        assert_eq!(f.energy, 0.0);
        assert_eq!(f.pitch_hz, 0.0);
        assert_eq!(f.spectral_centroid, 0.0);
    }

    #[test]
    fn empty_frame_does_not_panic() {
        let f = extract(&frame(Vec::new(), Vec::new()), None);
        assert!(f.is_finite());
        assert_eq!(f.cepstral_coeffs, [0.0; CEPSTRAL_COEFFS]);
    }

    #[test]
    fn flat_spectrum_has_only_dc_cepstrum() {
        let f = extract(&frame(vec![0.5; 64], vec![]), None);
        assert!((f.cepstral_coeffs[0] - (0.5f32 + LOG_FLOOR).ln()).abs() < 1e-4);
        for c in &f.cepstral_coeffs[1..] {
            assert!(c.abs() < 1e-4, "expected ~0, got {c}");
        }
    }

    #[test]
    fn sanitized_replaces_non_finite_values() {
        let v = FeatureVector {
            pitch_hz: f32::NAN,
            energy: -1.0,
            spectral_centroid: f32::INFINITY,
            ..FeatureVector::default()
        }
        .sanitized();
        assert!(v.is_finite());
        assert_eq!(v.energy, 0.0);
    }
}
