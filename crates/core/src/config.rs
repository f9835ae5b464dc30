use crate::arbiter::DetectionMode;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

pub const DEFAULT_SHORT_PAUSE_MS: u64 = 1000;
pub const DEFAULT_LONG_PAUSE_MS: u64 = 2500;
pub const DEFAULT_VOLUME_THRESHOLD: f32 = 0.02;
pub const DEFAULT_FEATURE_INTERVAL_MS: u64 = 100;
pub const DEFAULT_CLASSIFY_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_ENVELOPE_INTERVAL_MS: u64 = 50;
pub const ENV_SHORT_PAUSE_MS: &str = "VOICE_STATE_SHORT_PAUSE_MS";
pub const ENV_LONG_PAUSE_MS: &str = "VOICE_STATE_LONG_PAUSE_MS";
pub const ENV_VOLUME_THRESHOLD: &str = "VOICE_STATE_VOLUME_THRESHOLD";
pub const ENV_INPUT_DEVICE: &str = "VOICE_STATE_INPUT_DEVICE";

/// Thresholds for the pause / completion analyzer.
///
/// Fixed for the lifetime of a session; build a new one and restart to change.
/// Deserialization goes through [`DetectionConfig::new`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawDetectionConfig")]
pub struct DetectionConfig {
    short_pause_ms: u64,
    long_pause_ms: u64,
    volume_threshold: f32,
    context_analysis_enabled: bool,
}

impl DetectionConfig {
    pub fn new(
        short_pause_ms: u64,
        long_pause_ms: u64,
        volume_threshold: f32,
        context_analysis_enabled: bool,
    ) -> Result<Self, ConfigError> {
        if short_pause_ms == 0 {
            return Err(ConfigError::ZeroShortPause);
        }
        if long_pause_ms <= short_pause_ms {
            return Err(ConfigError::LongPauseNotAfterShort {
                short_ms: short_pause_ms,
                long_ms: long_pause_ms,
            });
        }
        if !volume_threshold.is_finite() || volume_threshold <= 0.0 || volume_threshold > 1.0 {
            return Err(ConfigError::VolumeThresholdOutOfRange(volume_threshold));
        }
        Ok(Self {
            short_pause_ms,
            long_pause_ms,
            volume_threshold,
            context_analysis_enabled,
        })
    }

    pub fn short_pause_ms(&self) -> u64 {
        self.short_pause_ms
    }

    pub fn long_pause_ms(&self) -> u64 {
        self.long_pause_ms
    }

    pub fn short_pause(&self) -> Duration {
        Duration::from_millis(self.short_pause_ms)
    }

    pub fn long_pause(&self) -> Duration {
        Duration::from_millis(self.long_pause_ms)
    }

    pub fn volume_threshold(&self) -> f32 {
        self.volume_threshold
    }

    pub fn context_analysis_enabled(&self) -> bool {
        self.context_analysis_enabled
    }
}

#[derive(Deserialize)]
struct RawDetectionConfig {
    short_pause_ms: u64,
    long_pause_ms: u64,
    volume_threshold: f32,
    context_analysis_enabled: bool,
}

impl TryFrom<RawDetectionConfig> for DetectionConfig {
    type Error = ConfigError;

    fn try_from(raw: RawDetectionConfig) -> Result<Self, Self::Error> {
        Self::new(
            raw.short_pause_ms,
            raw.long_pause_ms,
            raw.volume_threshold,
            raw.context_analysis_enabled,
        )
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            short_pause_ms: DEFAULT_SHORT_PAUSE_MS,
            long_pause_ms: DEFAULT_LONG_PAUSE_MS,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            context_analysis_enabled: true,
        }
    }
}

/// Cadences of the two sampling loops. Every interval is non-zero.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "RawSamplingConfig")]
pub struct SamplingConfig {
    feature_interval_ms: u64,
    classify_interval_ms: u64,
    envelope_interval_ms: u64,
}

#[derive(Deserialize)]
struct RawSamplingConfig {
    feature_interval_ms: u64,
    classify_interval_ms: u64,
    envelope_interval_ms: u64,
}

impl TryFrom<RawSamplingConfig> for SamplingConfig {
    type Error = ConfigError;

    fn try_from(raw: RawSamplingConfig) -> Result<Self, Self::Error> {
        Self::new(
            raw.feature_interval_ms,
            raw.classify_interval_ms,
            raw.envelope_interval_ms,
        )
    }
}

impl SamplingConfig {
    pub fn new(
        feature_interval_ms: u64,
        classify_interval_ms: u64,
        envelope_interval_ms: u64,
    ) -> Result<Self, ConfigError> {
        if feature_interval_ms == 0 || classify_interval_ms == 0 || envelope_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if classify_interval_ms < feature_interval_ms {
            return Err(ConfigError::ClassifyFasterThanFeatures);
        }
        Ok(Self {
            feature_interval_ms,
            classify_interval_ms,
            envelope_interval_ms,
        })
    }

    pub fn feature_interval_ms(&self) -> u64 {
        self.feature_interval_ms
    }

    pub fn classify_interval_ms(&self) -> u64 {
        self.classify_interval_ms
    }

    pub fn envelope_interval_ms(&self) -> u64 {
        self.envelope_interval_ms
    }

    pub fn feature_interval(&self) -> Duration {
        Duration::from_millis(self.feature_interval_ms)
    }

    pub fn classify_interval(&self) -> Duration {
        Duration::from_millis(self.classify_interval_ms)
    }

    pub fn envelope_interval(&self) -> Duration {
        Duration::from_millis(self.envelope_interval_ms)
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            feature_interval_ms: DEFAULT_FEATURE_INTERVAL_MS,
            classify_interval_ms: DEFAULT_CLASSIFY_INTERVAL_MS,
            envelope_interval_ms: DEFAULT_ENVELOPE_INTERVAL_MS,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub detection: DetectionConfig,
    pub sampling: SamplingConfig,
    pub auto_switch: bool,
    pub initial_mode: DetectionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detection: DetectionConfig::default(),
            sampling: SamplingConfig::default(),
            auto_switch: true,
            initial_mode: DetectionMode::Emotion,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("short pause threshold must be > 0 ms")]
    ZeroShortPause,
    #[error("long pause ({long_ms} ms) must be greater than short pause ({short_ms} ms)")]
    LongPauseNotAfterShort { short_ms: u64, long_ms: u64 },
    #[error("volume threshold must be in (0, 1], got {0}")]
    VolumeThresholdOutOfRange(f32),
    #[error("sampling intervals must be > 0 ms")]
    ZeroInterval,
    #[error("classification interval must not be shorter than the feature interval")]
    ClassifyFasterThanFeatures,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub trait Env {
    fn var(&self, key: &str) -> Option<String>;
}

#[derive(Clone, Debug, Default)]
pub struct StdEnv;

impl Env for StdEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapEnv {
    vars: std::collections::BTreeMap<String, String>,
}

impl MapEnv {
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

/// CLI value, then environment, then `default`. A present but unparsable
/// environment value is an error rather than a silent fallback.
pub fn resolve_parsed_with_default<T: FromStr>(
    cli_value: Option<T>,
    env_key: &str,
    env: &impl Env,
    default: T,
) -> Result<T, ConfigError> {
    if let Some(v) = cli_value {
        return Ok(v);
    }
    match env.var(env_key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue {
                key: env_key.to_owned(),
                value: raw,
            }),
        None => Ok(default),
    }
}

pub fn resolve_optional_string(
    cli_value: Option<String>,
    env_key: &str,
    env: &impl Env,
) -> Option<String> {
    match cli_value {
        Some(v) => Some(v),
        None => env.var(env_key),
    }
}
