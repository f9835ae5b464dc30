use serde::{Deserialize, Serialize};
use std::fmt;

const LOW_BATTERY: f32 = 0.2;
const HIGH_BATTERY: f32 = 0.7;
const RECOMMEND_EMOTION_BELOW: f32 = 0.3;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    Emotion,
    Motion,
    Both,
    BatterySaver,
}

impl DetectionMode {
    pub fn runs_emotion(self) -> bool {
        matches!(
            self,
            DetectionMode::Emotion | DetectionMode::Both | DetectionMode::BatterySaver
        )
    }

    pub fn runs_motion(self) -> bool {
        matches!(self, DetectionMode::Motion | DetectionMode::Both)
    }

    /// Multiplier applied to the classification interval.
    pub fn classify_interval_factor(self) -> u32 {
        match self {
            DetectionMode::BatterySaver => 2,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DetectionMode::Emotion => "emotion",
            DetectionMode::Motion => "motion",
            DetectionMode::Both => "both",
            DetectionMode::BatterySaver => "battery_saver",
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceMode {
    High,
    #[default]
    Balanced,
    BatterySaver,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeviceResourceState {
    /// Fraction in `[0, 1]`.
    pub battery_level: f32,
    pub is_charging: bool,
    pub performance_mode: PerformanceMode,
}

impl Default for DeviceResourceState {
    fn default() -> Self {
        Self {
            battery_level: 1.0,
            is_charging: false,
            performance_mode: PerformanceMode::Balanced,
        }
    }
}

impl DeviceResourceState {
    pub fn new(battery_level: f32, is_charging: bool, performance_mode: PerformanceMode) -> Self {
        let battery_level = if battery_level.is_finite() {
            battery_level.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            battery_level,
            is_charging,
            performance_mode,
        }
    }
}

/// Mode the engine should run in for `state`. [`ModeArbiter`] compares the
/// result against its current mode.
pub fn resolve(state: &DeviceResourceState) -> DetectionMode {
    let on_battery = !state.is_charging;
    if state.performance_mode == PerformanceMode::BatterySaver
        || (state.battery_level < LOW_BATTERY && on_battery)
    {
        DetectionMode::Emotion
    } else if state.performance_mode == PerformanceMode::High
        && (state.battery_level > HIGH_BATTERY || state.is_charging)
    {
        DetectionMode::Both
    } else {
        DetectionMode::Emotion
    }
}

/// Advisory only; never applied by the arbiter.
pub fn recommended_mode(state: &DeviceResourceState) -> DetectionMode {
    if state.battery_level < RECOMMEND_EMOTION_BELOW && !state.is_charging {
        DetectionMode::Emotion
    } else {
        DetectionMode::Both
    }
}

/// Holds the mode the next session will start in.
#[derive(Clone, Debug)]
pub struct ModeArbiter {
    mode: DetectionMode,
    auto_switch: bool,
    resources: DeviceResourceState,
}

impl ModeArbiter {
    pub fn new(initial: DetectionMode, auto_switch: bool) -> Self {
        Self {
            mode: initial,
            auto_switch,
            resources: DeviceResourceState::default(),
        }
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    pub fn auto_switch(&self) -> bool {
        self.auto_switch
    }

    pub fn set_auto_switch(&mut self, enabled: bool) {
        self.auto_switch = enabled;
    }

    pub fn resources(&self) -> DeviceResourceState {
        self.resources
    }

    /// Manual override. Takes effect on the next session start.
    pub fn set_mode(&mut self, mode: DetectionMode) {
        if mode != self.mode {
            tracing::info!(from = %self.mode, to = %mode, "detection mode set");
        }
        self.mode = mode;
    }

    /// Records `state` and, with auto-switch on, re-resolves the mode.
    /// Returns the new mode when it changed.
    pub fn update_resources(&mut self, state: DeviceResourceState) -> Option<DetectionMode> {
        self.resources = state;
        if !self.auto_switch {
            return None;
        }
        let next = resolve(&state);
        if next == self.mode {
            return None;
        }
        tracing::info!(
            from = %self.mode,
            to = %next,
            battery = state.battery_level,
            charging = state.is_charging,
            performance = ?state.performance_mode,
            "detection mode switched"
        );
        self.mode = next;
        Some(next)
    }

    pub fn recommended_mode(&self) -> DetectionMode {
        recommended_mode(&self.resources)
    }
}
