mod classifier;
mod history;
mod text;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

pub use classifier::classify;
pub use history::{EmotionHistory, HISTORY_CAPACITY, TREND_WINDOW};
pub use text::classify_text;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EmotionLabel {
    Excited,
    Nervous,
    Frustrated,
    Sad,
    Anxious,
    Calm,
    Happy,
    Melancholy,
    Neutral,
    Afraid,
    Ambitious,
}

impl EmotionLabel {
    /// Characteristic `(valence, arousal)` of the label.
    pub fn profile(self) -> (f32, f32) {
        match self {
            EmotionLabel::Excited => (0.8, 0.9),
            EmotionLabel::Nervous => (0.3, 0.7),
            EmotionLabel::Frustrated => (0.2, 0.8),
            EmotionLabel::Sad => (0.2, 0.3),
            EmotionLabel::Anxious => (0.4, 0.8),
            EmotionLabel::Calm => (0.6, 0.2),
            EmotionLabel::Happy => (0.8, 0.6),
            EmotionLabel::Melancholy => (0.3, 0.4),
            EmotionLabel::Neutral => (0.5, 0.5),
            EmotionLabel::Afraid => (0.2, 0.8),
            EmotionLabel::Ambitious => (0.7, 0.7),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmotionLabel::Excited => "excited",
            EmotionLabel::Nervous => "nervous",
            EmotionLabel::Frustrated => "frustrated",
            EmotionLabel::Sad => "sad",
            EmotionLabel::Anxious => "anxious",
            EmotionLabel::Calm => "calm",
            EmotionLabel::Happy => "happy",
            EmotionLabel::Melancholy => "melancholy",
            EmotionLabel::Neutral => "neutral",
            EmotionLabel::Afraid => "afraid",
            EmotionLabel::Ambitious => "ambitious",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classification result. All scalar fields are in `[0, 1]`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmotionSample {
    pub emotion: EmotionLabel,
    pub confidence: f32,
    pub intensity: f32,
    pub valence: f32,
    pub arousal: f32,
    pub timestamp: SystemTime,
}

impl EmotionSample {
    /// Builds a sample using the label's valence/arousal profile.
    pub fn from_label(emotion: EmotionLabel, confidence: f32, intensity: f32) -> Self {
        let (valence, arousal) = emotion.profile();
        Self {
            emotion,
            confidence: confidence.clamp(0.0, 1.0),
            intensity: intensity.clamp(0.0, 1.0),
            valence,
            arousal,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Agitated,
    Calming,
    Stable,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EmotionSummary {
    pub dominant: EmotionLabel,
    pub mean_confidence: f32,
    pub trend: Trend,
    pub sample_count: usize,
    pub recommendations: Vec<String>,
}
