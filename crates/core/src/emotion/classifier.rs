use crate::emotion::{EmotionLabel, EmotionSample};
use crate::features::FeatureVector;

struct Rule {
    label: EmotionLabel,
    confidence: f32,
    matches: fn(&FeatureVector) -> bool,
}

/// Evaluated top to bottom; the first match wins. All comparisons are strict.
///
/// Never consulted for a frame with zero energy (see [`classify`]), so the
/// low-energy rules only see frames that carry some signal.
const RULES: [Rule; 8] = [
    Rule {
        label: EmotionLabel::Excited,
        confidence: 0.8,
        matches: |f| f.pitch_hz > 200.0 && f.energy > 0.7,
    },
    Rule {
        label: EmotionLabel::Nervous,
        confidence: 0.7,
        matches: |f| f.pitch_hz > 200.0 && f.energy < 0.3,
    },
    Rule {
        label: EmotionLabel::Frustrated,
        confidence: 0.75,
        matches: |f| f.pitch_hz < 150.0 && f.energy > 0.8,
    },
    Rule {
        label: EmotionLabel::Sad,
        confidence: 0.7,
        matches: |f| f.pitch_hz < 150.0 && f.energy < 0.4,
    },
    Rule {
        label: EmotionLabel::Anxious,
        confidence: 0.6,
        matches: |f| f.speech_rate > 5.0,
    },
    Rule {
        label: EmotionLabel::Calm,
        confidence: 0.6,
        matches: |f| f.speech_rate < 2.0,
    },
    Rule {
        label: EmotionLabel::Happy,
        confidence: 0.65,
        matches: |f| f.spectral_centroid > 2000.0,
    },
    Rule {
        label: EmotionLabel::Melancholy,
        confidence: 0.6,
        matches: |f| f.spectral_centroid < 1000.0,
    },
];

const FALLBACK_CONFIDENCE: f32 = 0.5;
const SILENCE_CONFIDENCE: f32 = 0.3;

/// Maps one feature vector to an emotion through the fixed rule chain.
///
/// A frame with no spectral energy at all is reported as a low-confidence
/// neutral reading rather than whatever its zero pitch would imply.
pub fn classify(features: &FeatureVector) -> EmotionSample {
    let features = features.sanitized();
    let intensity = features.energy.clamp(0.0, 1.0);

    if features.energy == 0.0 {
        tracing::trace!("silent frame classified as neutral");
        return EmotionSample::from_label(EmotionLabel::Neutral, SILENCE_CONFIDENCE, 0.0);
    }

    let (label, confidence) = RULES
        .iter()
        .find(|rule| (rule.matches)(&features))
        .map_or((EmotionLabel::Neutral, FALLBACK_CONFIDENCE), |rule| {
            (rule.label, rule.confidence)
        });

    tracing::trace!(
        %label,
        pitch_hz = features.pitch_hz,
        energy = features.energy,
        speech_rate = features.speech_rate,
        centroid = features.spectral_centroid,
        "frame classified"
    );

    EmotionSample::from_label(label, confidence, intensity)
}
