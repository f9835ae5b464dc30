use crate::emotion::{EmotionLabel, EmotionSample, EmotionSummary, Trend};
use crate::util::RingBuffer;

pub const HISTORY_CAPACITY: usize = 10;
/// Number of most recent samples compared by [`EmotionHistory::trend`].
pub const TREND_WINDOW: usize = 3;
const TREND_DELTA: f32 = 0.2;

/// Sliding window of recent classifications, oldest first.
#[derive(Clone, Debug)]
pub struct EmotionHistory {
    samples: RingBuffer<EmotionSample>,
}

impl Default for EmotionHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl EmotionHistory {
    pub fn new() -> Self {
        Self {
            samples: RingBuffer::new(HISTORY_CAPACITY),
        }
    }

    pub fn push(&mut self, sample: EmotionSample) {
        if let Some(evicted) = self.samples.push(sample) {
            tracing::trace!(evicted = %evicted.emotion, "history full, oldest sample dropped");
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn latest(&self) -> Option<&EmotionSample> {
        self.samples.latest()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmotionSample> {
        self.samples.iter()
    }

    /// Most frequent label; ties go to whichever label appeared first.
    pub fn dominant(&self) -> Option<EmotionLabel> {
        // (label, count) in first-seen order
        let mut counts: Vec<(EmotionLabel, usize)> = Vec::new();
        for s in self.samples.iter() {
            match counts.iter_mut().find(|(label, _)| *label == s.emotion) {
                Some((_, n)) => *n += 1,
                None => counts.push((s.emotion, 1)),
            }
        }

        let mut best: Option<(EmotionLabel, usize)> = None;
        for (label, n) in counts {
            if best.map_or(true, |(_, top)| n > top) {
                best = Some((label, n));
            }
        }
        best.map(|(label, _)| label)
    }

    pub fn mean_confidence(&self) -> Option<f32> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f32 = self.samples.iter().map(|s| s.confidence).sum();
        Some(total / self.samples.len() as f32)
    }

    pub fn trend(&self) -> Trend {
        if self.samples.len() < TREND_WINDOW {
            return Trend::Stable;
        }
        let window: Vec<&EmotionSample> = self.samples.recent(TREND_WINDOW).collect();
        let (Some(first), Some(last)) = (window.first(), window.last()) else {
            return Trend::Stable;
        };

        let valence = Direction::of(last.valence - first.valence);
        let arousal = Direction::of(last.arousal - first.arousal);

        match (valence, arousal) {
            (Direction::Rising, Direction::Rising) => Trend::Improving,
            (Direction::Falling, Direction::Rising) => Trend::Agitated,
            (Direction::Falling, Direction::Falling) => Trend::Declining,
            (Direction::Rising, Direction::Falling) => Trend::Calming,
            _ => Trend::Stable,
        }
    }

    pub fn summary(&self) -> Option<EmotionSummary> {
        let dominant = self.dominant()?;
        let mean_confidence = self.mean_confidence()?;
        let trend = self.trend();

        let mut recommendations = vec![label_advice(dominant).to_string()];
        if let Some(advice) = trend_advice(trend) {
            recommendations.push(advice.to_string());
        }

        Some(EmotionSummary {
            dominant,
            mean_confidence,
            trend,
            sample_count: self.samples.len(),
            recommendations,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Rising,
    Falling,
    Flat,
}

impl Direction {
    fn of(delta: f32) -> Self {
        if delta > TREND_DELTA {
            Direction::Rising
        } else if delta < -TREND_DELTA {
            Direction::Falling
        } else {
            Direction::Flat
        }
    }
}

fn label_advice(label: EmotionLabel) -> &'static str {
    match label {
        EmotionLabel::Excited => "Match the energy and keep momentum going",
        EmotionLabel::Happy => "Keep the tone light and positive",
        EmotionLabel::Nervous => "Slow down and offer reassurance",
        EmotionLabel::Anxious => "Acknowledge concerns and keep replies short",
        EmotionLabel::Afraid => "Offer reassurance and a clear next step",
        EmotionLabel::Frustrated => "Acknowledge the difficulty and simplify",
        EmotionLabel::Sad => "Respond with empathy and a gentle pace",
        EmotionLabel::Melancholy => "Keep a gentle pace and check in",
        EmotionLabel::Calm => "Continue at the current pace",
        EmotionLabel::Ambitious => "Help break goals into concrete steps",
        EmotionLabel::Neutral => "No adjustment needed",
    }
}

fn trend_advice(trend: Trend) -> Option<&'static str> {
    match trend {
        Trend::Improving => Some("Mood is improving; keep the current approach"),
        Trend::Declining => Some("Mood is declining; consider changing direction"),
        Trend::Agitated => Some("Speaker is becoming agitated; de-escalate"),
        Trend::Calming => Some("Speaker is calming down"),
        Trend::Stable => None,
    }
}
