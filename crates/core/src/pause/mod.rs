//! Turn-completion detection from the amplitude envelope plus transcript
//! context.
//!
//! [`PauseDetector`] is a pure state machine: callers feed it amplitude
//! readings with a timestamp and drive the final deadline themselves (see
//! `session`), which keeps timing fully deterministic under test.

pub mod context;

use crate::config::DetectionConfig;
use crate::util::RingBuffer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

pub use context::{detect_clues, ContextClue, CONTEXT_FRAGMENTS};

pub const LOG_TARGET: &str = "voice_state::pause";
pub const ENVELOPE_WINDOW: usize = 10;

const HESITATION_CONFIDENCE: f32 = 0.2;
const THINKING_CONFIDENCE: f32 = 0.4;
const COMPLETE_CONFIDENCE: f32 = 0.8;
const CONTEXT_ADJUSTMENT: f32 = 0.3;
const MIN_CONFIDENCE: f32 = 0.1;
const MAX_CONFIDENCE: f32 = 0.9;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpeechPattern {
    Incomplete,
    Complete,
    Thinking,
    Hesitation,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PauseAnalysis {
    pub is_likely_complete: bool,
    pub confidence: f32,
    pub context_clues: BTreeSet<ContextClue>,
    pub pause_duration_ms: u32,
    pub speech_pattern: SpeechPattern,
    /// `false` for the analysis emitted at the short-pause mark, `true` for
    /// the one emitted at the long-pause deadline.
    pub is_final: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityState {
    /// No speech observed yet.
    Idle,
    Speaking,
    Silent { since: Instant },
}

/// Moving average over the last [`ENVELOPE_WINDOW`] amplitude readings.
#[derive(Clone, Debug)]
pub struct Envelope {
    window: RingBuffer<f32>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    pub fn new() -> Self {
        Self {
            window: RingBuffer::new(ENVELOPE_WINDOW),
        }
    }

    /// Records `amplitude` and returns the updated average.
    pub fn push(&mut self, amplitude: f32) -> f32 {
        self.window.push(amplitude);
        self.level()
    }

    pub fn level(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

/// Scores one pause given its duration and the transcript tail.
pub fn analyze_pause(
    config: &DetectionConfig,
    pause: Duration,
    fragments: &[String],
    is_final: bool,
) -> PauseAnalysis {
    let (mut speech_pattern, mut is_likely_complete, mut confidence) = if pause < config.short_pause()
    {
        (SpeechPattern::Hesitation, false, HESITATION_CONFIDENCE)
    } else if pause < config.long_pause() {
        (SpeechPattern::Thinking, false, THINKING_CONFIDENCE)
    } else {
        (SpeechPattern::Complete, true, COMPLETE_CONFIDENCE)
    };

    let context_clues = if config.context_analysis_enabled() {
        detect_clues(fragments)
    } else {
        BTreeSet::new()
    };

    let incomplete: Vec<ContextClue> = context_clues
        .iter()
        .copied()
        .filter(|c| c.suggests_incomplete())
        .collect();

    if !incomplete.is_empty() {
        is_likely_complete = false;
        confidence = (confidence - CONTEXT_ADJUSTMENT).max(MIN_CONFIDENCE);
        speech_pattern = if incomplete.iter().all(|c| *c == ContextClue::TrailingFiller) {
            SpeechPattern::Hesitation
        } else {
            SpeechPattern::Incomplete
        };
    } else if context_clues.iter().any(|c| c.suggests_complete()) {
        confidence = (confidence + CONTEXT_ADJUSTMENT).min(MAX_CONFIDENCE);
        if pause >= config.short_pause() {
            is_likely_complete = true;
            speech_pattern = SpeechPattern::Complete;
        }
    }

    PauseAnalysis {
        is_likely_complete,
        confidence,
        context_clues,
        pause_duration_ms: u32::try_from(pause.as_millis()).unwrap_or(u32::MAX),
        speech_pattern,
        is_final,
    }
}

/// Silence-episode state machine over amplitude readings.
///
/// Each Speaking -> Silent transition opens an episode. Once silence reaches
/// the short-pause threshold a provisional analysis is returned from
/// [`observe`](Self::observe) and a final deadline is armed at
/// `since + long_pause`; the caller hands that deadline back through
/// [`fire_final`](Self::fire_final). Speech cancels the episode.
#[derive(Debug)]
pub struct PauseDetector {
    config: DetectionConfig,
    envelope: Envelope,
    state: ActivityState,
    last_speech_time: Option<Instant>,
    final_deadline: Option<Instant>,
    provisional_emitted: bool,
}

impl PauseDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            envelope: Envelope::new(),
            state: ActivityState::Idle,
            last_speech_time: None,
            final_deadline: None,
            provisional_emitted: false,
        }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn envelope_level(&self) -> f32 {
        self.envelope.level()
    }

    /// When speech last turned into silence.
    pub fn last_speech_time(&self) -> Option<Instant> {
        self.last_speech_time
    }

    pub fn pending_deadline(&self) -> Option<Instant> {
        self.final_deadline
    }

    pub fn observe(
        &mut self,
        amplitude: f32,
        now: Instant,
        fragments: &[String],
    ) -> Option<PauseAnalysis> {
        let amplitude = if amplitude.is_finite() {
            amplitude.max(0.0)
        } else {
            0.0
        };
        let level = self.envelope.push(amplitude);
        let speaking = level >= self.config.volume_threshold();

        tracing::trace!(target: LOG_TARGET, amplitude, level, speaking, "envelope sample");

        if speaking {
            if self.state != ActivityState::Speaking {
                tracing::debug!(target: LOG_TARGET, level, "speech detected");
            }
            if self.final_deadline.take().is_some() {
                tracing::debug!(target: LOG_TARGET, "speech resumed, pending final analysis cancelled");
            }
            self.state = ActivityState::Speaking;
            self.provisional_emitted = false;
            return None;
        }

        match self.state {
            ActivityState::Idle => None,
            ActivityState::Speaking => {
                tracing::debug!(target: LOG_TARGET, level, "silence episode started");
                self.state = ActivityState::Silent { since: now };
                self.last_speech_time = Some(now);
                self.provisional_emitted = false;
                None
            }
            ActivityState::Silent { since } => {
                if self.provisional_emitted || self.final_deadline.is_some() {
                    return None;
                }
                let elapsed = now.saturating_duration_since(since);
                if elapsed < self.config.short_pause() {
                    return None;
                }

                self.provisional_emitted = true;
                let deadline = since + self.config.long_pause();
                self.final_deadline = Some(deadline);

                let analysis = analyze_pause(&self.config, elapsed, fragments, false);
                tracing::debug!(
                    target: LOG_TARGET,
                    pause_ms = analysis.pause_duration_ms,
                    complete = analysis.is_likely_complete,
                    confidence = analysis.confidence,
                    "provisional pause analysis"
                );
                Some(analysis)
            }
        }
    }

    /// Produces the final analysis if the armed deadline has been reached.
    /// At most once per episode.
    pub fn fire_final(&mut self, now: Instant, fragments: &[String]) -> Option<PauseAnalysis> {
        let deadline = self.final_deadline?;
        if now < deadline {
            return None;
        }
        self.final_deadline = None;

        let ActivityState::Silent { since } = self.state else {
            return None;
        };
        let elapsed = now.saturating_duration_since(since);
        let analysis = analyze_pause(&self.config, elapsed, fragments, true);
        tracing::debug!(
            target: LOG_TARGET,
            pause_ms = analysis.pause_duration_ms,
            complete = analysis.is_likely_complete,
            confidence = analysis.confidence,
            pattern = ?analysis.speech_pattern,
            "final pause analysis"
        );
        Some(analysis)
    }

    /// Drops any pending final deadline without emitting.
    pub fn cancel(&mut self) {
        if self.final_deadline.take().is_some() {
            tracing::debug!(target: LOG_TARGET, "pending final analysis dropped");
        }
    }

    pub fn reset(&mut self) {
        self.envelope.clear();
        self.state = ActivityState::Idle;
        self.last_speech_time = None;
        self.final_deadline = None;
        self.provisional_emitted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOUD: f32 = 0.5;

    fn config() -> DetectionConfig {
        DetectionConfig::new(1000, 2500, 0.02, true).expect("valid config")
    }

    fn transcript(fragments: &[&str]) -> Vec<String> {
        fragments.iter().map(|f| f.to_string()).collect()
    }

    /// Drives `detector` from speech into silence; returns the instant the
    /// silence episode started.
    fn speak_then_silence(detector: &mut PauseDetector, start: Instant) -> Instant {
        let mut now = start;
        for _ in 0..ENVELOPE_WINDOW {
            assert!(detector.observe(LOUD, now, &[]).is_none());
            now += Duration::from_millis(50);
        }
        // the envelope lags; feed zeros until it drops below the threshold
        loop {
            assert!(detector.observe(0.0, now, &[]).is_none());
            if let ActivityState::Silent { since } = detector.state() {
                return since;
            }
            now += Duration::from_millis(50);
        }
    }

    #[test]
    fn envelope_is_moving_average() {
        let mut env = Envelope::new();
        assert_eq!(env.level(), 0.0);
        assert!((env.push(1.0) - 1.0).abs() < 1e-6);
        assert!((env.push(0.0) - 0.5).abs() < 1e-6);
        for _ in 0..ENVELOPE_WINDOW {
            env.push(0.2);
        }
        assert!((env.level() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn silence_without_prior_speech_never_starts_episode() {
        let mut d = PauseDetector::new(config());
        let start = Instant::now();
        for i in 0..200 {
            let now = start + Duration::from_millis(50 * i);
            assert!(d.observe(0.0, now, &[]).is_none());
        }
        assert_eq!(d.state(), ActivityState::Idle);
        assert!(d.pending_deadline().is_none());
    }

    #[test]
    fn no_analysis_before_short_pause() {
        let mut d = PauseDetector::new(config());
        let since = speak_then_silence(&mut d, Instant::now());

        let mut now = since;
        while now < since + Duration::from_millis(999) {
            assert!(d.observe(0.0, now, &[]).is_none());
            now += Duration::from_millis(50);
        }
        assert!(d.pending_deadline().is_none());
    }

    #[test]
    fn provisional_then_final_once_per_episode() {
        let mut d = PauseDetector::new(config());
        let since = speak_then_silence(&mut d, Instant::now());

        let provisional = d
            .observe(0.0, since + Duration::from_millis(1000), &[])
            .expect("provisional analysis");
        assert!(!provisional.is_final);
        assert_eq!(provisional.speech_pattern, SpeechPattern::Thinking);
        assert_eq!(d.pending_deadline(), Some(since + Duration::from_millis(2500)));

        // further silence does not produce a second provisional
        assert!(d.observe(0.0, since + Duration::from_millis(1500), &[]).is_none());
        // too early
        assert!(d.fire_final(since + Duration::from_millis(2000), &[]).is_none());

        let final_analysis = d
            .fire_final(since + Duration::from_millis(2500), &[])
            .expect("final analysis");
        assert!(final_analysis.is_final);
        assert!(final_analysis.is_likely_complete);
        assert_eq!(final_analysis.pause_duration_ms, 2500);

        assert!(d.fire_final(since + Duration::from_millis(3000), &[]).is_none());
        assert!(d.observe(0.0, since + Duration::from_millis(4000), &[]).is_none());
    }

    #[test]
    fn speech_cancels_pending_final() {
        let mut d = PauseDetector::new(config());
        let since = speak_then_silence(&mut d, Instant::now());
        assert!(d.observe(0.0, since + Duration::from_millis(1100), &[]).is_some());
        assert!(d.pending_deadline().is_some());

        // one loud reading lifts the averaged envelope over the threshold
        assert!(d.observe(LOUD, since + Duration::from_millis(1200), &[]).is_none());
        assert_eq!(d.state(), ActivityState::Speaking);
        assert!(d.pending_deadline().is_none());
        assert!(d.fire_final(since + Duration::from_millis(2500), &[]).is_none());
    }

    #[test]
    fn new_episode_after_speech_resumes() {
        let mut d = PauseDetector::new(config());
        let first = speak_then_silence(&mut d, Instant::now());
        assert!(d.observe(0.0, first + Duration::from_millis(1000), &[]).is_some());

        let second = speak_then_silence(&mut d, first + Duration::from_millis(1200));
        assert!(second > first);
        assert_eq!(d.last_speech_time(), Some(second));
        assert!(d.observe(0.0, second + Duration::from_millis(1000), &[]).is_some());
    }

    #[test]
    fn final_with_trailing_conjunction_is_incomplete() {
        let d = config();
        let a = analyze_pause(&d, Duration::from_millis(2600), &transcript(&["I think that"]), true);
        assert!(!a.is_likely_complete);
        assert_eq!(a.speech_pattern, SpeechPattern::Incomplete);
        assert!(a.context_clues.contains(&ContextClue::TrailingConjunction));
        assert!((a.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn final_with_closing_phrase_is_complete() {
        let d = config();
        let a = analyze_pause(&d, Duration::from_millis(2600), &transcript(&["Thanks, bye!"]), true);
        assert!(a.is_likely_complete);
        assert_eq!(a.speech_pattern, SpeechPattern::Complete);
        assert!(a.confidence >= 0.8);
        assert!(a.confidence <= MAX_CONFIDENCE);
    }

    #[test]
    fn complete_cue_promotes_thinking_pause() {
        let a = analyze_pause(&config(), Duration::from_millis(1200), &transcript(&["Sounds good."]), false);
        assert!(a.is_likely_complete);
        assert_eq!(a.speech_pattern, SpeechPattern::Complete);
        assert!((a.confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn complete_cue_does_not_promote_hesitation() {
        let a = analyze_pause(&config(), Duration::from_millis(500), &transcript(&["Sounds good."]), false);
        assert!(!a.is_likely_complete);
        assert_eq!(a.speech_pattern, SpeechPattern::Hesitation);
        assert!((a.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn filler_alone_is_hesitation() {
        let a = analyze_pause(&config(), Duration::from_millis(2600), &transcript(&["it was um"]), true);
        assert!(!a.is_likely_complete);
        assert_eq!(a.speech_pattern, SpeechPattern::Hesitation);
    }

    #[test]
    fn confidence_floor_applies() {
        let a = analyze_pause(&config(), Duration::from_millis(100), &transcript(&["and"]), false);
        assert!((a.confidence - MIN_CONFIDENCE).abs() < 1e-6);
    }

    #[test]
    fn context_can_be_disabled() {
        let d = DetectionConfig::new(1000, 2500, 0.02, false).expect("valid config");
        let a = analyze_pause(&d, Duration::from_millis(2600), &transcript(&["I think that"]), true);
        assert!(a.context_clues.is_empty());
        assert!(a.is_likely_complete);
        assert!((a.confidence - COMPLETE_CONFIDENCE).abs() < 1e-6);
    }

    #[test]
    fn non_finite_amplitude_counts_as_silence() {
        let mut d = PauseDetector::new(config());
        assert!(d.observe(f32::NAN, Instant::now(), &[]).is_none());
        assert_eq!(d.envelope_level(), 0.0);
        assert_eq!(d.state(), ActivityState::Idle);
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut d = PauseDetector::new(config());
        let since = speak_then_silence(&mut d, Instant::now());
        d.observe(0.0, since + Duration::from_millis(1000), &[]);
        d.reset();
        assert_eq!(d.state(), ActivityState::Idle);
        assert!(d.pending_deadline().is_none());
        assert!(d.last_speech_time().is_none());
    }
}
