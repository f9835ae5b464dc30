use crate::emotion::{EmotionLabel, EmotionSample};

const TONE_FACTOR: f32 = 0.8;
const NO_MATCH_CONFIDENCE: f32 = 0.5;

struct Lexicon {
    label: EmotionLabel,
    keywords: &'static [&'static str],
    tones: &'static [&'static str],
    weight: f32,
}

/// Earlier tables win ties.
const LEXICONS: [Lexicon; 8] = [
    Lexicon {
        label: EmotionLabel::Excited,
        keywords: &[
            "excited", "thrilled", "amazing", "awesome", "can't wait", "pumped", "stoked",
        ],
        tones: &["!!", "wow", "omg"],
        weight: 0.3,
    },
    Lexicon {
        label: EmotionLabel::Happy,
        keywords: &[
            "happy", "glad", "great", "love", "wonderful", "fantastic", "joy", "delighted",
        ],
        tones: &[":)", "😊", "haha", "lol"],
        weight: 0.25,
    },
    Lexicon {
        label: EmotionLabel::Frustrated,
        keywords: &[
            "frustrated", "annoyed", "angry", "irritated", "fed up", "ridiculous", "hate",
        ],
        tones: &["ugh", "argh", "seriously"],
        weight: 0.3,
    },
    Lexicon {
        label: EmotionLabel::Sad,
        keywords: &["sad", "depressed", "lonely", "miss", "cry", "heartbroken"],
        tones: &[":(", "😢", "sigh"],
        weight: 0.3,
    },
    Lexicon {
        label: EmotionLabel::Afraid,
        keywords: &["afraid", "scared", "terrified", "frightened", "fear", "panic"],
        tones: &["oh no", "help"],
        weight: 0.3,
    },
    Lexicon {
        label: EmotionLabel::Ambitious,
        keywords: &["goal", "plan", "achieve", "succeed", "ambition", "dream", "build"],
        tones: &["let's go", "i will", "next step"],
        weight: 0.25,
    },
    Lexicon {
        label: EmotionLabel::Nervous,
        keywords: &["nervous", "worried", "anxious", "uneasy", "tense", "unsure"],
        tones: &["...", "i guess", "maybe"],
        weight: 0.25,
    },
    Lexicon {
        label: EmotionLabel::Calm,
        keywords: &["calm", "relaxed", "peaceful", "fine", "okay", "chill", "content"],
        tones: &["no worries", "all good"],
        weight: 0.2,
    },
];

impl Lexicon {
    fn score(&self, lower: &str) -> f32 {
        let keyword_hits = self.keywords.iter().filter(|k| lower.contains(*k)).count();
        let tone_hits = self.tones.iter().filter(|t| lower.contains(*t)).count();
        keyword_hits as f32 * self.weight + tone_hits as f32 * self.weight * TONE_FACTOR
    }
}

/// Keyword and tone-marker classification for transcribed speech, used when
/// audio features are unavailable. Intensity mirrors the confidence.
pub fn classify_text(text: &str) -> EmotionSample {
    let lower = text.to_lowercase();

    let mut best: Option<(EmotionLabel, f32)> = None;
    for lexicon in &LEXICONS {
        let score = lexicon.score(&lower);
        if score > 0.0 && best.map_or(true, |(_, top)| score > top) {
            best = Some((lexicon.label, score));
        }
    }

    match best {
        Some((label, score)) => {
            let confidence = score.min(1.0);
            tracing::trace!(%label, score, "text classified");
            EmotionSample::from_label(label, confidence, confidence)
        }
        None => EmotionSample::from_label(EmotionLabel::Neutral, NO_MATCH_CONFIDENCE, 0.0),
    }
}
