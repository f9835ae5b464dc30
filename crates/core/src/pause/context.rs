//! Linguistic hints about whether a speaker has finished their turn, read
//! from the tail of the transcript.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Fragments considered when reading the transcript tail.
pub const CONTEXT_FRAGMENTS: usize = 3;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ContextClue {
    TrailingConjunction,
    TrailingArticle,
    PronounAuxiliary,
    TrailingComma,
    TrailingFiller,
    TerminalPunctuation,
    ClosingPhrase,
    ShortAcknowledgement,
}

impl ContextClue {
    pub fn suggests_incomplete(self) -> bool {
        matches!(
            self,
            ContextClue::TrailingConjunction
                | ContextClue::TrailingArticle
                | ContextClue::PronounAuxiliary
                | ContextClue::TrailingComma
                | ContextClue::TrailingFiller
        )
    }

    pub fn suggests_complete(self) -> bool {
        !self.suggests_incomplete()
    }
}

struct Patterns {
    conjunction: Regex,
    article: Regex,
    pronoun_auxiliary: Regex,
    comma: Regex,
    filler: Regex,
    closing: Regex,
    acknowledgement: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            conjunction: Regex::new(
                r"(?i)\b(and|but|or|so|because|since|although|though|while|if|when|that|which|then)\s*$",
            )?,
            article: Regex::new(r"(?i)\b(a|an|the|this|these|those|my|your|our|their)\s*$")?,
            pronoun_auxiliary: Regex::new(
                r"(?i)\b(i|you|we|they|he|she|it)\s+(am|is|are|was|were|will|would|could|should|can|might|have|has|had|think|want|need|feel)\s*$",
            )?,
            comma: Regex::new(r",\s*$")?,
            filler: Regex::new(r"(?i)\b(um+|uh+|erm?|hmm+|like|you know)\s*(\.\.\.|…)?\s*$")?,
            closing: Regex::new(
                r"(?i)\b(thanks|thank you|bye|goodbye|see you|that's all|that's it|good night|talk later)\b[\s.!?,]*$",
            )?,
            acknowledgement: Regex::new(
                r"(?i)^\s*(yes|yeah|yep|no|nope|ok|okay|sure|right|got it|alright|cool|fine)[\s.!?]*$",
            )?,
        })
    }
}

static PATTERNS: LazyLock<Result<Patterns, regex::Error>> = LazyLock::new(Patterns::compile);

/// Clues found in the last [`CONTEXT_FRAGMENTS`] fragments of `fragments`
/// (oldest first).
pub fn detect_clues(fragments: &[String]) -> BTreeSet<ContextClue> {
    let mut clues = BTreeSet::new();

    let patterns = match PATTERNS.as_ref() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "context patterns unavailable, skipping context analysis");
            return clues;
        }
    };

    let tail = &fragments[fragments.len().saturating_sub(CONTEXT_FRAGMENTS)..];
    let text = tail
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        return clues;
    }

    if patterns.conjunction.is_match(&text) {
        clues.insert(ContextClue::TrailingConjunction);
    }
    if patterns.article.is_match(&text) {
        clues.insert(ContextClue::TrailingArticle);
    }
    if patterns.pronoun_auxiliary.is_match(&text) {
        clues.insert(ContextClue::PronounAuxiliary);
    }
    if patterns.comma.is_match(&text) {
        clues.insert(ContextClue::TrailingComma);
    }
    if patterns.filler.is_match(&text) {
        clues.insert(ContextClue::TrailingFiller);
    }
    if ends_with_terminal_punctuation(&text) {
        clues.insert(ContextClue::TerminalPunctuation);
    }
    if patterns.closing.is_match(&text) {
        clues.insert(ContextClue::ClosingPhrase);
    }
    let last = tail.iter().rev().map(|f| f.trim()).find(|f| !f.is_empty());
    if last.is_some_and(|f| patterns.acknowledgement.is_match(f)) {
        clues.insert(ContextClue::ShortAcknowledgement);
    }

    clues
}

/// A trailing ellipsis reads as trailing off, not as a full stop.
fn ends_with_terminal_punctuation(text: &str) -> bool {
    let trimmed = text.trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | ')'));
    if trimmed.ends_with("...") || trimmed.ends_with('…') {
        return false;
    }
    trimmed.ends_with(['.', '!', '?'])
}
