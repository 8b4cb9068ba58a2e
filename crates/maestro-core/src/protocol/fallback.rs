//! Heuristic phase detection for replies without an envelope.
//!
//! This path is deliberately weak: it scores phase-indicative phrases and
//! returns a capped confidence so callers can log or surface a hint but can
//! never mistake it for protocol data.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Highest confidence the detector will ever report.
pub const MAX_CONFIDENCE: f32 = 0.6;

/// Phase guessed from free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HintPhase {
    Analysis,
    TaskList,
    Progress,
    Completion,
    Aggregation,
    Error,
}

/// A low-confidence guess at what phase a reply belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackHint {
    pub phase: HintPhase,
    /// In `(0, MAX_CONFIDENCE]`.
    pub confidence: f32,
    /// The phrases that matched, for diagnostics.
    pub matched: Vec<String>,
}

struct Pattern {
    phase: HintPhase,
    regex: Regex,
    weight: f32,
}

#[allow(clippy::unwrap_used)] // patterns are literals covered by tests
static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    let p = |phase, re: &str, weight| Pattern {
        phase,
        regex: Regex::new(re).unwrap(),
        weight,
    };
    vec![
        p(HintPhase::Analysis, r"(?i)\banalysis\s+(is\s+)?(complete|completed|done|finished)\b", 0.35),
        p(HintPhase::Analysis, r"(?i)\brecommend(ed)?\s+(splitting|\d+\s+tasks?)\b", 0.2),
        p(HintPhase::Analysis, r"(?i)\bkey\s+files\b", 0.1),
        p(HintPhase::TaskList, r"(?i)\btask\s+(list|breakdown|plan)\s+(is\s+)?(ready|complete|below)\b", 0.35),
        p(HintPhase::TaskList, r"(?im)^\s*(task\s+)?\d+[.):]\s+\S+", 0.1),
        p(HintPhase::TaskList, r"(?i)\bdepends\s+on\b", 0.1),
        p(HintPhase::Progress, r"(?i)\b\d{1,3}\s*%\s*(complete|done)\b", 0.3),
        p(HintPhase::Progress, r"(?i)\b(currently|now)\s+(working|implementing|editing)\b", 0.15),
        p(HintPhase::Completion, r"(?i)\b(task|work|implementation)\s+(is\s+)?(complete|completed|done|finished)\b", 0.35),
        p(HintPhase::Completion, r"(?i)\ball\s+(tests|checks)\s+pass(ed|ing)?\b", 0.15),
        p(HintPhase::Aggregation, r"(?i)\b(merged|combined|aggregated)\s+(results|outputs|changes)\b", 0.3),
        p(HintPhase::Aggregation, r"(?i)\bconflicts?\s+(found|resolved|detected)\b", 0.15),
        p(HintPhase::Error, r"(?i)\b(error|failed|failure|unable to|cannot proceed)\b", 0.3),
        p(HintPhase::Error, r"(?i)\b(exception|panicked|traceback)\b", 0.2),
    ]
});

/// Guess the phase of `text`. Returns `None` when nothing matches.
pub fn detect(text: &str) -> Option<FallbackHint> {
    let mut best: Option<FallbackHint> = None;

    for phase in [
        HintPhase::Analysis,
        HintPhase::TaskList,
        HintPhase::Progress,
        HintPhase::Completion,
        HintPhase::Aggregation,
        HintPhase::Error,
    ] {
        let mut score = 0.0_f32;
        let mut matched = Vec::new();
        for pattern in PATTERNS.iter().filter(|p| p.phase == phase) {
            if let Some(m) = pattern.regex.find(text) {
                score += pattern.weight;
                matched.push(m.as_str().trim().to_string());
            }
        }
        if matched.is_empty() {
            continue;
        }
        let confidence = score.min(MAX_CONFIDENCE);
        if best.as_ref().is_none_or(|b| confidence > b.confidence) {
            best = Some(FallbackHint {
                phase,
                confidence,
                matched,
            });
        }
    }
    best
}
