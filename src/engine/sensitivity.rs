//! Deterministic sensitivity classification.
//!
//! A keyword check, not an LLM call: the classification gates the
//! relevance threshold and must be reproducible across runs. Markers
//! cover classification vocabulary, intelligence-community acronyms, and
//! known program terminology.

use regex::Regex;
use std::sync::OnceLock;

use crate::integrations::Sensitivity;

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?xi)
            \b(
                classified|covert|clandestine|
                code[-\s]?named?|cryptonym|
                special\ access\ program|
                black\ (?:budget|site|program)|
                TS/?SCI|NOFORN|SIGINT|HUMINT|
                JSOC|SOCOM|DEVGRU|
                NSA|CIA|DIA|NRO|ODNI|
                FISA|section\ 702
            )\b
            ",
        )
        .unwrap()
    })
}

/// Classify a question as public or sensitive.
pub fn classify(question: &str) -> Sensitivity {
    if marker_pattern().is_match(question) {
        Sensitivity::Sensitive
    } else {
        Sensitivity::Public
    }
}
