//! Query decomposition for boolean-hostile upstreams.
//!
//! Some government APIs refuse composite boolean queries or quietly return
//! zero results for them. When that happens, integrations split a top-level
//! `A OR B OR ...` into individual term queries, run each, and union the
//! results by item identity. The split respects quoted phrases.

use super::types::Item;

/// Split a query on top-level ` OR `, leaving quoted phrases intact.
///
/// Terms are trimmed; empty terms are dropped. A query with no top-level
/// `OR` comes back as a single term.
pub fn split_or_terms(query: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = query.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            in_quotes = !in_quotes;
            current.push(c);
            i += 1;
            continue;
        }
        // A separator is the 4-char sequence ` OR ` outside quotes.
        if !in_quotes && c == ' ' && chars[i..].starts_with(&[' ', 'O', 'R', ' ']) {
            let term = current.trim().to_string();
            if !term.is_empty() {
                terms.push(term);
            }
            current.clear();
            i += 4;
            continue;
        }
        current.push(c);
        i += 1;
    }

    let term = current.trim().to_string();
    if !term.is_empty() {
        terms.push(term);
    }
    terms
}

/// Union result sets by item URL, preserving first-seen order.
pub fn union_by_url(sets: Vec<Vec<Item>>) -> Vec<Item> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for set in sets {
        for item in set {
            if seen.insert(item.url.clone()) {
                merged.push(item);
            }
        }
    }
    merged
}

/// Keyword fallback when an LLM returns an empty keyword field: take the
/// longest distinct words of the question itself, so the integration always
/// has something to search for.
pub fn fallback_keywords(question: &str, max: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut keywords: Vec<String> = question
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| w.len() >= 4)
        .map(|w| w.to_lowercase())
        .filter(|w| seen.insert(w.clone()))
        .collect();
    keywords.sort_by_key(|w| std::cmp::Reverse(w.len()));
    keywords.truncate(max);
    keywords
}
