//! Curated FAQ short-circuit: exact and fuzzy question matching.
//!
//! The index is built once from a newline-delimited JSON file
//! (`{"q": ..., "a": ..., "lang": ..., "uri": ...}` per line) and treated
//! as immutable for the process lifetime; reloading means restarting.
//! A query that matches a known prompt-injection pattern skips the FAQ
//! entirely and is forced down the retrieval path.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::text::normalize_query;

static INJECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ignore previous|system prompt|do anything now").unwrap());

#[derive(Debug, Clone, Deserialize)]
pub struct FaqEntry {
    pub q: String,
    pub a: String,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

/// A successful FAQ route.
#[derive(Debug, Clone)]
pub struct FaqHit {
    pub answer: String,
    pub uri: Option<String>,
}

pub struct FaqIndex {
    entries: Vec<FaqEntry>,
    /// normalized question → entry indices (several languages may share a
    /// normalized form).
    exact: HashMap<String, Vec<usize>>,
    fuzzy_threshold: f64,
}

impl FaqIndex {
    /// Load the index from a JSONL file.
    pub fn load(path: &Path, fuzzy_threshold: f64) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read FAQ file: {}", path.display()))?;
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: FaqEntry = serde_json::from_str(line)
                .with_context(|| format!("Bad FAQ record on line {}", lineno + 1))?;
            entries.push(entry);
        }
        Ok(Self::from_entries(entries, fuzzy_threshold))
    }

    pub fn from_entries(entries: Vec<FaqEntry>, fuzzy_threshold: f64) -> Self {
        let mut exact: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            exact.entry(normalize_query(&entry.q)).or_default().push(i);
        }
        Self {
            entries,
            exact,
            fuzzy_threshold,
        }
    }

    pub fn empty() -> Self {
        Self::from_entries(Vec::new(), 100.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Try to answer a query from the FAQ. `None` means "fall through to
    /// retrieval" — either no good match, or the injection guard fired.
    pub fn route(&self, query: &str, lang_pref: &[String]) -> Option<FaqHit> {
        if INJECTION.is_match(query) {
            return None;
        }

        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return None;
        }

        // Exact match on the normalized form, honoring language preference.
        if let Some(indices) = self.exact.get(&normalized) {
            for &i in indices {
                let entry = &self.entries[i];
                if lang_matches(entry, lang_pref) {
                    return Some(hit(entry));
                }
            }
        }

        // Fuzzy: best token-sort similarity among preferred-language
        // entries, accepted only above the threshold.
        let mut best: Option<(f64, &FaqEntry)> = None;
        for entry in self.entries.iter().filter(|e| lang_matches(e, lang_pref)) {
            let score = token_sort_ratio(&normalized, &normalize_query(&entry.q));
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, entry));
            }
        }
        match best {
            Some((score, entry)) if score >= self.fuzzy_threshold => Some(hit(entry)),
            _ => None,
        }
    }
}

fn hit(entry: &FaqEntry) -> FaqHit {
    FaqHit {
        answer: entry.a.clone(),
        uri: entry.uri.clone(),
    }
}

fn lang_matches(entry: &FaqEntry, lang_pref: &[String]) -> bool {
    if lang_pref.is_empty() {
        return true;
    }
    match &entry.lang {
        Some(lang) => lang_pref.iter().any(|p| p == lang),
        None => true,
    }
}

/// Token-order-insensitive similarity on a 0–100 scale: sort the
/// whitespace tokens of both strings, rejoin, and take the Levenshtein
/// ratio of the results.
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let sort = |s: &str| {
        let mut tokens: Vec<&str> = s.split_whitespace().collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    let (a, b) = (sort(a), sort(b));
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 100.0;
    }
    let dist = levenshtein(&a, &b);
    (1.0 - dist as f64 / max_len as f64) * 100.0
}

/// Levenshtein distance, two-row dynamic program.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
