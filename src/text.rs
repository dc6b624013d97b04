//! Text normalization helpers used across routing, ranking, and synthesis.
//!
//! Queries and FAQ questions are folded into an accent-insensitive,
//! whitespace-collapsed form so that "¿Qué es...?" and "Que es...?" land on
//! the same key. Language detection is a cheap hint-based heuristic, good
//! enough to pick the answer language for fallback messages.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

static ES_HINTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[¿¡ñáéíóúü]|\b(el|la|de|y|que|cómo|qué)\b").unwrap()
});
static EN_HINTS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(the|and|of|how|what|is|are)\b").unwrap());
static BOILERPLATE_RUNS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(Leer más\s*){2,}").unwrap());

/// Decompose, drop combining marks, recompose. Also drops the Spanish
/// inverted punctuation marks, which otherwise keep accented and plain
/// spellings of the same question from colliding.
pub fn strip_diacritics(s: &str) -> String {
    s.nfd()
        .filter(|c| !is_combining_mark(*c) && *c != '¿' && *c != '¡')
        .nfkc()
        .collect()
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form for matching: trimmed, lowercased, single-spaced,
/// accent-stripped.
pub fn normalize_query(q: &str) -> String {
    strip_diacritics(&collapse_whitespace(q.trim()).to_lowercase())
}

/// Lowercase + accent-strip, for containment checks.
pub fn fold(s: &str) -> String {
    strip_diacritics(&s.to_lowercase())
}

/// Guess the language of a text: "es" or "en".
///
/// Hint words/characters for each language are counted as booleans; an
/// unambiguous hint wins, inverted punctuation breaks ties toward Spanish,
/// and English is the default.
pub fn detect_lang(text: &str) -> &'static str {
    let t = text.trim();
    let es = ES_HINTS.is_match(t);
    let en = EN_HINTS.is_match(t);
    if es && !en {
        return "es";
    }
    if en && !es {
        return "en";
    }
    if t.contains('¿') || t.contains('¡') {
        return "es";
    }
    "en"
}

/// Collapse a BCP-47-ish tag to the two languages the corpus carries.
/// Unknown tags fall back to Spanish, the corpus majority.
pub fn normalize_lang_tag(lang: &str) -> &'static str {
    let lang = lang.to_lowercase();
    if lang.starts_with("en") {
        "en"
    } else {
        "es"
    }
}

/// Cleanup pass over extracted document text before segmentation:
/// collapse whitespace and squash repeated "Leer más" boilerplate runs.
pub fn clean_text(text: &str) -> String {
    let collapsed = collapse_whitespace(text);
    BOILERPLATE_RUNS
        .replace_all(&collapsed, "Leer más ")
        .trim()
        .to_string()
}

/// Naive entity guess: the longest alphabetic token of the folded query,
/// punctuation stripped per token. A crude stand-in for real entity
/// extraction, kept because exact lexical matches are otherwise
/// under-ranked by embedding similarity.
pub fn entity_guess(query: &str) -> Option<String> {
    fold(query)
        .split_whitespace()
        .map(|t| t.chars().filter(|c| c.is_alphabetic()).collect::<String>())
        .filter(|t| !t.is_empty())
        .max_by_key(|t| t.chars().count())
}
