//! Text cleanup shared by narration and speed reading.

use once_cell::sync::Lazy;
use regex::Regex;

static RE_NUMERIC_BRACKET_CITE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*\d+(?:\s*[,-]\s*\d+)*\s*\]").unwrap());
static RE_SUPERSCRIPT_CITE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[⁰¹²³⁴⁵⁶⁷⁸⁹]+").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Strip footnote markers and collapse whitespace so the text reads aloud
/// cleanly. Returns an empty string when nothing speakable remains.
pub fn speakable_text(text: &str) -> String {
    let text = RE_NUMERIC_BRACKET_CITE.replace_all(text, "");
    let text = RE_SUPERSCRIPT_CITE.replace_all(&text, "");
    RE_WHITESPACE.replace_all(&text, " ").trim().to_string()
}

pub fn split_words(text: &str) -> Vec<String> {
    speakable_text(text)
        .split(' ')
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

fn trailing_mark(word: &str) -> Option<char> {
    word.trim_end_matches(['"', '\'', ')', ']', '”', '’', '»'])
        .chars()
        .last()
}

pub fn ends_sentence(word: &str) -> bool {
    matches!(trailing_mark(word), Some('.' | '!' | '?' | '…'))
}

pub fn ends_clause(word: &str) -> bool {
    matches!(trailing_mark(word), Some(',' | ';' | ':' | '—' | '–'))
}
