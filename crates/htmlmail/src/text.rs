//! Plain-text alternative for HTML bodies.

use std::sync::LazyLock;

use html_escape::decode_html_entities;
use regex::Regex;

static HIDDEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<head\b[^>]*>.*?</head\s*>|<style\b[^>]*>.*?</style\s*>|<script\b[^>]*>.*?</script\s*>",
    )
    .expect("HIDDEN_RE: hardcoded regex is valid")
});

static BREAK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(p|div|h[1-6]|li|tr|table|blockquote|pre)\s*>")
        .expect("BREAK_RE: hardcoded regex is valid")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("TAG_RE: hardcoded regex is valid"));

static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("BLANK_LINES_RE: hardcoded regex is valid"));

/// Derive a readable plain-text version of `html`.
#[must_use]
pub fn html_to_plain(html: &str) -> String {
    let text = HIDDEN_RE.replace_all(html, "");
    let text = BREAK_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = decode_html_entities(&text);
    let text = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_LINES_RE
        .replace_all(text.trim(), "\n\n")
        .into_owned()
}
