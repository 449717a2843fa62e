//! Recover a JSON payload from free-form model output.
//!
//! Model output routinely wraps the JSON it was asked for: a reasoning
//! preamble, `<think>` blocks, Markdown code fences, trailing commentary.
//! [`extract_json`] tries a fixed cascade and returns the first parse that
//! succeeds:
//!
//! 1. the whole text;
//! 2. the whole text with `<think>` reasoning removed;
//! 3. each ` ```json ` fenced block;
//! 4. each fenced block of any language;
//! 5. the span from the first `{` to the last `}`;
//! 6. the span from the first `[` to the last `]`.
//!
//! Steps 3–6 run on the text with reasoning removed. The cascade never
//! fails loudly: `None` means nothing was recoverable.
//!
//! The brace span in step 5 is greedy. Prose containing its own braces
//! makes it over-match, and the attempt then fails rather than guessing.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```json\s*(.*?)\s*```").expect("valid fence regex"));

static ANY_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*\s*(.*?)\s*```").expect("valid fence regex")
});

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid think regex"));

/// Extract the first recoverable JSON value from `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }

    if let Some(v) = parse(text) {
        return Some(v);
    }

    let text = strip_reasoning(text);
    if let Some(v) = parse(&text) {
        return Some(v);
    }

    fenced(&JSON_FENCE, &text)
        .or_else(|| fenced(&ANY_FENCE, &text))
        .or_else(|| span(&text, '{', '}'))
        .or_else(|| span(&text, '[', ']'))
}

fn parse(candidate: &str) -> Option<Value> {
    serde_json::from_str(candidate.trim()).ok()
}

fn fenced(pattern: &Regex, text: &str) -> Option<Value> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| parse(m.as_str()))
}

fn span(text: &str, open: char, close: char) -> Option<Value> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    parse(&text[start..=end])
}

/// Remove model reasoning: complete `<think>…</think>` blocks, anything
/// before an orphan `</think>`, and a trailing unterminated `<think>`.
fn strip_reasoning(text: &str) -> String {
    let mut out = THINK_BLOCK.replace_all(text, "").into_owned();
    if let Some(pos) = out.rfind("</think>") {
        out = out[pos + "</think>".len()..].to_string();
    }
    if let Some(pos) = out.find("<think>") {
        out.truncate(pos);
    }
    out
}
