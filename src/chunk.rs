//! Heading-boundary document chunker.
//!
//! Splits a guideline document into [`Chunk`]s of at most `max_chars`
//! characters. Splitting only happens at level 1–2 Markdown headings
//! (`# ` and `## `) so a clinical statement is never severed mid-section.
//!
//! # Algorithm
//!
//! 1. Cut the text into fragments at every heading line: body text before a
//!    heading, the heading line itself, and so on. Empty fragments are dropped.
//! 2. Accumulate fragments into a buffer while the buffer plus the next
//!    fragment stays within `max_chars`.
//! 3. Otherwise flush the buffer as a chunk and start a new one with that
//!    fragment.
//! 4. Flush whatever remains.
//!
//! A fragment longer than `max_chars` is never split: it becomes one
//! oversized chunk on its own. The limit is advisory.
//!
//! Concatenating the chunks in order always reproduces the input exactly.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::Chunk;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,2}[ \t].*$").expect("valid heading regex"));

/// Split `text` into heading-aligned chunks for `document`.
///
/// Lengths are measured in characters, not bytes. Returns no chunks for
/// empty text and exactly one chunk when the text has no headings.
pub fn split_document(document: &str, text: &str, max_chars: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for fragment in fragments(text) {
        let fragment_chars = fragment.chars().count();

        if current_chars + fragment_chars > max_chars && !current.is_empty() {
            push_chunk(&mut chunks, document, &current);
            current.clear();
            current_chars = 0;
        }

        current.push_str(fragment);
        current_chars += fragment_chars;
    }

    if !current.is_empty() {
        push_chunk(&mut chunks, document, &current);
    }

    chunks
}

/// Cut `text` at heading lines, keeping the headings as fragments.
fn fragments(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut last = 0;

    for m in HEADING.find_iter(text) {
        parts.push(&text[last..m.start()]);
        parts.push(m.as_str());
        last = m.end();
    }
    parts.push(&text[last..]);

    parts.retain(|p| !p.is_empty());
    parts
}

fn push_chunk(chunks: &mut Vec<Chunk>, document: &str, text: &str) {
    chunks.push(Chunk {
        document: document.to_string(),
        index: chunks.len(),
        text: text.to_string(),
    });
}
