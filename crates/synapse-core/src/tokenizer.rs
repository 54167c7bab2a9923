//! Text tokenization for the search index.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};

/// ASCII punctuation, removed outright (so "async-io" becomes "asyncio").
static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[[:punct:]]").unwrap());

/// Shortest token kept, in characters.
pub const MIN_TOKEN_CHARS: usize = 2;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // English
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
        "is", "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did",
        // Chinese
        "一个", "没有", "我们", "你们", "他们", "这个", "那个", "什么", "自己", "已经", "因为",
        "所以", "但是", "如果", "可以",
    ]
    .into_iter()
    .collect()
});

/// Lowercase, strip punctuation, split on whitespace, and drop short tokens
/// and stop words.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    if text.is_empty() {
        return BTreeSet::new();
    }

    let lowered = text.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lowered, "");

    stripped
        .split_whitespace()
        .filter(|word| word.chars().count() >= MIN_TOKEN_CHARS)
        .filter(|word| !STOP_WORDS.contains(word))
        .map(str::to_string)
        .collect()
}
