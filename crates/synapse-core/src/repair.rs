//! In-memory repair of legacy records.
//!
//! Older files may hold code solutions without a `language`, or a stray
//! `language` on approaches and patterns. Loading fixes both in memory; the
//! file on disk is left as it was.

use synapse_types::Solution;
use tracing::info;

/// Language used when nothing in the content gives a hint.
pub const FALLBACK_LANGUAGE: &str = "shell";

/// Ordered keyword rules; the first rule with any hit wins.
const LANGUAGE_HINTS: &[(&str, &[&str])] = &[
    ("bash", &["npx", "npm", "yarn"]),
    ("python", &["def ", "import ", "python"]),
    ("javascript", &["function", "const ", "let "]),
    ("php", &["<?php", "php"]),
    ("c", &["#include", "int main"]),
    ("java", &["public class", "java"]),
];

/// Guess a language from snippet content. Always returns a non-empty name.
pub fn infer_language(content: &str) -> &'static str {
    let content = content.to_lowercase();
    LANGUAGE_HINTS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| content.contains(n)))
        .map(|(language, _)| *language)
        .unwrap_or(FALLBACK_LANGUAGE)
}

/// Normalize loaded solutions and fill in missing languages on code
/// solutions. Returns how many languages were inferred.
pub fn repair_solutions(solutions: &mut [Solution]) -> usize {
    let mut repaired = 0;
    for solution in solutions.iter_mut() {
        solution.normalize();
        if !solution.needs_language() {
            continue;
        }
        let language = infer_language(&solution.content);
        info!(
            target: "synapse::repair",
            "Inferred language '{}' for legacy solution {}",
            language, solution.id
        );
        solution.language = Some(language.to_string());
        repaired += 1;
    }
    repaired
}
