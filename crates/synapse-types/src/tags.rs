//! Tag and category normalization shared by both record kinds.

use serde::{Deserialize, Deserializer};
use std::collections::HashSet;

/// Maximum length of a single tag or category, in characters.
pub const MAX_TAG_CHARS: usize = 50;

/// Category assigned when none (or an unusable one) is given.
pub const DEFAULT_CATEGORY: &str = "general";

/// Normalize a tag list: trim, lowercase, drop empty or oversized tags, and
/// deduplicate while keeping first-occurrence order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut cleaned = Vec::new();

    for tag in tags {
        let tag = tag.as_ref().trim().to_lowercase();
        if tag.is_empty() || tag.chars().count() > MAX_TAG_CHARS {
            continue;
        }
        if seen.insert(tag.clone()) {
            cleaned.push(tag);
        }
    }

    cleaned
}

/// Normalize a category name, falling back to [`DEFAULT_CATEGORY`].
pub fn normalize_category(category: &str) -> String {
    let category = category.trim().to_lowercase();
    if category.is_empty() || category.chars().count() > MAX_TAG_CHARS {
        DEFAULT_CATEGORY.to_string()
    } else {
        category
    }
}

/// Deserialize a tag list, normalizing it on the way in.
pub fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(normalize_tags(raw))
}

/// Deserialize a category, normalizing it on the way in.
pub fn deserialize_category<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(normalize_category(&raw))
}
