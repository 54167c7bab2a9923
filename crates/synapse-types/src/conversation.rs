//! Conversation records.

use crate::{Solution, ValidationError, normalize_category, normalize_tags};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum title length, in characters.
pub const MAX_TITLE_CHARS: usize = 200;

/// Default importance for new records.
pub const DEFAULT_IMPORTANCE: u8 = 3;

/// A stored conversation with its AI-produced metadata and attached solutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Unique identifier (`conv_YYYYMMDD_xxxxxx`). Never changes.
    pub id: String,
    pub title: String,
    /// Full conversation text.
    pub content: String,
    /// AI-produced summary.
    #[serde(default)]
    pub summary: String,
    /// Normalized tags.
    #[serde(default, deserialize_with = "crate::deserialize_tags")]
    pub tags: Vec<String>,
    #[serde(default = "default_category", deserialize_with = "crate::deserialize_category")]
    pub category: String,
    /// Importance from 1 (low) to 5 (high).
    #[serde(default = "default_importance")]
    pub importance: u8,
    #[serde(deserialize_with = "crate::timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
    #[serde(deserialize_with = "crate::timestamp::deserialize")]
    pub updated_at: DateTime<Utc>,
    /// Solutions extracted from this conversation, in insertion order.
    #[serde(default)]
    pub solutions: Vec<Solution>,
}

impl ConversationRecord {
    /// Create a new record with default metadata.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Result<Self, ValidationError> {
        let title = title.into().trim().to_string();
        let content = content.into();

        if title.is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        let title_chars = title.chars().count();
        if title_chars > MAX_TITLE_CHARS {
            return Err(ValidationError::TitleTooLong(title_chars));
        }
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }

        let now = Utc::now();
        Ok(Self {
            id: generate_conversation_id(now),
            title,
            content,
            summary: String::new(),
            tags: Vec::new(),
            category: default_category(),
            importance: DEFAULT_IMPORTANCE,
            created_at: now,
            updated_at: now,
            solutions: Vec::new(),
        })
    }

    /// Check the invariants enforced at construction. Used before persisting
    /// records that arrived through deserialization.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_record_id(&self.id) {
            return Err(ValidationError::InvalidId(self.id.clone()));
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        let title_chars = self.title.chars().count();
        if title_chars > MAX_TITLE_CHARS {
            return Err(ValidationError::TitleTooLong(title_chars));
        }
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if !(1..=5).contains(&self.importance) {
            return Err(ValidationError::ImportanceOutOfRange(self.importance));
        }
        for solution in &self.solutions {
            solution.validate()?;
        }
        Ok(())
    }

    /// Re-apply tag, category, and solution normalization. Deserialization
    /// already does this; direct field edits may not.
    pub fn normalize(&mut self) {
        self.tags = normalize_tags(&self.tags);
        self.category = normalize_category(&self.category);
        for solution in &mut self.solutions {
            solution.normalize();
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into().trim().to_string();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = normalize_category(category);
        self
    }

    pub fn with_importance(mut self, importance: u8) -> Result<Self, ValidationError> {
        if !(1..=5).contains(&importance) {
            return Err(ValidationError::ImportanceOutOfRange(importance));
        }
        self.importance = importance;
        Ok(self)
    }

    /// Set the creation time; `updated_at` follows so it never precedes it.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.updated_at = created_at;
        self
    }

    /// Attach a solution. A solution whose id is already attached is ignored.
    pub fn add_solution(&mut self, solution: Solution) {
        if self.solutions.iter().any(|s| s.id == solution.id) {
            return;
        }
        self.solutions.push(solution);
        self.touch();
    }

    /// Detach a solution by id. Returns false if it was not attached.
    pub fn remove_solution(&mut self, solution_id: &str) -> bool {
        match self.solutions.iter().position(|s| s.id == solution_id) {
            Some(pos) => {
                self.solutions.remove(pos);
                self.touch();
                true
            }
            None => false,
        }
    }

    pub fn solution(&self, solution_id: &str) -> Option<&Solution> {
        self.solutions.iter().find(|s| s.id == solution_id)
    }

    /// Replace the summary. Blank input is ignored.
    pub fn update_summary(&mut self, summary: &str) {
        let summary = summary.trim();
        if summary.is_empty() {
            return;
        }
        self.summary = summary.to_string();
        self.touch();
    }

    /// Merge new tags into the existing set.
    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let merged = self
            .tags
            .iter()
            .cloned()
            .chain(tags.into_iter().map(|t| t.as_ref().to_string()))
            .collect::<Vec<_>>();
        self.tags = normalize_tags(merged);
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }
}

/// Ids become file names, so only ASCII alphanumerics, `_` and `-` are allowed.
pub fn is_valid_record_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn default_category() -> String {
    crate::DEFAULT_CATEGORY.to_string()
}

fn default_importance() -> u8 {
    DEFAULT_IMPORTANCE
}

fn generate_conversation_id(now: DateTime<Utc>) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("conv_{}_{}", now.format("%Y%m%d"), &hex[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SolutionType;
    use chrono::TimeZone;

    fn sample() -> ConversationRecord {
        ConversationRecord::new("Fix async bug", "Long conversation body").unwrap()
    }

    #[test]
    fn test_new_defaults() {
        let record = sample();
        assert!(record.id.starts_with("conv_"));
        assert_eq!(record.category, "general");
        assert_eq!(record.importance, DEFAULT_IMPORTANCE);
        assert!(record.solutions.is_empty());
    }

    #[test]
    fn test_validation() {
        assert_eq!(ConversationRecord::new("  ", "body").unwrap_err(), ValidationError::EmptyTitle);
        assert_eq!(ConversationRecord::new("t", " ").unwrap_err(), ValidationError::EmptyContent);
        assert!(matches!(
            ConversationRecord::new("t".repeat(201), "body"),
            Err(ValidationError::TitleTooLong(201))
        ));
        assert_eq!(
            sample().with_importance(6).unwrap_err(),
            ValidationError::ImportanceOutOfRange(6)
        );
    }

    #[test]
    fn test_validate_rejects_path_like_ids() {
        let mut record = sample();
        assert!(record.validate().is_ok());
        record.id = "../escape".to_string();
        assert!(matches!(record.validate(), Err(ValidationError::InvalidId(_))));
        assert!(is_valid_record_id("conv_20240302_abc123"));
        assert!(!is_valid_record_id("a/b"));
        assert!(!is_valid_record_id(""));
    }

    #[test]
    fn test_solution_mutations_bump_updated_at() {
        let created = Utc.with_ymd_and_hms(2024, 3, 2, 9, 0, 0).unwrap();
        let mut record = sample().with_created_at(created);
        let solution = Solution::new(SolutionType::Pattern, "retry with backoff", "resilience", None, vec![], 0.7)
            .unwrap();
        let solution_id = solution.id.clone();

        record.add_solution(solution.clone());
        record.add_solution(solution);
        assert_eq!(record.solutions.len(), 1);
        assert!(record.updated_at > created);
        assert!(record.solution(&solution_id).is_some());

        assert!(record.remove_solution(&solution_id));
        assert!(!record.remove_solution(&solution_id));
    }

    #[test]
    fn test_update_summary_ignores_blank() {
        let mut record = sample().with_summary("original");
        record.update_summary("   ");
        assert_eq!(record.summary, "original");
        record.update_summary(" new summary ");
        assert_eq!(record.summary, "new summary");
    }

    #[test]
    fn test_add_tags_merges() {
        let mut record = sample().with_tags(["Python"]);
        record.add_tags(["python", "Async"]);
        assert_eq!(record.tags, vec!["python".to_string(), "async".to_string()]);
    }

    #[test]
    fn test_deserialize_normalizes_tags_and_category() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["tags"] = serde_json::json!(["Python", "python", " Async "]);
        value["category"] = serde_json::json!("DevOps");

        let record: ConversationRecord = serde_json::from_value(value).unwrap();
        assert_eq!(record.tags, vec!["python".to_string(), "async".to_string()]);
        assert_eq!(record.category, "devops");
    }

    #[test]
    fn test_normalize_and_validate_cover_solutions() {
        let mut record = sample();
        record.tags = vec!["Rust".to_string(), "rust".to_string()];
        record.category = "  ".to_string();
        let mut approach =
            Solution::new(SolutionType::Approach, "bisect", "find the bad commit", None, vec![], 0.5).unwrap();
        approach.language = Some("rust".to_string());
        record.solutions.push(approach);

        assert_eq!(
            record.validate().unwrap_err(),
            ValidationError::UnexpectedLanguage(SolutionType::Approach)
        );

        record.normalize();
        assert_eq!(record.tags, vec!["rust".to_string()]);
        assert_eq!(record.category, "general");
        assert!(record.solutions[0].language.is_none());
        assert!(record.validate().is_ok());

        record.solutions[0].description = " ".to_string();
        assert_eq!(record.validate().unwrap_err(), ValidationError::EmptyDescription);
    }

    #[test]
    fn test_json_roundtrip_preserves_record() {
        let record = sample().with_tags(["rust"]).with_summary("s");
        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: ConversationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
