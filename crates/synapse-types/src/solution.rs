//! Reusable solutions extracted from conversations.

use crate::{ValidationError, normalize_tags};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of reusable artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolutionType {
    /// A code snippet; carries a language.
    Code,
    /// A problem-solving approach described in prose.
    Approach,
    /// A design pattern.
    Pattern,
}

impl SolutionType {
    pub const ALL: [SolutionType; 3] = [SolutionType::Code, SolutionType::Approach, SolutionType::Pattern];

    pub fn as_str(&self) -> &'static str {
        match self {
            SolutionType::Code => "code",
            SolutionType::Approach => "approach",
            SolutionType::Pattern => "pattern",
        }
    }
}

impl std::fmt::Display for SolutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SolutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "code" => Ok(SolutionType::Code),
            "approach" => Ok(SolutionType::Approach),
            "pattern" => Ok(SolutionType::Pattern),
            other => Err(format!("Invalid solution type: '{}'", other)),
        }
    }
}

/// A reusable code snippet, approach, or pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    /// Unique identifier (`sol_` + 8 hex chars).
    pub id: String,
    /// Kind of solution.
    #[serde(rename = "type")]
    pub solution_type: SolutionType,
    /// The snippet or prose itself.
    pub content: String,
    /// Programming language; present only for code solutions.
    #[serde(default)]
    pub language: Option<String>,
    /// When and how to use this solution.
    pub description: String,
    /// Normalized tags.
    #[serde(default, deserialize_with = "crate::deserialize_tags")]
    pub tags: Vec<String>,
    /// How reusable the solution is, in [0, 1].
    pub reusability_score: f64,
    /// Number of times the solution has been surfaced.
    #[serde(default)]
    pub reference_count: u32,
    /// When the solution was last surfaced.
    #[serde(default, deserialize_with = "crate::timestamp::deserialize_option")]
    pub last_referenced: Option<DateTime<Utc>>,
}

impl Solution {
    /// Create a validated solution with a fresh id.
    pub fn new(
        solution_type: SolutionType,
        content: impl Into<String>,
        description: impl Into<String>,
        language: Option<String>,
        tags: Vec<String>,
        reusability_score: f64,
    ) -> Result<Self, ValidationError> {
        let language = match solution_type {
            SolutionType::Code => language.filter(|l| !l.trim().is_empty()),
            _ => None,
        };

        let solution = Self {
            id: generate_solution_id(),
            solution_type,
            content: content.into(),
            language,
            description: description.into(),
            tags: normalize_tags(tags),
            reusability_score: round_score(reusability_score),
            reference_count: 0,
            last_referenced: None,
        };
        solution.validate()?;
        Ok(solution)
    }

    /// Check the invariants enforced at construction.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !crate::is_valid_record_id(&self.id) {
            return Err(ValidationError::InvalidId(self.id.clone()));
        }
        if self.content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        if self.description.trim().is_empty() {
            return Err(ValidationError::EmptyDescription);
        }
        if !(0.0..=1.0).contains(&self.reusability_score) {
            return Err(ValidationError::ReusabilityOutOfRange(self.reusability_score));
        }
        if self.solution_type == SolutionType::Code
            && self.language.as_deref().is_none_or(|l| l.trim().is_empty())
        {
            return Err(ValidationError::MissingLanguage);
        }
        if self.solution_type != SolutionType::Code && self.language.is_some() {
            return Err(ValidationError::UnexpectedLanguage(self.solution_type));
        }
        Ok(())
    }

    /// Drop a language on non-code solutions, clear a blank one, and
    /// re-normalize tags.
    pub fn normalize(&mut self) {
        if self.solution_type != SolutionType::Code
            || self.language.as_deref().is_some_and(|l| l.trim().is_empty())
        {
            self.language = None;
        }
        self.tags = normalize_tags(&self.tags);
    }

    /// Record that the solution was surfaced to a caller.
    pub fn increment_reference(&mut self) {
        self.reference_count = self.reference_count.saturating_add(1);
        self.last_referenced = Some(Utc::now());
    }

    /// Code solution whose language field is missing or blank.
    pub fn needs_language(&self) -> bool {
        self.solution_type == SolutionType::Code
            && self.language.as_deref().is_none_or(|l| l.trim().is_empty())
    }
}

/// Header of a batch file of extracted solutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    #[serde(deserialize_with = "crate::timestamp::deserialize")]
    pub created_at: DateTime<Utc>,
    pub solution_type: SolutionType,
    pub total_solutions: usize,
    #[serde(default = "default_extraction_source")]
    pub extraction_source: String,
    #[serde(default = "default_format_version")]
    pub format_version: String,
}

/// On-disk shape of `extracted_{type}_solutions_{timestamp}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionBatch {
    pub metadata: BatchMetadata,
    #[serde(default)]
    pub solutions: Vec<Solution>,
}

impl SolutionBatch {
    /// Build a batch for solutions that all share `solution_type`.
    pub fn new(solution_type: SolutionType, solutions: Vec<Solution>) -> Self {
        Self {
            metadata: BatchMetadata {
                created_at: Utc::now(),
                solution_type,
                total_solutions: solutions.len(),
                extraction_source: default_extraction_source(),
                format_version: default_format_version(),
            },
            solutions,
        }
    }
}

fn default_extraction_source() -> String {
    "conversation_records".to_string()
}

fn default_format_version() -> String {
    "1.0".to_string()
}

fn generate_solution_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("sol_{}", &hex[..8])
}

fn round_score(score: f64) -> f64 {
    (score * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_solution_requires_language() {
        let err = Solution::new(SolutionType::Code, "fn main() {}", "entry point", None, vec![], 0.5)
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingLanguage);

        let ok = Solution::new(
            SolutionType::Code,
            "fn main() {}",
            "entry point",
            Some("rust".to_string()),
            vec![],
            0.5,
        )
        .unwrap();
        assert_eq!(ok.language.as_deref(), Some("rust"));
        assert!(ok.id.starts_with("sol_"));
    }

    #[test]
    fn test_non_code_drops_language() {
        let solution = Solution::new(
            SolutionType::Approach,
            "Bisect the failing commits",
            "debugging approach",
            Some("python".to_string()),
            vec!["Debugging".to_string()],
            0.8,
        )
        .unwrap();
        assert!(solution.language.is_none());
        assert_eq!(solution.tags, vec!["debugging".to_string()]);
    }

    #[test]
    fn test_stored_non_code_language_is_rejected_until_normalized() {
        let json = r#"{
            "id": "sol_0a1b2c3d",
            "type": "pattern",
            "content": "retry with backoff",
            "language": "rust",
            "description": "resilience",
            "tags": ["Retry", "retry"],
            "reusability_score": 0.6
        }"#;
        let mut s: Solution = serde_json::from_str(json).unwrap();
        assert_eq!(s.tags, vec!["retry".to_string()]);
        assert_eq!(s.validate().unwrap_err(), ValidationError::UnexpectedLanguage(SolutionType::Pattern));

        s.normalize();
        assert!(s.language.is_none());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_reusability_bounds_and_rounding() {
        assert!(matches!(
            Solution::new(SolutionType::Pattern, "x", "y", None, vec![], 1.5),
            Err(ValidationError::ReusabilityOutOfRange(_))
        ));
        let s = Solution::new(SolutionType::Pattern, "x", "y", None, vec![], 0.456).unwrap();
        assert_eq!(s.reusability_score, 0.46);
    }

    #[test]
    fn test_increment_reference() {
        let mut s = Solution::new(SolutionType::Pattern, "x", "y", None, vec![], 0.5).unwrap();
        assert!(s.last_referenced.is_none());
        s.increment_reference();
        s.increment_reference();
        assert_eq!(s.reference_count, 2);
        assert!(s.last_referenced.is_some());
    }

    #[test]
    fn test_legacy_json_defaults() {
        let json = r#"{
            "id": "sol_legacy01",
            "type": "code",
            "content": "npm install",
            "description": "install deps",
            "reusability_score": 0.4
        }"#;
        let s: Solution = serde_json::from_str(json).unwrap();
        assert_eq!(s.reference_count, 0);
        assert!(s.tags.is_empty());
        assert!(s.needs_language());
    }

    #[test]
    fn test_solution_type_serde() {
        let json = serde_json::to_string(&SolutionType::Approach).unwrap();
        assert_eq!(json, "\"approach\"");
        assert_eq!("Pattern".parse::<SolutionType>().unwrap(), SolutionType::Pattern);
    }
}
