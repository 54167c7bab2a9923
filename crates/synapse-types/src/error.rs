//! Validation errors for record construction.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Title must not be empty")]
    EmptyTitle,

    #[error("Title too long: {0} characters (max {max})", max = crate::MAX_TITLE_CHARS)]
    TitleTooLong(usize),

    #[error("Content must not be empty")]
    EmptyContent,

    #[error("Description must not be empty")]
    EmptyDescription,

    #[error("Importance must be between 1 and 5, got {0}")]
    ImportanceOutOfRange(u8),

    #[error("Reusability score must be between 0.0 and 1.0, got {0}")]
    ReusabilityOutOfRange(f64),

    #[error("Code solutions must specify a language")]
    MissingLanguage,

    #[error("Only code solutions carry a language, not {0} solutions")]
    UnexpectedLanguage(crate::SolutionType),

    #[error("Invalid record id: '{0}'")]
    InvalidId(String),
}
