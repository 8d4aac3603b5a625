//! Result types for scripted automation.

use serde::{Deserialize, Serialize};

/// Outcome of one scripted command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub command: String,
    /// Output before the prompt, or the error text when the step failed.
    pub output: String,
    pub success: bool,
}

/// Outcome of waiting for any of several patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectResult {
    pub matched: bool,
    /// Index of the winning pattern, `-1` when nothing matched.
    pub pattern_index: i64,
    pub pattern: Option<String>,
}

impl ExpectResult {
    pub(crate) fn matched(index: usize, pattern: &str) -> Self {
        Self {
            matched: true,
            pattern_index: i64::try_from(index).unwrap_or(i64::MAX),
            pattern: Some(pattern.to_string()),
        }
    }

    pub(crate) const fn unmatched() -> Self {
        Self {
            matched: false,
            pattern_index: -1,
            pattern: None,
        }
    }
}
