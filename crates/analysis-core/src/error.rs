//! Analysis error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Analysis cancelled")]
    Cancelled,

    #[error("Position cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Opening book unavailable: {0}")]
    BookUnavailable(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AnalysisError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AnalysisError::Cancelled)
    }

    /// Kinds that are handled where they occur and never abort an analysis.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AnalysisError::CacheUnavailable(_)
                | AnalysisError::BookUnavailable(_)
                | AnalysisError::InvalidInput(_)
        )
    }
}

impl From<rusqlite::Error> for AnalysisError {
    fn from(e: rusqlite::Error) -> Self {
        AnalysisError::CacheUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(e: serde_json::Error) -> Self {
        AnalysisError::CacheUnavailable(format!("corrupt cache record: {e}"))
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(e: reqwest::Error) -> Self {
        AnalysisError::BookUnavailable(e.to_string())
    }
}
