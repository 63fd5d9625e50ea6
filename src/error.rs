use thiserror::Error;

/// Failures the engine reports to its callers.
///
/// Per-ticker data gaps never show up here; they are collected as
/// [`crate::models::DataIssue`] entries on the result instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    Validation(String),

    #[error("market data error: {0}")]
    Data(String),

    #[error("No successful backtests completed ({failed} of {total} grid points failed)")]
    NoSuccessfulIterations { failed: usize, total: usize },

    #[error("{job} is already running")]
    AlreadyRunning { job: String },

    #[error("backtest {0} not found")]
    UnknownBacktest(String),
}

impl EngineError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        EngineError::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
