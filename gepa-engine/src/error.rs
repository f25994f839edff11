use std::backtrace::Backtrace;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Debug, Error, Serialize)]
#[error("{details}")]
#[serde(transparent)]
// As long as the struct members are private, we force people to use the `new` method and log the error.
// We arc `ErrorDetails` per the `clippy::result_large_err` lint, as well as to make it cloneable
pub struct Error {
    details: Arc<ErrorDetails>,
    /// Captured where the error was constructed; honors `RUST_BACKTRACE`
    #[serde(skip)]
    trace: Arc<Backtrace>,
}

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error {
            details: Arc::new(details),
            trace: Arc::new(Backtrace::capture()),
        }
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.trace
    }

    pub fn log(&self) {
        self.details.log();
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        self.details.log_at_level(prefix, level);
    }
}

#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.details == other.details
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    EmptyValidationScores,
    EvaluationBatchLength {
        outputs: usize,
        scores: usize,
        trajectories: Option<usize>,
    },
    Evaluator {
        message: String,
    },
    FileRead {
        message: String,
        file_path: String,
    },
    FileWrite {
        message: String,
        file_path: String,
    },
    InconsistentState {
        message: String,
    },
    InternalError {
        message: String,
    },
    NonFiniteScore {
        index: usize,
        score: f64,
    },
    Proposer {
        message: String,
    },
    ScoreLengthMismatch {
        expected: usize,
        actual: usize,
    },
    Serialization {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::EmptyValidationScores => tracing::Level::ERROR,
            ErrorDetails::EvaluationBatchLength { .. } => tracing::Level::ERROR,
            ErrorDetails::Evaluator { .. } => tracing::Level::WARN,
            ErrorDetails::FileRead { .. } => tracing::Level::ERROR,
            ErrorDetails::FileWrite { .. } => tracing::Level::ERROR,
            ErrorDetails::InconsistentState { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::NonFiniteScore { .. } => tracing::Level::ERROR,
            ErrorDetails::Proposer { .. } => tracing::Level::WARN,
            ErrorDetails::ScoreLengthMismatch { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
        }
    }

    pub fn log_at_level(&self, prefix: &str, level: tracing::Level) {
        match level {
            tracing::Level::ERROR => tracing::error!("{prefix}{self}"),
            tracing::Level::WARN => tracing::warn!("{prefix}{self}"),
            tracing::Level::INFO => tracing::info!("{prefix}{self}"),
            tracing::Level::DEBUG => tracing::debug!("{prefix}{self}"),
            tracing::Level::TRACE => tracing::trace!("{prefix}{self}"),
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        self.log_at_level("", self.level());
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::Config { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::EmptyValidationScores => {
                write!(
                    f,
                    "The seed candidate produced no validation scores; the validation set must not be empty"
                )
            }
            ErrorDetails::EvaluationBatchLength {
                outputs,
                scores,
                trajectories,
            } => match trajectories {
                Some(trajectories) => write!(
                    f,
                    "Evaluation batch lengths do not match: {outputs} outputs, {scores} scores, {trajectories} trajectories"
                ),
                None => write!(
                    f,
                    "Evaluation batch lengths do not match: {outputs} outputs, {scores} scores"
                ),
            },
            ErrorDetails::Evaluator { message } => {
                write!(f, "Evaluator error: {message}")
            }
            ErrorDetails::FileRead { message, file_path } => {
                write!(f, "Error reading file {file_path}: {message}")
            }
            ErrorDetails::FileWrite { message, file_path } => {
                write!(f, "Error writing file {file_path}: {message}")
            }
            ErrorDetails::InconsistentState { message } => {
                write!(f, "Inconsistent optimization state: {message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::NonFiniteScore { index, score } => {
                write!(f, "Score at index {index} is not finite: {score}")
            }
            ErrorDetails::Proposer { message } => {
                write!(f, "Proposer error: {message}")
            }
            ErrorDetails::ScoreLengthMismatch { expected, actual } => {
                write!(
                    f,
                    "Expected {expected} per-instance validation scores, got {actual}"
                )
            }
            ErrorDetails::Serialization { message } => {
                write!(f, "Serialization error: {message}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_batch_length_without_trajectories() {
        let details = ErrorDetails::EvaluationBatchLength {
            outputs: 2,
            scores: 3,
            trajectories: None,
        };
        assert_eq!(
            details.to_string(),
            "Evaluation batch lengths do not match: 2 outputs, 3 scores"
        );
    }

    #[test]
    fn test_error_exposes_details() {
        let error = Error::new(ErrorDetails::ScoreLengthMismatch {
            expected: 3,
            actual: 1,
        });
        assert!(matches!(
            error.get_details(),
            ErrorDetails::ScoreLengthMismatch {
                expected: 3,
                actual: 1
            }
        ));
        assert_eq!(
            error.to_string(),
            "Expected 3 per-instance validation scores, got 1"
        );
    }

    #[test]
    fn test_backtrace_travels_with_clones() {
        let error = Error::new(ErrorDetails::Proposer {
            message: "boom".to_string(),
        });
        let cloned = error.clone();

        assert!(std::ptr::eq(error.backtrace(), cloned.backtrace()));
        assert_eq!(
            error.backtrace().status(),
            Backtrace::capture().status()
        );
        assert_eq!(error, cloned);
    }

    #[test]
    fn test_error_serializes_as_details() {
        let error = Error::new(ErrorDetails::Config {
            message: "bad".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            serde_json::to_value(error.get_details()).unwrap()
        );
    }
}
