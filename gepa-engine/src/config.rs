use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::observability::LogFormat;

// Default functions
fn default_max_metric_calls() -> usize {
    100
}

fn default_perfect_score() -> f64 {
    1.0
}

fn default_track_best_outputs() -> bool {
    false
}

fn default_raise_on_exception() -> bool {
    true
}

fn default_max_consecutive_failures() -> usize {
    3
}

fn default_max_merge_invocations() -> usize {
    5
}

/// GEPA engine configuration
///
/// Controls the evaluation budget, persistence, and failure policy of a single
/// optimization run. Collaborators (evaluator, proposers, tracker) are not part of
/// the configuration and are handed to the engine directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GepaConfig {
    /// Budget of metric calls (per-instance evaluations) for the whole run,
    /// including the seed evaluation
    pub max_metric_calls: usize,

    /// Maximum score achievable by the metric. Reserved for early exit.
    pub perfect_score: f64,

    /// Directory used for the state snapshot and best-output artifacts
    pub run_dir: Option<PathBuf>,

    /// Keep the outputs of every candidate tied for best on each validation instance
    pub track_best_outputs: bool,

    /// Propagate iteration failures to the caller of `run` instead of continuing
    pub raise_on_exception: bool,

    /// Number of consecutive failed iterations tolerated when failures are not raised
    pub max_consecutive_failures: usize,

    /// Whether merge proposals are attempted at all
    pub use_merge: bool,

    /// Upper bound on the number of merges the engine schedules
    pub max_merge_invocations: usize,

    /// Seed recorded with the run result for reproducibility
    pub seed: u64,

    /// Format used by `observability::setup_logging`
    pub log_format: LogFormat,
}

impl Default for GepaConfig {
    fn default() -> Self {
        Self {
            max_metric_calls: default_max_metric_calls(),
            perfect_score: default_perfect_score(),
            run_dir: None,
            track_best_outputs: default_track_best_outputs(),
            raise_on_exception: default_raise_on_exception(),
            max_consecutive_failures: default_max_consecutive_failures(),
            use_merge: false,
            max_merge_invocations: default_max_merge_invocations(),
            seed: 0,
            log_format: LogFormat::default(),
        }
    }
}

/// Uninitialized GEPA engine configuration (deserializable from TOML)
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UninitializedGepaConfig {
    #[serde(default = "default_max_metric_calls")]
    pub max_metric_calls: usize,

    #[serde(default = "default_perfect_score")]
    pub perfect_score: f64,

    pub run_dir: Option<PathBuf>,

    #[serde(default = "default_track_best_outputs")]
    pub track_best_outputs: bool,

    #[serde(default = "default_raise_on_exception")]
    pub raise_on_exception: bool,

    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: usize,

    #[serde(default)]
    pub use_merge: bool,

    #[serde(default = "default_max_merge_invocations")]
    pub max_merge_invocations: usize,

    #[serde(default)]
    pub seed: u64,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for UninitializedGepaConfig {
    fn default() -> Self {
        Self {
            max_metric_calls: default_max_metric_calls(),
            perfect_score: default_perfect_score(),
            run_dir: None,
            track_best_outputs: default_track_best_outputs(),
            raise_on_exception: default_raise_on_exception(),
            max_consecutive_failures: default_max_consecutive_failures(),
            use_merge: false,
            max_merge_invocations: default_max_merge_invocations(),
            seed: 0,
            log_format: LogFormat::default(),
        }
    }
}

impl std::fmt::Display for UninitializedGepaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = toml::to_string_pretty(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{rendered}")
    }
}

impl UninitializedGepaConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse GEPA engine config: {e}"),
            })
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::FileRead {
                message: e.to_string(),
                file_path: path.display().to_string(),
            })
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate the configuration
    pub fn load(self) -> Result<GepaConfig, Error> {
        if self.max_metric_calls == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`max_metric_calls` must be greater than 0".to_string(),
            }));
        }
        if self.max_consecutive_failures == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`max_consecutive_failures` must be greater than 0".to_string(),
            }));
        }
        if !self.perfect_score.is_finite() {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "`perfect_score` must be finite, got {}",
                    self.perfect_score
                ),
            }));
        }
        Ok(GepaConfig {
            max_metric_calls: self.max_metric_calls,
            perfect_score: self.perfect_score,
            run_dir: self.run_dir,
            track_best_outputs: self.track_best_outputs,
            raise_on_exception: self.raise_on_exception,
            max_consecutive_failures: self.max_consecutive_failures,
            use_merge: self.use_merge,
            max_merge_invocations: self.max_merge_invocations,
            seed: self.seed,
            log_format: self.log_format,
        })
    }
}
