//! Mutable search state for a GEPA run
//!
//! `GepaState` is the single source of truth for the search: the candidate pool, its
//! lineage, per-instance and aggregate validation scores, the per-instance Pareto front,
//! and the budget counters. Every per-candidate structure is index-parallel to the
//! candidate pool and grows only through `update_state_with_new_program`, which appends
//! to all of them in one call.
//!
//! The whole state is persisted as a single JSON snapshot (`gepa_state.json`) in the run
//! directory so interrupted runs can resume without repeating completed evaluations.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorDetails};
use crate::json_utils::write_json_file;
use crate::observability::RunLogger;
use crate::pareto::idxmax;
use crate::proposer::ProposalTag;

/// A program under search: component name -> instruction text
pub type Candidate = BTreeMap<String, String>;

pub const STATE_FILE_NAME: &str = "gepa_state.json";
pub const BEST_OUTPUTS_DIR_NAME: &str = "generated_best_outputs_valset";

/// One proposal considered during an iteration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposalAttempt {
    pub tag: ProposalTag,
    pub parent_program_ids: Vec<usize>,
    pub subsample_score_before: Option<f64>,
    pub subsample_score_after: Option<f64>,
    pub accepted: bool,
}

/// What happened during one iteration of the engine loop
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub i: i64,
    #[serde(default)]
    pub attempts: Vec<ProposalAttempt>,
    #[serde(default)]
    pub new_program_idx: Option<usize>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GepaState {
    program_candidates: Vec<Candidate>,
    parent_program_for_candidate: Vec<Vec<usize>>,
    program_full_scores_val_set: Vec<f64>,
    per_program_tracked_scores: Vec<f64>,
    prog_candidate_val_subscores: Vec<Vec<f64>>,
    num_metric_calls_by_discovery: Vec<usize>,

    pareto_front_valset: Vec<f64>,
    program_at_pareto_front_valset: Vec<BTreeSet<usize>>,
    best_outputs_valset: Option<Vec<Vec<(usize, Value)>>>,

    full_program_trace: Vec<TraceRecord>,

    i: i64,
    num_full_ds_evals: usize,
    total_num_evals: usize,
}

impl GepaState {
    /// Build the state for a run from the seed candidate and its full validation evaluation.
    ///
    /// Every validation instance starts with the seed as its sole Pareto-front member.
    pub fn new(
        seed_candidate: Candidate,
        outputs: Vec<Value>,
        scores: Vec<f64>,
        track_best_outputs: bool,
    ) -> Result<Self, Error> {
        if scores.is_empty() {
            return Err(Error::new(ErrorDetails::EmptyValidationScores));
        }
        if outputs.len() != scores.len() {
            return Err(Error::new(ErrorDetails::EvaluationBatchLength {
                outputs: outputs.len(),
                scores: scores.len(),
                trajectories: None,
            }));
        }

        let aggregate = mean(&scores);
        let num_instances = scores.len();
        let best_outputs_valset = track_best_outputs.then(|| {
            outputs
                .into_iter()
                .map(|output| vec![(0, output)])
                .collect()
        });

        Ok(Self {
            program_candidates: vec![seed_candidate],
            parent_program_for_candidate: vec![Vec::new()],
            program_full_scores_val_set: vec![aggregate],
            per_program_tracked_scores: vec![aggregate],
            pareto_front_valset: scores.clone(),
            prog_candidate_val_subscores: vec![scores],
            num_metric_calls_by_discovery: vec![0],
            program_at_pareto_front_valset: vec![BTreeSet::from([0]); num_instances],
            best_outputs_valset,
            full_program_trace: Vec::new(),
            i: -1,
            num_full_ds_evals: 0,
            total_num_evals: 0,
        })
    }

    /// Append a fully-evaluated candidate and fold its scores into the Pareto front.
    ///
    /// Returns `(new_index, current_best_index)` where the best index is the first
    /// candidate with the highest aggregate score. Inputs are validated before anything
    /// is appended, so a failed call leaves the state untouched.
    #[expect(clippy::too_many_arguments)]
    pub fn update_state_with_new_program(
        &mut self,
        parent_indices: Vec<usize>,
        new_candidate: Candidate,
        aggregate_score: f64,
        outputs: &[Value],
        per_instance_scores: Vec<f64>,
        run_dir: Option<&Path>,
        cumulative_eval_count: usize,
    ) -> Result<(usize, usize), Error> {
        let num_instances = self.num_val_instances();
        if per_instance_scores.len() != num_instances {
            return Err(Error::new(ErrorDetails::ScoreLengthMismatch {
                expected: num_instances,
                actual: per_instance_scores.len(),
            }));
        }
        if outputs.len() != per_instance_scores.len() {
            return Err(Error::new(ErrorDetails::EvaluationBatchLength {
                outputs: outputs.len(),
                scores: per_instance_scores.len(),
                trajectories: None,
            }));
        }
        if let Some(parent) = parent_indices
            .iter()
            .find(|&&parent| parent >= self.num_candidates())
        {
            return Err(Error::new(ErrorDetails::InconsistentState {
                message: format!(
                    "parent index {parent} is out of range for {} candidates",
                    self.num_candidates()
                ),
            }));
        }

        let new_index = self.num_candidates();
        self.program_candidates.push(new_candidate);
        self.parent_program_for_candidate.push(parent_indices);
        self.program_full_scores_val_set.push(aggregate_score);
        self.num_metric_calls_by_discovery
            .push(cumulative_eval_count);

        let mut improved_instances = Vec::new();
        for (task_idx, &new_score) in per_instance_scores.iter().enumerate() {
            let front_score = self.pareto_front_valset[task_idx];
            if new_score > front_score {
                self.pareto_front_valset[task_idx] = new_score;
                self.program_at_pareto_front_valset[task_idx] = BTreeSet::from([new_index]);
                if let Some(best_outputs) = self.best_outputs_valset.as_mut() {
                    best_outputs[task_idx] = vec![(new_index, outputs[task_idx].clone())];
                }
                improved_instances.push(task_idx);
            } else if new_score == front_score {
                self.program_at_pareto_front_valset[task_idx].insert(new_index);
                if let Some(best_outputs) = self.best_outputs_valset.as_mut() {
                    best_outputs[task_idx].push((new_index, outputs[task_idx].clone()));
                }
            }
        }
        self.prog_candidate_val_subscores.push(per_instance_scores);

        self.per_program_tracked_scores
            .clone_from(&self.program_full_scores_val_set);
        let best_index = self.best_program_idx();

        if let Some(run_dir) = run_dir {
            for task_idx in improved_instances {
                let path = best_output_path(run_dir, task_idx, self.i + 1, new_index);
                if let Err(e) = write_json_file(&path, &outputs[task_idx]) {
                    tracing::warn!(
                        "Failed to persist best output for instance {task_idx} of candidate {new_index}: {e}"
                    );
                }
            }
        }

        Ok((new_index, best_index))
    }

    /// Verify every parallel structure has the expected length and every Pareto-front
    /// member refers to an existing candidate.
    pub fn consistency_check(&self) -> Result<(), Error> {
        let num_candidates = self.program_candidates.len();
        let per_candidate_lengths = [
            (
                "parent_program_for_candidate",
                self.parent_program_for_candidate.len(),
            ),
            (
                "program_full_scores_val_set",
                self.program_full_scores_val_set.len(),
            ),
            (
                "per_program_tracked_scores",
                self.per_program_tracked_scores.len(),
            ),
            (
                "prog_candidate_val_subscores",
                self.prog_candidate_val_subscores.len(),
            ),
            (
                "num_metric_calls_by_discovery",
                self.num_metric_calls_by_discovery.len(),
            ),
        ];
        for (name, len) in per_candidate_lengths {
            if len != num_candidates {
                return Err(inconsistent(format!(
                    "`{name}` has {len} entries but there are {num_candidates} candidates"
                )));
            }
        }
        if num_candidates == 0 {
            return Err(inconsistent(
                "the candidate pool is empty; the seed candidate is missing".to_string(),
            ));
        }

        let num_instances = self.pareto_front_valset.len();
        if self.program_at_pareto_front_valset.len() != num_instances {
            return Err(inconsistent(format!(
                "`program_at_pareto_front_valset` has {} entries but `pareto_front_valset` has {num_instances}",
                self.program_at_pareto_front_valset.len()
            )));
        }
        if let Some(len) = self
            .best_outputs_valset
            .as_ref()
            .map(Vec::len)
            .filter(|&len| len != num_instances)
        {
            return Err(inconsistent(format!(
                "`best_outputs_valset` has {len} entries but there are {num_instances} validation instances"
            )));
        }
        for (candidate_idx, subscores) in self.prog_candidate_val_subscores.iter().enumerate() {
            if subscores.len() != num_instances {
                return Err(inconsistent(format!(
                    "candidate {candidate_idx} has {} per-instance scores, expected {num_instances}",
                    subscores.len()
                )));
            }
        }
        for (candidate_idx, parents) in self.parent_program_for_candidate.iter().enumerate() {
            if let Some(parent) = parents.iter().find(|&&parent| parent >= num_candidates) {
                return Err(inconsistent(format!(
                    "candidate {candidate_idx} lists parent {parent}, which does not exist"
                )));
            }
        }
        for (task_idx, front) in self.program_at_pareto_front_valset.iter().enumerate() {
            if let Some(member) = front.iter().find(|&&member| member >= num_candidates) {
                return Err(inconsistent(format!(
                    "Pareto front of instance {task_idx} contains candidate {member}, which does not exist"
                )));
            }
        }
        Ok(())
    }

    pub fn snapshot_path(run_dir: &Path) -> PathBuf {
        run_dir.join(STATE_FILE_NAME)
    }

    /// Write the full state to `<run_dir>/gepa_state.json`.
    ///
    /// The snapshot is written to a temporary file first and then renamed into place.
    pub fn save(&self, run_dir: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(run_dir).map_err(|e| {
            Error::new(ErrorDetails::FileWrite {
                message: format!("Failed to create run directory: {e}"),
                file_path: run_dir.display().to_string(),
            })
        })?;
        let contents = serde_json::to_vec(self).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize GEPA state: {e}"),
            })
        })?;

        let path = Self::snapshot_path(run_dir);
        let tmp_path = run_dir.join(format!("{STATE_FILE_NAME}.tmp"));
        std::fs::write(&tmp_path, contents).map_err(|e| {
            Error::new(ErrorDetails::FileWrite {
                message: e.to_string(),
                file_path: tmp_path.display().to_string(),
            })
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            Error::new(ErrorDetails::FileWrite {
                message: format!("Failed to move snapshot into place: {e}"),
                file_path: path.display().to_string(),
            })
        })
    }

    /// Read the snapshot in `run_dir` and verify its consistency.
    pub fn load(run_dir: &Path) -> Result<Self, Error> {
        let path = Self::snapshot_path(run_dir);
        let contents = std::fs::read(&path).map_err(|e| {
            Error::new(ErrorDetails::FileRead {
                message: e.to_string(),
                file_path: path.display().to_string(),
            })
        })?;
        let state: GepaState = serde_json::from_slice(&contents).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to parse GEPA state from {}: {e}", path.display()),
            })
        })?;
        state.consistency_check()?;
        Ok(state)
    }

    /// Start a new iteration: bump the iteration counter and open its trace record.
    pub fn begin_iteration(&mut self) -> i64 {
        self.i += 1;
        self.full_program_trace.push(TraceRecord {
            i: self.i,
            ..Default::default()
        });
        self.i
    }

    pub fn last_trace_mut(&mut self) -> Option<&mut TraceRecord> {
        self.full_program_trace.last_mut()
    }

    /// Account for metric calls spent outside full evaluations (e.g. subsample gates).
    pub fn charge_metric_calls(&mut self, num_calls: usize) {
        self.total_num_evals += num_calls;
    }

    /// Account for one full validation evaluation of `num_scores` instances.
    pub fn record_full_evaluation(&mut self, num_scores: usize) {
        self.num_full_ds_evals += 1;
        self.total_num_evals += num_scores;
    }

    /// Index of the first candidate with the highest aggregate score
    pub fn best_program_idx(&self) -> usize {
        idxmax(&self.per_program_tracked_scores).unwrap_or(0)
    }

    /// Mean of the per-instance Pareto-front scores
    pub fn pareto_front_aggregate(&self) -> f64 {
        mean(&self.pareto_front_valset)
    }

    pub fn num_candidates(&self) -> usize {
        self.program_candidates.len()
    }

    pub fn num_val_instances(&self) -> usize {
        self.pareto_front_valset.len()
    }

    pub fn program_candidates(&self) -> &[Candidate] {
        &self.program_candidates
    }

    pub fn parent_program_for_candidate(&self) -> &[Vec<usize>] {
        &self.parent_program_for_candidate
    }

    pub fn program_full_scores_val_set(&self) -> &[f64] {
        &self.program_full_scores_val_set
    }

    pub fn per_program_tracked_scores(&self) -> &[f64] {
        &self.per_program_tracked_scores
    }

    pub fn prog_candidate_val_subscores(&self) -> &[Vec<f64>] {
        &self.prog_candidate_val_subscores
    }

    pub fn num_metric_calls_by_discovery(&self) -> &[usize] {
        &self.num_metric_calls_by_discovery
    }

    pub fn pareto_front_valset(&self) -> &[f64] {
        &self.pareto_front_valset
    }

    pub fn program_at_pareto_front_valset(&self) -> &[BTreeSet<usize>] {
        &self.program_at_pareto_front_valset
    }

    pub fn best_outputs_valset(&self) -> Option<&[Vec<(usize, Value)>]> {
        self.best_outputs_valset.as_deref()
    }

    pub fn full_program_trace(&self) -> &[TraceRecord] {
        &self.full_program_trace
    }

    pub fn i(&self) -> i64 {
        self.i
    }

    pub fn num_full_ds_evals(&self) -> usize {
        self.num_full_ds_evals
    }

    pub fn total_num_evals(&self) -> usize {
        self.total_num_evals
    }
}

/// Resume the state stored in `run_dir`, or start a fresh one by evaluating the seed.
///
/// A fresh state accounts for the seed evaluation (`num_full_ds_evals = 1`,
/// `total_num_evals = len(scores)`), and when `run_dir` is set the seed's outputs are
/// written as the initial best-output artifacts for every instance.
pub async fn initialize_gepa_state<F, Fut>(
    run_dir: Option<&Path>,
    logger: &dyn RunLogger,
    seed_candidate: &Candidate,
    valset_evaluator: F,
    track_best_outputs: bool,
) -> Result<GepaState, Error>
where
    F: FnOnce(Candidate) -> Fut,
    Fut: Future<Output = Result<(Vec<Value>, Vec<f64>), Error>>,
{
    if let Some(run_dir) = run_dir.filter(|dir| GepaState::snapshot_path(dir).exists()) {
        logger.log(&format!(
            "Loading GEPA state from run directory {}",
            run_dir.display()
        ));
        return GepaState::load(run_dir);
    }

    let (outputs, scores) = valset_evaluator(seed_candidate.clone()).await?;
    if let Some(run_dir) = run_dir {
        for (task_idx, output) in outputs.iter().enumerate() {
            write_json_file(&best_output_path(run_dir, task_idx, 0, 0), output)?;
        }
    }

    let num_scores = scores.len();
    let mut state = GepaState::new(
        seed_candidate.clone(),
        outputs,
        scores,
        track_best_outputs,
    )?;
    state.record_full_evaluation(num_scores);
    Ok(state)
}

fn best_output_path(run_dir: &Path, task_idx: usize, iteration: i64, program_idx: usize) -> PathBuf {
    run_dir
        .join(BEST_OUTPUTS_DIR_NAME)
        .join(format!("task_{task_idx}"))
        .join(format!("iter_{iteration}_prog_{program_idx}.json"))
}

fn inconsistent(message: String) -> Error {
    Error::new(ErrorDetails::InconsistentState { message })
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
