//! Immutable summary of a finished (or checkpointed) GEPA run

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorDetails};
use crate::json_utils::sort_json_keys;
use crate::pareto::{find_dominator_programs, idxmax};
use crate::state::{Candidate, GepaState};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GepaResult {
    candidates: Vec<Candidate>,
    parents: Vec<Vec<usize>>,
    val_aggregate_scores: Vec<f64>,
    val_subscores: Vec<Vec<f64>>,
    per_val_instance_best_candidates: Vec<BTreeSet<usize>>,
    discovery_eval_counts: Vec<usize>,
    #[serde(default)]
    best_outputs_valset: Option<Vec<Vec<(usize, Value)>>>,
    total_metric_calls: usize,
    num_full_val_evals: usize,
    run_dir: Option<PathBuf>,
    seed: Option<u64>,
}

impl GepaResult {
    pub fn from_state(state: &GepaState, run_dir: Option<PathBuf>, seed: Option<u64>) -> Self {
        Self {
            candidates: state.program_candidates().to_vec(),
            parents: state.parent_program_for_candidate().to_vec(),
            val_aggregate_scores: state.program_full_scores_val_set().to_vec(),
            val_subscores: state.prog_candidate_val_subscores().to_vec(),
            per_val_instance_best_candidates: state.program_at_pareto_front_valset().to_vec(),
            discovery_eval_counts: state.num_metric_calls_by_discovery().to_vec(),
            best_outputs_valset: state.best_outputs_valset().map(<[_]>::to_vec),
            total_metric_calls: state.total_num_evals(),
            num_full_val_evals: state.num_full_ds_evals(),
            run_dir,
            seed,
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn parents(&self) -> &[Vec<usize>] {
        &self.parents
    }

    pub fn val_aggregate_scores(&self) -> &[f64] {
        &self.val_aggregate_scores
    }

    pub fn val_subscores(&self) -> &[Vec<f64>] {
        &self.val_subscores
    }

    pub fn per_val_instance_best_candidates(&self) -> &[BTreeSet<usize>] {
        &self.per_val_instance_best_candidates
    }

    /// `total_metric_calls` at the moment each candidate was discovered
    pub fn discovery_eval_counts(&self) -> &[usize] {
        &self.discovery_eval_counts
    }

    pub fn best_outputs_valset(&self) -> Option<&[Vec<(usize, Value)>]> {
        self.best_outputs_valset.as_deref()
    }

    pub fn total_metric_calls(&self) -> usize {
        self.total_metric_calls
    }

    pub fn num_full_val_evals(&self) -> usize {
        self.num_full_val_evals
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn num_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn num_val_instances(&self) -> usize {
        self.per_val_instance_best_candidates.len()
    }

    /// Index of the first candidate with the highest aggregate score
    pub fn best_idx(&self) -> usize {
        idxmax(&self.val_aggregate_scores).unwrap_or(0)
    }

    pub fn best_candidate(&self) -> Option<&Candidate> {
        self.candidates.get(self.best_idx())
    }

    pub fn best_score(&self) -> Option<f64> {
        self.val_aggregate_scores.get(self.best_idx()).copied()
    }

    /// Candidates that survive dominance filtering of the per-instance fronts
    pub fn non_dominated_indices(&self) -> Vec<usize> {
        find_dominator_programs(
            &self.per_val_instance_best_candidates,
            &self.val_aggregate_scores,
        )
    }

    /// `idx` followed by its first-parent ancestors, ending at a candidate with no parents
    pub fn lineage(&self, idx: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut current = Some(idx);
        while let Some(program) = current {
            // Parents always precede children; guard against malformed input anyway
            if program >= self.num_candidates() || chain.contains(&program) {
                break;
            }
            chain.push(program);
            current = self
                .parents
                .get(program)
                .and_then(|parents| parents.first().copied());
        }
        chain
    }

    /// Up to `k` candidate indices ordered by aggregate score, highest first; ties by index
    pub fn best_k(&self, k: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.val_aggregate_scores.len()).collect();
        indices.sort_by(|&a, &b| {
            self.val_aggregate_scores[b]
                .total_cmp(&self.val_aggregate_scores[a])
                .then(a.cmp(&b))
        });
        indices.truncate(k);
        indices
    }

    /// Candidates tied for the best score on validation instance `task_idx`
    pub fn instance_winners(&self, task_idx: usize) -> Option<&BTreeSet<usize>> {
        self.per_val_instance_best_candidates.get(task_idx)
    }

    /// JSON form with recursively sorted keys
    pub fn to_dict(&self) -> Result<Value, Error> {
        let value = serde_json::to_value(self).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize GEPA result: {e}"),
            })
        })?;
        Ok(sort_json_keys(value))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(&self.to_dict()?).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to serialize GEPA result: {e}"),
            })
        })
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: format!("Failed to parse GEPA result: {e}"),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(text: &str) -> Candidate {
        Candidate::from([("instructions".to_string(), text.to_string())])
    }

    /// Seed plus three children: 1 <- 0, 2 <- 1, 3 <- (2, 0)
    fn sample_state() -> GepaState {
        let outputs = vec![json!("a"), json!("b"), json!("c")];
        let mut state =
            GepaState::new(candidate("seed"), outputs.clone(), vec![0.2, 0.4, 0.6], true)
                .unwrap();
        let children: [(Vec<usize>, Vec<f64>); 3] = [
            (vec![0], vec![0.5, 0.4, 0.3]),
            (vec![1], vec![0.5, 0.9, 0.3]),
            (vec![2, 0], vec![0.1, 0.9, 0.8]),
        ];
        for (i, (parents, scores)) in children.into_iter().enumerate() {
            let aggregate = scores.iter().sum::<f64>() / 3.0;
            state
                .update_state_with_new_program(
                    parents,
                    candidate(&format!("child{i}")),
                    aggregate,
                    &outputs,
                    scores,
                    None,
                    3 * (i + 1),
                )
                .unwrap();
        }
        state
    }

    #[test]
    fn test_from_state_copies_everything() {
        let state = sample_state();
        let result = GepaResult::from_state(&state, Some(PathBuf::from("run")), Some(5));

        assert_eq!(result.num_candidates(), 4);
        assert_eq!(result.num_val_instances(), 3);
        assert_eq!(result.parents(), state.parent_program_for_candidate());
        assert_eq!(result.discovery_eval_counts(), &[0, 3, 6, 9]);
        assert_eq!(result.seed(), Some(5));
        assert_eq!(result.run_dir(), Some(Path::new("run")));
        assert_eq!(result.total_metric_calls(), state.total_num_evals());
        assert!(result.best_outputs_valset().is_some());
    }

    #[test]
    fn test_best_candidate() {
        let result = GepaResult::from_state(&sample_state(), None, None);

        // Aggregates: 0.4, 0.4, 0.5666.., 0.6
        assert_eq!(result.best_idx(), 3);
        assert_eq!(result.best_candidate(), Some(&candidate("child2")));
        assert_eq!(result.best_k(2), vec![3, 2]);
        assert_eq!(result.best_k(10).len(), 4);
    }

    #[test]
    fn test_best_idx_tie_takes_first() {
        let mut state =
            GepaState::new(candidate("seed"), vec![json!(1)], vec![0.5], false).unwrap();
        for text in ["first", "second"] {
            state
                .update_state_with_new_program(
                    vec![0],
                    candidate(text),
                    0.7,
                    &[json!(1)],
                    vec![0.7],
                    None,
                    1,
                )
                .unwrap();
        }
        let result = GepaResult::from_state(&state, None, None);
        assert_eq!(result.val_aggregate_scores(), &[0.5, 0.7, 0.7]);
        assert_eq!(result.best_idx(), 1);
        assert_eq!(result.best_k(3), vec![1, 2, 0]);
    }

    #[test]
    fn test_lineage_walks_first_parents() {
        let result = GepaResult::from_state(&sample_state(), None, None);
        assert_eq!(result.lineage(3), vec![3, 2, 1, 0]);
        assert_eq!(result.lineage(0), vec![0]);
        assert!(result.lineage(17).is_empty());
    }

    #[test]
    fn test_instance_winners_and_non_dominated() {
        let result = GepaResult::from_state(&sample_state(), None, None);

        assert_eq!(result.instance_winners(0), Some(&BTreeSet::from([1, 2])));
        assert_eq!(result.instance_winners(1), Some(&BTreeSet::from([2, 3])));
        assert_eq!(result.instance_winners(2), Some(&BTreeSet::from([3])));
        assert_eq!(result.instance_winners(3), None);

        // Candidate 1 only ever shares a front with candidate 2, which scores higher
        assert_eq!(result.non_dominated_indices(), vec![2, 3]);
    }

    #[test]
    fn test_json_is_deterministic_and_parses_back() {
        let state = sample_state();
        let first = GepaResult::from_state(&state, None, Some(1));
        let second = GepaResult::from_state(&state.clone(), None, Some(1));

        let json = first.to_json().unwrap();
        assert_eq!(json, second.to_json().unwrap());

        let keys: Vec<String> = first
            .to_dict()
            .unwrap()
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);

        assert_eq!(GepaResult::from_json(&json).unwrap(), first);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let error = GepaResult::from_json("{\"candidates\": 3}").unwrap_err();
        assert!(matches!(
            error.get_details(),
            ErrorDetails::Serialization { .. }
        ));
    }
}
