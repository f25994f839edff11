//! Evaluation results and the evaluator collaborator

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::state::Candidate;

/// Outputs, scores, and optional traces produced by a single evaluation call
///
/// All per-instance vectors have the same length; construction fails otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationBatch<O, T = serde_json::Value> {
    outputs: Vec<O>,
    scores: Vec<f64>,
    trajectories: Option<Vec<T>>,
}

impl<O, T> EvaluationBatch<O, T> {
    pub fn new(
        outputs: Vec<O>,
        scores: Vec<f64>,
        trajectories: Option<Vec<T>>,
    ) -> Result<Self, Error> {
        let trajectories_len = trajectories.as_ref().map(Vec::len);
        if outputs.len() != scores.len()
            || trajectories_len.is_some_and(|len| len != outputs.len())
        {
            return Err(Error::new(ErrorDetails::EvaluationBatchLength {
                outputs: outputs.len(),
                scores: scores.len(),
                trajectories: trajectories_len,
            }));
        }
        if let Some((index, score)) = scores
            .iter()
            .copied()
            .enumerate()
            .find(|(_, score)| !score.is_finite())
        {
            return Err(Error::new(ErrorDetails::NonFiniteScore { index, score }));
        }
        Ok(Self {
            outputs,
            scores,
            trajectories,
        })
    }

    pub fn outputs(&self) -> &[O] {
        &self.outputs
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    pub fn trajectories(&self) -> Option<&[T]> {
        self.trajectories.as_deref()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Sum of per-instance scores (the quantity compared by the subsample gates)
    pub fn score_sum(&self) -> f64 {
        self.scores.iter().sum()
    }

    pub fn into_parts(self) -> (Vec<O>, Vec<f64>, Option<Vec<T>>) {
        (self.outputs, self.scores, self.trajectories)
    }
}

/// Runs a candidate over a dataset
///
/// Implementations may fan out internally; the engine awaits one call at a time.
/// The returned batch must hold exactly one entry per dataset item, in dataset order.
#[async_trait]
pub trait Evaluator<D, O>: Send + Sync {
    async fn evaluate(
        &self,
        dataset: &[D],
        candidate: &Candidate,
    ) -> Result<EvaluationBatch<O>, Error>;
}
