//! Proposal types and the proposer collaborators
//!
//! Proposers produce new candidates together with subsample evidence; the engine decides
//! whether a proposal earns a full validation evaluation using the gates below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::state::{Candidate, GepaState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalTag {
    Reflective,
    Merge,
}

impl ProposalTag {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalTag::Reflective => "reflective",
            ProposalTag::Merge => "merge",
        }
    }
}

impl std::fmt::Display for ProposalTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A new candidate plus the subsample evidence used to gate it
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateProposal {
    pub candidate: Candidate,
    pub parent_program_ids: Vec<usize>,
    /// Training instances the subsample scores were computed on
    pub subsample_indices: Vec<usize>,
    /// Reflective: per-instance parent scores on the subsample. Merge: one subsample sum per parent.
    pub subsample_scores_before: Option<Vec<f64>>,
    /// Per-instance scores of the new candidate on the subsample
    pub subsample_scores_after: Option<Vec<f64>>,
    pub tag: ProposalTag,
    /// Metric calls the proposer spent producing this proposal; charged to the run budget
    pub metric_calls: usize,
}

impl CandidateProposal {
    pub fn subsample_sum_before(&self) -> Option<f64> {
        self.subsample_scores_before
            .as_ref()
            .map(|scores| scores.iter().sum())
    }

    pub fn subsample_sum_after(&self) -> Option<f64> {
        self.subsample_scores_after
            .as_ref()
            .map(|scores| scores.iter().sum())
    }

    /// Merge gate: the merged candidate's subsample sum must match or beat the best parent sum.
    ///
    /// Missing or empty parent sums reject, as do missing merged scores.
    pub fn passes_merge_gate(&self) -> bool {
        let best_parent = self
            .subsample_scores_before
            .as_ref()
            .and_then(|scores| scores.iter().copied().reduce(f64::max));
        match (best_parent, self.subsample_sum_after()) {
            (Some(before), Some(after)) => after >= before,
            _ => false,
        }
    }

    /// Reflective gate: strict improvement of the subsample sum over the parent
    pub fn passes_reflective_gate(&self) -> bool {
        match (self.subsample_sum_before(), self.subsample_sum_after()) {
            (Some(before), Some(after)) => after > before,
            _ => false,
        }
    }
}

/// Produces new candidates from the current search state
///
/// `Ok(None)` means the proposer has nothing left to offer.
#[async_trait]
pub trait ProposeNewCandidate: Send {
    async fn propose(&mut self, state: &GepaState) -> Result<Option<CandidateProposal>, Error>;
}

/// Scheduling counters shared between the engine and a merge proposer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeSchedule {
    pub use_merge: bool,
    pub merges_due: usize,
    pub last_iter_found_new_program: bool,
    pub total_merges_tested: usize,
    pub max_merge_invocations: usize,
}

impl MergeSchedule {
    pub fn new(use_merge: bool, max_merge_invocations: usize) -> Self {
        Self {
            use_merge,
            max_merge_invocations,
            ..Default::default()
        }
    }

    /// Queue another merge if merging is enabled and the invocation cap is not reached
    pub fn schedule_if_needed(&mut self) {
        if self.use_merge && self.total_merges_tested < self.max_merge_invocations {
            self.merges_due += 1;
        }
    }

    /// A merge is attempted only when one is due and the previous iteration found a program
    pub fn should_attempt(&self) -> bool {
        self.use_merge && self.merges_due > 0 && self.last_iter_found_new_program
    }
}

/// A proposer that crosses over existing candidates
pub trait MergeProposer: ProposeNewCandidate {
    fn schedule(&self) -> &MergeSchedule;

    fn schedule_mut(&mut self) -> &mut MergeSchedule;
}
