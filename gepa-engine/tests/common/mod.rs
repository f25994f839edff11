#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use gepa_engine::observability::{ExperimentTracker, NoopTracker, Telemetry, TracingLogger};
use gepa_engine::pareto::{CandidateSelector, ParetoCandidateSelector};
use gepa_engine::sample::EpochShuffledBatchSampler;
use gepa_engine::{
    Candidate, CandidateProposal, Error, ErrorDetails, EvaluationBatch, Evaluator, GepaConfig,
    GepaEngine, GepaEngineParams, GepaState, MergeProposer, MergeSchedule, ProposalTag,
    ProposeNewCandidate,
};

pub const COMPONENT: &str = "instructions";

pub fn candidate(text: &str) -> Candidate {
    Candidate::from([(COMPONENT.to_string(), text.to_string())])
}

pub fn instructions(candidate: &Candidate) -> &str {
    candidate.get(COMPONENT).map_or("", String::as_str)
}

pub type ScoreFn = Arc<dyn Fn(&Candidate, u32) -> f64 + Send + Sync>;

/// Scores every (candidate, item) pair with `score` and counts its calls
pub struct FnEvaluator {
    score: ScoreFn,
    calls: Arc<AtomicUsize>,
    fail_from_call: Option<usize>,
}

impl FnEvaluator {
    pub fn new(score: impl Fn(&Candidate, u32) -> f64 + Send + Sync + 'static) -> Self {
        Self {
            score: Arc::new(score),
            calls: Arc::new(AtomicUsize::new(0)),
            fail_from_call: None,
        }
    }

    /// Scores each candidate by looking up its instruction text; unknown text scores 0
    pub fn from_table(table: &[(&str, &[f64])]) -> Self {
        let table: BTreeMap<String, Vec<f64>> = table
            .iter()
            .map(|(text, scores)| ((*text).to_string(), scores.to_vec()))
            .collect();
        Self::new(move |candidate, item| {
            table
                .get(instructions(candidate))
                .and_then(|scores| scores.get(item as usize).copied())
                .unwrap_or(0.0)
        })
    }

    /// Every call starting with the `call`-th (0-based) fails
    pub fn failing_from_call(mut self, call: usize) -> Self {
        self.fail_from_call = Some(call);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Evaluator<u32, String> for FnEvaluator {
    async fn evaluate(
        &self,
        dataset: &[u32],
        candidate: &Candidate,
    ) -> Result<EvaluationBatch<String>, Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_from_call.is_some_and(|first| call >= first) {
            return Err(Error::new(ErrorDetails::Evaluator {
                message: "evaluator unavailable".to_string(),
            }));
        }
        let outputs = dataset
            .iter()
            .map(|item| format!("{}:{item}", instructions(candidate)))
            .collect();
        let scores = dataset
            .iter()
            .map(|&item| (self.score)(candidate, item))
            .collect();
        EvaluationBatch::new(outputs, scores, None)
    }
}

pub fn reflective(text: &str, parent: usize, before: &[f64], after: &[f64]) -> CandidateProposal {
    CandidateProposal {
        candidate: candidate(text),
        parent_program_ids: vec![parent],
        subsample_indices: (0..before.len()).collect(),
        subsample_scores_before: Some(before.to_vec()),
        subsample_scores_after: Some(after.to_vec()),
        tag: ProposalTag::Reflective,
        metric_calls: before.len() + after.len(),
    }
}

pub fn merge(
    text: &str,
    parents: [usize; 2],
    parent_sums: [f64; 2],
    after: &[f64],
) -> CandidateProposal {
    CandidateProposal {
        candidate: candidate(text),
        parent_program_ids: parents.to_vec(),
        subsample_indices: (0..after.len()).collect(),
        subsample_scores_before: Some(parent_sums.to_vec()),
        subsample_scores_after: Some(after.to_vec()),
        tag: ProposalTag::Merge,
        metric_calls: 3 * after.len(),
    }
}

pub fn proposer_error(message: &str) -> Error {
    Error::new(ErrorDetails::Proposer {
        message: message.to_string(),
    })
}

/// Replays a fixed script of proposals; an exhausted script proposes nothing
pub struct ScriptedProposer {
    script: VecDeque<Result<Option<CandidateProposal>, Error>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProposer {
    pub fn new(script: Vec<Result<Option<CandidateProposal>, Error>>) -> Self {
        Self {
            script: script.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn accepting(proposals: Vec<CandidateProposal>) -> Self {
        Self::new(proposals.into_iter().map(|p| Ok(Some(p))).collect())
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl ProposeNewCandidate for ScriptedProposer {
    async fn propose(&mut self, _state: &GepaState) -> Result<Option<CandidateProposal>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or(Ok(None))
    }
}

pub struct ScriptedMergeProposer {
    inner: ScriptedProposer,
    schedule: MergeSchedule,
}

impl ScriptedMergeProposer {
    pub fn new(proposals: Vec<Option<CandidateProposal>>) -> Self {
        Self {
            inner: ScriptedProposer::new(proposals.into_iter().map(Ok).collect()),
            schedule: MergeSchedule::default(),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.inner.calls()
    }
}

#[async_trait]
impl ProposeNewCandidate for ScriptedMergeProposer {
    async fn propose(&mut self, state: &GepaState) -> Result<Option<CandidateProposal>, Error> {
        self.inner.propose(state).await
    }
}

impl MergeProposer for ScriptedMergeProposer {
    fn schedule(&self) -> &MergeSchedule {
        &self.schedule
    }

    fn schedule_mut(&mut self) -> &mut MergeSchedule {
        &mut self.schedule
    }
}

/// Mutates a Pareto-selected parent by appending `+` and measures both on a minibatch
pub struct AppendingProposer {
    evaluator: FnEvaluator,
    trainset: Vec<u32>,
    selector: ParetoCandidateSelector,
    sampler: EpochShuffledBatchSampler,
}

impl AppendingProposer {
    pub fn new(evaluator: FnEvaluator, trainset: Vec<u32>, minibatch_size: usize) -> Self {
        Self {
            evaluator,
            trainset,
            selector: ParetoCandidateSelector::new(0),
            sampler: EpochShuffledBatchSampler::new(minibatch_size, 0).unwrap(),
        }
    }
}

#[async_trait]
impl ProposeNewCandidate for AppendingProposer {
    async fn propose(&mut self, state: &GepaState) -> Result<Option<CandidateProposal>, Error> {
        let parent_idx = self.selector.select_candidate_idx(state)?;
        let parent = state.program_candidates()[parent_idx].clone();
        let child = candidate(&format!("{}+", instructions(&parent)));

        let iteration = usize::try_from(state.i()).unwrap_or_default();
        let indices = self
            .sampler
            .next_minibatch_indices(self.trainset.len(), iteration)?;
        let minibatch: Vec<u32> = indices.iter().map(|&idx| self.trainset[idx]).collect();

        let before = self.evaluator.evaluate(&minibatch, &parent).await?;
        let after = self.evaluator.evaluate(&minibatch, &child).await?;
        Ok(Some(CandidateProposal {
            candidate: child,
            parent_program_ids: vec![parent_idx],
            subsample_indices: indices,
            metric_calls: before.len() + after.len(),
            subsample_scores_before: Some(before.scores().to_vec()),
            subsample_scores_after: Some(after.scores().to_vec()),
            tag: ProposalTag::Reflective,
        }))
    }
}

/// 0.1 per appended `+`, capped at 1.0
pub fn plus_count_score(candidate: &Candidate, _item: u32) -> f64 {
    let count = instructions(candidate).matches('+').count();
    (count as f64 * 0.1).min(1.0)
}

pub struct EngineBuilder {
    pub evaluator: Box<dyn Evaluator<u32, String>>,
    pub valset: Vec<u32>,
    pub reflective_proposer: Box<dyn ProposeNewCandidate>,
    pub merge_proposer: Option<Box<dyn MergeProposer>>,
    pub experiment_tracker: Box<dyn ExperimentTracker>,
    pub telemetry: Telemetry,
    pub config: GepaConfig,
}

impl EngineBuilder {
    pub fn new(
        evaluator: impl Evaluator<u32, String> + 'static,
        reflective_proposer: impl ProposeNewCandidate + 'static,
    ) -> Self {
        Self {
            evaluator: Box::new(evaluator),
            valset: vec![0, 1, 2, 3],
            reflective_proposer: Box::new(reflective_proposer),
            merge_proposer: None,
            experiment_tracker: Box::new(NoopTracker),
            telemetry: Telemetry::Disabled,
            config: GepaConfig::default(),
        }
    }

    pub fn build(self) -> GepaEngine<u32, String> {
        GepaEngine::new(GepaEngineParams {
            evaluator: self.evaluator,
            valset: self.valset,
            seed_candidate: candidate("seed"),
            reflective_proposer: self.reflective_proposer,
            merge_proposer: self.merge_proposer,
            logger: Arc::new(TracingLogger),
            experiment_tracker: self.experiment_tracker,
            telemetry: self.telemetry,
            config: self.config,
        })
    }
}
