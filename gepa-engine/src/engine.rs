//! GEPA engine: the budgeted propose / gate / evaluate loop
//!
//! Each iteration:
//! 1. If a merge is due (and the previous iteration found a new program), ask the merge
//!    proposer for a crossover and accept it when its subsample sum is at least the best
//!    parent's subsample sum. An accepted merge ends the iteration.
//! 2. Otherwise ask the reflective proposer for a mutation and accept it only on a strict
//!    improvement of the subsample sum. A proposer with nothing to offer ends the run.
//! 3. Accepted candidates get a full validation evaluation, which updates the Pareto
//!    bookkeeping in `GepaState` and is checkpointed to the run directory.
//!
//! The loop stops once `total_num_evals` reaches `max_metric_calls`.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::GepaConfig;
use crate::error::{Error, ErrorDetails};
use crate::evaluation::Evaluator;
use crate::json_utils::output_to_json;
use crate::observability::{ExperimentTracker, RunLogger, Telemetry};
use crate::proposer::{CandidateProposal, MergeProposer, ProposalTag, ProposeNewCandidate};
use crate::result::GepaResult;
use crate::state::{Candidate, GepaState, ProposalAttempt, initialize_gepa_state, mean};

/// Collaborators and configuration for a `GepaEngine`
pub struct GepaEngineParams<D, O> {
    pub evaluator: Box<dyn Evaluator<D, O>>,
    pub valset: Vec<D>,
    pub seed_candidate: Candidate,
    pub reflective_proposer: Box<dyn ProposeNewCandidate>,
    /// Its schedule's `use_merge` and `max_merge_invocations` are overwritten from `config`
    pub merge_proposer: Option<Box<dyn MergeProposer>>,
    pub logger: Arc<dyn RunLogger>,
    pub experiment_tracker: Box<dyn ExperimentTracker>,
    pub telemetry: Telemetry,
    pub config: GepaConfig,
}

/// How a single iteration ended
#[derive(Debug)]
pub enum IterationOutcome {
    /// A new candidate was accepted and fully evaluated
    Progressed,
    /// A proposal was rejected by its subsample gate
    NoProgress,
    /// The reflective proposer had nothing left to propose
    Exhausted,
    Failed(Error),
}

pub struct GepaEngine<D, O> {
    evaluator: Box<dyn Evaluator<D, O>>,
    valset: Vec<D>,
    seed_candidate: Candidate,
    reflective_proposer: Box<dyn ProposeNewCandidate>,
    merge_proposer: Option<Box<dyn MergeProposer>>,
    logger: Arc<dyn RunLogger>,
    experiment_tracker: Box<dyn ExperimentTracker>,
    telemetry: Telemetry,
    config: GepaConfig,
}

impl<D, O> GepaEngine<D, O>
where
    D: Sync,
    O: Serialize + Debug + Send,
{
    /// The merge proposer's `use_merge` and `max_merge_invocations` are taken from `config`.
    pub fn new(params: GepaEngineParams<D, O>) -> Self {
        let GepaEngineParams {
            evaluator,
            valset,
            seed_candidate,
            reflective_proposer,
            mut merge_proposer,
            logger,
            experiment_tracker,
            telemetry,
            config,
        } = params;

        if let Some(merge_proposer) = merge_proposer.as_mut() {
            let schedule = merge_proposer.schedule_mut();
            if schedule.use_merge != config.use_merge {
                tracing::warn!(
                    schedule_use_merge = schedule.use_merge,
                    config_use_merge = config.use_merge,
                    "Merge proposer schedule disagrees with `use_merge` in the GEPA config; using the config value"
                );
            }
            schedule.use_merge = config.use_merge;
            schedule.max_merge_invocations = config.max_merge_invocations;
        }

        Self {
            evaluator,
            valset,
            seed_candidate,
            reflective_proposer,
            merge_proposer,
            logger,
            experiment_tracker,
            telemetry,
            config,
        }
    }

    pub fn config(&self) -> &GepaConfig {
        &self.config
    }

    pub fn merge_proposer(&self) -> Option<&dyn MergeProposer> {
        self.merge_proposer.as_deref()
    }

    /// Run the search until the budget is spent or the reflective proposer is exhausted.
    ///
    /// Returns the final state. With `raise_on_exception` the first failed iteration is
    /// returned as an error; otherwise failures are logged and the run continues until
    /// `max_consecutive_failures` failures happen in a row.
    pub async fn run(&mut self) -> Result<GepaState, Error> {
        let telemetry = self.telemetry;
        let mut state = telemetry
            .with_span("gepa.initialize_state", &[], self.initialize_state())
            .await?;

        let seed_score = state
            .program_full_scores_val_set()
            .first()
            .copied()
            .unwrap_or_default();
        self.experiment_tracker.log_metrics(
            &BTreeMap::from([("valset_score".to_string(), seed_score)]),
            0,
        );
        self.logger.log(&format!(
            "Iteration {}: Base program full valset score: {seed_score}",
            state.i() + 1
        ));

        if let Some(merge_proposer) = self.merge_proposer.as_mut() {
            merge_proposer.schedule_mut().last_iter_found_new_program = false;
        }

        let mut consecutive_failures = 0;
        while state.total_num_evals() < self.config.max_metric_calls {
            match self.iteration_step(&mut state).await {
                IterationOutcome::Progressed | IterationOutcome::NoProgress => {
                    consecutive_failures = 0;
                }
                IterationOutcome::Exhausted => {
                    self.logger.log(&format!(
                        "Iteration {}: No further candidates proposed; stopping",
                        state.i()
                    ));
                    break;
                }
                IterationOutcome::Failed(error) => {
                    if self.config.raise_on_exception {
                        return Err(error);
                    }
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.max_consecutive_failures {
                        tracing::error!(
                            consecutive_failures,
                            "Stopping GEPA run after {consecutive_failures} consecutive failed iterations"
                        );
                        self.logger.log(&format!(
                            "Iteration {}: Stopping after {consecutive_failures} consecutive failures",
                            state.i()
                        ));
                        break;
                    }
                }
            }
        }

        tracing::info!(
            num_candidates = state.num_candidates(),
            total_num_evals = state.total_num_evals(),
            best_program_idx = state.best_program_idx(),
            "GEPA run finished"
        );
        if let Some(run_dir) = self.config.run_dir.as_deref() {
            state.save(run_dir)?;
        }
        Ok(state)
    }

    /// `run`, summarized as a `GepaResult`
    pub async fn run_to_result(&mut self) -> Result<GepaResult, Error> {
        let state = self.run().await?;
        Ok(GepaResult::from_state(
            &state,
            self.config.run_dir.clone(),
            Some(self.config.seed),
        ))
    }

    /// Run one iteration against `state`, converting any error into `IterationOutcome::Failed`.
    pub async fn iteration_step(&mut self, state: &mut GepaState) -> IterationOutcome {
        let iteration = state.begin_iteration();
        let telemetry = self.telemetry;
        let result = telemetry
            .with_span(
                "gepa.iteration",
                &[("iteration", iteration.to_string())],
                self.try_iteration_step(state, iteration),
            )
            .await;

        match result {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(
                    iteration,
                    "GEPA iteration failed: {error}\n{}",
                    error.backtrace()
                );
                self.logger
                    .log(&format!("Iteration {iteration}: Exception during optimization: {error}"));
                if let Some(trace) = state.last_trace_mut() {
                    trace.error = Some(error.to_string());
                }
                IterationOutcome::Failed(error)
            }
        }
    }

    async fn try_iteration_step(
        &mut self,
        state: &mut GepaState,
        iteration: i64,
    ) -> Result<IterationOutcome, Error> {
        if let Some(parent_ids) = self.try_merge(state, iteration).await? {
            tracing::debug!(?parent_ids, "Merge accepted; skipping reflective phase");
            return Ok(IterationOutcome::Progressed);
        }

        let Some(proposal) = self.reflective_proposer.propose(state).await? else {
            self.logger.log(&format!(
                "Iteration {iteration}: Reflective mutation did not propose a new candidate"
            ));
            return Ok(IterationOutcome::Exhausted);
        };
        state.charge_metric_calls(proposal.metric_calls);

        let accepted = proposal.passes_reflective_gate();
        record_attempt(state, &proposal, accepted);
        if !accepted {
            self.logger.log(&format!(
                "Iteration {iteration}: New subsample score {} is not better than old score {}, skipping",
                format_sum(proposal.subsample_sum_after()),
                format_sum(proposal.subsample_sum_before()),
            ));
            return Ok(IterationOutcome::NoProgress);
        }

        self.logger.log(&format!(
            "Iteration {iteration}: New subsample score {} is better than old score {}. Continue to full eval and add to candidate pool.",
            format_sum(proposal.subsample_sum_after()),
            format_sum(proposal.subsample_sum_before()),
        ));
        self.full_evaluation(state, proposal.candidate, proposal.parent_program_ids)
            .await?;

        if let Some(merge_proposer) = self.merge_proposer.as_mut() {
            let schedule = merge_proposer.schedule_mut();
            schedule.last_iter_found_new_program = true;
            schedule.schedule_if_needed();
        }
        Ok(IterationOutcome::Progressed)
    }

    /// Attempt a merge if one is due. Returns the parents of an accepted merge.
    async fn try_merge(
        &mut self,
        state: &mut GepaState,
        iteration: i64,
    ) -> Result<Option<Vec<usize>>, Error> {
        let Some(merge_proposer) = self.merge_proposer.as_mut() else {
            return Ok(None);
        };
        if !merge_proposer.schedule().should_attempt() {
            merge_proposer.schedule_mut().last_iter_found_new_program = false;
            return Ok(None);
        }

        let proposal = merge_proposer.propose(state).await;
        merge_proposer.schedule_mut().last_iter_found_new_program = false;
        let Some(proposal) = proposal? else {
            return Ok(None);
        };
        state.charge_metric_calls(proposal.metric_calls);

        if proposal.tag != ProposalTag::Merge {
            tracing::warn!(
                tag = %proposal.tag,
                "Merge proposer returned a proposal that is not tagged as a merge; ignoring it"
            );
            record_attempt(state, &proposal, false);
            return Ok(None);
        }

        let accepted = proposal.passes_merge_gate();
        record_attempt(state, &proposal, accepted);
        if !accepted {
            self.logger.log(&format!(
                "Iteration {iteration}: Merged program subsample score {} is worse than the best parent score {}, skipping",
                format_sum(proposal.subsample_sum_after()),
                format_sum(
                    proposal
                        .subsample_scores_before
                        .as_ref()
                        .and_then(|sums| sums.iter().copied().reduce(f64::max))
                ),
            ));
            return Ok(None);
        }

        self.logger.log(&format!(
            "Iteration {iteration}: Merged programs {:?}; subsample score {} accepted",
            proposal.parent_program_ids,
            format_sum(proposal.subsample_sum_after()),
        ));
        let parent_ids = proposal.parent_program_ids.clone();
        self.full_evaluation(state, proposal.candidate, proposal.parent_program_ids)
            .await?;

        if let Some(merge_proposer) = self.merge_proposer.as_mut() {
            let schedule = merge_proposer.schedule_mut();
            schedule.merges_due = schedule.merges_due.saturating_sub(1);
            schedule.total_merges_tested += 1;
        }
        Ok(Some(parent_ids))
    }

    async fn initialize_state(&self) -> Result<GepaState, Error> {
        let evaluator = self.evaluator.as_ref();
        let valset = self.valset.as_slice();
        initialize_gepa_state(
            self.config.run_dir.as_deref(),
            self.logger.as_ref(),
            &self.seed_candidate,
            |candidate| async move { evaluate_valset(evaluator, valset, &candidate).await },
            self.config.track_best_outputs,
        )
        .await
    }

    /// Evaluate `candidate` on the full validation set and add it to the pool
    async fn full_evaluation(
        &mut self,
        state: &mut GepaState,
        candidate: Candidate,
        parent_ids: Vec<usize>,
    ) -> Result<usize, Error> {
        let cumulative_eval_count = state.total_num_evals();
        let telemetry = self.telemetry;
        let (outputs, scores) = telemetry
            .with_span(
                "gepa.full_evaluation",
                &[("num_instances", self.valset.len().to_string())],
                evaluate_valset(self.evaluator.as_ref(), &self.valset, &candidate),
            )
            .await?;

        let aggregate = mean(&scores);
        let num_scores = scores.len();
        let (new_idx, best_idx) = state.update_state_with_new_program(
            parent_ids,
            candidate,
            aggregate,
            &outputs,
            scores,
            self.config.run_dir.as_deref(),
            cumulative_eval_count,
        )?;
        state.record_full_evaluation(num_scores);

        let iteration = state.i();
        let best_score = state.program_full_scores_val_set()[best_idx];
        self.logger.log(&format!(
            "Iteration {iteration}: New program {new_idx} valset score: {aggregate}; best program so far: {best_idx} ({best_score})"
        ));
        self.experiment_tracker.log_metrics(
            &BTreeMap::from([
                ("valset_score".to_string(), aggregate),
                ("best_valset_score".to_string(), best_score),
                (
                    "valset_pareto_front_agg".to_string(),
                    state.pareto_front_aggregate(),
                ),
                ("new_program_idx".to_string(), new_idx as f64),
                ("total_metric_calls".to_string(), state.total_num_evals() as f64),
            ]),
            iteration,
        );
        if let Some(trace) = state.last_trace_mut() {
            trace.new_program_idx = Some(new_idx);
        }
        if let Some(run_dir) = self.config.run_dir.as_deref() {
            state.save(run_dir)?;
        }
        Ok(new_idx)
    }
}

/// Evaluate a candidate on the validation set and convert its outputs to JSON
async fn evaluate_valset<D, O>(
    evaluator: &dyn Evaluator<D, O>,
    valset: &[D],
    candidate: &Candidate,
) -> Result<(Vec<Value>, Vec<f64>), Error>
where
    D: Sync,
    O: Serialize + Debug + Send,
{
    let batch = evaluator.evaluate(valset, candidate).await?;
    if batch.len() != valset.len() {
        return Err(Error::new(ErrorDetails::Evaluator {
            message: format!(
                "Evaluator returned {} results for a dataset of {} instances",
                batch.len(),
                valset.len()
            ),
        }));
    }
    let (outputs, scores, _) = batch.into_parts();
    Ok((outputs.iter().map(output_to_json).collect(), scores))
}

fn record_attempt(state: &mut GepaState, proposal: &CandidateProposal, accepted: bool) {
    if let Some(trace) = state.last_trace_mut() {
        trace.attempts.push(ProposalAttempt {
            tag: proposal.tag,
            parent_program_ids: proposal.parent_program_ids.clone(),
            subsample_score_before: proposal.subsample_sum_before(),
            subsample_score_after: proposal.subsample_sum_after(),
            accepted,
        });
    }
}

fn format_sum(sum: Option<f64>) -> String {
    sum.map_or_else(|| "<missing>".to_string(), |sum| sum.to_string())
}
