//! Pareto frontier utilities for GEPA candidate selection
//!
//! The engine keeps, for every validation instance, the set of candidates tied for the best
//! score on that instance. This module works on those sets:
//! - Removing candidates that are dominated across all fronts they appear in
//! - Frequency-weighted sampling of a parent candidate from the surviving fronts
//! - Simple selectors that proposers can plug in

use std::collections::{BTreeMap, BTreeSet};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;

use crate::error::{Error, ErrorDetails};
use crate::state::GepaState;

/// Index of the first maximum value, or `None` for an empty slice
pub fn idxmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, &value) in values.iter().enumerate() {
        if best.is_none_or(|(_, best_value)| value > best_value) {
            best = Some((idx, value));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Check whether `program` is dominated given the remaining `programs`
///
/// A program is dominated when every front it belongs to also contains another program
/// from `programs`. A program that is the sole surviving member of any front is not.
fn is_dominated(
    program: usize,
    programs: &BTreeSet<usize>,
    fronts: &[BTreeSet<usize>],
) -> bool {
    fronts
        .iter()
        .filter(|front| front.contains(&program))
        .all(|front| {
            front
                .iter()
                .any(|&other| other != program && programs.contains(&other))
        })
}

/// Remove dominated programs from every front
///
/// Programs are examined from the lowest aggregate score upwards (ties broken by index),
/// and one program is eliminated at a time until no remaining program is dominated.
/// Every front that was non-empty stays non-empty.
pub fn remove_dominated_programs(
    fronts: &[BTreeSet<usize>],
    scores: &[f64],
) -> Vec<BTreeSet<usize>> {
    let mut programs: Vec<usize> = fronts
        .iter()
        .flatten()
        .copied()
        .collect::<BTreeSet<usize>>()
        .into_iter()
        .collect();
    let score_of = |idx: usize| scores.get(idx).copied().unwrap_or(f64::NEG_INFINITY);
    programs.sort_by(|&a, &b| score_of(a).total_cmp(&score_of(b)).then(a.cmp(&b)));

    let mut remaining: BTreeSet<usize> = programs.iter().copied().collect();
    loop {
        let dominated = programs
            .iter()
            .copied()
            .filter(|program| remaining.contains(program))
            .find(|&program| is_dominated(program, &remaining, fronts));
        match dominated {
            Some(program) => {
                remaining.remove(&program);
            }
            None => break,
        }
    }

    fronts
        .iter()
        .map(|front| {
            front
                .iter()
                .copied()
                .filter(|program| remaining.contains(program))
                .collect()
        })
        .collect()
}

/// Sorted indices of the programs that survive `remove_dominated_programs`
pub fn find_dominator_programs(fronts: &[BTreeSet<usize>], scores: &[f64]) -> Vec<usize> {
    remove_dominated_programs(fronts, scores)
        .into_iter()
        .flatten()
        .collect::<BTreeSet<usize>>()
        .into_iter()
        .collect()
}

/// Sample a program proportional to the number of (non-dominated) fronts it belongs to
pub fn select_program_candidate_from_pareto_front(
    fronts: &[BTreeSet<usize>],
    scores: &[f64],
    rng: &mut StdRng,
) -> Result<usize, Error> {
    let mut frequencies: BTreeMap<usize, usize> = BTreeMap::new();
    for front in remove_dominated_programs(fronts, scores) {
        for program in front {
            *frequencies.entry(program).or_default() += 1;
        }
    }
    if frequencies.is_empty() {
        return Err(Error::new(ErrorDetails::InternalError {
            message: "Cannot sample from an empty Pareto front".to_string(),
        }));
    }

    let items: Vec<(usize, usize)> = frequencies.into_iter().collect();
    items
        .choose_weighted(rng, |&(_, count)| count)
        .map(|&(program, _)| program)
        .map_err(|e| {
            Error::new(ErrorDetails::InternalError {
                message: format!("Weighted sampling failed: {e}"),
            })
        })
}

/// Chooses which existing candidate a proposer should build on
pub trait CandidateSelector: Send {
    fn select_candidate_idx(&mut self, state: &GepaState) -> Result<usize, Error>;
}

/// Samples a parent from the per-instance Pareto fronts, weighted by front membership
#[derive(Debug)]
pub struct ParetoCandidateSelector {
    rng: StdRng,
}

impl ParetoCandidateSelector {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl CandidateSelector for ParetoCandidateSelector {
    fn select_candidate_idx(&mut self, state: &GepaState) -> Result<usize, Error> {
        select_program_candidate_from_pareto_front(
            state.program_at_pareto_front_valset(),
            state.per_program_tracked_scores(),
            &mut self.rng,
        )
    }
}

/// Always picks the candidate with the best aggregate score
#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentBestCandidateSelector;

impl CandidateSelector for CurrentBestCandidateSelector {
    fn select_candidate_idx(&mut self, state: &GepaState) -> Result<usize, Error> {
        Ok(state.best_program_idx())
    }
}
