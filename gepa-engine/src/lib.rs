//! GEPA: a budgeted, Pareto-aware search over text-parameterized programs.
//!
//! A candidate program maps component names to instruction text. Starting from a seed, the
//! engine asks proposers for mutated or merged candidates, gates each proposal on cheap
//! subsample scores, and fully evaluates only the ones that do not regress. Every validation
//! instance keeps its own Pareto front of best candidates, and the whole search state can be
//! checkpointed to a run directory and resumed.
//!
//! The evaluator and proposers are supplied by the caller through the traits in
//! [`evaluation`] and [`proposer`].

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod json_utils;
pub mod observability;
pub mod pareto;
pub mod proposer;
pub mod result;
pub mod sample;
pub mod state;

pub use config::{GepaConfig, UninitializedGepaConfig};
pub use engine::{GepaEngine, GepaEngineParams, IterationOutcome};
pub use error::{Error, ErrorDetails};
pub use evaluation::{EvaluationBatch, Evaluator};
pub use proposer::{
    CandidateProposal, MergeProposer, MergeSchedule, ProposalTag, ProposeNewCandidate,
};
pub use result::GepaResult;
pub use state::{Candidate, GepaState};
