//! Minibatch sampling for subsample gates
//!
//! Proposers evaluate candidates on small minibatches of the training set before the engine
//! spends a full validation evaluation. `EpochShuffledBatchSampler` walks a seeded shuffle of
//! the training ids, reshuffling at every epoch boundary, so each id is visited once per epoch
//! and runs with the same seed see the same minibatches.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::error::{Error, ErrorDetails};

#[derive(Debug)]
pub struct EpochShuffledBatchSampler {
    minibatch_size: usize,
    rng: StdRng,
    shuffled_ids: Vec<usize>,
    epoch: Option<usize>,
    trainset_size: usize,
}

impl EpochShuffledBatchSampler {
    pub fn new(minibatch_size: usize, seed: u64) -> Result<Self, Error> {
        if minibatch_size == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "minibatch size must be greater than 0".to_string(),
            }));
        }
        Ok(Self {
            minibatch_size,
            rng: StdRng::seed_from_u64(seed),
            shuffled_ids: Vec::new(),
            epoch: None,
            trainset_size: 0,
        })
    }

    pub fn minibatch_size(&self) -> usize {
        self.minibatch_size
    }

    /// Indices into a training set of `trainset_size` items for iteration `iteration`
    ///
    /// The shuffled order is padded with its first ids up to a multiple of the minibatch size,
    /// so every minibatch is full. Minibatches larger than the training set are clamped.
    pub fn next_minibatch_indices(
        &mut self,
        trainset_size: usize,
        iteration: usize,
    ) -> Result<Vec<usize>, Error> {
        if trainset_size == 0 {
            return Err(Error::new(ErrorDetails::InternalError {
                message: "Cannot sample a minibatch from an empty training set".to_string(),
            }));
        }
        let batch_size = self.minibatch_size.min(trainset_size);
        let padded_len = trainset_size.div_ceil(batch_size) * batch_size;

        let position = iteration * batch_size;
        let epoch = position / padded_len;
        if self.epoch != Some(epoch) || self.trainset_size != trainset_size {
            self.reshuffle(trainset_size, padded_len);
            self.epoch = Some(epoch);
        }

        let start = position % padded_len;
        Ok(self.shuffled_ids[start..start + batch_size].to_vec())
    }

    fn reshuffle(&mut self, trainset_size: usize, padded_len: usize) {
        let mut ids: Vec<usize> = (0..trainset_size).collect();
        ids.shuffle(&mut self.rng);
        let padding: Vec<usize> = ids.iter().copied().take(padded_len - trainset_size).collect();
        ids.extend(padding);
        tracing::debug!(
            trainset_size,
            padded_len,
            "Reshuffled training ids for a new epoch"
        );
        self.shuffled_ids = ids;
        self.trainset_size = trainset_size;
    }
}
