//! Guessing entropy of the correct candidate over repeated experiments.
use ndarray::{Array, Array1, ArrayView, ArrayView1, Dimension, Zip};
use serde::{Deserialize, Serialize};
use std::ops::Add;

use crate::Error;

/// Accumulates true-rank trajectories of independent experiments.
///
/// Experiments may stop at different checkpoints: each checkpoint averages only the experiments
/// that reached it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuessingEntropy {
    /// Sum of `log2(rank)` per checkpoint
    log_rank_sums: Vec<f64>,
    /// Number of experiments per checkpoint
    counts: Vec<usize>,
}

impl GuessingEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in the 1-indexed true-rank trajectory of one experiment.
    pub fn process(&mut self, ranks: ArrayView1<usize>) -> Result<(), Error> {
        if let Some(checkpoint) = ranks.iter().position(|&rank| rank == 0) {
            return Err(Error::InvalidConfig(format!(
                "rank 0 at checkpoint {checkpoint}, ranks are 1-indexed"
            )));
        }

        if ranks.len() > self.counts.len() {
            self.log_rank_sums.resize(ranks.len(), 0.0);
            self.counts.resize(ranks.len(), 0);
        }

        for (i, &rank) in ranks.iter().enumerate() {
            self.log_rank_sums[i] += (rank as f64).log2();
            self.counts[i] += 1;
        }

        Ok(())
    }

    /// Mean `log2(rank)` per checkpoint.
    pub fn guessing_entropy(&self) -> Array1<f64> {
        self.log_rank_sums
            .iter()
            .zip(&self.counts)
            .map(|(&sum, &count)| sum / count as f64)
            .collect()
    }

    /// Number of experiments behind each checkpoint.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn num_checkpoints(&self) -> usize {
        self.counts.len()
    }
}

impl Add for GuessingEntropy {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        let (mut long, short) = if self.counts.len() >= rhs.counts.len() {
            (self, rhs)
        } else {
            (rhs, self)
        };

        for (i, (sum, count)) in short.log_rank_sums.into_iter().zip(short.counts).enumerate() {
            long.log_rank_sums[i] += sum;
            long.counts[i] += count;
        }

        long
    }
}

/// Compute the guessing-entropy curve of a set of true-rank trajectories.
pub fn guessing_entropy(trajectories: &[Array1<usize>]) -> Result<Array1<f64>, Error> {
    let mut ge = GuessingEntropy::new();
    for trajectory in trajectories {
        ge.process(trajectory.view())?;
    }

    Ok(ge.guessing_entropy())
}

/// Guessing-entropy curves of traces split on the execution of an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionedGuessingEntropy {
    /// Curve over traces where the operation was executed
    pub executed: Array1<f64>,
    /// Curve over traces where the operation was skipped
    pub skipped: Array1<f64>,
}

impl PartitionedGuessingEntropy {
    pub fn new(executed: &[Array1<usize>], skipped: &[Array1<usize>]) -> Result<Self, Error> {
        Ok(Self {
            executed: guessing_entropy(executed)?,
            skipped: guessing_entropy(skipped)?,
        })
    }
}

/// Mean `log2(rank)` of every candidate over experiments.
///
/// Each experiment holds the 1-indexed rank of every candidate (see
/// [`crate::ranking::Ranking::candidate_ranks`]); all experiments must share the same shape.
pub fn candidate_guessing_entropy<D: Dimension>(
    experiments: &[ArrayView<usize, D>],
) -> Result<Array<f64, D>, Error> {
    let Some(first) = experiments.first() else {
        return Err(Error::InvalidConfig("no experiment to average".into()));
    };

    let mut sums = Array::<f64, D>::zeros(first.raw_dim());
    for experiment in experiments {
        if experiment.shape() != first.shape() {
            return Err(Error::InvalidConfig(format!(
                "experiment shape {:?} differs from {:?}",
                experiment.shape(),
                first.shape()
            )));
        }
        if experiment.iter().any(|&rank| rank == 0) {
            return Err(Error::InvalidConfig("rank 0, ranks are 1-indexed".into()));
        }

        Zip::from(&mut sums)
            .and(experiment)
            .for_each(|sum, &rank| *sum += (rank as f64).log2());
    }

    let count = experiments.len() as f64;
    Ok(sums.mapv(|sum| sum / count))
}

/// Element-wise mean of equally shaped correlation matrices from repeated experiments.
pub fn mean_correlation<D: Dimension>(
    experiments: &[ArrayView<f64, D>],
) -> Result<Array<f64, D>, Error> {
    let Some(first) = experiments.first() else {
        return Err(Error::InvalidConfig("no experiment to average".into()));
    };

    let mut sums = Array::<f64, D>::zeros(first.raw_dim());
    for experiment in experiments {
        if experiment.shape() != first.shape() {
            return Err(Error::InvalidConfig(format!(
                "experiment shape {:?} differs from {:?}",
                experiment.shape(),
                first.shape()
            )));
        }
        sums += experiment;
    }

    let count = experiments.len() as f64;
    Ok(sums.mapv(|sum| sum / count))
}
