//! Candidate ranking by correlation magnitude.
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3, Axis, s};
use rayon::prelude::*;

use crate::{Error, distinguishers::cpa::Correlation, util::argsort_by};

/// Order the candidates of a sample by descending magnitude.
///
/// Returned identifiers are 1-indexed. Equal magnitudes keep their first-occurrence order.
pub fn order_candidates(magnitudes: ArrayView1<f64>) -> Array1<usize> {
    let magnitudes = magnitudes.to_vec();

    argsort_by(&magnitudes, |a, b| b.total_cmp(a))
        .into_iter()
        .map(|i| i + 1)
        .collect()
}

/// Order the candidates of every sample of a snapshot, shape `(num_samples, num_candidates)`.
pub fn rank(correlation: &Correlation) -> Array2<usize> {
    let magnitudes = correlation.magnitudes();

    let mut orders = Array2::zeros(magnitudes.dim());
    for (mut order, row) in orders.rows_mut().into_iter().zip(magnitudes.rows()) {
        order.assign(&order_candidates(row));
    }

    orders
}

/// Return the 1-indexed position of `candidate` in an ordered candidate list.
pub fn extract_true_rank(order: ArrayView1<usize>, candidate: usize) -> Result<usize, Error> {
    order
        .iter()
        .position(|&c| c == candidate)
        .map(|p| p + 1)
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "candidate {candidate} outside 1..={}",
                order.len()
            ))
        })
}

/// Candidate orderings of a correlation trajectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranking {
    /// 1-indexed candidate ids, shape `(num_checkpoints, num_samples, num_candidates)`
    orders: Array3<usize>,
    /// Number of traces at each checkpoint
    num_traces: Vec<usize>,
}

impl Ranking {
    /// Rank every snapshot of a trajectory. Snapshots must share the same shape.
    pub fn new(snapshots: &[Correlation]) -> Result<Self, Error> {
        let (num_samples, num_candidates) = snapshots
            .first()
            .map_or((0, 0), |s| (s.num_samples(), s.num_candidates()));
        for snapshot in snapshots {
            Error::shape("snapshot samples", num_samples, snapshot.num_samples())?;
            Error::shape("snapshot candidates", num_candidates, snapshot.num_candidates())?;
        }

        let mut orders = Array3::zeros((snapshots.len(), num_samples, num_candidates));
        orders
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(snapshots.par_iter())
            .for_each(|(mut orders, snapshot)| orders.assign(&rank(snapshot)));

        Ok(Self {
            orders,
            num_traces: snapshots.iter().map(Correlation::num_traces).collect(),
        })
    }

    pub fn orders(&self) -> ArrayView3<'_, usize> {
        self.orders.view()
    }

    pub fn num_checkpoints(&self) -> usize {
        self.orders.shape()[0]
    }

    pub fn num_samples(&self) -> usize {
        self.orders.shape()[1]
    }

    pub fn num_candidates(&self) -> usize {
        self.orders.shape()[2]
    }

    /// Number of traces behind each checkpoint.
    pub fn num_traces(&self) -> &[usize] {
        &self.num_traces
    }

    /// Position of `candidate` at a given checkpoint and sample.
    pub fn true_rank(&self, checkpoint: usize, sample: usize, candidate: usize) -> Result<usize, Error> {
        if checkpoint >= self.num_checkpoints() || sample >= self.num_samples() {
            return Err(Error::InvalidConfig(format!(
                "cell ({checkpoint}, {sample}) outside {} checkpoints and {} samples",
                self.num_checkpoints(),
                self.num_samples()
            )));
        }

        extract_true_rank(self.orders.slice(s![checkpoint, sample, ..]), candidate)
    }

    /// Best position of `candidate` over the sample window, per checkpoint.
    pub fn true_rank_trajectory(&self, candidate: usize) -> Result<Array1<usize>, Error> {
        if self.num_samples() == 0 && self.num_checkpoints() > 0 {
            return Err(Error::InvalidConfig("empty sample window".into()));
        }

        (0..self.num_checkpoints())
            .map(|checkpoint| {
                (0..self.num_samples())
                    .map(|sample| self.true_rank(checkpoint, sample, candidate))
                    .try_fold(usize::MAX, |best, rank| rank.map(|rank| best.min(rank)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Array1::from)
    }

    /// Position of every candidate, same shape as [`Ranking::orders`].
    ///
    /// Cell `(checkpoint, sample, candidate - 1)` holds the 1-indexed rank of `candidate`.
    pub fn candidate_ranks(&self) -> Array3<usize> {
        let mut ranks = Array3::zeros(self.orders.dim());
        for (mut ranks, order) in ranks
            .lanes_mut(Axis(2))
            .into_iter()
            .zip(self.orders.lanes(Axis(2)))
        {
            for (position, &candidate) in order.iter().enumerate() {
                ranks[candidate - 1] = position + 1;
            }
        }

        ranks
    }
}
