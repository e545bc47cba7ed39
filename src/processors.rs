//! Traces processing algorithms
use ndarray::{Array1, ArrayView1, Zip};
use num_traits::AsPrimitive;
use serde::{Deserialize, Serialize};
use std::ops::Add;

use crate::Sample;

/// Processes traces to calculate mean and variance in a single pass.
///
/// It implements Welford's online update, and merges partial results with Chan's pairwise
/// formula so that processors fed with disjoint trace batches can be summed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeanVar {
    /// Running mean of traces
    mean: Array1<f64>,
    /// Running sum of squared deviations from the mean
    m2: Array1<f64>,
    /// Number of traces processed
    count: usize,
}

impl MeanVar {
    /// Creates a new mean and variance processor.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of samples per trace
    pub fn new(size: usize) -> Self {
        Self {
            mean: Array1::zeros(size),
            m2: Array1::zeros(size),
            count: 0,
        }
    }

    /// Processes an input trace to update internal accumulators.
    ///
    /// # Panics
    /// Panics in debug if the length of the trace is different form the size of [`MeanVar`].
    pub fn process<T: Sample>(&mut self, trace: ArrayView1<T>) {
        debug_assert!(trace.len() == self.size());

        self.count += 1;
        let n = self.count as f64;

        Zip::from(&mut self.mean)
            .and(&mut self.m2)
            .and(trace)
            .for_each(|mean, m2, &x| {
                let x: f64 = x.as_();
                let delta = x - *mean;
                *mean += delta / n;
                *m2 += delta * (x - *mean);
            });
    }

    /// Returns trace mean.
    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }

    /// Returns the sum of squared deviations from the mean.
    pub fn m2(&self) -> ArrayView1<'_, f64> {
        self.m2.view()
    }

    /// Calculates and returns traces population variance.
    pub fn var(&self) -> Array1<f64> {
        let count = self.count as f64;

        self.m2.mapv(|m2| m2 / count)
    }

    /// Returns the trace size handled.
    pub fn size(&self) -> usize {
        self.mean.len()
    }

    /// Returns the number of traces processed.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Determine if two [`MeanVar`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.size() == other.size()
    }
}

impl Add for MeanVar {
    type Output = Self;

    /// Merge computations of two [`MeanVar`]. Processors need to be compatible to be merged
    /// together, otherwise it can panic or yield incoherent result (see
    /// [`MeanVar::is_compatible_with`]).
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        if self.count == 0 {
            return rhs;
        }
        if rhs.count == 0 {
            return self;
        }

        let count = self.count + rhs.count;
        let (na, nb) = (self.count as f64, rhs.count as f64);
        let n = count as f64;

        let delta = &rhs.mean - &self.mean;
        let mean = &self.mean + &(&delta * (nb / n));
        let m2 = self.m2 + rhs.m2 + delta.mapv(|d| d * d * na * nb / n);

        Self { mean, m2, count }
    }
}
