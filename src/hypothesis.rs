//! Weight candidates and accumulator leakage hypotheses.
use ndarray::{Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    Error,
    config::AttackConfig,
    leakage_model::{Register, hw},
    simulator::Activations,
};

/// The enumerable range of a secret weight, `first..=last`.
///
/// Candidates are identified by a 1-indexed id: id `1` is `first`, id `len()` is `last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSpace {
    pub first: u32,
    pub last: u32,
}

impl Default for CandidateSpace {
    /// Non-zero 7-bit magnitudes.
    fn default() -> Self {
        Self { first: 1, last: 127 }
    }
}

impl CandidateSpace {
    pub fn new(first: u32, last: u32) -> Result<Self, Error> {
        let space = Self { first, last };
        space.validate()?;

        Ok(space)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.first > self.last {
            return Err(Error::InvalidConfig(format!(
                "empty candidate range {}..={}",
                self.first, self.last
            )));
        }

        Ok(())
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.first > self.last
    }

    /// Weight value of the candidate `id`.
    pub fn value(&self, id: usize) -> Result<u32, Error> {
        if id == 0 || id > self.len() {
            return Err(Error::InvalidConfig(format!(
                "candidate id {id} outside 1..={}",
                self.len()
            )));
        }

        Ok(self.first + (id - 1) as u32)
    }

    /// Candidate id of the weight `value`.
    pub fn id(&self, value: u32) -> Result<usize, Error> {
        if !(self.first..=self.last).contains(&value) {
            return Err(Error::InvalidConfig(format!(
                "weight {value} outside {}..={}",
                self.first, self.last
            )));
        }

        Ok((value - self.first) as usize + 1)
    }

    /// Candidate weight values, in id order.
    pub fn values(&self) -> impl Iterator<Item = u32> {
        self.first..=self.last
    }
}

/// Compute the leakage hypothesis of every candidate for an accumulation step.
///
/// For each trace `t` and candidate weight `w`, the hypothesis is
/// `leakage_model(prior[t] + inputs[t] * w)` computed in `register` width. The result has shape
/// `(num_traces, candidates.len())`.
pub fn accumulator_hypotheses<F>(
    prior: ArrayView1<u64>,
    inputs: ArrayView1<u32>,
    candidates: &CandidateSpace,
    register: Register,
    leakage_model: F,
) -> Result<Array2<f64>, Error>
where
    F: Fn(u64) -> u32 + Sync,
{
    Error::shape("accumulator hypotheses inputs", prior.len(), inputs.len())?;
    candidates.validate()?;

    let mut hypotheses = Array2::zeros((prior.len(), candidates.len()));
    hypotheses
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(trace, mut row)| {
            for (hypothesis, weight) in row.iter_mut().zip(candidates.values()) {
                let value = register.mac(prior[trace], inputs[trace] as u64, weight as u64);
                *hypothesis = leakage_model(value) as f64;
            }
        });

    Ok(hypotheses)
}

/// Hamming-weight hypotheses on the accumulator after `operand` of `neuron`.
///
/// `operand` is a position in the fetch order. The prior accumulation is the simulated running sum
/// of the preceding operands, which must have been simulated with the already recovered weights.
pub fn operand_hypotheses(
    activations: &Activations,
    neuron: usize,
    operand: usize,
    config: &AttackConfig,
) -> Result<Array2<f64>, Error> {
    let (prior, inputs) = activations.operand_context(neuron, operand)?;

    accumulator_hypotheses(
        prior.view(),
        inputs.view(),
        &config.candidates,
        Register::new(config.accumulator_bits),
        hw::<u64>,
    )
}
