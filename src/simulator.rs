//! Simulation of the target's fixed-point multiply-accumulate sequence.
//!
//! The target fetches the operands of a neuron in reversed chunks: the operand vector is split
//! into `num_chunks` equal chunks and each chunk is walked backwards. Every simulated quantity is
//! expressed in that fetch order.
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis, s};
use rayon::prelude::*;

use crate::{
    Error,
    config::AttackConfig,
    leakage_model::{Register, hw},
};

/// Split `values` into `num_chunks` equal chunks, reverse each chunk and concatenate them.
///
/// Applying it twice returns the original order.
pub fn reverse_chunks<T: Copy>(values: &[T], num_chunks: usize) -> Result<Vec<T>, Error> {
    if num_chunks == 0 || values.len() % num_chunks != 0 {
        return Err(Error::InvalidConfig(format!(
            "cannot split {} operands into {num_chunks} equal chunks",
            values.len()
        )));
    }

    Ok(values
        .chunks(values.len() / num_chunks)
        .flat_map(|chunk| chunk.iter().rev().copied())
        .collect())
}

/// One neuron activation, in fetch order.
#[derive(Debug, Clone, PartialEq)]
pub struct Neuron {
    /// Inputs in fetch order
    inputs: Array1<u32>,
    /// Weights in fetch order
    weights: Array1<u32>,
    /// `inputs[k] * weights[k]`
    products: Array1<u64>,
    /// Running accumulation after each operation
    prefix_accumulations: Array1<u64>,
    /// Sum of the first `accumulation_terms` products
    final_accumulation: u64,
}

impl Neuron {
    pub fn inputs(&self) -> ArrayView1<'_, u32> {
        self.inputs.view()
    }

    pub fn weights(&self) -> ArrayView1<'_, u32> {
        self.weights.view()
    }

    pub fn products(&self) -> ArrayView1<'_, u64> {
        self.products.view()
    }

    /// `prefix_accumulations()[k]` is the accumulator value once operation `k` is done.
    pub fn prefix_accumulations(&self) -> ArrayView1<'_, u64> {
        self.prefix_accumulations.view()
    }

    pub fn final_accumulation(&self) -> u64 {
        self.final_accumulation
    }

    /// Number of operations of the neuron.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Expected neuron output: the full accumulation plus `bias`, in 64-bit arithmetic.
    pub fn output(&self, bias: u64) -> u64 {
        self.prefix_accumulations
            .last()
            .copied()
            .unwrap_or(0)
            .wrapping_add(bias)
    }
}

/// Simulate one neuron activation.
///
/// `inputs` and `weights` are given in memory order; they are reordered to the fetch order before
/// the multiply-accumulate chain is evaluated in `config.accumulator_bits` width.
pub fn simulate(
    inputs: ArrayView1<u32>,
    weights: ArrayView1<u32>,
    config: &AttackConfig,
) -> Result<Neuron, Error> {
    Error::shape("neuron weights", inputs.len(), weights.len())?;

    let inputs = Array1::from_vec(reverse_chunks(&inputs.to_vec(), config.num_chunks)?);
    let weights = Array1::from_vec(reverse_chunks(&weights.to_vec(), config.num_chunks)?);

    Ok(accumulate(inputs, weights, config))
}

/// Simulate one neuron activation where skipped operations contribute nothing.
///
/// `executed` flags each operation in memory order, like `weights`. Weights of skipped operations
/// are zeroed before the reordering, as [`masked_weights`] does for a batch.
pub fn simulate_masked(
    inputs: ArrayView1<u32>,
    weights: ArrayView1<u32>,
    executed: &[bool],
    config: &AttackConfig,
) -> Result<Neuron, Error> {
    Error::shape("execution mask", weights.len(), executed.len())?;

    let weights: Array1<u32> = weights
        .iter()
        .zip(executed)
        .map(|(&weight, &executed)| if executed { weight } else { 0 })
        .collect();

    simulate(inputs, weights.view(), config)
}

fn accumulate(inputs: Array1<u32>, weights: Array1<u32>, config: &AttackConfig) -> Neuron {
    let register = Register::new(config.accumulator_bits);

    let products: Array1<u64> = inputs
        .iter()
        .zip(&weights)
        .map(|(&i, &w)| register.mul(i as u64, w as u64))
        .collect();

    let mut acc: u64 = 0;
    let prefix_accumulations = products
        .iter()
        .map(|&p| {
            acc = register.wrap(acc.wrapping_add(p));
            acc
        })
        .collect();

    let terms = config.accumulation_terms.min(products.len());
    let final_accumulation = products
        .slice(s![..terms])
        .iter()
        .fold(0, |acc: u64, &p| register.wrap(acc.wrapping_add(p)));

    Neuron {
        inputs,
        weights,
        products,
        prefix_accumulations,
        final_accumulation,
    }
}

/// Neuron activations of a trace batch, `neurons[trace][neuron]`.
#[derive(Debug, Clone)]
pub struct Activations {
    neurons: Vec<Vec<Neuron>>,
}

impl Activations {
    pub fn num_traces(&self) -> usize {
        self.neurons.len()
    }

    pub fn num_neurons(&self) -> usize {
        self.neurons.first().map_or(0, Vec::len)
    }

    pub fn neuron(&self, trace: usize, neuron: usize) -> Option<&Neuron> {
        self.neurons.get(trace)?.get(neuron)
    }

    /// Raw running accumulations, shape `(num_traces, num_neurons, num_operands)`.
    pub fn prefix_accumulations(&self) -> Array3<u64> {
        self.gather(|neuron| neuron.prefix_accumulations())
    }

    /// Hamming weight of every product, shape `(num_traces, num_neurons, num_operands)`.
    pub fn product_leakages(&self) -> Array3<u32> {
        self.gather(|neuron| neuron.products()).mapv(hw::<u64>)
    }

    /// Hamming weight of every running accumulation, shape
    /// `(num_traces, num_neurons, num_operands)`.
    pub fn accumulation_leakages(&self) -> Array3<u32> {
        self.prefix_accumulations().mapv(hw::<u64>)
    }

    /// Hamming weight of the final accumulation, shape `(num_traces, num_neurons)`.
    pub fn final_leakages(&self) -> Array2<u32> {
        Array2::from_shape_fn((self.num_traces(), self.num_neurons()), |(t, n)| {
            hw(self.neurons[t][n].final_accumulation())
        })
    }

    /// Accumulator value before `operand` of `neuron` and the input it is multiplied with, for
    /// every trace.
    pub fn operand_context(
        &self,
        neuron: usize,
        operand: usize,
    ) -> Result<(Array1<u64>, Array1<u32>), Error> {
        if neuron >= self.num_neurons() {
            return Err(Error::InvalidConfig(format!(
                "neuron {neuron} outside 0..{}",
                self.num_neurons()
            )));
        }

        let mut prior = Array1::zeros(self.num_traces());
        let mut inputs = Array1::zeros(self.num_traces());
        for (t, neurons) in self.neurons.iter().enumerate() {
            let activation = &neurons[neuron];
            if operand >= activation.len() {
                return Err(Error::InvalidConfig(format!(
                    "operand {operand} outside 0..{}",
                    activation.len()
                )));
            }
            if operand > 0 {
                prior[t] = activation.prefix_accumulations[operand - 1];
            }
            inputs[t] = activation.inputs[operand];
        }

        Ok((prior, inputs))
    }

    fn gather<'a, F>(&'a self, field: F) -> Array3<u64>
    where
        F: Fn(&'a Neuron) -> ArrayView1<'a, u64>,
    {
        let num_operands = self
            .neurons
            .first()
            .and_then(|neurons| neurons.first())
            .map_or(0, Neuron::len);

        let mut array = Array3::zeros((self.num_traces(), self.num_neurons(), num_operands));
        for (t, neurons) in self.neurons.iter().enumerate() {
            for (n, neuron) in neurons.iter().enumerate() {
                array.slice_mut(s![t, n, ..]).assign(&field(neuron));
            }
        }

        array
    }
}

/// Simulate every neuron for every trace.
///
/// `inputs` has shape `(num_traces, num_operands)` and `weights` has shape
/// `(num_weight_sets, num_neurons, num_operands)`, where `num_weight_sets` is either 1 (the same
/// weights for every trace) or `num_traces` (one weight set per trace, e.g. masked weights).
pub fn simulate_batch(
    inputs: ArrayView2<u32>,
    weights: ArrayView3<u32>,
    config: &AttackConfig,
) -> Result<Activations, Error> {
    let num_traces = inputs.shape()[0];
    Error::shape("weight operands", inputs.shape()[1], weights.shape()[2])?;
    if weights.shape()[0] != 1 {
        Error::shape("weight sets", num_traces, weights.shape()[0])?;
    }

    let neurons = (0..num_traces)
        .into_par_iter()
        .map(|t| {
            let set = if weights.shape()[0] == 1 { 0 } else { t };
            weights
                .index_axis(Axis(0), set)
                .rows()
                .into_iter()
                .map(|neuron_weights| simulate(inputs.row(t), neuron_weights, config))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Activations { neurons })
}

/// Zero the weights of skipped operations, per trace.
///
/// `weights` has shape `(num_neurons, num_operands)` in memory order and `masks` has shape
/// `(num_traces, num_neurons * num_operands)` in memory order. Returns the per-trace weight sets
/// accepted by [`simulate_batch`].
pub fn masked_weights(
    weights: ArrayView2<u32>,
    masks: ArrayView2<bool>,
) -> Result<Array3<u32>, Error> {
    let (num_neurons, num_operands) = weights.dim();
    Error::shape("execution masks", num_neurons * num_operands, masks.shape()[1])?;

    Ok(Array3::from_shape_fn(
        (masks.shape()[0], num_neurons, num_operands),
        |(t, n, k)| {
            if masks[[t, n * num_operands + k]] {
                weights[[n, k]]
            } else {
                0
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::{masked_weights, reverse_chunks, simulate, simulate_batch, simulate_masked};
    use crate::{config::AttackConfig, leakage_model::hw};
    use ndarray::{Array2, Array3, array};

    #[test]
    fn test_reverse_chunks() {
        let values: Vec<u32> = (0..32).collect();
        let reversed = reverse_chunks(&values, 4).unwrap();
        assert_eq!(&reversed[..8], &[7, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(&reversed[24..], &[31, 30, 29, 28, 27, 26, 25, 24]);
        assert_eq!(reverse_chunks(&reversed, 4).unwrap(), values);

        assert!(reverse_chunks(&values, 5).is_err());
        assert!(reverse_chunks(&values, 0).is_err());
    }

    #[test]
    fn test_simulate_unit_weights() {
        let config = AttackConfig::default();
        let neuron = simulate(
            array![1u32, 2, 3, 4, 5, 6, 7, 8].view(),
            array![1u32, 1, 1, 1, 1, 1, 1, 1].view(),
            &config,
        )
        .unwrap();

        assert_eq!(neuron.products(), array![2u64, 1, 4, 3, 6, 5, 8, 7]);
        assert_eq!(
            neuron.prefix_accumulations(),
            array![2u64, 3, 7, 10, 16, 21, 29, 36]
        );
        assert_eq!(neuron.final_accumulation(), 36);
        assert_eq!(hw(neuron.final_accumulation()), 2);
        assert_eq!(neuron.output(4), 40);
    }

    #[test]
    fn test_final_accumulation_uses_first_terms() {
        let config = AttackConfig::default();
        let inputs: Vec<u32> = (1..=16).collect();
        let weights = vec![2u32; 16];
        let neuron = simulate(
            ndarray::ArrayView1::from(&inputs),
            ndarray::ArrayView1::from(&weights),
            &config,
        )
        .unwrap();

        // First two chunks in fetch order are [4, 3, 2, 1] and [8, 7, 6, 5].
        assert_eq!(neuron.final_accumulation(), 2 * 36);
        assert_eq!(neuron.prefix_accumulations()[15], 2 * 136);
    }

    #[test]
    fn test_simulate_wraps() {
        let config = AttackConfig {
            accumulator_bits: 8,
            ..Default::default()
        };
        let neuron = simulate(
            array![16u32, 16, 1, 1].view(),
            array![16u32, 1, 1, 1].view(),
            &config,
        )
        .unwrap();

        // Single-operand chunks keep the memory order; 16 * 16 wraps to 0.
        assert_eq!(neuron.products(), array![0u64, 16, 1, 1]);
        assert_eq!(neuron.prefix_accumulations(), array![0u64, 16, 17, 18]);
    }

    #[test]
    fn test_simulate_masked() {
        let config = AttackConfig::default();
        let neuron = simulate_masked(
            array![1u32, 2, 3, 4, 5, 6, 7, 8].view(),
            array![1u32, 1, 1, 1, 1, 1, 1, 1].view(),
            &[false, true, true, true, true, true, true, false],
            &config,
        )
        .unwrap();

        // Operation 0 is fetched second and operation 7 second to last.
        assert_eq!(neuron.weights(), array![1u32, 0, 1, 1, 1, 1, 0, 1]);
        assert_eq!(neuron.products(), array![2u64, 0, 4, 3, 6, 5, 0, 7]);
        assert_eq!(neuron.final_accumulation(), 27);

        assert!(simulate_masked(
            array![1u32, 2].view(),
            array![1u32, 1].view(),
            &[true],
            &config
        )
        .is_err());
    }

    #[test]
    fn test_simulate_masked_matches_masked_weights() {
        let config = AttackConfig::default();
        let inputs = array![[1u32, 2, 3, 4, 5, 6, 7, 8]];
        let weights = array![[3u32, 1, 4, 1, 5, 9, 2, 6]];
        let mask = [false, true, true, false, true, true, true, true];

        let masks = Array2::from_shape_vec((1, 8), mask.to_vec()).unwrap();
        let batch = simulate_batch(
            inputs.view(),
            masked_weights(weights.view(), masks.view())
                .unwrap()
                .view(),
            &config,
        )
        .unwrap();
        let single = simulate_masked(inputs.row(0), weights.row(0), &mask, &config).unwrap();

        assert_eq!(batch.neuron(0, 0).unwrap(), &single);
        assert_eq!(single.weights(), array![1u32, 0, 0, 4, 9, 5, 6, 2]);
    }

    #[test]
    fn test_simulate_length_mismatch() {
        let config = AttackConfig::default();
        assert!(simulate(array![1u32, 2, 3, 4].view(), array![1u32, 2].view(), &config).is_err());
    }

    #[test]
    fn test_simulate_batch() {
        let config = AttackConfig::default();
        let inputs = array![[1u32, 2, 3, 4, 5, 6, 7, 8], [8, 7, 6, 5, 4, 3, 2, 1]];
        let weights = Array3::from_shape_fn((1, 2, 8), |(_, n, _)| n as u32 + 1);

        let activations = simulate_batch(inputs.view(), weights.view(), &config).unwrap();
        assert_eq!(activations.num_traces(), 2);
        assert_eq!(activations.num_neurons(), 2);

        let prefix = activations.prefix_accumulations();
        assert_eq!(prefix.shape(), &[2, 2, 8]);
        assert_eq!(prefix[[0, 0, 7]], 36);
        assert_eq!(prefix[[1, 1, 7]], 72);
        assert_eq!(activations.final_leakages(), array![[2u32, 2], [2, 2]]);
        assert_eq!(activations.product_leakages()[[0, 1, 0]], hw(4u64));

        let (prior, inputs) = activations.operand_context(0, 1).unwrap();
        assert_eq!(prior, array![2u64, 7]);
        assert_eq!(inputs, array![1u32, 8]);

        let (prior, _) = activations.operand_context(0, 0).unwrap();
        assert_eq!(prior, array![0u64, 0]);
        assert!(activations.operand_context(2, 0).is_err());
        assert!(activations.operand_context(0, 8).is_err());
    }

    #[test]
    fn test_masked_weights() {
        let weights = array![[3u32, 5], [7, 9]];
        let masks = array![[true, false, true, true], [false, true, false, false]];
        let masked = masked_weights(weights.view(), masks.view()).unwrap();

        assert_eq!(masked.shape(), &[2, 2, 2]);
        assert_eq!(masked.index_axis(ndarray::Axis(0), 0), array![[3u32, 0], [7, 9]]);
        assert_eq!(masked.index_axis(ndarray::Axis(0), 1), array![[0u32, 5], [0, 0]]);
    }
}
