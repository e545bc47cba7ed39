use anyhow::{Context, Result};
use mlpsca::{
    config::AttackConfig,
    distinguishers::cpa::correlate,
    guessing_entropy::guessing_entropy,
    hypothesis::operand_hypotheses,
    ranking::Ranking,
    simulator::{reverse_chunks, simulate_batch},
    util::save_array,
};
use ndarray::{Array1, Array2, Array3, Axis};
use ndarray_npy::read_npy;
use ndarray_rand::{
    RandomExt,
    rand::{SeedableRng, rngs::StdRng},
    rand_distr::{Normal, Uniform},
};
use std::{env, path::PathBuf};

const NUM_TRACES: usize = 2000;
const NUM_OPERANDS: usize = 32;
const ATTACKED_OPERANDS: usize = 8;

/// Noisy Hamming weight of every running accumulation of one neuron.
fn synthesize(config: &AttackConfig) -> Result<(Array2<f64>, Array2<u32>, Array2<u32>)> {
    let mut rng = StdRng::seed_from_u64(0);

    let inputs = Array2::random_using((NUM_TRACES, NUM_OPERANDS), Uniform::new(0u32, 256), &mut rng);
    let weights = Array2::random_using((1, NUM_OPERANDS), Uniform::new_inclusive(1u32, 127), &mut rng);

    let activations = simulate_batch(inputs.view(), weights.view().insert_axis(Axis(0)), config)?;
    let leakages = activations
        .accumulation_leakages()
        .index_axis_move(Axis(1), 0)
        .mapv(f64::from);
    let noise = Array2::random_using(leakages.dim(), Normal::new(0.0, 1.0)?, &mut rng);

    Ok((leakages + noise, inputs, weights))
}

fn load(dir: PathBuf) -> Result<(Array2<f64>, Array2<u32>, Array2<u32>)> {
    let traces = read_npy(dir.join("traces.npy")).context("Failed to read traces.npy")?;
    let inputs = read_npy(dir.join("inputs.npy")).context("Failed to read inputs.npy")?;
    let weights = read_npy(dir.join("weights.npy")).context("Failed to read weights.npy")?;

    Ok((traces, inputs, weights))
}

fn main() -> Result<()> {
    let config = AttackConfig {
        checkpoint_interval: 250,
        ..Default::default()
    };

    let (traces, inputs, weights) = match env::var("TRACES_DIR") {
        Ok(dir) => load(PathBuf::from(dir))?,
        Err(_) => synthesize(&config)?,
    };
    let expected = reverse_chunks(&weights.row(0).to_vec(), config.num_chunks)?;

    // Weights recovered so far, in fetch order
    let mut recovered = vec![0u32; inputs.ncols()];
    let mut curves = Vec::with_capacity(ATTACKED_OPERANDS);
    for operand in 0..ATTACKED_OPERANDS {
        let guess_weights = Array3::from_shape_vec(
            (1, 1, recovered.len()),
            reverse_chunks(&recovered, config.num_chunks)?,
        )?;
        let activations = simulate_batch(inputs.view(), guess_weights.view(), &config)?;
        let hypotheses = operand_hypotheses(&activations, 0, operand, &config)?;

        let snapshots = correlate(traces.view(), hypotheses.view(), config.checkpoint_interval)?;
        let last = snapshots.last().context("Not enough traces for a checkpoint")?;
        recovered[operand] = config.candidates.value(last.best_guess())?;

        let ranking = Ranking::new(&snapshots)?;
        let true_rank = ranking.true_rank_trajectory(config.candidates.id(expected[operand])?)?;
        let ge = guessing_entropy(&[true_rank])?;
        println!(
            "operand {operand}: expected {}, recovered {}, guessing entropy {:.2}",
            expected[operand],
            recovered[operand],
            ge.last().copied().unwrap_or_default()
        );
        curves.push(ge);
    }

    let curves = ndarray::stack(
        Axis(0),
        &curves.iter().map(Array1::view).collect::<Vec<_>>(),
    )?;
    save_array("guessing-entropy.npy", &curves)?;

    Ok(())
}
