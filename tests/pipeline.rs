use mlpsca::{
    config::{AttackConfig, ClassifierConfig},
    distinguishers::cpa::correlate,
    guessing_entropy::{PartitionedGuessingEntropy, guessing_entropy},
    hypothesis::operand_hypotheses,
    partition::{partition_by_operand, select_rows},
    pattern::{ExecutionPattern, ReferencePatterns, classify},
    ranking::Ranking,
    simulator::{Activations, masked_weights, simulate_batch},
};
use ndarray::{Array1, Array2, Axis, array, s};
use ndarray_rand::{
    RandomExt,
    rand::{SeedableRng, rngs::StdRng},
    rand_distr::Uniform,
};

const NUM_OPERANDS: usize = 32;

fn setup(seed: u64, num_traces: usize, config: &AttackConfig) -> (Activations, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let inputs = Array2::random_using((num_traces, NUM_OPERANDS), Uniform::new(0u32, 256), &mut rng);
    let weights = Array2::random_using((1, NUM_OPERANDS), Uniform::new_inclusive(1u32, 127), &mut rng);

    let activations = simulate_batch(inputs.view(), weights.view().insert_axis(Axis(0)), config).unwrap();
    let traces = activations
        .accumulation_leakages()
        .index_axis_move(Axis(1), 0)
        .mapv(f64::from);

    (activations, traces)
}

/// Rank the candidates of `operand` on noiseless traces, priors simulated with the true weights.
fn attack(seed: u64, operand: usize, config: &AttackConfig) -> (Ranking, u32) {
    let (activations, traces) = setup(seed, 400, config);
    let hypotheses = operand_hypotheses(&activations, 0, operand, config).unwrap();
    let snapshots = correlate(traces.view(), hypotheses.view(), config.checkpoint_interval).unwrap();

    let weight = activations.neuron(0, 0).unwrap().weights()[operand];
    (Ranking::new(&snapshots).unwrap(), weight)
}

#[test]
fn noiseless_attack_recovers_weights() {
    let config = AttackConfig {
        checkpoint_interval: 50,
        ..Default::default()
    };

    let trajectories: Vec<_> = (0..3)
        .map(|seed| {
            let (ranking, weight) = attack(seed, 2, &config);
            let id = config.candidates.id(weight).unwrap();
            assert_eq!(ranking.orders()[[7, 2, 0]], id);
            ranking.true_rank_trajectory(id).unwrap()
        })
        .collect();
    for trajectory in &trajectories {
        assert_eq!(trajectory.len(), 8);
        assert_eq!(trajectory[7], 1);
    }

    let ge = guessing_entropy(&trajectories).unwrap();
    assert_eq!(ge.len(), 8);
    assert_eq!(ge[7], 0.0);
    assert!(ge.iter().all(|&g| g >= 0.0));
    for (checkpoint, pair) in ge.windows(2).into_iter().enumerate() {
        assert!(
            pair[1] <= pair[0] + 1e-12,
            "guessing entropy grows after checkpoint {checkpoint}: {ge}"
        );
    }
}

#[test]
fn first_operand_is_shift_ambiguous() {
    let config = AttackConfig {
        checkpoint_interval: 100,
        ..Default::default()
    };

    // Without a prior accumulation, w and 2w have the same Hamming weights: the odd part of the
    // weight ranks first and the weight itself after its halvings.
    let (ranking, weight) = attack(7, 0, &config);
    let id = config.candidates.id(weight).unwrap();
    let odd = weight >> weight.trailing_zeros();
    assert_eq!(
        ranking.orders()[[3, 0, 0]],
        config.candidates.id(odd).unwrap()
    );
    assert_eq!(
        ranking.true_rank(3, 0, id).unwrap(),
        weight.trailing_zeros() as usize + 1
    );
}

fn reference_patterns() -> ReferencePatterns {
    ReferencePatterns::new(
        array![6.0, 6.0, 5.0, 9.0, 4.0, 6.0, 9.0, 7.0],
        array![6.0, 9.0, 4.0, 3.0, 3.0, 7.0],
        array![7.0, 7.0, 0.0, 5.0],
    )
    .unwrap()
}

/// Concatenate reference patterns following `sequence` (`I`, `E` or `S` per operation), then
/// zero-pad to `width` samples.
fn waveform(patterns: &ReferencePatterns, sequence: &str, width: usize) -> Array1<f64> {
    let mut samples = vec![0.0; 3];
    for operation in sequence.chars() {
        let pattern = match operation {
            'I' => &patterns.important,
            'E' => &patterns.executed,
            _ => &patterns.skipped,
        };
        samples.extend(pattern.iter());
    }
    samples.resize(width, 0.0);

    Array1::from(samples)
}

#[test]
fn classification_partitions_traces() {
    let patterns = reference_patterns();
    let config = ClassifierConfig {
        image_width: 4,
        image_height: 2,
        num_neurons: 1,
        ..Default::default()
    };

    // Slot 1 is executed in traces 0 and 2, skipped in traces 1 and 3.
    let sequences = ["IEISSIES", "ISISEIES", "IEISSIES", "ISISEIES"];
    let mut waveforms = Array2::zeros((4, 3 + 8 * 8 + 3));
    for (mut row, sequence) in waveforms.rows_mut().into_iter().zip(sequences) {
        row.assign(&waveform(&patterns, sequence, 3 + 8 * 8 + 3));
    }

    let classification = classify(waveforms.view(), &patterns, &config).unwrap();
    assert_eq!(
        classification.pattern().slots(),
        &[true, false, true, false, false, true, false, false]
    );
    assert!(classification.consensus.disagreeing.is_empty());

    let executed = classification.executed_bytes().unwrap();
    let partition = partition_by_operand(
        executed.view(),
        &classification.usable_traces(),
        0,
        1,
        config.operands_per_neuron(),
    )
    .unwrap();
    assert_eq!(partition.executed, vec![0, 2]);
    assert_eq!(partition.skipped, vec![1, 3]);

    let subset = select_rows(waveforms.view(), &partition.skipped).unwrap();
    assert_eq!(subset.row(0), waveforms.row(1));

    // Slots are in fetch order; weights are stored with each 8-slot group reversed.
    let masks = classification.execution_masks().unwrap();
    let weights = masked_weights(Array2::ones((1, 8)).view(), masks.view()).unwrap();
    assert_eq!(weights.slice(s![1, 0, ..]), array![0, 1, 1, 1, 0, 1, 0, 1]);

    let config = AttackConfig {
        num_chunks: 1,
        ..Default::default()
    };
    let activations = simulate_batch(Array2::ones((4, 8)).view(), weights.view(), &config).unwrap();
    let neuron = activations.neuron(1, 0).unwrap();
    assert_eq!(neuron.weights(), array![1, 0, 1, 0, 1, 1, 1, 0]);
    assert_eq!(neuron.final_accumulation(), 5);

    let ge = PartitionedGuessingEntropy::new(&[array![2, 1]], &[array![4, 4]]).unwrap();
    assert_eq!(ge.executed, array![1.0, 0.0]);
    assert_eq!(ge.skipped, array![2.0, 2.0]);
}

#[test]
fn classification_at_target_size() {
    let patterns = reference_patterns();
    let config = ClassifierConfig::default();
    let length = config.pattern_length();
    assert_eq!(length, 160);

    // Important operations are shared by every trace; the others are executed or skipped at
    // random.
    let mut rng = StdRng::seed_from_u64(11);
    let important = Array1::random_using(length, Uniform::new(0u8, 3), &mut rng).mapv(|r| r == 0);
    let sequences: Vec<String> = (0..4)
        .map(|_| {
            let executed = Array1::random_using(length, Uniform::new(0u8, 2), &mut rng);
            important
                .iter()
                .zip(&executed)
                .map(|(&important, &executed)| match (important, executed) {
                    (true, _) => 'I',
                    (false, 1) => 'E',
                    _ => 'S',
                })
                .collect()
        })
        .collect();

    let width = 3 + 8 * length + 3;
    let mut waveforms = Array2::zeros((sequences.len(), width));
    for (mut row, sequence) in waveforms.rows_mut().into_iter().zip(&sequences) {
        row.assign(&waveform(&patterns, sequence, width));
    }

    let classification = classify(waveforms.view(), &patterns, &config).unwrap();
    assert_eq!(classification.pattern().slots(), important.as_slice().unwrap());
    assert!(classification.excluded.is_empty());
    assert!(classification.consensus.disagreeing.is_empty());

    let labels = classification.label_matrix();
    for (t, sequence) in sequences.iter().enumerate() {
        let expected: Array1<u8> = sequence
            .chars()
            .map(|operation| match operation {
                'I' => 2,
                'E' => 1,
                _ => 0,
            })
            .collect();
        assert_eq!(labels.row(t), expected);
    }

    let executed = classification.executed_bytes().unwrap();
    assert_eq!(executed.dim(), (4, 20));

    // The packed table unpacks to memory-order masks; simulating the masked weights puts the
    // executed flags back in fetch order.
    let masks = classification.execution_masks().unwrap();
    let slots: Vec<bool> = labels.row(0).iter().map(|&label| label > 0).collect();
    let table = ExecutionPattern::from_slots(slots).to_bytes().unwrap();
    assert_eq!(executed.row(0).to_vec(), table);
    assert_eq!(
        masks.row(0).to_vec(),
        ExecutionPattern::from_bytes(&table).slots()
    );

    let num_neurons = config.num_neurons;
    let num_operands = config.operands_per_neuron();
    let weights = masked_weights(Array2::ones((num_neurons, num_operands)).view(), masks.view()).unwrap();
    let activations = simulate_batch(
        Array2::ones((4, num_operands)).view(),
        weights.view(),
        &AttackConfig::default(),
    )
    .unwrap();
    for (t, sequence) in sequences.iter().enumerate() {
        for n in 0..num_neurons {
            let fetched: Vec<u32> = sequence[n * num_operands..(n + 1) * num_operands]
                .chars()
                .map(|operation| u32::from(operation != 'S'))
                .collect();
            assert_eq!(activations.neuron(t, n).unwrap().weights().to_vec(), fetched);
        }
    }
}
