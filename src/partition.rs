//! Split traces on the execution of one operation.
use ndarray::{Array2, ArrayView2, Axis};

use crate::Error;

/// Trace indices split on whether an operation was executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub executed: Vec<usize>,
    pub skipped: Vec<usize>,
}

/// Split `traces` on the execution of `operand` of `neuron`.
///
/// `executed_bytes` holds the packed executed-operation slots of every trace (see
/// [`crate::pattern::Classification::executed_bytes`]). `operand` is a position in the fetch order.
pub fn partition_by_operand(
    executed_bytes: ArrayView2<u8>,
    traces: &[usize],
    neuron: usize,
    operand: usize,
    operands_per_neuron: usize,
) -> Result<Partition, Error> {
    if operand >= operands_per_neuron {
        return Err(Error::InvalidConfig(format!(
            "operand {operand} outside 0..{operands_per_neuron}"
        )));
    }

    let slot = neuron * operands_per_neuron + operand;
    let (byte, bit) = (slot / 8, 7 - slot % 8);
    if byte >= executed_bytes.ncols() {
        return Err(Error::InvalidConfig(format!(
            "slot {slot} outside the {} packed bytes",
            executed_bytes.ncols()
        )));
    }

    let mut partition = Partition::default();
    for &trace in traces {
        if trace >= executed_bytes.nrows() {
            return Err(Error::InvalidConfig(format!(
                "trace {trace} outside 0..{}",
                executed_bytes.nrows()
            )));
        }

        if executed_bytes[[trace, byte]] & (1 << bit) != 0 {
            partition.executed.push(trace);
        } else {
            partition.skipped.push(trace);
        }
    }

    tracing::debug!(
        neuron,
        operand,
        executed = partition.executed.len(),
        skipped = partition.skipped.len(),
        "traces partitioned"
    );

    Ok(partition)
}

/// Gather the given rows of `array`.
pub fn select_rows<T: Clone>(array: ArrayView2<T>, rows: &[usize]) -> Result<Array2<T>, Error> {
    if let Some(&row) = rows.iter().find(|&&row| row >= array.nrows()) {
        return Err(Error::InvalidConfig(format!(
            "row {row} outside 0..{}",
            array.nrows()
        )));
    }

    Ok(array.select(Axis(0), rows))
}
