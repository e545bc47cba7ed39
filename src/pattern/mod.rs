//! Recovery of executed and skipped operations from raw waveforms.
//!
//! Each waveform is searched for three reference patterns: the important operations, always
//! executed, and the non-important operations, either executed or skipped. The order of the
//! matches gives, for every operation slot, whether it is important and whether it was executed.
//! The important-operation pattern is finally agreed upon across traces by quorum.
pub mod consensus;
pub mod detection;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use num_traits::AsPrimitive;
use rayon::prelude::*;

use crate::{
    Error, Sample,
    config::ClassifierConfig,
    error::{InconsistencyReport, PatternKind},
    pattern::{
        consensus::{Consensus, resolve},
        detection::{TraceClassification, classify_trace, concatenate_windows},
    },
};

/// Label of an operation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ExecutionLabel {
    Skipped = 0,
    Executed = 1,
    Important = 2,
}

impl TryFrom<u8> for ExecutionLabel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Skipped),
            1 => Ok(Self::Executed),
            2 => Ok(Self::Important),
            _ => Err(Error::InvalidConfig(format!("invalid execution label {value}"))),
        }
    }
}

/// One boolean per operation slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionPattern {
    slots: Vec<bool>,
}

impl ExecutionPattern {
    pub fn from_slots(slots: Vec<bool>) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &[bool] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of set slots.
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|&&s| s).count()
    }

    /// Pack into bytes in the target's table format.
    ///
    /// Slot `i` is stored in bit `7 - i % 8` of byte `i / 8`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.slots.len() % 8 != 0 {
            return Err(Error::InvalidConfig(format!(
                "{} slots cannot be packed into bytes",
                self.slots.len()
            )));
        }

        Ok(self
            .slots
            .chunks_exact(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .rev()
                    .enumerate()
                    .fold(0u8, |byte, (bit, &slot)| byte | ((slot as u8) << bit))
            })
            .collect())
    }

    /// Unpack a table in the target's format, LSB first.
    ///
    /// Bit `j` of byte `b` becomes slot `8 * b + j`, which yields the slots in memory order:
    /// `from_bytes(&p.to_bytes()?)` equals `p.memory_order()`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let slots = bytes
            .iter()
            .flat_map(|&byte| (0..8).map(move |bit| (byte >> bit) & 1 == 1))
            .collect();

        Self { slots }
    }

    /// Reverse every group of 8 slots, mapping fetch order to memory order and back.
    pub fn memory_order(&self) -> Self {
        let slots = self
            .slots
            .chunks(8)
            .flat_map(|group| group.iter().rev().copied())
            .collect();

        Self { slots }
    }
}

/// Reference waveforms of the three kinds of operations.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePatterns {
    pub important: Array1<f64>,
    pub executed: Array1<f64>,
    pub skipped: Array1<f64>,
}

impl ReferencePatterns {
    pub fn new(
        important: Array1<f64>,
        executed: Array1<f64>,
        skipped: Array1<f64>,
    ) -> Result<Self, Error> {
        for (kind, pattern) in [
            (PatternKind::Important, &important),
            (PatternKind::Executed, &executed),
            (PatternKind::Skipped, &skipped),
        ] {
            if pattern.is_empty() {
                return Err(Error::InvalidConfig(format!("empty {kind} pattern")));
            }
        }

        Ok(Self {
            important,
            executed,
            skipped,
        })
    }

    pub fn get(&self, kind: PatternKind) -> ArrayView1<'_, f64> {
        match kind {
            PatternKind::Important => self.important.view(),
            PatternKind::Executed => self.executed.view(),
            PatternKind::Skipped => self.skipped.view(),
        }
    }
}

/// Result of classifying a batch of waveforms.
#[derive(Debug)]
pub struct Classification {
    num_traces: usize,
    pattern_length: usize,
    /// Quorum outcome, including traces to exclude from later analysis
    pub consensus: Consensus,
    /// Per-trace results, for traces where every pattern was found
    pub traces: Vec<TraceClassification>,
    /// Traces that could not be classified
    pub excluded: Vec<(usize, Error)>,
    /// Important-operation windows of each trace placed back to back, zero-padded
    pub realigned_important: Array2<f64>,
    /// Executed non-important windows of each trace placed back to back, zero-padded
    pub realigned_executed: Array2<f64>,
}

impl Classification {
    /// Accepted important-operation pattern.
    pub fn pattern(&self) -> &ExecutionPattern {
        &self.consensus.pattern
    }

    pub fn num_traces(&self) -> usize {
        self.num_traces
    }

    /// Slot labels of every trace, shape `(num_traces, pattern_length)`.
    ///
    /// Rows of excluded traces are all [`ExecutionLabel::Skipped`].
    pub fn label_matrix(&self) -> Array2<u8> {
        let mut labels = Array2::zeros((self.num_traces, self.pattern_length));
        for trace in &self.traces {
            labels.row_mut(trace.trace).assign(&trace.labels());
        }

        labels
    }

    /// Label of one slot of one trace, `None` if the trace was excluded.
    pub fn label(&self, trace: usize, slot: usize) -> Option<ExecutionLabel> {
        let trace = self.traces.iter().find(|t| t.trace == trace)?;
        let important = *trace.pattern.slots().get(slot)?;
        let executed = *trace.executed.slots().get(slot)?;

        ExecutionLabel::try_from(important as u8 + executed as u8).ok()
    }

    /// Packed executed-operation slots of every trace, shape `(num_traces, pattern_length / 8)`.
    pub fn executed_bytes(&self) -> Result<Array2<u8>, Error> {
        let mut bytes = Array2::zeros((self.num_traces, self.pattern_length.div_ceil(8)));
        for trace in &self.traces {
            bytes
                .row_mut(trace.trace)
                .assign(&Array1::from(trace.executed.to_bytes()?));
        }

        Ok(bytes)
    }

    /// Executed-operation masks of every trace in memory order, shape
    /// `(num_traces, pattern_length)`, as accepted by [`crate::simulator::masked_weights`].
    ///
    /// The masks are unpacked from [`Classification::executed_bytes`]. Rows of excluded traces
    /// are all `false`.
    pub fn execution_masks(&self) -> Result<Array2<bool>, Error> {
        let bytes = self.executed_bytes()?;
        let mut masks = Array2::from_elem((self.num_traces, self.pattern_length), false);
        for (mut mask, row) in masks.rows_mut().into_iter().zip(bytes.rows()) {
            let unpacked = ExecutionPattern::from_bytes(&row.to_vec());
            mask.assign(&ArrayView1::from(&unpacked.slots()[..self.pattern_length]));
        }

        Ok(masks)
    }

    /// Traces classified and agreeing with the accepted pattern.
    pub fn usable_traces(&self) -> Vec<usize> {
        self.traces
            .iter()
            .map(|t| t.trace)
            .filter(|trace| !self.consensus.disagreeing.contains(trace))
            .collect()
    }

    /// `(trace, offset)` of every skipped-operation match overlapping an executed one.
    pub fn ambiguous_matches(&self) -> Vec<(usize, usize)> {
        self.traces
            .iter()
            .flat_map(|t| t.matches.ambiguous.iter().map(|&offset| (t.trace, offset)))
            .collect()
    }
}

/// Classify the operations of every waveform and agree on the important-operation pattern.
///
/// `waveforms` has shape `(num_traces, num_samples)`. Traces where a reference pattern is not
/// found are excluded and reported in [`Classification::excluded`]. Fails with
/// [`Error::ClassificationInconclusive`] if no pattern reaches quorum.
pub fn classify<T: Sample>(
    waveforms: ArrayView2<T>,
    patterns: &ReferencePatterns,
    config: &ClassifierConfig,
) -> Result<Classification, Error> {
    config.validate()?;

    let (num_traces, num_samples) = waveforms.dim();
    let mut realigned_important = Array2::zeros((num_traces, num_samples));
    let mut realigned_executed = Array2::zeros((num_traces, num_samples));

    let results: Vec<_> = waveforms
        .axis_iter(Axis(0))
        .into_par_iter()
        .zip(realigned_important.axis_iter_mut(Axis(0)))
        .zip(realigned_executed.axis_iter_mut(Axis(0)))
        .enumerate()
        .map(|(trace, ((waveform, important), executed))| -> Result<_, Error> {
            let waveform = waveform.mapv(|x| -> f64 { x.as_() });
            let classification = classify_trace(trace, waveform.view(), patterns, config)?;

            let truncated = concatenate_windows(
                waveform.view(),
                &classification.matches.important,
                patterns.important.len(),
                important,
            ) | concatenate_windows(
                waveform.view(),
                &classification.matches.executed,
                patterns.executed.len(),
                executed,
            );
            if truncated {
                tracing::warn!(trace, "operation windows truncated");
            }

            Ok(classification)
        })
        .collect();

    let mut traces = Vec::with_capacity(num_traces);
    let mut excluded = Vec::new();
    for result in results {
        match result {
            Ok(classification) => traces.push(classification),
            Err(
                e @ (Error::PatternNotFound { trace, .. } | Error::SequenceOverflow { trace, .. }),
            ) => {
                tracing::warn!(trace, error = %e, "trace skipped");
                excluded.push((trace, e));
            }
            Err(e) => return Err(e),
        }
    }

    if traces.is_empty() {
        return Err(Error::ClassificationInconclusive(InconsistencyReport {
            threshold: config.inconsistency_threshold,
            attempts: Vec::new(),
        }));
    }

    let candidates: Vec<_> = traces.iter().map(|t| (t.trace, &t.pattern)).collect();
    let consensus = resolve(&candidates, config.inconsistency_threshold)?;
    tracing::info!(
        reference_trace = consensus.reference_trace,
        rate = consensus.rate,
        important = consensus.pattern.count(),
        "execution pattern accepted"
    );

    Ok(Classification {
        num_traces,
        pattern_length: config.pattern_length(),
        consensus,
        traces,
        excluded,
        realigned_important,
        realigned_executed,
    })
}
