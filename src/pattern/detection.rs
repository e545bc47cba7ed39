//! Pattern matching and operation sequence reconstruction on a single waveform.
use itertools::Itertools;
use ndarray::{Array1, ArrayView1, ArrayViewMut1, Zip, s};
use std::iter;

use crate::{
    Error,
    config::{ClassifierConfig, OverlapPolicy},
    error::PatternKind,
    pattern::{ExecutionPattern, ReferencePatterns},
};

/// Normalized cross-correlation of `pattern` at every offset of `waveform`.
///
/// The result has `waveform.len() - pattern.len() + 1` entries, none if the pattern is longer than
/// the waveform. Windows or patterns without variance correlate to 0.
pub fn pattern_correlation(waveform: ArrayView1<f64>, pattern: ArrayView1<f64>) -> Array1<f64> {
    let m = pattern.len();
    if m == 0 || waveform.len() < m {
        return Array1::zeros(0);
    }

    let pattern_mean = pattern.sum() / m as f64;
    let centered = pattern.mapv(|p| p - pattern_mean);
    let pattern_norm = centered.dot(&centered).sqrt();

    waveform
        .windows(m)
        .into_iter()
        .map(|window| {
            let window_mean = window.sum() / m as f64;
            let (num, ss) = Zip::from(&window)
                .and(&centered)
                .fold((0.0, 0.0), |(num, ss), &w, &p| {
                    let d = w - window_mean;
                    (num + d * p, ss + d * d)
                });

            let denom = ss.sqrt() * pattern_norm;
            if denom == 0.0 { 0.0 } else { num / denom }
        })
        .collect()
}

/// Offsets where `pattern` correlates above `threshold`, in increasing order.
pub fn find_matches(waveform: ArrayView1<f64>, pattern: ArrayView1<f64>, threshold: f64) -> Vec<usize> {
    pattern_correlation(waveform, pattern)
        .iter()
        .positions(|&c| c > threshold)
        .collect()
}

/// Match offsets of the three reference patterns in one waveform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matches {
    pub important: Vec<usize>,
    pub executed: Vec<usize>,
    pub skipped: Vec<usize>,
    /// Skipped-pattern offsets whose window overlaps an executed-pattern window
    pub ambiguous: Vec<usize>,
}

impl Matches {
    /// Offsets of executed operations, important or not, in increasing order.
    pub fn executed_operations(&self) -> Vec<usize> {
        self.important
            .iter()
            .merge(&self.executed)
            .copied()
            .collect()
    }

    /// Offsets of non-important operations, executed or not, in increasing order.
    pub fn non_important_operations(&self) -> Vec<usize> {
        self.executed.iter().merge(&self.skipped).copied().collect()
    }
}

/// Locate every reference pattern in `waveform`.
///
/// Fails with [`Error::PatternNotFound`] when one of the patterns has no match.
pub fn locate(
    trace: usize,
    waveform: ArrayView1<f64>,
    patterns: &ReferencePatterns,
    config: &ClassifierConfig,
) -> Result<Matches, Error> {
    let find = |kind| {
        let offsets = find_matches(waveform, patterns.get(kind), config.match_threshold);
        if offsets.is_empty() {
            Err(Error::PatternNotFound {
                trace,
                pattern: kind,
            })
        } else {
            Ok(offsets)
        }
    };

    let important = find(PatternKind::Important)?;
    let executed = find(PatternKind::Executed)?;
    let skipped = find(PatternKind::Skipped)?;

    let executed_len = patterns.executed.len();
    let skipped_len = patterns.skipped.len();
    let (ambiguous, unambiguous): (Vec<usize>, Vec<usize>) =
        skipped.iter().copied().partition(|&offset| {
            let i = executed.partition_point(|&e| e + executed_len <= offset);
            executed.get(i).is_some_and(|&e| e < offset + skipped_len)
        });

    let skipped = match config.overlap {
        OverlapPolicy::Permissive => skipped,
        OverlapPolicy::Strict => unambiguous,
    };

    Ok(Matches {
        important,
        executed,
        skipped,
        ambiguous,
    })
}

/// Rebuild a slot sequence from the offsets of marked operations and the offsets of the others.
///
/// Each marked operation is preceded by as many unmarked slots as there are new unmarked offsets
/// since the previous mark. The sequence is zero-padded to `capacity`.
fn gap_sequence(
    trace: usize,
    marks: &[usize],
    others: &[usize],
    capacity: usize,
) -> Result<Vec<bool>, Error> {
    let mut slots = Vec::with_capacity(capacity);
    let mut last = 0;
    for &mark in marks {
        let count = others.partition_point(|&o| o < mark);
        slots.extend(iter::repeat_n(false, count.saturating_sub(last)));
        slots.push(true);
        last = count;
    }

    if slots.len() > capacity {
        return Err(Error::SequenceOverflow {
            trace,
            slots: slots.len(),
            capacity,
        });
    }
    slots.resize(capacity, false);

    Ok(slots)
}

/// Important and executed operation slots recovered from one waveform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceClassification {
    pub trace: usize,
    pub matches: Matches,
    /// Important-operation slots
    pub pattern: ExecutionPattern,
    /// Executed-operation slots, important or not
    pub executed: ExecutionPattern,
}

impl TraceClassification {
    pub fn new(trace: usize, matches: Matches, capacity: usize) -> Result<Self, Error> {
        let pattern = gap_sequence(
            trace,
            &matches.important,
            &matches.non_important_operations(),
            capacity,
        )?;
        let executed = gap_sequence(
            trace,
            &matches.executed_operations(),
            &matches.skipped,
            capacity,
        )?;

        Ok(Self {
            trace,
            matches,
            pattern: ExecutionPattern::from_slots(pattern),
            executed: ExecutionPattern::from_slots(executed),
        })
    }

    /// Label of every slot: `executed + important`.
    pub fn labels(&self) -> Array1<u8> {
        self.pattern
            .slots()
            .iter()
            .zip(self.executed.slots())
            .map(|(&important, &executed)| important as u8 + executed as u8)
            .collect()
    }
}

/// Locate the reference patterns in `waveform` and rebuild its operation slots.
pub fn classify_trace(
    trace: usize,
    waveform: ArrayView1<f64>,
    patterns: &ReferencePatterns,
    config: &ClassifierConfig,
) -> Result<TraceClassification, Error> {
    let matches = locate(trace, waveform, patterns, config)?;
    if !matches.ambiguous.is_empty() {
        tracing::warn!(
            trace,
            offsets = ?matches.ambiguous,
            policy = ?config.overlap,
            "skipped-operation matches overlap executed operations"
        );
    }

    TraceClassification::new(trace, matches, config.pattern_length())
}

/// Copy the `window`-long slices of `waveform` starting at `offsets` back to back into `out`.
///
/// Stops at the first slice running past the end of the waveform or not fitting in `out`.
/// Returns `true` if extraction was truncated.
pub fn concatenate_windows(
    waveform: ArrayView1<f64>,
    offsets: &[usize],
    window: usize,
    mut out: ArrayViewMut1<f64>,
) -> bool {
    let mut pos = 0;
    for &offset in offsets {
        if offset + window > waveform.len() || pos + window > out.len() {
            return true;
        }

        out.slice_mut(s![pos..pos + window])
            .assign(&waveform.slice(s![offset..offset + window]));
        pos += window;
    }

    false
}
