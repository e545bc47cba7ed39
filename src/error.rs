use std::{fmt, io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Shape mismatch on {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Zero variance at sample {sample}, candidate {candidate}")]
    DegenerateStatistic { sample: usize, candidate: usize },
    #[error("No {pattern} pattern found in trace {trace}")]
    PatternNotFound { trace: usize, pattern: PatternKind },
    #[error("Trace {trace} reconstructs {slots} operation slots, more than {capacity}")]
    SequenceOverflow {
        trace: usize,
        slots: usize,
        capacity: usize,
    },
    #[error("No execution pattern reached quorum\n{0}")]
    ClassificationInconclusive(InconsistencyReport),
    #[error("Failed to save/load mlpsca data")]
    SaveLoadError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error(transparent)]
    NpyRead(#[from] ndarray_npy::ReadNpyError),
    #[error(transparent)]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),
}

impl Error {
    pub(crate) fn shape(what: &'static str, expected: usize, actual: usize) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::ShapeMismatch {
                what,
                expected,
                actual,
            })
        }
    }
}

/// Reference waveform patterns searched by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    Important,
    Executed,
    Skipped,
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Important => write!(f, "important operation"),
            Self::Executed => write!(f, "executed non-important operation"),
            Self::Skipped => write!(f, "skipped non-important operation"),
        }
    }
}

/// One reference candidate tried during quorum resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumAttempt {
    /// Trace whose reconstructed pattern served as the reference
    pub reference_trace: usize,
    /// Fraction of traces disagreeing with the reference
    pub rate: f64,
    /// Indices of the disagreeing traces
    pub disagreeing: Vec<usize>,
}

/// Every quorum attempt made before giving up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InconsistencyReport {
    pub threshold: f64,
    pub attempts: Vec<QuorumAttempt>,
}

impl fmt::Display for InconsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "threshold = {}", self.threshold)?;
        for attempt in &self.attempts {
            writeln!(
                f,
                "reference trace {}: rate = {:.4}, disagreeing = {:?}",
                attempt.reference_trace, attempt.rate, attempt.disagreeing
            )?;
        }
        Ok(())
    }
}
