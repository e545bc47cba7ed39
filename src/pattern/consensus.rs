//! Cross-trace agreement on the execution pattern.
use crate::{
    Error,
    error::{InconsistencyReport, QuorumAttempt},
    pattern::ExecutionPattern,
};

/// The execution pattern accepted by quorum.
#[derive(Debug, Clone, PartialEq)]
pub struct Consensus {
    pub pattern: ExecutionPattern,
    /// Trace whose pattern was accepted
    pub reference_trace: usize,
    /// Traces whose pattern differs from the accepted one
    pub disagreeing: Vec<usize>,
    /// Fraction of disagreeing traces
    pub rate: f64,
}

/// Pick the first per-trace pattern that at most `threshold` of the traces disagree with.
///
/// Candidates are tried in the given order. A pattern already rejected is not tried twice.
pub fn resolve(
    patterns: &[(usize, &ExecutionPattern)],
    threshold: f64,
) -> Result<Consensus, Error> {
    let mut report = InconsistencyReport {
        threshold,
        attempts: Vec::new(),
    };

    for (i, &(reference_trace, candidate)) in patterns.iter().enumerate() {
        if patterns[..i].iter().any(|(_, tried)| *tried == candidate) {
            continue;
        }

        let disagreeing: Vec<usize> = patterns
            .iter()
            .filter(|(_, pattern)| *pattern != candidate)
            .map(|&(trace, _)| trace)
            .collect();
        let rate = disagreeing.len() as f64 / patterns.len() as f64;

        tracing::debug!(reference_trace, rate, "execution pattern candidate");
        if disagreeing.is_empty() || rate <= threshold {
            if !disagreeing.is_empty() {
                tracing::warn!(?disagreeing, rate, "traces disagree with the execution pattern");
            }

            return Ok(Consensus {
                pattern: candidate.clone(),
                reference_trace,
                disagreeing,
                rate,
            });
        }

        report.attempts.push(QuorumAttempt {
            reference_trace,
            rate,
            disagreeing,
        });
    }

    Err(Error::ClassificationInconclusive(report))
}

#[cfg(test)]
mod tests {
    use super::resolve;
    use crate::{Error, pattern::ExecutionPattern};

    fn pattern(slots: &[u8]) -> ExecutionPattern {
        ExecutionPattern::from_slots(slots.iter().map(|&s| s == 1).collect())
    }

    #[test]
    fn test_unanimous() {
        let a = pattern(&[1, 0, 1, 0]);
        let consensus = resolve(&[(0, &a), (1, &a), (2, &a)], 0.25).unwrap();

        assert_eq!(consensus.reference_trace, 0);
        assert!(consensus.disagreeing.is_empty());
        assert_eq!(consensus.rate, 0.0);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let a = pattern(&[1, 0, 1, 0]);
        let b = pattern(&[1, 1, 1, 0]);
        let consensus = resolve(&[(0, &a), (1, &a), (2, &b), (5, &a)], 0.25).unwrap();

        assert_eq!(consensus.pattern, a);
        assert_eq!(consensus.disagreeing, vec![2]);
        assert_eq!(consensus.rate, 0.25);
    }

    #[test]
    fn test_advances_to_next_candidate() {
        let a = pattern(&[1, 0, 1, 0]);
        let b = pattern(&[1, 1, 1, 0]);
        let patterns = [(3, &b), (4, &a), (6, &a), (7, &a), (8, &a)];
        let consensus = resolve(&patterns, 0.25).unwrap();

        assert_eq!(consensus.reference_trace, 4);
        assert_eq!(consensus.disagreeing, vec![3]);
        assert_eq!(consensus.rate, 0.2);
    }

    #[test]
    fn test_inconclusive() {
        let a = pattern(&[1, 0]);
        let b = pattern(&[0, 1]);
        let c = pattern(&[1, 1]);
        let result = resolve(&[(0, &a), (1, &b), (2, &a), (3, &c)], 0.25);

        let Err(Error::ClassificationInconclusive(report)) = result else {
            panic!("expected an inconclusive classification");
        };
        let references: Vec<_> = report.attempts.iter().map(|a| a.reference_trace).collect();
        assert_eq!(references, vec![0, 1, 3]);
        assert_eq!(report.attempts[0].rate, 0.5);
        assert_eq!(report.attempts[1].disagreeing, vec![0, 2, 3]);
    }

    #[test]
    fn test_empty() {
        assert!(matches!(
            resolve(&[], 0.25),
            Err(Error::ClassificationInconclusive(_))
        ));
    }
}
