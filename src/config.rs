//! Attack and classifier parameters.
//!
//! The defaults describe the physical target: 7-bit weight magnitudes, operands fetched in four
//! reversed chunks, an 8-term final accumulation and 32-bit accumulator registers.
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path};

use crate::{Error, hypothesis::CandidateSpace};

/// Parameters of the leakage simulation and of the correlation attack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfig {
    /// Enumerated weight candidates
    pub candidates: CandidateSpace,
    /// Number of chunks the operand vector is split into before each chunk is reversed
    pub num_chunks: usize,
    /// Number of products summed by the final accumulation
    pub accumulation_terms: usize,
    /// Accumulator register width in bits
    pub accumulator_bits: u32,
    /// Number of traces between two correlation snapshots
    pub checkpoint_interval: usize,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            candidates: CandidateSpace::default(),
            num_chunks: 4,
            accumulation_terms: 8,
            accumulator_bits: 32,
            checkpoint_interval: 100,
        }
    }
}

impl AttackConfig {
    /// Check that the parameters are usable.
    pub fn validate(&self) -> Result<(), Error> {
        self.candidates.validate()?;
        if self.num_chunks == 0 {
            return Err(Error::InvalidConfig("num_chunks must be positive".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(Error::InvalidConfig(
                "checkpoint_interval must be positive".into(),
            ));
        }
        if self.accumulator_bits == 0 || self.accumulator_bits > 64 {
            return Err(Error::InvalidConfig(format!(
                "accumulator_bits must be in 1..=64, got {}",
                self.accumulator_bits
            )));
        }

        Ok(())
    }
}

/// Strictness applied when a skipped-operation match overlaps an executed-operation match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverlapPolicy {
    /// Keep every skipped match; overlaps are only reported.
    #[default]
    Permissive,
    /// Drop skipped matches whose window overlaps an executed match; overlaps are reported.
    Strict,
}

/// Parameters of the pattern classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Normalized cross-correlation above which a pattern match is accepted
    pub match_threshold: f64,
    /// Highest accepted fraction of traces disagreeing with the consensus pattern
    pub inconsistency_threshold: f64,
    pub image_width: usize,
    pub image_height: usize,
    pub num_neurons: usize,
    pub overlap: OverlapPolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.92,
            inconsistency_threshold: 0.25,
            image_width: 8,
            image_height: 4,
            num_neurons: 5,
            overlap: OverlapPolicy::Permissive,
        }
    }
}

impl ClassifierConfig {
    /// Number of operation slots in an execution pattern.
    pub fn pattern_length(&self) -> usize {
        self.image_width * self.image_height * self.num_neurons
    }

    /// Number of operands processed by each neuron.
    pub fn operands_per_neuron(&self) -> usize {
        self.image_width * self.image_height
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.pattern_length() == 0 {
            return Err(Error::InvalidConfig("empty execution pattern".into()));
        }
        if !(0.0..=1.0).contains(&self.inconsistency_threshold) {
            return Err(Error::InvalidConfig(format!(
                "inconsistency_threshold must be in [0, 1], got {}",
                self.inconsistency_threshold
            )));
        }

        Ok(())
    }
}

/// Load a configuration from a JSON file.
pub fn load<C, P>(path: P) -> Result<C, Error>
where
    C: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let file = File::open(path)?;
    Ok(serde_json::from_reader(file)?)
}

/// Save a configuration to a JSON file.
pub fn save<C: Serialize, P: AsRef<Path>>(config: &C, path: P) -> Result<(), Error> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, config)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{AttackConfig, ClassifierConfig, OverlapPolicy};

    #[test]
    fn test_defaults_match_target() {
        let attack = AttackConfig::default();
        assert_eq!(attack.candidates.len(), 127);
        assert_eq!(attack.accumulation_terms, 8);
        assert!(attack.validate().is_ok());

        let classifier = ClassifierConfig::default();
        assert_eq!(classifier.pattern_length(), 160);
        assert_eq!(classifier.overlap, OverlapPolicy::Permissive);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AttackConfig = serde_json::from_str(r#"{"checkpoint_interval": 10}"#).unwrap();
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.num_chunks, 4);
    }

    #[test]
    fn test_invalid_config() {
        let config = AttackConfig {
            checkpoint_interval: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ClassifierConfig {
            inconsistency_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
