pub mod config;
pub mod distinguishers;
pub mod error;
pub mod guessing_entropy;
pub mod hypothesis;
pub mod leakage_model;
pub mod partition;
pub mod pattern;
pub mod processors;
pub mod ranking;
pub mod simulator;
pub mod util;

pub use crate::error::Error;

use num_traits::AsPrimitive;

/// A waveform sample or leakage hypothesis value consumed by the statistics.
pub trait Sample: AsPrimitive<f64> + Send + Sync {}

impl<T> Sample for T where T: AsPrimitive<f64> + Send + Sync {}
