use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use num_traits::AsPrimitive;
use rayon::iter::{ParallelBridge, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::{fs::File, iter::zip, ops::Add, path::Path};

#[cfg(feature = "progress_bar")]
use crate::util::progress_bar;
use crate::{
    Error, Sample,
    processors::MeanVar,
    util::{argmax_by, max_per_row},
};

/// Compute the correlation trajectory of the given traces in a single pass.
///
/// `traces` has shape `(num_traces, num_samples)` and `hypotheses` has shape
/// `(num_traces, num_candidates)`. A [`Correlation`] snapshot is emitted every
/// `checkpoint_interval` traces.
///
/// # Examples
/// ```
/// use mlpsca::distinguishers::cpa::correlate;
/// use ndarray::array;
///
/// let traces = array![[1.0f32], [2.0]];
/// let hypotheses = array![[1u32], [2]];
/// let snapshots = correlate(traces.view(), hypotheses.view(), 2).unwrap();
/// assert_eq!(snapshots[0].coefficient(0, 1).unwrap(), 1.0);
/// ```
pub fn correlate<T, H>(
    traces: ArrayView2<T>,
    hypotheses: ArrayView2<H>,
    checkpoint_interval: usize,
) -> Result<Vec<Correlation>, Error>
where
    T: Sample,
    H: Sample,
{
    Error::shape("hypotheses rows", traces.shape()[0], hypotheses.shape()[0])?;

    let mut online = OnlineCorrelation::new(
        traces.shape()[1],
        hypotheses.shape()[1],
        checkpoint_interval,
    )?;

    #[cfg(feature = "progress_bar")]
    let progress = progress_bar(traces.shape()[0]);

    let mut snapshots = Vec::with_capacity(traces.shape()[0] / checkpoint_interval);
    for (trace, hypothesis) in zip(traces.rows(), hypotheses.rows()) {
        if let Some(snapshot) = online.push(trace, hypothesis)? {
            snapshots.push(snapshot);
        }

        #[cfg(feature = "progress_bar")]
        progress.inc(1);
    }

    #[cfg(feature = "progress_bar")]
    progress.finish();

    Ok(snapshots)
}

/// Compute the final [`Correlation`] of the given traces using [`CorrelationProcessor`].
///
/// Trace batches are processed in parallel and merged pairwise.
pub fn cpa<T, H>(
    traces: ArrayView2<T>,
    hypotheses: ArrayView2<H>,
    batch_size: usize,
) -> Result<Correlation, Error>
where
    T: Sample,
    H: Sample,
{
    Error::shape("hypotheses rows", traces.shape()[0], hypotheses.shape()[0])?;
    if batch_size == 0 {
        return Err(Error::InvalidConfig("batch_size must be positive".into()));
    }

    let num_samples = traces.shape()[1];
    let num_candidates = hypotheses.shape()[1];

    // From benchmarks fold + reduce_with is faster than map + reduce/reduce_with and fold + reduce
    zip(
        traces.axis_chunks_iter(Axis(0), batch_size),
        hypotheses.axis_chunks_iter(Axis(0), batch_size),
    )
    .par_bridge()
    .fold(
        || Ok(CorrelationProcessor::new(num_samples, num_candidates)),
        |cpa: Result<CorrelationProcessor, Error>, (trace_batch, hypothesis_batch)| {
            let mut cpa = cpa?;
            for (trace, hypothesis) in zip(trace_batch.rows(), hypothesis_batch.rows()) {
                cpa.update(trace, hypothesis)?;
            }

            Ok(cpa)
        },
    )
    .reduce_with(|a, b| Ok(a? + b?))
    .unwrap_or_else(|| Ok(CorrelationProcessor::new(num_samples, num_candidates)))
    .map(|cpa| cpa.finalize())
}

/// Pearson correlation coefficients between every trace sample and every candidate hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    /// Number of traces folded in
    num_traces: usize,
    /// `None` where one of the two variances is zero
    coefficients: Array2<Option<f64>>,
}

impl Correlation {
    pub fn num_traces(&self) -> usize {
        self.num_traces
    }

    pub fn num_samples(&self) -> usize {
        self.coefficients.shape()[0]
    }

    pub fn num_candidates(&self) -> usize {
        self.coefficients.shape()[1]
    }

    /// Return the coefficient of a sample and a 1-indexed candidate.
    pub fn coefficient(&self, sample: usize, candidate: usize) -> Result<f64, Error> {
        if sample >= self.num_samples() || candidate == 0 || candidate > self.num_candidates() {
            return Err(Error::InvalidConfig(format!(
                "cell ({sample}, {candidate}) outside {} samples and {} candidates",
                self.num_samples(),
                self.num_candidates()
            )));
        }

        self.coefficients[[sample, candidate - 1]]
            .ok_or(Error::DegenerateStatistic { sample, candidate })
    }

    /// Coefficients indexed by `(sample, candidate - 1)`.
    pub fn coefficients(&self) -> ArrayView2<'_, Option<f64>> {
        self.coefficients.view()
    }

    /// `(sample, candidate)` cells whose coefficient is undefined.
    pub fn degenerate_cells(&self) -> Vec<(usize, usize)> {
        self.coefficients
            .indexed_iter()
            .filter(|(_, c)| c.is_none())
            .map(|((sample, candidate), _)| (sample, candidate + 1))
            .collect()
    }

    /// Absolute coefficients, shape `(num_samples, num_candidates)`. Degenerate cells are 0.
    pub fn magnitudes(&self) -> Array2<f64> {
        self.coefficients.mapv(|c| c.map_or(0.0, f64::abs))
    }

    /// Return the maximum absolute coefficient of each candidate.
    pub fn max_magnitudes(&self) -> Array1<f64> {
        max_per_row(self.magnitudes().t())
    }

    /// Return the 1-indexed candidate with the highest absolute coefficient.
    pub fn best_guess(&self) -> usize {
        argmax_by(self.max_magnitudes().view(), f64::total_cmp) + 1
    }
}

/// Signed correlation trajectory, one row per checkpoint and one column per
/// `(sample, candidate)` cell, sample-major.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationTrajectory {
    /// Signed coefficients, NaN where `degenerate` is set
    pub coefficients: Array2<f64>,
    /// Cells whose coefficient is undefined
    pub degenerate: Array2<bool>,
}

impl CorrelationTrajectory {
    /// Absolute coefficients. Degenerate cells are 0.
    pub fn magnitudes(&self) -> Array2<f64> {
        Zip::from(&self.coefficients)
            .and(&self.degenerate)
            .map_collect(|&c, &degenerate| if degenerate { 0.0 } else { c.abs() })
    }
}

/// Stack snapshots into a `(num_checkpoints, num_samples * num_candidates)` trajectory.
pub fn trajectory_matrix(snapshots: &[Correlation]) -> Result<CorrelationTrajectory, Error> {
    let (num_samples, num_candidates) = snapshots
        .first()
        .map_or((0, 0), |first| (first.num_samples(), first.num_candidates()));

    let shape = (snapshots.len(), num_samples * num_candidates);
    let mut trajectory = CorrelationTrajectory {
        coefficients: Array2::zeros(shape),
        degenerate: Array2::from_elem(shape, false),
    };
    for (i, snapshot) in snapshots.iter().enumerate() {
        Error::shape("snapshot samples", num_samples, snapshot.num_samples())?;
        Error::shape("snapshot candidates", num_candidates, snapshot.num_candidates())?;

        for (j, cell) in snapshot.coefficients.iter().enumerate() {
            trajectory.coefficients[[i, j]] = cell.unwrap_or(f64::NAN);
            trajectory.degenerate[[i, j]] = cell.is_none();
        }
    }

    Ok(trajectory)
}

/// A processor that computes the [`Correlation`] of the given traces.
///
/// Means, sums of squared deviations and co-deviations are updated with Welford's online
/// formulation, so memory does not depend on the number of traces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationProcessor {
    /// Moments of the trace samples
    traces: MeanVar,
    /// Moments of the hypotheses
    hypotheses: MeanVar,
    /// Sum of co-deviations, shape `(num_samples, num_candidates)`
    cov: Array2<f64>,
}

impl CorrelationProcessor {
    pub fn new(num_samples: usize, num_candidates: usize) -> Self {
        Self {
            traces: MeanVar::new(num_samples),
            hypotheses: MeanVar::new(num_candidates),
            cov: Array2::zeros((num_samples, num_candidates)),
        }
    }

    /// Fold one trace and its hypotheses into the accumulators.
    pub fn update<T, H>(&mut self, trace: ArrayView1<T>, hypotheses: ArrayView1<H>) -> Result<(), Error>
    where
        T: Sample,
        H: Sample,
    {
        Error::shape("trace samples", self.num_samples(), trace.len())?;
        Error::shape("hypotheses", self.num_candidates(), hypotheses.len())?;

        let n = (self.num_traces() + 1) as f64;
        let scale = (n - 1.0) / n;

        let dx: Array1<f64> = trace.mapv(|x| x.as_()) - &self.traces.mean();
        let dy: Array1<f64> = hypotheses.mapv(|y| y.as_()) - &self.hypotheses.mean();

        Zip::from(self.cov.rows_mut())
            .and(&dx)
            .par_for_each(|mut row, &dx| row.scaled_add(dx * scale, &dy));

        self.traces.process(trace);
        self.hypotheses.process(hypotheses);

        Ok(())
    }

    /// Compute the coefficients of the traces folded in so far.
    pub fn finalize(&self) -> Correlation {
        let m2_traces = self.traces.m2();
        let m2_hypotheses = self.hypotheses.m2();

        let coefficients = Array2::from_shape_fn(self.cov.dim(), |(sample, candidate)| {
            let (vx, vy) = (m2_traces[sample], m2_hypotheses[candidate]);
            if vx == 0.0 || vy == 0.0 {
                None
            } else {
                Some(self.cov[[sample, candidate]] / (vx * vy).sqrt())
            }
        });

        Correlation {
            num_traces: self.num_traces(),
            coefficients,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.traces.size()
    }

    pub fn num_candidates(&self) -> usize {
        self.hypotheses.size()
    }

    /// Number of traces folded in.
    pub fn num_traces(&self) -> usize {
        self.traces.count()
    }

    /// Save the [`CorrelationProcessor`] to a file.
    ///
    /// # Warning
    /// The file format is not stable.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let file = File::create(path)?;
        serde_json::to_writer(file, self)?;

        Ok(())
    }

    /// Load a [`CorrelationProcessor`] from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = File::open(path)?;
        let p: CorrelationProcessor = serde_json::from_reader(file)?;

        Ok(p)
    }

    /// Determine if two [`CorrelationProcessor`] are compatible for addition.
    ///
    /// If they were created with the same parameters, they are compatible.
    fn is_compatible_with(&self, other: &Self) -> bool {
        self.num_samples() == other.num_samples() && self.num_candidates() == other.num_candidates()
    }
}

impl Add for CorrelationProcessor {
    type Output = Self;

    /// Merge computations of two [`CorrelationProcessor`] with Chan's pairwise formula.
    ///
    /// # Panics
    /// Panics in debug if the processors are not compatible.
    fn add(self, rhs: Self) -> Self::Output {
        debug_assert!(self.is_compatible_with(&rhs));

        let (na, nb) = (self.num_traces() as f64, rhs.num_traces() as f64);
        let n = na + nb;

        let mut cov = self.cov + rhs.cov;
        if na > 0.0 && nb > 0.0 {
            let dx = &rhs.traces.mean() - &self.traces.mean();
            let dy = &rhs.hypotheses.mean() - &self.hypotheses.mean();
            let scale = na * nb / n;
            Zip::from(cov.rows_mut())
                .and(&dx)
                .for_each(|mut row, &dx| row.scaled_add(dx * scale, &dy));
        }

        Self {
            traces: self.traces + rhs.traces,
            hypotheses: self.hypotheses + rhs.hypotheses,
            cov,
        }
    }
}

/// Streaming front-end of [`CorrelationProcessor`] emitting periodic snapshots.
#[derive(Debug, Clone)]
pub struct OnlineCorrelation {
    processor: CorrelationProcessor,
    checkpoint_interval: usize,
}

impl OnlineCorrelation {
    pub fn new(
        num_samples: usize,
        num_candidates: usize,
        checkpoint_interval: usize,
    ) -> Result<Self, Error> {
        if checkpoint_interval == 0 {
            return Err(Error::InvalidConfig(
                "checkpoint_interval must be positive".into(),
            ));
        }

        Ok(Self {
            processor: CorrelationProcessor::new(num_samples, num_candidates),
            checkpoint_interval,
        })
    }

    /// Fold the next trace in; returns a snapshot when a checkpoint is reached.
    pub fn push<T, H>(
        &mut self,
        trace: ArrayView1<T>,
        hypotheses: ArrayView1<H>,
    ) -> Result<Option<Correlation>, Error>
    where
        T: Sample,
        H: Sample,
    {
        self.processor.update(trace, hypotheses)?;

        let count = self.processor.num_traces();
        if count % self.checkpoint_interval != 0 {
            return Ok(None);
        }

        tracing::debug!(traces = count, "correlation checkpoint");
        Ok(Some(self.processor.finalize()))
    }

    /// Number of traces processed, for progress reporting.
    pub fn num_traces(&self) -> usize {
        self.processor.num_traces()
    }

    pub fn processor(&self) -> &CorrelationProcessor {
        &self.processor
    }
}
