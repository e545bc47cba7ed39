//! Convenient utility functions.

use std::{cmp::Ordering, path::Path};

use ndarray::{Array1, ArrayBase, ArrayView1, ArrayView2, Axis, Data, Dimension};
use ndarray_npy::{ReadNpyExt, WritableElement, read_npy, write_npy};

use crate::Error;

#[cfg(feature = "progress_bar")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(feature = "progress_bar")]
use std::time::Duration;

/// Creates a [`ProgressBar`] with a predefined default style.
#[cfg(feature = "progress_bar")]
pub fn progress_bar(len: usize) -> ProgressBar {
    let style = ProgressStyle::with_template("{elapsed_precise} {wide_bar} {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let progress_bar = ProgressBar::new(len as u64).with_style(style);
    progress_bar.enable_steady_tick(Duration::new(0, 100000000));
    progress_bar
}

/// Return an array where the i-th element contains the maximum of the i-th row of the input array.
///
/// Empty rows yield `f64::NEG_INFINITY`.
pub fn max_per_row(arr: ArrayView2<f64>) -> Array1<f64> {
    arr.axis_iter(Axis(0))
        .map(|row| row.fold(f64::NEG_INFINITY, |a, &b| a.max(b)))
        .collect()
}

/// Return the indices that would sort the given array with a comparison function.
///
/// The sort is stable: equal elements keep their original relative order.
pub fn argsort_by<T, F>(data: &[T], compare: F) -> Vec<usize>
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut indices: Vec<usize> = (0..data.len()).collect();

    indices.sort_by(|&a, &b| compare(&data[a], &data[b]));

    indices
}

/// Return the index of the maximum value in the given array.
///
/// The first occurrence wins on ties.
pub fn argmax_by<T, F>(array: ArrayView1<T>, compare: F) -> usize
where
    F: Fn(&T, &T) -> Ordering,
{
    let mut idx_max = 0;

    for i in 0..array.shape()[0] {
        if compare(&array[i], &array[idx_max]).is_gt() {
            idx_max = i;
        }
    }

    idx_max
}

/// Save an array to a `.npy` file.
pub fn save_array<P, A, S, D>(path: P, array: &ArrayBase<S, D>) -> Result<(), Error>
where
    P: AsRef<Path>,
    A: WritableElement,
    S: Data<Elem = A>,
    D: Dimension,
{
    write_npy(path, array)?;

    Ok(())
}

/// Load an array from a `.npy` file.
pub fn load_array<P, T>(path: P) -> Result<T, Error>
where
    P: AsRef<Path>,
    T: ReadNpyExt,
{
    Ok(read_npy(path)?)
}
