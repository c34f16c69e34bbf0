//! Uniform sampling without replacement over a feature collection.

use rand::Rng;
use thiserror::Error;

use crate::{Feature, FeatureCollection};

#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    #[error("cannot sample from an empty feature collection")]
    EmptyCollection,
    #[error("percentage must be in (0, 100], got {0}")]
    PercentageOutOfRange(f64),
}

/// Number of features a `percentage` selects out of `total`:
/// `max(1, round(percentage / 100 * total))`, never more than `total`.
pub fn selection_count(percentage: f64, total: usize) -> usize {
    let raw = (percentage / 100.0 * total as f64).round() as usize;
    raw.max(1).min(total)
}

/// Draw `percentage` percent of `fc` with the thread-local RNG.
pub fn sample(fc: &FeatureCollection, percentage: f64) -> Result<FeatureCollection, SampleError> {
    sample_with(fc, percentage, &mut rand::thread_rng())
}

/// Partial Fisher-Yates over a working copy of references: only the first `count`
/// positions are swapped, so the cost is linear in `count` plus the copy.
/// The result is in draw order; `fc` is left as it was.
pub fn sample_with<R: Rng + ?Sized>(
    fc: &FeatureCollection,
    percentage: f64,
    rng: &mut R,
) -> Result<FeatureCollection, SampleError> {
    if !(percentage > 0.0 && percentage <= 100.0) {
        return Err(SampleError::PercentageOutOfRange(percentage));
    }
    let n = fc.features.len();
    if n == 0 {
        return Err(SampleError::EmptyCollection);
    }
    let count = selection_count(percentage, n);
    let mut work: Vec<&Feature> = fc.features.iter().collect();
    for i in 0..count {
        let j = rng.gen_range(i..n);
        work.swap(i, j);
    }
    let selected = work[..count].iter().map(|f| (*f).clone()).collect();
    Ok(FeatureCollection::new(selected))
}
