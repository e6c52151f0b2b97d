//! Rating prediction models.

pub mod factorization;
pub mod parallel;

use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Link function applied to the raw factorization score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Link {
    /// Use the raw score directly; predictions are clamped into the
    /// observed rating range.
    Identity,
    /// Squash the raw score through a logistic function and rescale it
    /// into the observed rating range. Much harder to diverge.
    Logistic,
}

/// The optimization target selecting the per-interaction gradient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Squared error.
    Rmse,
    /// Absolute error.
    Mae,
    /// Cross-entropy on range-normalized ratings; requires the logistic
    /// link.
    LogisticLoss,
}

/// Draw a `rows` x `cols` matrix from `Normal(mean, stdev)`.
pub(crate) fn normal_matrix<R: Rng>(
    rows: usize,
    cols: usize,
    mean: f32,
    stdev: f32,
    rng: &mut R,
) -> Result<Array2<f32>, Error> {
    let normal = Normal::new(mean, stdev)
        .map_err(|error| Error::InvalidArgument(format!("factor initializer: {}", error)))?;
    Ok(Array2::from_shape_fn((rows, cols), |_| normal.sample(rng)))
}

pub(crate) fn logistic(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
