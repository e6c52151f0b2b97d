#![deny(missing_docs)]
//! # sparsemf
//!
//! `sparsemf` predicts missing ratings in a sparse user-item interaction
//! matrix using biased matrix factorization trained with stochastic
//! gradient descent.
//!
//! The crate is built around three pieces:
//!
//! - [`data::Ratings`], an in-memory store of (user, item, value) triples
//!   with lazily built per-user and per-item indices,
//! - [`models::factorization::FactorizationModel`], the factor model and
//!   its single- and multi-threaded SGD trainers, and
//! - fold-in, which fits a latent vector for a user that is not part of
//!   the training data without touching the shared model.
//!
//! ## Example
//!
//! ```rust
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//! use sparsemf::data::Ratings;
//! use sparsemf::models::factorization::{FactorizationModel, Hyperparameters};
//! use sparsemf::RatingPredictor;
//!
//! let mut ratings = Ratings::new();
//! ratings.add(0, 0, 3.0).unwrap();
//! ratings.add(0, 1, 4.0).unwrap();
//! ratings.add(1, 0, 2.0).unwrap();
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! let hyper = Hyperparameters::new().num_factors(2).num_epochs(20);
//! let mut model = FactorizationModel::new(hyper);
//!
//! let train_rmse = model.fit(&mut ratings, &mut rng).unwrap();
//! assert!(train_rmse.is_finite());
//!
//! let prediction = model.predict(0, 1).unwrap();
//! assert!(prediction >= 2.0 && prediction <= 4.0);
//! ```

pub mod data;
pub mod evaluation;
pub mod io;
pub mod models;
pub mod scale;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;

/// Errors surfaced by stores, trainers and importers.
///
/// All errors are synchronous; the trainer performs no internal retries.
/// Numerical divergence (non-finite parameters caused by an excessive
/// learning rate) is *not* detected: callers are expected to bound the
/// learning rate, or to prefer the logistic link which is much harder to
/// blow up.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No interaction exists for the requested user-item pair.
    #[error("no interaction found for user {user} and item {item}")]
    NotFound {
        /// The user id that was looked up.
        user: UserId,
        /// The item id that was looked up.
        item: ItemId,
    },
    /// A fixed-capacity store has run out of preallocated space.
    #[error("fixed-capacity store is full: holds {capacity} interactions")]
    CapacityExceeded {
        /// The preallocated capacity of the store.
        capacity: usize,
    },
    /// Malformed input data: an unparseable import line, or persisted
    /// model parameters whose shapes disagree.
    #[error("format error: {0}")]
    Format(String),
    /// An invalid hyperparameter, split ratio, or constructor argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation is not supported by this store variant.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// An underlying I/O failure while importing data.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Models that can score a single user-item pair.
pub trait RatingPredictor {
    /// Predict the rating of `user` for `item`.
    ///
    /// Ids outside the trained range fall back to the global mean
    /// prediction rather than erroring.
    fn predict(&self, user: UserId, item: ItemId) -> Result<f32, Error>;
}
