//! Biased matrix factorization trained with stochastic gradient descent.
//!
//! The model approximates a rating as
//!
//! ```text
//! r(u, i) = link(global_bias + user_bias[u] + item_bias[i]
//!                + dot(user_factors[u], item_factors[i]))
//! ```
//!
//! and minimizes a regularized objective over the observed interactions.
//! Training visits interactions in a cached shuffled order; the learning
//! rate either decays by a fixed factor per epoch or follows the bold
//! driver heuristic, which recomputes the full objective after every
//! epoch, halves the rate when the objective got worse and grows it by
//! 5 % when it improved.
//!
//! Divergence is not detected: an excessive learning rate can drive the
//! parameters to NaN without an error. Bound the learning rate, or use
//! [`Link::Logistic`], which squashes scores into the rating range.

use log::debug;
use ndarray::{s, Array1, Array2};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::parallel::{self, Partitioning};
use super::{logistic, normal_matrix, Link, Target};
use crate::data::{RatingSource, Ratings};
use crate::evaluation;
use crate::scale::RatingScale;
use crate::{Error, ItemId, RatingPredictor, UserId};

/// Hyperparameters for [`FactorizationModel`].
#[derive(Clone, Debug)]
pub struct Hyperparameters {
    pub(crate) num_factors: usize,
    pub(crate) learn_rate: f32,
    pub(crate) learn_rate_decay: f32,
    pub(crate) num_epochs: usize,
    pub(crate) reg_user: f32,
    pub(crate) reg_item: f32,
    pub(crate) reg_bias: f32,
    pub(crate) bias_learn_rate: f32,
    pub(crate) frequency_regularization: bool,
    pub(crate) init_mean: f32,
    pub(crate) init_stdev: f32,
    pub(crate) link: Link,
    pub(crate) target: Target,
    pub(crate) bold_driver: bool,
    pub(crate) fold_in_epochs: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self::new()
    }
}

impl Hyperparameters {
    /// Build new hyperparameters with reasonable defaults.
    pub fn new() -> Self {
        Hyperparameters {
            num_factors: 10,
            learn_rate: 0.01,
            learn_rate_decay: 1.0,
            num_epochs: 30,
            reg_user: 0.015,
            reg_item: 0.015,
            reg_bias: 0.0001,
            bias_learn_rate: 1.0,
            frequency_regularization: false,
            init_mean: 0.0,
            init_stdev: 0.1,
            link: Link::Identity,
            target: Target::Rmse,
            bold_driver: false,
            fold_in_epochs: 10,
        }
    }

    /// Set the number of latent factors.
    pub fn num_factors(mut self, num_factors: usize) -> Self {
        self.num_factors = num_factors;
        self
    }

    /// Set the learning rate.
    pub fn learn_rate(mut self, learn_rate: f32) -> Self {
        self.learn_rate = learn_rate;
        self
    }

    /// Set the multiplicative per-epoch learning rate decay.
    ///
    /// Ignored while the bold driver is active.
    pub fn learn_rate_decay(mut self, learn_rate_decay: f32) -> Self {
        self.learn_rate_decay = learn_rate_decay;
        self
    }

    /// Set the number of training epochs.
    pub fn num_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    /// Set the regularization weight for user latent factors.
    pub fn reg_user(mut self, reg_user: f32) -> Self {
        self.reg_user = reg_user;
        self
    }

    /// Set the regularization weight for item latent factors.
    pub fn reg_item(mut self, reg_item: f32) -> Self {
        self.reg_item = reg_item;
        self
    }

    /// Set the regularization weight for the bias terms.
    pub fn reg_bias(mut self, reg_bias: f32) -> Self {
        self.reg_bias = reg_bias;
        self
    }

    /// Set the learning rate multiplier applied to bias updates.
    pub fn bias_learn_rate(mut self, bias_learn_rate: f32) -> Self {
        self.bias_learn_rate = bias_learn_rate;
        self
    }

    /// Divide regularization weights by the square root of an entity's
    /// interaction count, reducing the penalty on popular entities.
    pub fn frequency_regularization(mut self, enabled: bool) -> Self {
        self.frequency_regularization = enabled;
        self
    }

    /// Set the mean of the normal factor initializer.
    pub fn init_mean(mut self, init_mean: f32) -> Self {
        self.init_mean = init_mean;
        self
    }

    /// Set the standard deviation of the normal factor initializer.
    pub fn init_stdev(mut self, init_stdev: f32) -> Self {
        self.init_stdev = init_stdev;
        self
    }

    /// Set the link function.
    pub fn link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    /// Set the optimization target.
    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Enable or disable bold driver learning rate adaptation.
    pub fn bold_driver(mut self, enabled: bool) -> Self {
        self.bold_driver = enabled;
        self
    }

    /// Set the number of local epochs used when folding in a user.
    pub fn fold_in_epochs(mut self, fold_in_epochs: usize) -> Self {
        self.fold_in_epochs = fold_in_epochs;
        self
    }

    /// Check the hyperparameters for consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_factors == 0 {
            return Err(Error::InvalidArgument(
                "num_factors must be at least 1".to_string(),
            ));
        }
        if !self.learn_rate.is_finite() || self.learn_rate <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "learn_rate must be positive and finite, got {}",
                self.learn_rate
            )));
        }
        if !self.learn_rate_decay.is_finite() || self.learn_rate_decay <= 0.0 {
            return Err(Error::InvalidArgument(format!(
                "learn_rate_decay must be positive, got {}",
                self.learn_rate_decay
            )));
        }
        if self.reg_user < 0.0 || self.reg_item < 0.0 || self.reg_bias < 0.0 {
            return Err(Error::InvalidArgument(
                "regularization weights must be non-negative".to_string(),
            ));
        }
        if self.bias_learn_rate < 0.0 {
            return Err(Error::InvalidArgument(
                "bias_learn_rate must be non-negative".to_string(),
            ));
        }
        if !self.init_stdev.is_finite() || self.init_stdev < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "init_stdev must be non-negative, got {}",
                self.init_stdev
            )));
        }
        if self.target == Target::LogisticLoss && self.link == Link::Identity {
            return Err(Error::InvalidArgument(
                "the logistic-loss target requires the logistic link".to_string(),
            ));
        }
        Ok(())
    }
}

/// The learned model parameters.
///
/// Rows for entities absent from the training data are zero; removed
/// entities keep their (zeroed) rows so ids stay dense and stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Latent user factors; one row per user id.
    pub user_factors: Array2<f32>,
    /// Latent item factors; one row per item id.
    pub item_factors: Array2<f32>,
    /// Per-user bias terms.
    pub user_bias: Array1<f32>,
    /// Per-item bias terms.
    pub item_bias: Array1<f32>,
    /// The global bias; the mean rating, or its inverse logit under the
    /// logistic link.
    pub global_bias: f32,
    /// Lower bound of the rating range seen during training.
    pub min_rating: f32,
    /// Upper bound of the rating range seen during training.
    pub max_rating: f32,
    /// The link function the parameters were trained with.
    pub link: Link,
}

impl Parameters {
    /// Check that paired structures agree in shape.
    ///
    /// Persistence layers are expected to call this after loading;
    /// mismatched shapes surface as [`Error::Format`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.user_factors.ncols() != self.item_factors.ncols() {
            return Err(Error::Format(format!(
                "user and item factor widths must match: {} != {}",
                self.user_factors.ncols(),
                self.item_factors.ncols()
            )));
        }
        if self.user_bias.len() != self.user_factors.nrows() {
            return Err(Error::Format(format!(
                "user bias length must equal the number of user factor rows: {} != {}",
                self.user_bias.len(),
                self.user_factors.nrows()
            )));
        }
        if self.item_bias.len() != self.item_factors.nrows() {
            return Err(Error::Format(format!(
                "item bias length must equal the number of item factor rows: {} != {}",
                self.item_bias.len(),
                self.item_factors.nrows()
            )));
        }
        if self.min_rating > self.max_rating {
            return Err(Error::Format(format!(
                "rating bounds are inverted: {} > {}",
                self.min_rating, self.max_rating
            )));
        }
        Ok(())
    }

    /// The number of latent factors.
    pub fn num_factors(&self) -> usize {
        self.user_factors.ncols()
    }

    pub(crate) fn raw_score(&self, user: UserId, item: ItemId) -> f32 {
        self.global_bias
            + self.user_bias[user]
            + self.item_bias[item]
            + self.user_factors.row(user).dot(&self.item_factors.row(item))
    }

    pub(crate) fn apply_link(&self, raw: f32) -> f32 {
        match self.link {
            Link::Identity => raw.clamp(self.min_rating, self.max_rating),
            Link::Logistic => {
                self.min_rating + logistic(raw) * (self.max_rating - self.min_rating)
            }
        }
    }

    pub(crate) fn fallback_prediction(&self) -> f32 {
        match self.link {
            Link::Identity => self.global_bias,
            Link::Logistic => {
                self.min_rating + logistic(self.global_bias) * (self.max_rating - self.min_rating)
            }
        }
    }

    /// Predict the rating of `user` for `item`, bounded into the rating
    /// range. Ids outside the trained ranges get the global mean
    /// prediction.
    pub fn predict(&self, user: UserId, item: ItemId) -> f32 {
        if user >= self.user_factors.nrows() || item >= self.item_factors.nrows() {
            return self.fallback_prediction();
        }
        self.apply_link(self.raw_score(user, item))
    }
}

/// A user representation fitted by fold-in, private to the caller.
#[derive(Clone, Debug)]
pub struct FoldedUser {
    /// The fitted latent vector.
    pub factors: Array1<f32>,
    /// The fitted user bias.
    pub bias: f32,
}

/// Biased matrix factorization with single- and multi-threaded SGD
/// training, incremental retraining, and fold-in.
pub struct FactorizationModel {
    hyper: Hyperparameters,
    params: Option<Parameters>,
    /// The current learning rate; adjusted across epochs by decay or the
    /// bold driver.
    learn_rate: f32,
    last_objective: Option<f32>,
}

impl FactorizationModel {
    /// Create an unfitted model.
    pub fn new(hyper: Hyperparameters) -> Self {
        let learn_rate = hyper.learn_rate;
        FactorizationModel {
            hyper,
            params: None,
            learn_rate,
            last_objective: None,
        }
    }

    /// Wrap previously persisted parameters, validating their shapes.
    pub fn with_parameters(hyper: Hyperparameters, params: Parameters) -> Result<Self, Error> {
        hyper.validate()?;
        params.validate()?;
        let learn_rate = hyper.learn_rate;
        Ok(FactorizationModel {
            hyper,
            params: Some(params),
            learn_rate,
            last_objective: None,
        })
    }

    /// The fitted parameters, if the model has been trained or loaded.
    pub fn parameters(&self) -> Option<&Parameters> {
        self.params.as_ref()
    }

    /// The current learning rate.
    pub fn learn_rate(&self) -> f32 {
        self.learn_rate
    }

    /// Fit the model on `ratings` with single-threaded SGD.
    ///
    /// Returns the RMSE on the training data. Two runs from the same seed
    /// and data produce identical parameters.
    pub fn fit<R: Rng>(&mut self, ratings: &mut Ratings, rng: &mut R) -> Result<f32, Error> {
        let scale = self.check_trainable(ratings)?;

        let count_by_user = ratings.count_by_user().to_vec();
        let count_by_item = ratings.count_by_item().to_vec();
        let order = ratings.random_index(rng).to_vec();

        let mut params = self.init_params(ratings, &scale, &count_by_user, &count_by_item, rng)?;
        self.begin_training(&params, ratings, &count_by_user, &count_by_item);

        for epoch in 0..self.hyper.num_epochs {
            let ctx = UpdateContext {
                hyper: &self.hyper,
                learn_rate: self.learn_rate,
                count_by_user: &count_by_user,
                count_by_item: &count_by_item,
            };
            sgd_pass(&mut params, ratings, &order, &ctx, true, true);
            self.finish_epoch(epoch, &params, ratings, &count_by_user, &count_by_item);
        }

        self.params = Some(params);
        evaluation::rmse(self, ratings)
    }

    /// Fit the model using `num_workers` parallel SGD workers.
    ///
    /// With [`Partitioning::ConflictFree`] interactions are processed in
    /// sub-epochs whose blocks never share a user or item row between
    /// workers, so the updates need no locking. [`Partitioning::Naive`]
    /// splits the shuffled interaction list into flat chunks; it is
    /// simpler but its result depends on thread scheduling and is not
    /// reproducible.
    pub fn fit_parallel<R: Rng>(
        &mut self,
        ratings: &mut Ratings,
        num_workers: usize,
        partitioning: Partitioning,
        rng: &mut R,
    ) -> Result<f32, Error> {
        if num_workers == 0 {
            return Err(Error::InvalidArgument(
                "num_workers must be at least 1".to_string(),
            ));
        }
        let scale = self.check_trainable(ratings)?;

        // Single-threaded warm-up: every lazy cache the workers touch is
        // built here and treated as read-only for the rest of training.
        ratings.build_user_index();
        ratings.build_item_index();
        let count_by_user = ratings.count_by_user().to_vec();
        let count_by_item = ratings.count_by_item().to_vec();
        let order = ratings.random_index(rng).to_vec();

        let mut params = self.init_params(ratings, &scale, &count_by_user, &count_by_item, rng)?;
        self.begin_training(&params, ratings, &count_by_user, &count_by_item);

        match partitioning {
            Partitioning::ConflictFree => {
                let grid = parallel::partition_users_items(ratings, num_workers, rng)?;
                for epoch in 0..self.hyper.num_epochs {
                    let ctx = UpdateContext {
                        hyper: &self.hyper,
                        learn_rate: self.learn_rate,
                        count_by_user: &count_by_user,
                        count_by_item: &count_by_item,
                    };
                    parallel::run_epoch(&mut params, ratings, &grid, &ctx, rng);
                    self.finish_epoch(epoch, &params, ratings, &count_by_user, &count_by_item);
                }
            }
            Partitioning::Naive => {
                let chunks = parallel::flat_partition(&order, num_workers);
                for epoch in 0..self.hyper.num_epochs {
                    let ctx = UpdateContext {
                        hyper: &self.hyper,
                        learn_rate: self.learn_rate,
                        count_by_user: &count_by_user,
                        count_by_item: &count_by_item,
                    };
                    parallel::run_epoch_naive(&mut params, ratings, &chunks, &ctx);
                    self.finish_epoch(epoch, &params, ratings, &count_by_user, &count_by_item);
                }
            }
        }

        self.params = Some(params);
        evaluation::rmse(self, ratings)
    }

    /// Append a new interaction and retrain the touched user's and item's
    /// buckets instead of refitting the whole model.
    ///
    /// Parameter matrices grow as needed; a full [`FactorizationModel::fit`]
    /// must have happened first. Not safe to interleave with an in-flight
    /// training epoch; callers serialize externally.
    pub fn add_rating<R: Rng>(
        &mut self,
        ratings: &mut Ratings,
        user: UserId,
        item: ItemId,
        value: f32,
        rng: &mut R,
    ) -> Result<(), Error> {
        if self.params.is_none() {
            return Err(Error::InvalidArgument(
                "the model must be fitted before incremental updates".to_string(),
            ));
        }

        ratings.add(user, item, value)?;
        {
            let params = self.params.as_mut().unwrap();
            grow_rows(&mut params.user_factors, &mut params.user_bias, user);
            grow_rows(&mut params.item_factors, &mut params.item_bias, item);
        }
        self.retrain_user(ratings, user, rng)?;
        self.retrain_item(ratings, item, rng)
    }

    /// Remove one interaction and retrain the affected entities.
    pub fn remove_rating<R: Rng>(
        &mut self,
        ratings: &mut Ratings,
        user: UserId,
        item: ItemId,
        rng: &mut R,
    ) -> Result<(), Error> {
        let index = ratings.get_index(user, item)?;
        ratings.remove_at(index)?;
        self.retrain_user(ratings, user, rng)?;
        self.retrain_item(ratings, item, rng)
    }

    /// Remove a user from the store and reset their parameters to the
    /// zero baseline. The row is kept so other ids stay stable.
    pub fn remove_user(&mut self, ratings: &mut Ratings, user: UserId) -> Result<(), Error> {
        ratings.remove_user(user)?;
        if let Some(params) = self.params.as_mut() {
            if user < params.user_factors.nrows() {
                params.user_factors.row_mut(user).fill(0.0);
                params.user_bias[user] = 0.0;
            }
        }
        Ok(())
    }

    /// Remove an item from the store and reset its parameters to the
    /// zero baseline.
    pub fn remove_item(&mut self, ratings: &mut Ratings, item: ItemId) -> Result<(), Error> {
        ratings.remove_item(item)?;
        if let Some(params) = self.params.as_mut() {
            if item < params.item_factors.nrows() {
                params.item_factors.row_mut(item).fill(0.0);
                params.item_bias[item] = 0.0;
            }
        }
        Ok(())
    }

    /// Reinitialize and retrain a single user's parameters from their
    /// current bucket, holding the item side fixed.
    pub fn retrain_user<R: Rng>(
        &mut self,
        ratings: &mut Ratings,
        user: UserId,
        rng: &mut R,
    ) -> Result<(), Error> {
        let indices = ratings.by_user().get(user).cloned().unwrap_or_default();
        let count_by_user = ratings.count_by_user().to_vec();
        let count_by_item = ratings.count_by_item().to_vec();

        let params = self
            .params
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("the model has not been fitted".to_string()))?;
        if user >= params.user_factors.nrows() {
            return Err(Error::InvalidArgument(format!(
                "user {} is outside the trained model",
                user
            )));
        }

        params.user_bias[user] = 0.0;
        let row = normal_matrix(
            1,
            params.num_factors(),
            self.hyper.init_mean,
            self.hyper.init_stdev,
            rng,
        )?;
        params.user_factors.row_mut(user).assign(&row.row(0));

        let ctx = UpdateContext {
            hyper: &self.hyper,
            learn_rate: self.learn_rate,
            count_by_user: &count_by_user,
            count_by_item: &count_by_item,
        };
        for _ in 0..self.hyper.num_epochs {
            sgd_pass(params, ratings, &indices, &ctx, true, false);
        }

        Ok(())
    }

    /// Reinitialize and retrain a single item's parameters from its
    /// current bucket, holding the user side fixed.
    pub fn retrain_item<R: Rng>(
        &mut self,
        ratings: &mut Ratings,
        item: ItemId,
        rng: &mut R,
    ) -> Result<(), Error> {
        let indices = ratings.by_item().get(item).cloned().unwrap_or_default();
        let count_by_user = ratings.count_by_user().to_vec();
        let count_by_item = ratings.count_by_item().to_vec();

        let params = self
            .params
            .as_mut()
            .ok_or_else(|| Error::InvalidArgument("the model has not been fitted".to_string()))?;
        if item >= params.item_factors.nrows() {
            return Err(Error::InvalidArgument(format!(
                "item {} is outside the trained model",
                item
            )));
        }

        params.item_bias[item] = 0.0;
        let row = normal_matrix(
            1,
            params.num_factors(),
            self.hyper.init_mean,
            self.hyper.init_stdev,
            rng,
        )?;
        params.item_factors.row_mut(item).assign(&row.row(0));

        let ctx = UpdateContext {
            hyper: &self.hyper,
            learn_rate: self.learn_rate,
            count_by_user: &count_by_user,
            count_by_item: &count_by_item,
        };
        for _ in 0..self.hyper.num_epochs {
            sgd_pass(params, ratings, &indices, &ctx, false, true);
        }

        Ok(())
    }

    /// Fit a private latent vector and bias for a user described only by
    /// a list of (item, rating) pairs.
    ///
    /// The item-side parameters are read-only inputs; the shared model is
    /// never written. Use [`FactorizationModel::predict_folded`] to score
    /// with the result.
    pub fn fold_in<R: Rng>(
        &self,
        rated_items: &[(ItemId, f32)],
        rng: &mut R,
    ) -> Result<FoldedUser, Error> {
        let params = self.params.as_ref().ok_or_else(|| {
            Error::InvalidArgument("the model must be fitted before folding in users".to_string())
        })?;
        if rated_items.is_empty() {
            return Err(Error::InvalidArgument(
                "fold-in needs at least one rated item".to_string(),
            ));
        }
        for &(item, _) in rated_items {
            if item >= params.item_factors.nrows() {
                return Err(Error::InvalidArgument(format!(
                    "item {} is outside the trained model",
                    item
                )));
            }
        }

        let num_factors = params.num_factors();
        let mut pairs = rated_items.to_vec();
        pairs.shuffle(rng);

        let mut factors: Array1<f32> = normal_matrix(
            1,
            num_factors,
            self.hyper.init_mean,
            self.hyper.init_stdev,
            rng,
        )?
        .row(0)
        .to_owned();
        let mut bias = 0.0f32;

        let reg_weight = if self.hyper.frequency_regularization {
            1.0 / (pairs.len() as f32).sqrt()
        } else {
            1.0
        };

        for _ in 0..self.hyper.fold_in_epochs {
            for &(item, actual) in &pairs {
                let raw = params.global_bias
                    + bias
                    + params.item_bias[item]
                    + factors.dot(&params.item_factors.row(item));
                let gradient = gradient_common(
                    params.link,
                    self.hyper.target,
                    params.min_rating,
                    params.max_rating,
                    raw,
                    actual,
                );

                bias += self.hyper.bias_learn_rate
                    * self.learn_rate
                    * (gradient - self.hyper.reg_bias * reg_weight * bias);
                for f in 0..num_factors {
                    let u_f = factors[f];
                    let i_f = params.item_factors[[item, f]];
                    factors[f] +=
                        self.learn_rate * (gradient * i_f - self.hyper.reg_user * reg_weight * u_f);
                }
            }
        }

        Ok(FoldedUser { factors, bias })
    }

    /// Score an item against a folded-in user representation.
    pub fn predict_folded(&self, user: &FoldedUser, item: ItemId) -> Result<f32, Error> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("the model has not been fitted".to_string()))?;
        if item >= params.item_factors.nrows() {
            return Ok(params.fallback_prediction());
        }
        let raw = params.global_bias
            + user.bias
            + params.item_bias[item]
            + user.factors.dot(&params.item_factors.row(item));
        Ok(params.apply_link(raw))
    }

    fn check_trainable(&self, ratings: &Ratings) -> Result<RatingScale, Error> {
        self.hyper.validate()?;
        if ratings.is_empty() {
            return Err(Error::InvalidArgument(
                "cannot fit a model on an empty dataset".to_string(),
            ));
        }
        let scale = RatingScale::from_source(ratings)?;
        if self.hyper.link == Link::Logistic && scale.min() == scale.max() {
            return Err(Error::InvalidArgument(
                "the logistic link needs at least two distinct rating levels".to_string(),
            ));
        }
        Ok(scale)
    }

    fn init_params<R: Rng>(
        &self,
        ratings: &Ratings,
        scale: &RatingScale,
        count_by_user: &[usize],
        count_by_item: &[usize],
        rng: &mut R,
    ) -> Result<Parameters, Error> {
        let num_users = ratings.max_user_id() + 1;
        let num_items = ratings.max_item_id() + 1;
        let num_factors = self.hyper.num_factors;

        let mut user_factors = normal_matrix(
            num_users,
            num_factors,
            self.hyper.init_mean,
            self.hyper.init_stdev,
            rng,
        )?;
        let mut item_factors = normal_matrix(
            num_items,
            num_factors,
            self.hyper.init_mean,
            self.hyper.init_stdev,
            rng,
        )?;

        // entities without training data stay at the zero baseline
        for (user, &count) in count_by_user.iter().enumerate() {
            if count == 0 {
                user_factors.row_mut(user).fill(0.0);
            }
        }
        for (item, &count) in count_by_item.iter().enumerate() {
            if count == 0 {
                item_factors.row_mut(item).fill(0.0);
            }
        }

        let mean = ratings.mean_rating();
        let global_bias = match self.hyper.link {
            Link::Identity => mean,
            Link::Logistic => {
                let normalized =
                    ((mean - scale.min()) / (scale.max() - scale.min())).clamp(0.01, 0.99);
                (normalized / (1.0 - normalized)).ln()
            }
        };

        Ok(Parameters {
            user_factors,
            item_factors,
            user_bias: Array1::zeros(num_users),
            item_bias: Array1::zeros(num_items),
            global_bias,
            min_rating: scale.min(),
            max_rating: scale.max(),
            link: self.hyper.link,
        })
    }

    fn begin_training<S: RatingSource>(
        &mut self,
        params: &Parameters,
        source: &S,
        count_by_user: &[usize],
        count_by_item: &[usize],
    ) {
        self.learn_rate = self.hyper.learn_rate;
        self.last_objective = if self.hyper.bold_driver {
            Some(compute_objective(
                &self.hyper,
                params,
                source,
                count_by_user,
                count_by_item,
            ))
        } else {
            None
        };
    }

    fn finish_epoch<S: RatingSource>(
        &mut self,
        epoch: usize,
        params: &Parameters,
        source: &S,
        count_by_user: &[usize],
        count_by_item: &[usize],
    ) {
        if self.hyper.bold_driver {
            // always a fresh whole-dataset value, never a mid-epoch one
            let objective =
                compute_objective(&self.hyper, params, source, count_by_user, count_by_item);
            if let Some(last) = self.last_objective {
                self.learn_rate = adjusted_learn_rate(self.learn_rate, last, objective);
            }
            self.last_objective = Some(objective);
            debug!(
                "epoch {}: objective {} learn_rate {}",
                epoch, objective, self.learn_rate
            );
        } else {
            self.learn_rate *= self.hyper.learn_rate_decay;
            debug!("epoch {}: learn_rate {}", epoch, self.learn_rate);
        }
    }
}

impl RatingPredictor for FactorizationModel {
    fn predict(&self, user: UserId, item: ItemId) -> Result<f32, Error> {
        let params = self
            .params
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("the model has not been fitted".to_string()))?;
        Ok(params.predict(user, item))
    }
}

/// Read-only context shared by every SGD update in one epoch.
pub(crate) struct UpdateContext<'a> {
    pub(crate) hyper: &'a Hyperparameters,
    pub(crate) learn_rate: f32,
    pub(crate) count_by_user: &'a [usize],
    pub(crate) count_by_item: &'a [usize],
}

/// The gradient-common term: the error combined with the link derivative,
/// selected by the optimization target.
fn gradient_common(link: Link, target: Target, min: f32, max: f32, raw: f32, actual: f32) -> f32 {
    match link {
        Link::Identity => {
            let err = actual - raw;
            match target {
                Target::Rmse => err,
                Target::Mae => err.signum(),
                // rejected by Hyperparameters::validate
                Target::LogisticLoss => err,
            }
        }
        Link::Logistic => {
            let range = max - min;
            let sig = logistic(raw);
            let err = actual - (min + sig * range);
            match target {
                Target::Rmse => err * sig * (1.0 - sig) * range,
                Target::Mae => err.signum() * sig * (1.0 - sig) * range,
                Target::LogisticLoss => (actual - min) / range - sig,
            }
        }
    }
}

/// Apply one SGD update per index in `indices`.
///
/// `update_user`/`update_item` restrict the update to one side, which is
/// how incremental retraining holds the other side fixed.
pub(crate) fn sgd_pass<S: RatingSource>(
    params: &mut Parameters,
    ratings: &S,
    indices: &[usize],
    ctx: &UpdateContext<'_>,
    update_user: bool,
    update_item: bool,
) {
    for &index in indices {
        let user = ratings.user(index);
        let item = ratings.item(index);
        let actual = ratings.value(index);

        let raw = params.raw_score(user, item);
        let gradient = gradient_common(
            params.link,
            ctx.hyper.target,
            params.min_rating,
            params.max_rating,
            raw,
            actual,
        );

        // interaction counts are >= 1 for every entity that appears here
        let user_weight = if ctx.hyper.frequency_regularization {
            1.0 / (ctx.count_by_user[user] as f32).sqrt()
        } else {
            1.0
        };
        let item_weight = if ctx.hyper.frequency_regularization {
            1.0 / (ctx.count_by_item[item] as f32).sqrt()
        } else {
            1.0
        };

        if update_user {
            params.user_bias[user] += ctx.hyper.bias_learn_rate
                * ctx.learn_rate
                * (gradient - ctx.hyper.reg_bias * user_weight * params.user_bias[user]);
        }
        if update_item {
            params.item_bias[item] += ctx.hyper.bias_learn_rate
                * ctx.learn_rate
                * (gradient - ctx.hyper.reg_bias * item_weight * params.item_bias[item]);
        }

        for f in 0..params.user_factors.ncols() {
            let u_f = params.user_factors[[user, f]];
            let i_f = params.item_factors[[item, f]];

            if update_user {
                let delta_u = gradient * i_f - ctx.hyper.reg_user * user_weight * u_f;
                params.user_factors[[user, f]] += ctx.learn_rate * delta_u;
            }
            if update_item {
                let delta_i = gradient * u_f - ctx.hyper.reg_item * item_weight * i_f;
                params.item_factors[[item, f]] += ctx.learn_rate * delta_i;
            }
        }
    }
}

/// The full regularized objective: the per-interaction loss plus L2
/// penalties on every row and bias, frequency-scaled when enabled.
pub(crate) fn compute_objective<S: RatingSource>(
    hyper: &Hyperparameters,
    params: &Parameters,
    source: &S,
    count_by_user: &[usize],
    count_by_item: &[usize],
) -> f32 {
    let mut objective = 0.0f64;

    for index in 0..source.len() {
        let user = source.user(index);
        let item = source.item(index);
        let actual = source.value(index);

        match hyper.target {
            Target::Rmse => {
                let err = params.predict(user, item) - actual;
                objective += f64::from(err * err);
            }
            Target::Mae => {
                objective += f64::from((params.predict(user, item) - actual).abs());
            }
            Target::LogisticLoss => {
                let range = params.max_rating - params.min_rating;
                let sig = logistic(params.raw_score(user, item));
                let normalized = (actual - params.min_rating) / range;
                objective -= f64::from(normalized) * f64::from(sig.max(1e-10).ln())
                    + f64::from(1.0 - normalized) * f64::from((1.0 - sig).max(1e-10).ln());
            }
        }
    }

    for (user, &count) in count_by_user.iter().enumerate() {
        if count == 0 || user >= params.user_factors.nrows() {
            continue;
        }
        let weight = if hyper.frequency_regularization {
            (count as f32).sqrt()
        } else {
            count as f32
        };
        let row = params.user_factors.row(user);
        let norm_squared = row.dot(&row);
        let bias = params.user_bias[user];
        objective += f64::from(weight * (hyper.reg_user * norm_squared + hyper.reg_bias * bias * bias));
    }
    for (item, &count) in count_by_item.iter().enumerate() {
        if count == 0 || item >= params.item_factors.nrows() {
            continue;
        }
        let weight = if hyper.frequency_regularization {
            (count as f32).sqrt()
        } else {
            count as f32
        };
        let row = params.item_factors.row(item);
        let norm_squared = row.dot(&row);
        let bias = params.item_bias[item];
        objective += f64::from(weight * (hyper.reg_item * norm_squared + hyper.reg_bias * bias * bias));
    }

    objective as f32
}

/// Bold driver rule: halve the rate when the objective got worse, grow it
/// by 5 % when it improved, keep it when unchanged.
pub(crate) fn adjusted_learn_rate(learn_rate: f32, last_objective: f32, objective: f32) -> f32 {
    if objective > last_objective {
        learn_rate * 0.5
    } else if objective < last_objective {
        learn_rate * 1.05
    } else {
        learn_rate
    }
}

/// Grow a factor matrix and its paired bias vector to cover `id`,
/// zero-filling the new rows.
fn grow_rows(factors: &mut Array2<f32>, bias: &mut Array1<f32>, id: usize) {
    if id < factors.nrows() {
        return;
    }

    let mut grown = Array2::zeros((id + 1, factors.ncols()));
    grown.slice_mut(s![..factors.nrows(), ..]).assign(factors);
    *factors = grown;

    let mut grown_bias = Array1::zeros(id + 1);
    grown_bias.slice_mut(s![..bias.len()]).assign(bias);
    *bias = grown_bias;
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::evaluation;

    fn scenario_a() -> Ratings {
        let mut ratings = Ratings::new();
        ratings.add(0, 0, 3.0).unwrap();
        ratings.add(0, 1, 4.0).unwrap();
        ratings.add(1, 0, 2.0).unwrap();
        ratings
    }

    fn synthetic_ratings(num_users: usize, num_items: usize) -> Ratings {
        let mut ratings = Ratings::new();
        for user in 0..num_users {
            for item in 0..num_items {
                if (user + item) % 3 == 0 {
                    continue;
                }
                let value = 1.0 + ((user * 7 + item * 3) % 5) as f32;
                ratings.add(user, item, value).unwrap();
            }
        }
        ratings
    }

    #[test]
    fn training_beats_the_global_mean_baseline() {
        let mut ratings = scenario_a();
        let mut rng = StdRng::seed_from_u64(42);

        let hyper = Hyperparameters::new()
            .num_factors(2)
            .num_epochs(50)
            .learn_rate(0.05);
        let mut model = FactorizationModel::new(hyper);

        let train_rmse = model.fit(&mut ratings, &mut rng).unwrap();
        let baseline = evaluation::constant_rmse(&ratings, 3.0).unwrap();

        assert!(
            train_rmse < baseline,
            "training RMSE {} should beat the constant baseline {}",
            train_rmse,
            baseline
        );
    }

    #[test]
    fn same_seed_gives_identical_parameters() {
        let hyper = Hyperparameters::new().num_factors(4).num_epochs(10);

        let mut first_ratings = synthetic_ratings(10, 8);
        let mut first_rng = StdRng::seed_from_u64(99);
        let mut first = FactorizationModel::new(hyper.clone());
        first.fit(&mut first_ratings, &mut first_rng).unwrap();

        let mut second_ratings = synthetic_ratings(10, 8);
        let mut second_rng = StdRng::seed_from_u64(99);
        let mut second = FactorizationModel::new(hyper);
        second.fit(&mut second_ratings, &mut second_rng).unwrap();

        assert_eq!(first.parameters().unwrap(), second.parameters().unwrap());
    }

    #[test]
    fn fold_in_never_touches_the_shared_model() {
        let mut ratings = synthetic_ratings(10, 8);
        let mut rng = StdRng::seed_from_u64(7);

        let hyper = Hyperparameters::new().num_factors(3).num_epochs(10);
        let mut model = FactorizationModel::new(hyper);
        model.fit(&mut ratings, &mut rng).unwrap();

        let before = model.parameters().unwrap().clone();
        let folded = model.fold_in(&[(0, 4.0), (1, 2.0), (2, 5.0)], &mut rng).unwrap();
        let after = model.parameters().unwrap();

        assert_eq!(&before, after);
        assert_eq!(folded.factors.len(), 3);

        let prediction = model.predict_folded(&folded, 0).unwrap();
        assert!(prediction >= 1.0 && prediction <= 5.0);
    }

    #[test]
    fn bold_driver_reacts_monotonically() {
        assert!(adjusted_learn_rate(0.1, 1.0, 2.0) < 0.1);
        assert!(adjusted_learn_rate(0.1, 2.0, 1.0) > 0.1);
        assert_eq!(adjusted_learn_rate(0.1, 1.0, 1.0), 0.1);
        assert_eq!(adjusted_learn_rate(0.1, 1.0, 2.0), 0.05);
        assert!((adjusted_learn_rate(0.1, 2.0, 1.0) - 0.105).abs() < 1e-7);
    }

    #[test]
    fn bold_driver_training_stays_finite() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut ratings = synthetic_ratings(8, 6);
        let mut rng = StdRng::seed_from_u64(21);

        let hyper = Hyperparameters::new()
            .num_factors(2)
            .num_epochs(15)
            .bold_driver(true);
        let mut model = FactorizationModel::new(hyper);

        let rmse = model.fit(&mut ratings, &mut rng).unwrap();
        assert!(rmse.is_finite());
        assert!(model.learn_rate().is_finite() && model.learn_rate() > 0.0);
    }

    #[test]
    fn logistic_link_bounds_predictions() {
        let mut ratings = synthetic_ratings(8, 6);
        let mut rng = StdRng::seed_from_u64(5);

        let hyper = Hyperparameters::new()
            .num_factors(2)
            .num_epochs(10)
            .link(Link::Logistic);
        let mut model = FactorizationModel::new(hyper);
        model.fit(&mut ratings, &mut rng).unwrap();

        for user in 0..8 {
            for item in 0..6 {
                let prediction = model.predict(user, item).unwrap();
                assert!(prediction >= 1.0 && prediction <= 5.0);
            }
        }
    }

    #[test]
    fn unknown_ids_fall_back_to_the_global_prediction() {
        let mut ratings = scenario_a();
        let mut rng = StdRng::seed_from_u64(1);

        let mut model = FactorizationModel::new(Hyperparameters::new().num_epochs(5));
        model.fit(&mut ratings, &mut rng).unwrap();

        let fallback = model.parameters().unwrap().fallback_prediction();
        assert_eq!(model.predict(100, 0).unwrap(), fallback);
        assert_eq!(model.predict(0, 100).unwrap(), fallback);
    }

    #[test]
    fn incremental_add_grows_the_model() {
        let mut ratings = scenario_a();
        let mut rng = StdRng::seed_from_u64(17);

        let hyper = Hyperparameters::new().num_factors(2).num_epochs(20);
        let mut model = FactorizationModel::new(hyper);
        model.fit(&mut ratings, &mut rng).unwrap();

        model.add_rating(&mut ratings, 5, 3, 4.0, &mut rng).unwrap();

        let params = model.parameters().unwrap();
        assert_eq!(params.user_factors.nrows(), 6);
        assert_eq!(params.item_factors.nrows(), 4);
        assert_eq!(params.user_bias.len(), 6);

        let prediction = model.predict(5, 3).unwrap();
        assert!(prediction >= 2.0 && prediction <= 4.0);
    }

    #[test]
    fn removing_a_user_zeroes_their_row() {
        let mut ratings = synthetic_ratings(6, 5);
        let mut rng = StdRng::seed_from_u64(13);

        let mut model = FactorizationModel::new(Hyperparameters::new().num_epochs(5));
        model.fit(&mut ratings, &mut rng).unwrap();

        model.remove_user(&mut ratings, 2).unwrap();

        let params = model.parameters().unwrap();
        assert!(params.user_factors.row(2).iter().all(|&x| x == 0.0));
        assert_eq!(params.user_bias[2], 0.0);
        // the row count is unchanged, ids stay dense
        assert_eq!(params.user_factors.nrows(), 6);
    }

    #[test]
    fn invalid_hyperparameters_are_rejected() {
        assert!(Hyperparameters::new().num_factors(0).validate().is_err());
        assert!(Hyperparameters::new().learn_rate(-1.0).validate().is_err());
        assert!(Hyperparameters::new().reg_user(-0.1).validate().is_err());
        assert!(Hyperparameters::new()
            .target(Target::LogisticLoss)
            .validate()
            .is_err());
        assert!(Hyperparameters::new()
            .target(Target::LogisticLoss)
            .link(Link::Logistic)
            .validate()
            .is_ok());
    }

    #[test]
    fn fitting_an_empty_store_is_an_error() {
        let mut empty = Ratings::new();
        let mut rng = StdRng::seed_from_u64(0);
        let mut model = FactorizationModel::new(Hyperparameters::new());

        assert!(matches!(
            model.fit(&mut empty, &mut rng),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn parameter_shape_mismatches_are_format_errors() {
        let params = Parameters {
            user_factors: Array2::zeros((3, 2)),
            item_factors: Array2::zeros((4, 2)),
            user_bias: Array1::zeros(2), // wrong: should be 3
            item_bias: Array1::zeros(4),
            global_bias: 0.0,
            min_rating: 1.0,
            max_rating: 5.0,
            link: Link::Identity,
        };
        assert!(matches!(params.validate(), Err(Error::Format(_))));

        let params = Parameters {
            user_factors: Array2::zeros((3, 2)),
            item_factors: Array2::zeros((4, 3)), // wrong width
            user_bias: Array1::zeros(3),
            item_bias: Array1::zeros(4),
            global_bias: 0.0,
            min_rating: 1.0,
            max_rating: 5.0,
            link: Link::Identity,
        };
        assert!(matches!(
            FactorizationModel::with_parameters(Hyperparameters::new(), params),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn parameters_survive_a_serde_roundtrip() {
        let mut ratings = scenario_a();
        let mut rng = StdRng::seed_from_u64(3);

        let mut model = FactorizationModel::new(Hyperparameters::new().num_epochs(5));
        model.fit(&mut ratings, &mut rng).unwrap();

        let serialized = serde_json::to_string(model.parameters().unwrap()).unwrap();
        let restored: Parameters = serde_json::from_str(&serialized).unwrap();
        restored.validate().unwrap();

        assert_eq!(&restored, model.parameters().unwrap());
    }

    #[test]
    fn mae_target_trains() {
        let mut ratings = synthetic_ratings(8, 6);
        let mut rng = StdRng::seed_from_u64(29);

        let hyper = Hyperparameters::new()
            .num_factors(2)
            .num_epochs(10)
            .target(Target::Mae)
            .learn_rate(0.005);
        let mut model = FactorizationModel::new(hyper);

        let rmse = model.fit(&mut ratings, &mut rng).unwrap();
        assert!(rmse.is_finite());
    }

    #[test]
    fn frequency_regularization_trains() {
        let mut ratings = synthetic_ratings(8, 6);
        let mut rng = StdRng::seed_from_u64(31);

        let hyper = Hyperparameters::new()
            .num_factors(2)
            .num_epochs(30)
            .learn_rate(0.05)
            .frequency_regularization(true);
        let mut model = FactorizationModel::new(hyper);

        let rmse = model.fit(&mut ratings, &mut rng).unwrap();
        let baseline = evaluation::constant_rmse(&ratings, ratings.mean_rating()).unwrap();
        assert!(rmse < baseline);
    }
}
