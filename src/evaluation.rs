//! Accuracy metrics for rating predictors.

use crate::data::RatingSource;
use crate::{Error, RatingPredictor};

/// Compute the root mean squared error of `predictor` over `ratings`.
///
/// An empty dataset is an error rather than a silent zero.
pub fn rmse<P: RatingPredictor, S: RatingSource>(predictor: &P, ratings: &S) -> Result<f32, Error> {
    if ratings.is_empty() {
        return Err(Error::InvalidArgument(
            "cannot evaluate on an empty dataset".to_string(),
        ));
    }

    let mut sum_squared = 0.0f64;
    for index in 0..ratings.len() {
        let err = predictor.predict(ratings.user(index), ratings.item(index))?
            - ratings.value(index);
        sum_squared += f64::from(err * err);
    }

    Ok((sum_squared / ratings.len() as f64).sqrt() as f32)
}

/// Compute the mean absolute error of `predictor` over `ratings`.
pub fn mae<P: RatingPredictor, S: RatingSource>(predictor: &P, ratings: &S) -> Result<f32, Error> {
    if ratings.is_empty() {
        return Err(Error::InvalidArgument(
            "cannot evaluate on an empty dataset".to_string(),
        ));
    }

    let mut sum_absolute = 0.0f64;
    for index in 0..ratings.len() {
        let err = predictor.predict(ratings.user(index), ratings.item(index))?
            - ratings.value(index);
        sum_absolute += f64::from(err.abs());
    }

    Ok((sum_absolute / ratings.len() as f64) as f32)
}

/// The RMSE of always predicting `value`; the usual baseline is the
/// training mean.
pub fn constant_rmse<S: RatingSource>(ratings: &S, value: f32) -> Result<f32, Error> {
    rmse(&ConstantPredictor(value), ratings)
}

struct ConstantPredictor(f32);

impl RatingPredictor for ConstantPredictor {
    fn predict(&self, _user: usize, _item: usize) -> Result<f32, Error> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::data::Ratings;

    #[test]
    fn constant_predictor_metrics() {
        let mut ratings = Ratings::new();
        ratings.add(0, 0, 1.0).unwrap();
        ratings.add(0, 1, 3.0).unwrap();
        ratings.add(1, 0, 5.0).unwrap();

        // predicting the mean of {1, 3, 5}
        let rmse = constant_rmse(&ratings, 3.0).unwrap();
        assert_abs_diff_eq!(rmse, (8.0f32 / 3.0).sqrt(), epsilon = 1e-6);

        let mae = mae(&ConstantPredictor(3.0), &ratings).unwrap();
        assert_abs_diff_eq!(mae, 4.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn perfect_predictions_score_zero() {
        let mut ratings = Ratings::new();
        ratings.add(0, 0, 2.0).unwrap();
        ratings.add(1, 1, 2.0).unwrap();

        assert_abs_diff_eq!(constant_rmse(&ratings, 2.0).unwrap(), 0.0);
    }

    #[test]
    fn empty_dataset_is_an_error() {
        let empty = Ratings::new();
        assert!(matches!(
            constant_rmse(&empty, 3.0),
            Err(Error::InvalidArgument(_))
        ));
    }
}
