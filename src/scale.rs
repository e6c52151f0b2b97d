//! The rating scale: the sorted set of distinct observed rating values.

use std::collections::HashMap;

use crate::data::RatingSource;
use crate::Error;

/// Catalog of distinct observed rating values with rank lookup.
///
/// Levels are sorted ascending and unique; `min`/`max` are the first and
/// last level. The rank ("level id") lookup is used by discretized and
/// label-based algorithms built on top of the factor model family.
#[derive(Clone, Debug)]
pub struct RatingScale {
    levels: Vec<f32>,
    // keyed by bit pattern so that exact observed values hash
    level_ids: HashMap<u32, usize>,
}

impl RatingScale {
    /// Build a scale from a list of observed levels.
    ///
    /// Duplicates are collapsed; an empty level set is an error.
    pub fn from_levels(mut levels: Vec<f32>) -> Result<Self, Error> {
        levels.sort_by(f32::total_cmp);
        levels.dedup_by(|a, b| a.to_bits() == b.to_bits());

        if levels.is_empty() {
            return Err(Error::InvalidArgument(
                "a rating scale needs at least one level".to_string(),
            ));
        }

        let level_ids = levels
            .iter()
            .enumerate()
            .map(|(id, level)| (level.to_bits(), id))
            .collect();

        Ok(RatingScale { levels, level_ids })
    }

    /// Build a scale from the distinct values observed in a dataset.
    pub fn from_source<S: RatingSource>(source: &S) -> Result<Self, Error> {
        let values: Vec<f32> = (0..source.len()).map(|index| source.value(index)).collect();
        Self::from_levels(values)
    }

    /// Build a scale covering the union of two scales' level sets.
    pub fn union(first: &RatingScale, second: &RatingScale) -> Result<Self, Error> {
        let mut levels = first.levels.clone();
        levels.extend_from_slice(&second.levels);
        Self::from_levels(levels)
    }

    /// The sorted distinct rating levels.
    pub fn levels(&self) -> &[f32] {
        &self.levels
    }

    /// The smallest observed rating.
    pub fn min(&self) -> f32 {
        self.levels[0]
    }

    /// The largest observed rating.
    pub fn max(&self) -> f32 {
        self.levels[self.levels.len() - 1]
    }

    /// The rank of `value` within the scale, if it is a known level.
    pub fn level_id(&self, value: f32) -> Option<usize> {
        self.level_ids.get(&value.to_bits()).copied()
    }
}
