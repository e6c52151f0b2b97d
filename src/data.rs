//! Sparse storage for (user, item, rating) interaction data.
//!
//! [`Ratings`] keeps three parallel sequences (users, items, values) and
//! lazily builds secondary indices over them: per-user and per-item index
//! buckets, per-entity counts, and a cached random permutation used to
//! visit interactions in shuffled order during training. A built index is
//! maintained incrementally on `add` and repaired in a single pass on
//! removal, so it is always consistent with the data it describes.

use std::hash::Hasher;

use rand::seq::SliceRandom;
use rand::Rng;
use siphasher::sip::SipHasher;

use crate::{Error, ItemId, UserId};

/// A single observed (user, item, value) triple.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interaction {
    /// The user who produced the rating.
    pub user_id: UserId,
    /// The rated item.
    pub item_id: ItemId,
    /// The observed rating value.
    pub value: f32,
}

/// Read-only, index-addressable access to a sequence of interactions.
///
/// Implemented by the owning store and by index-restricted views of it;
/// the concrete variant is chosen once at construction.
pub trait RatingSource {
    /// Number of interactions.
    fn len(&self) -> usize;

    /// Whether the source holds no interactions.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The user id of the interaction at `index`.
    fn user(&self, index: usize) -> UserId;

    /// The item id of the interaction at `index`.
    fn item(&self, index: usize) -> ItemId;

    /// The rating value of the interaction at `index`.
    fn value(&self, index: usize) -> f32;

    /// The highest user id seen.
    fn max_user_id(&self) -> UserId;

    /// The highest item id seen.
    fn max_item_id(&self) -> ItemId;

    /// Streaming mean of all rating values.
    fn mean_rating(&self) -> f32 {
        let mut sum = 0.0f64;
        for index in 0..self.len() {
            sum += f64::from(self.value(index));
        }
        (sum / self.len() as f64) as f32
    }
}

/// Growable in-memory store of rating triples with lazy secondary indices.
#[derive(Debug)]
pub struct Ratings {
    users: Vec<UserId>,
    items: Vec<ItemId>,
    values: Vec<f32>,
    max_user_id: UserId,
    max_item_id: ItemId,
    /// `Some` for the fixed-capacity variant, which rejects growth past
    /// its preallocated size and forbids removal.
    capacity: Option<usize>,
    by_user: Option<Vec<Vec<usize>>>,
    by_item: Option<Vec<Vec<usize>>>,
    count_by_user: Option<Vec<usize>>,
    count_by_item: Option<Vec<usize>>,
    random_index: Option<Vec<usize>>,
}

impl Default for Ratings {
    fn default() -> Self {
        Self::new()
    }
}

impl Ratings {
    /// Create an empty store.
    pub fn new() -> Self {
        Ratings {
            users: Vec::new(),
            items: Vec::new(),
            values: Vec::new(),
            max_user_id: 0,
            max_item_id: 0,
            capacity: None,
            by_user: None,
            by_item: None,
            count_by_user: None,
            count_by_item: None,
            random_index: None,
        }
    }

    /// Create a fixed-capacity store.
    ///
    /// Adding more than `capacity` interactions fails with
    /// [`Error::CapacityExceeded`]; removal is not supported.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut ratings = Ratings::new();
        ratings.users.reserve_exact(capacity);
        ratings.items.reserve_exact(capacity);
        ratings.values.reserve_exact(capacity);
        ratings.capacity = Some(capacity);
        ratings
    }

    /// Build a store around existing sequences without copying them.
    pub fn from_parts(
        users: Vec<UserId>,
        items: Vec<ItemId>,
        values: Vec<f32>,
    ) -> Result<Self, Error> {
        if users.len() != items.len() || users.len() != values.len() {
            return Err(Error::InvalidArgument(format!(
                "user, item and value sequences must have equal lengths, got {}/{}/{}",
                users.len(),
                items.len(),
                values.len()
            )));
        }

        let max_user_id = users.iter().copied().max().unwrap_or(0);
        let max_item_id = items.iter().copied().max().unwrap_or(0);

        Ok(Ratings {
            users,
            items,
            values,
            max_user_id,
            max_item_id,
            capacity: None,
            by_user: None,
            by_item: None,
            count_by_user: None,
            count_by_item: None,
            random_index: None,
        })
    }

    /// Append a new interaction.
    ///
    /// Already-built per-entity indices are maintained in place instead of
    /// being rebuilt; the cached random permutation is invalidated because
    /// the index range changed.
    pub fn add(&mut self, user: UserId, item: ItemId, value: f32) -> Result<(), Error> {
        if let Some(capacity) = self.capacity {
            if self.users.len() == capacity {
                return Err(Error::CapacityExceeded { capacity });
            }
        }

        let index = self.users.len();

        self.users.push(user);
        self.items.push(item);
        self.values.push(value);

        if user > self.max_user_id {
            self.max_user_id = user;
        }
        if item > self.max_item_id {
            self.max_item_id = item;
        }

        if let Some(by_user) = self.by_user.as_mut() {
            if user >= by_user.len() {
                by_user.resize_with(user + 1, Vec::new);
            }
            by_user[user].push(index);
        }
        if let Some(by_item) = self.by_item.as_mut() {
            if item >= by_item.len() {
                by_item.resize_with(item + 1, Vec::new);
            }
            by_item[item].push(index);
        }
        if let Some(counts) = self.count_by_user.as_mut() {
            if user >= counts.len() {
                counts.resize(user + 1, 0);
            }
            counts[user] += 1;
        }
        if let Some(counts) = self.count_by_item.as_mut() {
            if item >= counts.len() {
                counts.resize(item + 1, 0);
            }
            counts[item] += 1;
        }

        self.random_index = None;

        Ok(())
    }

    /// Remove the interaction at `index`.
    pub fn remove_at(&mut self, index: usize) -> Result<(), Error> {
        self.check_removable()?;
        if index >= self.users.len() {
            return Err(Error::InvalidArgument(format!(
                "index {} out of bounds for store of length {}",
                index,
                self.users.len()
            )));
        }

        let user = self.users[index];
        let item = self.items[index];
        self.remove_positions(&[index], &[user], &[item]);

        Ok(())
    }

    /// Remove every interaction involving `user`.
    ///
    /// The maximum user id shrinks only if the removed id was the maximum.
    pub fn remove_user(&mut self, user: UserId) -> Result<(), Error> {
        self.check_removable()?;

        let positions: Vec<usize> = (0..self.users.len())
            .filter(|&index| self.users[index] == user)
            .collect();
        let items: Vec<ItemId> = {
            let mut touched: Vec<ItemId> =
                positions.iter().map(|&index| self.items[index]).collect();
            touched.sort_unstable();
            touched.dedup();
            touched
        };

        self.remove_positions(&positions, &[user], &items);

        Ok(())
    }

    /// Remove every interaction involving `item`.
    pub fn remove_item(&mut self, item: ItemId) -> Result<(), Error> {
        self.check_removable()?;

        let positions: Vec<usize> = (0..self.items.len())
            .filter(|&index| self.items[index] == item)
            .collect();
        let users: Vec<UserId> = {
            let mut touched: Vec<UserId> =
                positions.iter().map(|&index| self.users[index]).collect();
            touched.sort_unstable();
            touched.dedup();
            touched
        };

        self.remove_positions(&positions, &users, &[item]);

        Ok(())
    }

    fn check_removable(&self) -> Result<(), Error> {
        if self.capacity.is_some() {
            Err(Error::Unsupported(
                "fixed-capacity stores do not support removal",
            ))
        } else {
            Ok(())
        }
    }

    /// Delete the interactions at the given (sorted) positions and repair
    /// the secondary indices: removed positions are dropped from their
    /// buckets and surviving entries are shifted down past the holes, all
    /// in one pass over the index caches.
    fn remove_positions(
        &mut self,
        positions: &[usize],
        touched_users: &[UserId],
        touched_items: &[ItemId],
    ) {
        if positions.is_empty() {
            return;
        }

        let mut keep = vec![true; self.users.len()];
        for &position in positions {
            keep[position] = false;
        }

        let mut write = 0;
        for read in 0..self.users.len() {
            if keep[read] {
                self.users[write] = self.users[read];
                self.items[write] = self.items[read];
                self.values[write] = self.values[read];
                write += 1;
            }
        }
        self.users.truncate(write);
        self.items.truncate(write);
        self.values.truncate(write);

        if let Some(by_user) = self.by_user.as_mut() {
            repair_buckets(by_user, positions);
        }
        if let Some(by_item) = self.by_item.as_mut() {
            repair_buckets(by_item, positions);
        }
        if let Some(counts) = self.count_by_user.as_mut() {
            for &user in touched_users {
                if user < counts.len() {
                    counts[user] = self.users.iter().filter(|&&u| u == user).count();
                }
            }
        }
        if let Some(counts) = self.count_by_item.as_mut() {
            for &item in touched_items {
                if item < counts.len() {
                    counts[item] = self.items.iter().filter(|&&i| i == item).count();
                }
            }
        }

        if touched_users.contains(&self.max_user_id) {
            self.max_user_id = self.users.iter().copied().max().unwrap_or(0);
        }
        if touched_items.contains(&self.max_item_id) {
            self.max_item_id = self.items.iter().copied().max().unwrap_or(0);
        }

        self.random_index = None;
    }

    /// Per-user buckets of interaction indices, built on first access.
    pub fn by_user(&mut self) -> &[Vec<usize>] {
        if self.by_user.is_none() {
            self.build_user_index();
        }
        self.by_user.as_deref().unwrap()
    }

    /// Per-item buckets of interaction indices, built on first access.
    pub fn by_item(&mut self) -> &[Vec<usize>] {
        if self.by_item.is_none() {
            self.build_item_index();
        }
        self.by_item.as_deref().unwrap()
    }

    /// Rebuild the per-user index: one bucket per id in `[0, max_user_id]`,
    /// filled in a single linear pass.
    pub fn build_user_index(&mut self) {
        let mut by_user = vec![Vec::new(); self.max_user_id + 1];
        for (index, &user) in self.users.iter().enumerate() {
            by_user[user].push(index);
        }
        self.by_user = Some(by_user);
    }

    /// Rebuild the per-item index.
    pub fn build_item_index(&mut self) {
        let mut by_item = vec![Vec::new(); self.max_item_id + 1];
        for (index, &item) in self.items.iter().enumerate() {
            by_item[item].push(index);
        }
        self.by_item = Some(by_item);
    }

    /// Number of interactions per user id, built on first access.
    pub fn count_by_user(&mut self) -> &[usize] {
        if self.count_by_user.is_none() {
            let mut counts = vec![0; self.max_user_id + 1];
            for &user in &self.users {
                counts[user] += 1;
            }
            self.count_by_user = Some(counts);
        }
        self.count_by_user.as_deref().unwrap()
    }

    /// Number of interactions per item id, built on first access.
    pub fn count_by_item(&mut self) -> &[usize] {
        if self.count_by_item.is_none() {
            let mut counts = vec![0; self.max_item_id + 1];
            for &item in &self.items {
                counts[item] += 1;
            }
            self.count_by_item = Some(counts);
        }
        self.count_by_item.as_deref().unwrap()
    }

    /// A cached random permutation of `[0, len)`.
    ///
    /// Built with a Fisher-Yates shuffle on first access and rebuilt only
    /// when the number of interactions has changed since.
    pub fn random_index<R: Rng>(&mut self, rng: &mut R) -> &[usize] {
        let stale = match self.random_index.as_ref() {
            Some(permutation) => permutation.len() != self.users.len(),
            None => true,
        };
        if stale {
            let mut permutation: Vec<usize> = (0..self.users.len()).collect();
            permutation.shuffle(rng);
            self.random_index = Some(permutation);
        }
        self.random_index.as_deref().unwrap()
    }

    /// Find the index of the first interaction matching `user` and `item`
    /// by scanning the whole store.
    pub fn find_index(&self, user: UserId, item: ItemId) -> Option<usize> {
        (0..self.users.len()).find(|&index| self.users[index] == user && self.items[index] == item)
    }

    /// Find a matching index among the supplied candidates only.
    ///
    /// Passing a per-user or per-item bucket makes the lookup linear in
    /// the bucket size instead of the store size.
    pub fn find_index_among(
        &self,
        user: UserId,
        item: ItemId,
        candidates: &[usize],
    ) -> Option<usize> {
        candidates
            .iter()
            .copied()
            .find(|&index| self.users[index] == user && self.items[index] == item)
    }

    /// Like [`Ratings::find_index`], but a missing pair is a hard error.
    pub fn get_index(&self, user: UserId, item: ItemId) -> Result<usize, Error> {
        self.find_index(user, item)
            .ok_or(Error::NotFound { user, item })
    }

    /// Like [`Ratings::find_index_among`], but a missing pair is a hard error.
    pub fn get_index_among(
        &self,
        user: UserId,
        item: ItemId,
        candidates: &[usize],
    ) -> Result<usize, Error> {
        self.find_index_among(user, item, candidates)
            .ok_or(Error::NotFound { user, item })
    }

    /// The rating of `user` for `item`, if one was observed.
    pub fn try_get(&self, user: UserId, item: ItemId) -> Option<f32> {
        self.find_index(user, item).map(|index| self.values[index])
    }

    /// The rating of `user` for `item`; a missing pair is a hard error.
    pub fn get(&self, user: UserId, item: ItemId) -> Result<f32, Error> {
        self.get_index(user, item).map(|index| self.values[index])
    }

    /// A read-only view restricted to the given store positions.
    ///
    /// The view shares the backing sequences and keeps the parent's id
    /// space, so models sized against the parent remain valid.
    pub fn subset(&self, indices: Vec<usize>) -> RatingsSubset<'_> {
        RatingsSubset {
            parent: self,
            indices,
        }
    }

    /// All interactions as owned triples, in store order.
    pub fn interactions(&self) -> Vec<Interaction> {
        (0..self.users.len())
            .map(|index| Interaction {
                user_id: self.users[index],
                item_id: self.items[index],
                value: self.values[index],
            })
            .collect()
    }
}

impl RatingSource for Ratings {
    fn len(&self) -> usize {
        self.users.len()
    }

    fn user(&self, index: usize) -> UserId {
        self.users[index]
    }

    fn item(&self, index: usize) -> ItemId {
        self.items[index]
    }

    fn value(&self, index: usize) -> f32 {
        self.values[index]
    }

    fn max_user_id(&self) -> UserId {
        self.max_user_id
    }

    fn max_item_id(&self) -> ItemId {
        self.max_item_id
    }
}

/// Drop removed positions from every bucket and shift the survivors down
/// by the number of removed positions below them. `removed` must be sorted.
fn repair_buckets(buckets: &mut [Vec<usize>], removed: &[usize]) {
    for bucket in buckets.iter_mut() {
        bucket.retain(|index| removed.binary_search(index).is_err());
        for index in bucket.iter_mut() {
            *index -= removed.partition_point(|&position| position < *index);
        }
    }
}

/// A read-only view over a subset of a parent store's positions.
pub struct RatingsSubset<'a> {
    parent: &'a Ratings,
    indices: Vec<usize>,
}

impl<'a> RatingsSubset<'a> {
    /// The parent-store position backing view position `index`.
    pub fn parent_index(&self, index: usize) -> usize {
        self.indices[index]
    }

    /// Copy the viewed interactions into an independent store.
    ///
    /// The copy keeps the parent's id space so that entity ranges agree
    /// between complementary subsets.
    pub fn to_ratings(&self) -> Ratings {
        let mut ratings = Ratings::new();
        for &index in &self.indices {
            // Infallible: the target store is not fixed-capacity.
            let _ = ratings.add(
                self.parent.users[index],
                self.parent.items[index],
                self.parent.values[index],
            );
        }
        ratings.max_user_id = self.parent.max_user_id;
        ratings.max_item_id = self.parent.max_item_id;
        ratings
    }
}

impl<'a> RatingSource for RatingsSubset<'a> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn user(&self, index: usize) -> UserId {
        self.parent.users[self.indices[index]]
    }

    fn item(&self, index: usize) -> ItemId {
        self.parent.items[self.indices[index]]
    }

    fn value(&self, index: usize) -> f32 {
        self.parent.values[self.indices[index]]
    }

    fn max_user_id(&self) -> UserId {
        self.parent.max_user_id
    }

    fn max_item_id(&self) -> ItemId {
        self.parent.max_item_id
    }
}

/// Split a store into `(train, test)` by shuffling interaction positions.
///
/// `test_fraction` must lie strictly between 0 and 1.
pub fn ratio_split<R: Rng>(
    ratings: &Ratings,
    rng: &mut R,
    test_fraction: f32,
) -> Result<(Ratings, Ratings), Error> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(Error::InvalidArgument(format!(
            "test fraction must lie strictly between 0 and 1, got {}",
            test_fraction
        )));
    }

    let mut positions: Vec<usize> = (0..ratings.len()).collect();
    positions.shuffle(rng);

    let num_test = (test_fraction * ratings.len() as f32) as usize;
    let (test_positions, train_positions) = positions.split_at(num_test);

    Ok((
        ratings.subset(train_positions.to_vec()).to_ratings(),
        ratings.subset(test_positions.to_vec()).to_ratings(),
    ))
}

/// Split a store into `(train, test)` so that each user's interactions
/// land wholly on one side, decided by a keyed hash of the user id.
pub fn user_based_split<R: Rng>(
    ratings: &Ratings,
    rng: &mut R,
    test_fraction: f32,
) -> Result<(Ratings, Ratings), Error> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(Error::InvalidArgument(format!(
            "test fraction must lie strictly between 0 and 1, got {}",
            test_fraction
        )));
    }

    let denominator = 100_000u64;
    let cutoff = (test_fraction * denominator as f32) as u64;
    let (key_0, key_1) = (rng.gen::<u64>(), rng.gen::<u64>());

    let is_test = |user: UserId| {
        let mut hasher = SipHasher::new_with_keys(key_0, key_1);
        hasher.write_usize(user);
        hasher.finish() % denominator < cutoff
    };

    let mut train_positions = Vec::new();
    let mut test_positions = Vec::new();
    for index in 0..ratings.len() {
        if is_test(ratings.users[index]) {
            test_positions.push(index);
        } else {
            train_positions.push(index);
        }
    }

    Ok((
        ratings.subset(train_positions).to_ratings(),
        ratings.subset(test_positions).to_ratings(),
    ))
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn scenario_a() -> Ratings {
        let mut ratings = Ratings::new();
        ratings.add(0, 0, 3.0).unwrap();
        ratings.add(0, 1, 4.0).unwrap();
        ratings.add(1, 0, 2.0).unwrap();
        ratings
    }

    #[test]
    fn add_tracks_maxima_count_and_average() {
        let ratings = scenario_a();

        assert_eq!(ratings.max_user_id(), 1);
        assert_eq!(ratings.max_item_id(), 1);
        assert_eq!(ratings.len(), 3);
        assert!((ratings.mean_rating() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn get_index_roundtrip() {
        let ratings = scenario_a();

        for (user, item, value) in [(0, 0, 3.0), (0, 1, 4.0), (1, 0, 2.0)] {
            let index = ratings.get_index(user, item).unwrap();
            assert_eq!(ratings.user(index), user);
            assert_eq!(ratings.item(index), item);
            assert_eq!(ratings.value(index), value);
        }

        assert!(matches!(
            ratings.get_index(1, 1),
            Err(Error::NotFound { user: 1, item: 1 })
        ));
        assert!(ratings.find_index(7, 7).is_none());
    }

    #[test]
    fn lookup_restricted_to_candidates() {
        let mut ratings = scenario_a();

        let bucket = ratings.by_user()[0].clone();
        assert_eq!(ratings.find_index_among(0, 1, &bucket), Some(1));
        // the pair exists, but not among user 1's indices
        let other = ratings.by_user()[1].clone();
        assert!(ratings.find_index_among(0, 1, &other).is_none());
    }

    #[test]
    fn buckets_contain_their_own_indices() {
        let mut ratings = scenario_a();

        let by_user = ratings.by_user().to_vec();
        let by_item = ratings.by_item().to_vec();
        for index in 0..ratings.len() {
            assert!(by_user[ratings.user(index)].contains(&index));
            assert!(by_item[ratings.item(index)].contains(&index));
        }
    }

    #[test]
    fn counts_match_bucket_lengths() {
        let mut ratings = scenario_a();

        let by_user = ratings.by_user().to_vec();
        let counts = ratings.count_by_user().to_vec();
        assert_eq!(by_user.len(), counts.len());
        for (bucket, count) in by_user.iter().zip(&counts) {
            assert_eq!(bucket.len(), *count);
        }
    }

    #[test]
    fn add_maintains_built_indices() {
        let mut ratings = scenario_a();
        ratings.by_user();
        ratings.by_item();
        ratings.count_by_user();

        ratings.add(2, 3, 5.0).unwrap();

        assert_eq!(ratings.by_user()[2], vec![3]);
        assert_eq!(ratings.by_item()[3], vec![3]);
        assert_eq!(ratings.count_by_user()[2], 1);
        assert_eq!(ratings.max_item_id(), 3);
    }

    #[test]
    fn random_index_is_a_permutation() {
        let mut ratings = scenario_a();
        ratings.add(1, 1, 1.0).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let mut permutation = ratings.random_index(&mut rng).to_vec();
        permutation.sort_unstable();
        assert_eq!(permutation, vec![0, 1, 2, 3]);
    }

    #[test]
    fn random_index_rebuilt_after_count_change() {
        let mut ratings = scenario_a();
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(ratings.random_index(&mut rng).len(), 3);
        ratings.add(1, 1, 1.0).unwrap();
        assert_eq!(ratings.random_index(&mut rng).len(), 4);
    }

    #[test]
    fn remove_user_keeps_unrelated_max() {
        let mut ratings = scenario_a();
        ratings.remove_user(0).unwrap();

        assert_eq!(ratings.len(), 1);
        assert_eq!(ratings.user(0), 1);
        assert_eq!(ratings.item(0), 0);
        assert_eq!(ratings.value(0), 2.0);
        // removed id 0 was not the maximum, so the maximum is untouched
        assert_eq!(ratings.max_user_id(), 1);
    }

    #[test]
    fn remove_user_shrinks_max_when_it_was_the_max() {
        let mut ratings = scenario_a();
        ratings.remove_user(1).unwrap();

        assert_eq!(ratings.len(), 2);
        assert_eq!(ratings.max_user_id(), 0);
    }

    #[test]
    fn removal_repairs_built_indices() {
        let mut ratings = scenario_a();
        ratings.add(2, 1, 5.0).unwrap();
        ratings.by_user();
        ratings.by_item();
        ratings.count_by_user();
        ratings.count_by_item();

        // removes positions 0 and 1; surviving positions shift down by two
        ratings.remove_user(0).unwrap();

        assert_eq!(ratings.by_user()[0], Vec::<usize>::new());
        assert_eq!(ratings.by_user()[1], vec![0]);
        assert_eq!(ratings.by_user()[2], vec![1]);
        assert_eq!(ratings.by_item()[0], vec![0]);
        assert_eq!(ratings.by_item()[1], vec![1]);
        assert_eq!(ratings.count_by_user()[0], 0);
        assert_eq!(ratings.count_by_item()[1], 1);
    }

    #[test]
    fn remove_at_repairs_item_side() {
        let mut ratings = scenario_a();
        ratings.by_item();

        let index = ratings.get_index(0, 0).unwrap();
        ratings.remove_at(index).unwrap();

        assert_eq!(ratings.len(), 2);
        assert_eq!(ratings.by_item()[0], vec![1]);
        assert_eq!(ratings.by_item()[1], vec![0]);
        assert!(ratings.find_index(0, 0).is_none());
    }

    #[test]
    fn fixed_capacity_store_rejects_overflow_and_removal() {
        let mut ratings = Ratings::with_capacity(2);
        ratings.add(0, 0, 1.0).unwrap();
        ratings.add(0, 1, 2.0).unwrap();

        assert!(matches!(
            ratings.add(1, 0, 3.0),
            Err(Error::CapacityExceeded { capacity: 2 })
        ));
        assert!(matches!(ratings.remove_at(0), Err(Error::Unsupported(_))));
        assert!(matches!(ratings.remove_user(0), Err(Error::Unsupported(_))));
    }

    #[test]
    fn from_parts_shares_sequences() {
        let ratings = Ratings::from_parts(vec![0, 3], vec![1, 2], vec![4.0, 5.0]).unwrap();

        assert_eq!(ratings.len(), 2);
        assert_eq!(ratings.max_user_id(), 3);
        assert_eq!(ratings.max_item_id(), 2);

        assert!(matches!(
            Ratings::from_parts(vec![0], vec![1, 2], vec![4.0]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn subset_exposes_selected_positions_only() {
        let ratings = scenario_a();
        let view = ratings.subset(vec![2, 0]);

        assert_eq!(view.len(), 2);
        assert_eq!(view.user(0), 1);
        assert_eq!(view.value(1), 3.0);
        assert_eq!(view.max_user_id(), 1);
        assert_eq!(view.parent_index(0), 2);
    }

    #[test]
    fn ratio_split_partitions_all_interactions() {
        let mut ratings = Ratings::new();
        for index in 0..20 {
            ratings.add(index % 5, index % 7, (index % 3) as f32).unwrap();
        }

        let mut rng = StdRng::seed_from_u64(3);
        let (train, test) = ratio_split(&ratings, &mut rng, 0.25).unwrap();

        assert_eq!(train.len() + test.len(), 20);
        assert_eq!(test.len(), 5);
        // id space preserved on both sides
        assert_eq!(train.max_user_id(), ratings.max_user_id());
        assert_eq!(test.max_item_id(), ratings.max_item_id());
    }

    #[test]
    fn invalid_split_ratio_is_rejected() {
        let ratings = scenario_a();
        let mut rng = StdRng::seed_from_u64(3);

        assert!(matches!(
            ratio_split(&ratings, &mut rng, 0.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            user_based_split(&ratings, &mut rng, 1.5),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn user_based_split_keeps_users_on_one_side() {
        let mut ratings = Ratings::new();
        for user in 0..50 {
            for item in 0..3 {
                ratings.add(user, item, 1.0).unwrap();
            }
        }

        let mut rng = StdRng::seed_from_u64(11);
        let (train, test) = user_based_split(&ratings, &mut rng, 0.3).unwrap();

        assert_eq!(train.len() + test.len(), 150);

        let train_users: std::collections::HashSet<UserId> =
            (0..train.len()).map(|index| train.user(index)).collect();
        for index in 0..test.len() {
            assert!(!train_users.contains(&test.user(index)));
        }
    }
}
