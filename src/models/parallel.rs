//! Multi-threaded SGD epochs.
//!
//! The conflict-free scheme partitions users and items into `T` random
//! groups each, giving a `T` x `T` grid of interaction blocks. An epoch
//! runs `T` sub-epochs; in sub-epoch `s`, worker `t` processes block
//! `(t, (s + t) % T)`. The blocks active in one sub-epoch share no user
//! row and no item row, so the workers can write the shared parameters
//! without locks, and each sub-epoch boundary is a full barrier.
//!
//! The naive scheme splits the shuffled interaction list into flat
//! chunks and lets the workers race on overlapping rows. It converges in
//! practice but its result depends on thread scheduling.

use std::cell::UnsafeCell;

use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

use super::factorization::{sgd_pass, Parameters, UpdateContext};
use crate::data::RatingSource;
use crate::Error;

/// How interactions are distributed over parallel SGD workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partitioning {
    /// Grid partitioning; no two concurrent workers touch the same user
    /// or item parameters.
    ConflictFree,
    /// Flat chunks with unsynchronized Hogwild-style updates; not
    /// reproducible.
    Naive,
}

/// A grid of interaction blocks indexed by (user group, item group).
#[derive(Clone, Debug)]
pub struct Grid {
    pub(crate) blocks: Vec<Vec<Vec<usize>>>,
    pub(crate) num_groups: usize,
}

impl Grid {
    /// The number of user (and item) groups.
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }
}

/// Partition interactions into a grid of `num_groups` x `num_groups`
/// blocks using random user and item group assignments.
///
/// The group count is clamped so that no group is guaranteed empty:
/// it never exceeds the number of distinct user or item ids.
pub fn partition_users_items<S: RatingSource, R: Rng>(
    ratings: &S,
    num_groups: usize,
    rng: &mut R,
) -> Result<Grid, Error> {
    if num_groups == 0 {
        return Err(Error::InvalidArgument(
            "the number of groups must be at least 1".to_string(),
        ));
    }

    let num_users = ratings.max_user_id() + 1;
    let num_items = ratings.max_item_id() + 1;
    let num_groups = num_groups.min(num_users).min(num_items);

    let mut user_groups: Vec<usize> = (0..num_users).map(|user| user % num_groups).collect();
    user_groups.shuffle(rng);
    let mut item_groups: Vec<usize> = (0..num_items).map(|item| item % num_groups).collect();
    item_groups.shuffle(rng);

    let mut blocks = vec![vec![Vec::new(); num_groups]; num_groups];
    for index in 0..ratings.len() {
        let user_group = user_groups[ratings.user(index)];
        let item_group = item_groups[ratings.item(index)];
        blocks[user_group][item_group].push(index);
    }

    for row in blocks.iter_mut() {
        for block in row.iter_mut() {
            block.shuffle(rng);
        }
    }

    Ok(Grid { blocks, num_groups })
}

/// Split a shuffled interaction order into `num_workers` contiguous
/// chunks of near-equal size.
pub(crate) fn flat_partition(order: &[usize], num_workers: usize) -> Vec<Vec<usize>> {
    let chunk_size = (order.len() + num_workers - 1) / num_workers.max(1);
    if chunk_size == 0 {
        return vec![Vec::new()];
    }
    order.chunks(chunk_size).map(<[usize]>::to_vec).collect()
}

/// Shared-parameter cell for lock-free updates.
///
/// Safety rests on the epoch schedule: within one sub-epoch every worker
/// holds a block whose user and item rows are disjoint from every other
/// active block, so no two threads ever write the same row, and the
/// rayon join at the end of each sub-epoch is the barrier before rows
/// change hands.
struct ParamCell<'a> {
    inner: UnsafeCell<&'a mut Parameters>,
}

unsafe impl Sync for ParamCell<'_> {}

impl<'a> ParamCell<'a> {
    fn new(params: &'a mut Parameters) -> Self {
        ParamCell {
            inner: UnsafeCell::new(params),
        }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn get(&self) -> &mut Parameters {
        &mut **self.inner.get()
    }
}

/// Run one conflict-free epoch over the grid.
pub(crate) fn run_epoch<S: RatingSource + Sync, R: Rng>(
    params: &mut Parameters,
    ratings: &S,
    grid: &Grid,
    ctx: &UpdateContext<'_>,
    rng: &mut R,
) {
    let mut offsets: Vec<usize> = (0..grid.num_groups).collect();
    offsets.shuffle(rng);

    let cell = ParamCell::new(params);
    for &offset in &offsets {
        (0..grid.num_groups).into_par_iter().for_each(|worker| {
            let block = &grid.blocks[worker][(offset + worker) % grid.num_groups];
            if block.is_empty() {
                return;
            }
            let params = unsafe { cell.get() };
            sgd_pass(params, ratings, block, ctx, true, true);
        });
    }
}

/// Run one epoch over flat chunks with unsynchronized updates.
pub(crate) fn run_epoch_naive<S: RatingSource + Sync>(
    params: &mut Parameters,
    ratings: &S,
    chunks: &[Vec<usize>],
    ctx: &UpdateContext<'_>,
) {
    let cell = ParamCell::new(params);
    chunks.par_iter().for_each(|chunk| {
        if chunk.is_empty() {
            return;
        }
        let params = unsafe { cell.get() };
        sgd_pass(params, ratings, chunk, ctx, true, true);
    });
}
