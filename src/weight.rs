//! Approximate in-memory sizing of live scheduler state.
//!
//! Weights are advisory: they are computed from `size_of` plus the heap
//! capacity of owned strings and collections, and may be slightly stale when
//! read while the entity is being mutated elsewhere.

use std::collections::BTreeSet;
use std::mem::size_of;

use serde::Serialize;

/// An entity that can report its approximate memory footprint in bytes.
pub trait Weigh {
    fn calc_weight(&self) -> usize;
}

#[allow(clippy::ptr_arg)]
pub fn weigh_string(s: &String) -> usize {
    size_of::<String>() + s.capacity()
}

pub fn weigh_strings(list: &[String]) -> usize {
    list.iter().map(weigh_string).sum()
}

pub fn weigh_set(set: &BTreeSet<String>) -> usize {
    // Per-node overhead is roughly a key plus two pointers.
    set.iter()
        .map(|s| weigh_string(s) + 2 * size_of::<usize>())
        .sum()
}

/// Breakdown of a job's weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobWeight {
    pub total: usize,
    pub logs: usize,
    pub black_lists: usize,
    pub progress: usize,
}

impl std::ops::AddAssign for JobWeight {
    fn add_assign(&mut self, rhs: Self) {
        self.total += rhs.total;
        self.logs += rhs.logs;
        self.black_lists += rhs.black_lists;
        self.progress += rhs.progress;
    }
}
