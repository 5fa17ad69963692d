//! Bounded top-K result container.
//!
//! A `ResultSet` keeps the k smallest-distance `(id, distance)` pairs seen so
//! far, sorted ascending by distance. Workers produce one per query from the
//! local scan; the coordinator folds those partials together with [`merge`]
//! into the global answer.
//!
//! [`merge`]: ResultSet::merge

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error(
    "cannot merge result sets for different queries: \
     ({left_query}, k={left_k}) vs ({right_query}, k={right_k})"
)]
pub struct MergeMismatch {
    pub left_query: i64,
    pub left_k: usize,
    pub right_query: i64,
    pub right_k: usize,
}

/// Fixed-capacity sorted accumulator of the k nearest candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    query_id: i64,
    capacity: usize,
    ids: Vec<i32>,
    distances: Vec<f32>,
}

impl ResultSet {
    /// Create an empty set for `query_id` retaining at most `capacity`
    /// entries.
    pub fn new(query_id: i64, capacity: usize) -> Self {
        Self {
            query_id,
            capacity,
            ids: Vec::new(),
            distances: Vec::new(),
        }
    }

    pub fn query_id(&self) -> i64 {
        self.query_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid entries, never exceeding the capacity.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Insert a candidate, keeping the set sorted and bounded.
    ///
    /// The insertion position comes from a binary search over the valid
    /// prefix; ties land wherever the search puts them, with no further
    /// left/right preference. Candidates landing at or past the capacity are
    /// discarded, and an insertion that overflows the capacity drops the
    /// current worst entry.
    pub fn insert(&mut self, id: i32, distance: f32) {
        let position = self.distances.partition_point(|&d| d < distance);
        if position >= self.capacity {
            return;
        }
        self.ids.insert(position, id);
        self.distances.insert(position, distance);
        self.ids.truncate(self.capacity);
        self.distances.truncate(self.capacity);
    }

    /// Merge two same-query, same-capacity sets into a new one holding the k
    /// smallest entries of their union.
    ///
    /// A two-pointer walk over both sorted inputs, consuming the
    /// smaller-distance head at each step until the output is full or both
    /// inputs are exhausted. Merging is commutative and associative over
    /// same-query sets, so worker reply order never changes the outcome.
    pub fn merge(&self, other: &ResultSet) -> Result<ResultSet, MergeMismatch> {
        if self.query_id != other.query_id || self.capacity != other.capacity {
            return Err(MergeMismatch {
                left_query: self.query_id,
                left_k: self.capacity,
                right_query: other.query_id,
                right_k: other.capacity,
            });
        }

        let mut merged = ResultSet::new(self.query_id, self.capacity);
        let mut i = 0;
        let mut j = 0;
        while merged.len() < merged.capacity && (i < self.len() || j < other.len()) {
            let take_left = if i >= self.len() {
                false
            } else if j >= other.len() {
                true
            } else {
                self.distances[i] <= other.distances[j]
            };
            if take_left {
                merged.insert(self.ids[i], self.distances[i]);
                i += 1;
            } else {
                merged.insert(other.ids[j], other.distances[j]);
                j += 1;
            }
        }
        Ok(merged)
    }

    /// Iterate over the valid `(id, distance)` entries in ascending distance
    /// order.
    pub fn entries(&self) -> impl Iterator<Item = (i32, f32)> + '_ {
        self.ids.iter().copied().zip(self.distances.iter().copied())
    }
}
