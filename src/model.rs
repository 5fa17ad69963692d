//! Core data model shared by master and workers.

use crate::metric::Metric;

/// A single indexed vector with its caller-assigned identifier.
///
/// Points are immutable once constructed; adding a point whose id already
/// exists replaces the old one (upsert).
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: i32,
    pub vector: Vec<f32>,
}

impl Point {
    pub fn new(id: i32, vector: Vec<f32>) -> Self {
        Self { id, vector }
    }

    /// Dimensionality of the point's vector.
    pub fn dim(&self) -> usize {
        self.vector.len()
    }
}

/// A search request as broadcast to every worker.
///
/// `query_id` is allocated from a process-wide monotonically increasing
/// counter owned by the coordinator, starting at 1.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub query_id: i64,
    pub k: i32,
    pub vector: Vec<f32>,
    pub metric: Metric,
}

impl Query {
    pub fn new(query_id: i64, k: i32, vector: Vec<f32>, metric: Metric) -> Self {
        Self {
            query_id,
            k,
            vector,
            metric,
        }
    }
}
