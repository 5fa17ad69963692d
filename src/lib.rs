//! Daybreak: a distributed exact nearest-neighbor search engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │        POST /query, GET /query/{id}, POST /points           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Master                            │
//! │   worker registry · ownership routing · query coordinator   │
//! └─────────────────────────────────────────────────────────────┘
//!                  │ framed TCP (one stream per worker)
//!        ┌─────────┴─────────┬───────────────────┐
//!        ▼                   ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Worker    │     │   Worker    │     │   Worker    │
//! │ linear scan │     │ linear scan │     │ linear scan │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! Every query fans out to all registered workers. Each worker brute-force
//! scans its shard and returns a locally sorted top-K partial result; the
//! master merges the partials into the globally correct top-K answer. Points
//! are routed to a single owning worker by `id mod worker_count`.

pub mod master;
pub mod metric;
pub mod model;
pub mod protocol;
pub mod result_set;
pub mod server;
pub mod store;
pub mod worker;

pub use master::{Master, MasterConfig, MasterError, PollOutcome, QueryOutcome};
pub use metric::{DistanceError, Metric};
pub use model::{Point, Query};
pub use result_set::ResultSet;
pub use store::{PointStore, StoreError};
pub use worker::{Worker, WorkerConfig};
