//! Scatter-gather query coordinator.
//!
//! One `QueryState` per in-flight query id tracks which workers still owe a
//! reply and the running merged result. Both live in a single map under one
//! lock so that observing completion and consuming the result is one
//! critical section; two concurrent pollers can never both see an empty
//! outstanding set and double-consume.
//!
//! Completion is signaled through a condvar rather than busy-polling:
//! [`QueryCoordinator::wait`] sleeps until the final reply (or the query
//! deadline) and preserves the same exactly-once consumption semantics as
//! [`QueryCoordinator::poll`].

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::metric::Metric;
use crate::model::Query;
use crate::protocol::Message;
use crate::result_set::ResultSet;

use super::registry::WorkerRegistry;
use super::MasterError;

/// Outcome of consuming a completed query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// Merged `(id, distance)` pairs, ascending by distance.
    pub results: Vec<(i32, f32)>,
    /// True when every worker that was queried reported back.
    pub complete: bool,
    /// Workers that never reported: lost connections plus deadline
    /// stragglers.
    pub lost_workers: usize,
}

/// Result of asking for a query's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The query id was never submitted, or its result was already consumed.
    Unknown,
    /// Workers are still reporting and the deadline has not passed.
    Pending,
    /// The answer, handed out exactly once.
    Ready(QueryOutcome),
}

#[derive(Debug)]
struct QueryState {
    outstanding: HashSet<u64>,
    merged: Option<ResultSet>,
    deadline: Instant,
    lost_workers: usize,
}

/// Broadcasts queries, tracks per-worker completion, and merges partials.
pub struct QueryCoordinator {
    registry: Arc<WorkerRegistry>,
    queries: Mutex<HashMap<i64, QueryState>>,
    completed: Condvar,
    next_query_id: AtomicI64,
    query_deadline: Duration,
}

impl QueryCoordinator {
    pub fn new(registry: Arc<WorkerRegistry>, query_deadline: Duration) -> Self {
        Self {
            registry,
            queries: Mutex::new(HashMap::new()),
            completed: Condvar::new(),
            next_query_id: AtomicI64::new(1),
            query_deadline,
        }
    }

    /// Broadcast a search to every currently registered worker.
    ///
    /// The outstanding worker set is recorded before anything is enqueued,
    /// so a reply can never race the query state into existence. Workers
    /// joining after submission are not consulted. A worker whose queue
    /// rejects the message is counted lost for this query up front.
    pub fn submit(
        &self,
        vector: Vec<f32>,
        metric: Metric,
        k: i32,
    ) -> Result<i64, MasterError> {
        if k <= 0 {
            return Err(MasterError::InvalidK(k));
        }
        let workers = self.registry.snapshot();
        if workers.is_empty() {
            return Err(MasterError::NoWorkersAvailable);
        }

        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let query = Query::new(query_id, k, vector, metric);

        {
            let mut queries = self.queries.lock();
            queries.insert(
                query_id,
                QueryState {
                    outstanding: workers.iter().map(|w| w.worker_id()).collect(),
                    merged: None,
                    deadline: Instant::now() + self.query_deadline,
                    lost_workers: 0,
                },
            );
        }

        for worker in &workers {
            if let Err(e) = worker.enqueue(Message::FindKNearest(query.clone())) {
                warn!(
                    worker_id = worker.worker_id(),
                    query_id,
                    error = %e,
                    "could not dispatch search to worker"
                );
                self.abandon_worker(query_id, worker.worker_id());
            }
        }
        Ok(query_id)
    }

    /// Fold one worker's partial result into the query's running answer and
    /// retire the worker from the outstanding set.
    pub fn on_worker_reply(&self, query_id: i64, worker_id: u64, partial: ResultSet) {
        let mut queries = self.queries.lock();
        let Some(state) = queries.get_mut(&query_id) else {
            warn!(query_id, worker_id, "reply for unknown or consumed query");
            return;
        };
        if !state.outstanding.remove(&worker_id) {
            warn!(query_id, worker_id, "duplicate reply from worker");
        }
        state.merged = Some(match state.merged.take() {
            None => partial,
            Some(accumulated) => match accumulated.merge(&partial) {
                Ok(merged) => merged,
                Err(e) => {
                    warn!(query_id, worker_id, error = %e, "discarding mismatched partial");
                    accumulated
                }
            },
        });
        if state.outstanding.is_empty() {
            self.completed.notify_all();
        }
    }

    /// Retire a departed worker from every outstanding set. Queries that
    /// were only waiting on it complete with what they have, flagging the
    /// loss.
    pub fn on_worker_lost(&self, worker_id: u64) {
        let mut queries = self.queries.lock();
        let mut unblocked = false;
        for state in queries.values_mut() {
            if state.outstanding.remove(&worker_id) {
                state.lost_workers += 1;
                unblocked |= state.outstanding.is_empty();
            }
        }
        if unblocked {
            self.completed.notify_all();
        }
    }

    /// Non-blocking check for a query's answer.
    ///
    /// Consuming is exactly-once: the first `Ready` removes the state, and
    /// every later call for the same id reports `Unknown`, never `Pending`.
    /// A query past its deadline finalizes with whatever partials arrived.
    pub fn poll(&self, query_id: i64) -> PollOutcome {
        let mut queries = self.queries.lock();
        Self::poll_locked(&mut queries, query_id)
    }

    /// Block until the query completes, its deadline passes, or `timeout`
    /// elapses. Same consumption semantics as [`poll`](Self::poll).
    pub fn wait(&self, query_id: i64, timeout: Duration) -> PollOutcome {
        let give_up = Instant::now() + timeout;
        let mut queries = self.queries.lock();
        loop {
            match Self::poll_locked(&mut queries, query_id) {
                PollOutcome::Pending => {
                    let now = Instant::now();
                    if now >= give_up {
                        return PollOutcome::Pending;
                    }
                    let deadline = queries
                        .get(&query_id)
                        .map(|state| state.deadline)
                        .unwrap_or(give_up);
                    let _ = self
                        .completed
                        .wait_until(&mut queries, deadline.min(give_up));
                }
                outcome => return outcome,
            }
        }
    }

    /// Number of queries still tracked (unconsumed).
    pub fn active_queries(&self) -> usize {
        self.queries.lock().len()
    }

    fn abandon_worker(&self, query_id: i64, worker_id: u64) {
        let mut queries = self.queries.lock();
        if let Some(state) = queries.get_mut(&query_id) {
            if state.outstanding.remove(&worker_id) {
                state.lost_workers += 1;
                if state.outstanding.is_empty() {
                    self.completed.notify_all();
                }
            }
        }
    }

    fn poll_locked(queries: &mut HashMap<i64, QueryState>, query_id: i64) -> PollOutcome {
        let Entry::Occupied(entry) = queries.entry(query_id) else {
            return PollOutcome::Unknown;
        };
        let expired = Instant::now() >= entry.get().deadline;
        if !entry.get().outstanding.is_empty() && !expired {
            return PollOutcome::Pending;
        }

        let state = entry.remove();
        let lost_workers = state.lost_workers + state.outstanding.len();
        let results = state
            .merged
            .map(|merged| merged.entries().collect())
            .unwrap_or_default();
        PollOutcome::Ready(QueryOutcome {
            results,
            complete: lost_workers == 0,
            lost_workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::registry::WorkerHandle;
    use std::sync::mpsc::Receiver;

    fn coordinator_with_workers(
        n: usize,
        deadline: Duration,
    ) -> (QueryCoordinator, Vec<Receiver<Message>>) {
        let registry = Arc::new(WorkerRegistry::new());
        let mut receivers = Vec::new();
        for _ in 0..n {
            let id = registry.allocate_id();
            let (handle, rx) = WorkerHandle::connected(id, "127.0.0.1:1".parse().unwrap());
            registry.register(handle);
            receivers.push(rx);
        }
        (QueryCoordinator::new(registry, deadline), receivers)
    }

    fn partial(query_id: i64, k: usize, entries: &[(i32, f32)]) -> ResultSet {
        let mut set = ResultSet::new(query_id, k);
        for &(id, d) in entries {
            set.insert(id, d);
        }
        set
    }

    #[test]
    fn test_submit_requires_workers() {
        let (coordinator, _rx) = coordinator_with_workers(0, Duration::from_secs(5));
        assert!(matches!(
            coordinator.submit(vec![1.0], Metric::Euclidean, 1),
            Err(MasterError::NoWorkersAvailable)
        ));
    }

    #[test]
    fn test_submit_rejects_bad_k() {
        let (coordinator, _rx) = coordinator_with_workers(1, Duration::from_secs(5));
        assert!(matches!(
            coordinator.submit(vec![1.0], Metric::Euclidean, 0),
            Err(MasterError::InvalidK(0))
        ));
    }

    #[test]
    fn test_broadcast_reaches_every_worker() {
        let (coordinator, receivers) = coordinator_with_workers(3, Duration::from_secs(5));
        let qid = coordinator.submit(vec![1.0], Metric::Manhattan, 2).unwrap();
        assert_eq!(qid, 1);

        for rx in &receivers {
            match rx.try_recv().unwrap() {
                Message::FindKNearest(query) => {
                    assert_eq!(query.query_id, qid);
                    assert_eq!(query.k, 2);
                    assert_eq!(query.metric, Metric::Manhattan);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[test]
    fn test_merge_across_replies_and_exactly_once_consumption() {
        let (coordinator, _rx) = coordinator_with_workers(2, Duration::from_secs(5));
        let qid = coordinator.submit(vec![0.0], Metric::Euclidean, 2).unwrap();

        assert_eq!(coordinator.poll(qid), PollOutcome::Pending);
        coordinator.on_worker_reply(qid, 0, partial(qid, 2, &[(0, 3.0), (2, 1.0)]));
        assert_eq!(coordinator.poll(qid), PollOutcome::Pending);
        coordinator.on_worker_reply(qid, 1, partial(qid, 2, &[(1, 2.0), (3, 0.5)]));

        match coordinator.poll(qid) {
            PollOutcome::Ready(outcome) => {
                assert!(outcome.complete);
                assert_eq!(outcome.lost_workers, 0);
                assert_eq!(outcome.results, vec![(3, 0.5), (2, 1.0)]);
            }
            other => panic!("expected ready, got {other:?}"),
        }

        // Consumed exactly once: afterwards the id is unknown, not pending.
        assert_eq!(coordinator.poll(qid), PollOutcome::Unknown);
    }

    #[test]
    fn test_unknown_id_is_distinguishable_from_pending() {
        let (coordinator, _rx) = coordinator_with_workers(1, Duration::from_secs(5));
        let qid = coordinator.submit(vec![0.0], Metric::Euclidean, 1).unwrap();
        assert_eq!(coordinator.poll(qid + 100), PollOutcome::Unknown);
        assert_eq!(coordinator.poll(qid), PollOutcome::Pending);
    }

    #[test]
    fn test_deadline_finalizes_with_partials() {
        let (coordinator, _rx) = coordinator_with_workers(2, Duration::ZERO);
        let qid = coordinator.submit(vec![0.0], Metric::Euclidean, 3).unwrap();
        coordinator.on_worker_reply(qid, 0, partial(qid, 3, &[(5, 1.0)]));

        match coordinator.poll(qid) {
            PollOutcome::Ready(outcome) => {
                assert!(!outcome.complete);
                assert_eq!(outcome.lost_workers, 1);
                assert_eq!(outcome.results, vec![(5, 1.0)]);
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_lost_worker_unblocks_query() {
        let (coordinator, _rx) = coordinator_with_workers(2, Duration::from_secs(5));
        let qid = coordinator.submit(vec![0.0], Metric::Euclidean, 1).unwrap();
        coordinator.on_worker_reply(qid, 0, partial(qid, 1, &[(9, 0.25)]));
        coordinator.on_worker_lost(1);

        match coordinator.poll(qid) {
            PollOutcome::Ready(outcome) => {
                assert!(!outcome.complete);
                assert_eq!(outcome.lost_workers, 1);
                assert_eq!(outcome.results, vec![(9, 0.25)]);
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn test_wait_returns_after_final_reply() {
        let (coordinator, _rx) = coordinator_with_workers(1, Duration::from_secs(5));
        let coordinator = Arc::new(coordinator);
        let qid = coordinator.submit(vec![0.0], Metric::Euclidean, 1).unwrap();

        let replier = {
            let coordinator = Arc::clone(&coordinator);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                coordinator.on_worker_reply(qid, 0, partial(qid, 1, &[(4, 2.0)]));
            })
        };

        match coordinator.wait(qid, Duration::from_secs(5)) {
            PollOutcome::Ready(outcome) => {
                assert_eq!(outcome.results, vec![(4, 2.0)]);
                assert!(outcome.complete);
            }
            other => panic!("expected ready, got {other:?}"),
        }
        replier.join().unwrap();
    }

    #[test]
    fn test_wait_times_out_while_pending() {
        let (coordinator, _rx) = coordinator_with_workers(1, Duration::from_secs(60));
        let qid = coordinator.submit(vec![0.0], Metric::Euclidean, 1).unwrap();
        assert_eq!(
            coordinator.wait(qid, Duration::from_millis(10)),
            PollOutcome::Pending
        );
        // Still pending, not consumed.
        assert_eq!(coordinator.poll(qid), PollOutcome::Pending);
    }

    #[test]
    fn test_full_queue_counts_worker_lost() {
        let registry = Arc::new(WorkerRegistry::new());
        let (handle, _rx) = WorkerHandle::with_queue(0, "127.0.0.1:1".parse().unwrap(), 1);
        registry.register(handle.clone());
        // Occupy the only queue slot so the broadcast is rejected.
        handle.enqueue(Message::Shutdown).unwrap();

        let coordinator = QueryCoordinator::new(registry, Duration::from_secs(5));
        let qid = coordinator.submit(vec![0.0], Metric::Euclidean, 1).unwrap();
        match coordinator.poll(qid) {
            PollOutcome::Ready(outcome) => {
                assert!(!outcome.complete);
                assert_eq!(outcome.lost_workers, 1);
                assert!(outcome.results.is_empty());
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }
}
