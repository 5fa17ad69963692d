//! Worker registry and ownership routing.
//!
//! Workers register in arrival order; a point's owner is the worker at
//! `id mod worker_count` in that order. The mapping is recomputed on every
//! lookup, so registrations and departures re-route ids that were placed
//! under an earlier worker count. Already-placed points are never rebalanced.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::protocol::Message;

/// Bound on each worker's outbound queue. A worker that stops draining its
/// connection rejects further traffic instead of growing without limit.
pub(crate) const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("worker outbound queue is full")]
    Full,

    #[error("worker connection is gone")]
    Disconnected,
}

/// Master-side handle to one connected worker.
pub struct WorkerHandle {
    worker_id: u64,
    peer_addr: SocketAddr,
    outbound: SyncSender<Message>,
    last_report: Mutex<Instant>,
}

impl WorkerHandle {
    /// Create a handle with its bounded outbound queue, returning the
    /// receiving end for the connection pump.
    pub fn connected(worker_id: u64, peer_addr: SocketAddr) -> (Arc<Self>, Receiver<Message>) {
        Self::with_queue(worker_id, peer_addr, OUTBOUND_QUEUE_CAPACITY)
    }

    pub(crate) fn with_queue(
        worker_id: u64,
        peer_addr: SocketAddr,
        capacity: usize,
    ) -> (Arc<Self>, Receiver<Message>) {
        let (outbound, receiver) = sync_channel(capacity);
        let handle = Arc::new(Self {
            worker_id,
            peer_addr,
            outbound,
            last_report: Mutex::new(Instant::now()),
        });
        (handle, receiver)
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Enqueue a message for the connection pump, rejecting when the queue
    /// is full rather than blocking or dropping older traffic.
    pub fn enqueue(&self, message: Message) -> Result<(), QueueError> {
        self.outbound.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Disconnected,
        })
    }

    /// Record that the worker just reported over its connection.
    pub fn touch(&self) {
        *self.last_report.lock() = Instant::now();
    }

    pub fn last_report(&self) -> Instant {
        *self.last_report.lock()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Ordered set of live workers.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
    next_worker_id: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a worker about to complete its handshake.
    pub fn allocate_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Append a registered worker to the routing order.
    pub fn register(&self, handle: Arc<WorkerHandle>) {
        self.workers.write().push(handle);
    }

    /// Remove a worker. Points it owned stay where they were placed; no
    /// rebalancing happens.
    pub fn deregister(&self, worker_id: u64) -> bool {
        let mut workers = self.workers.write();
        let before = workers.len();
        workers.retain(|w| w.worker_id() != worker_id);
        workers.len() != before
    }

    /// The worker owning `point_id` under the current registry, or `None`
    /// when no workers are registered.
    pub fn owner_of(&self, point_id: i32) -> Option<Arc<WorkerHandle>> {
        let workers = self.workers.read();
        if workers.is_empty() {
            return None;
        }
        let slot = point_id.rem_euclid(workers.len() as i32) as usize;
        Some(Arc::clone(&workers[slot]))
    }

    /// Snapshot of the current worker set in registration order.
    pub fn snapshot(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}
