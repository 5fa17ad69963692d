//! Master node: worker registry, ownership routing, and the scatter-gather
//! query coordinator.
//!
//! # Concurrency model
//!
//! One OS thread accepts worker registrations; each accepted connection gets
//! its own pump thread that drains the worker's bounded outbound queue in
//! FIFO order. `FindKNearest` is synchronous per worker: the pump blocks on
//! the reply before sending anything else down that connection, so a slow
//! worker stalls only its own pump. A failed connection deregisters its
//! worker and retires it from every in-flight query rather than leaving
//! those queries pending forever.

pub mod coordinator;
pub mod registry;

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::metric::Metric;
use crate::model::Point;
use crate::protocol::{self, Message, ProtocolError, REGISTER_ACK};

pub use coordinator::{PollOutcome, QueryCoordinator, QueryOutcome};
pub use registry::{QueueError, WorkerHandle, WorkerRegistry};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterError {
    #[error("no workers available")]
    NoWorkersAvailable,

    #[error("k must be positive, got {0}")]
    InvalidK(i32),

    #[error("outbound queue for worker {worker_id} is full")]
    QueueFull { worker_id: u64 },

    #[error("worker {worker_id} is no longer connected")]
    WorkerUnavailable { worker_id: u64 },
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address the wire listener binds for worker registrations.
    pub bind_addr: SocketAddr,
    /// How long a query may wait on stragglers before finalizing with
    /// partial results.
    pub query_deadline: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9876)),
            query_deadline: Duration::from_secs(30),
        }
    }
}

/// The coordinator node workers register with and the front-end talks to.
pub struct Master {
    registry: Arc<WorkerRegistry>,
    coordinator: QueryCoordinator,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutting_down: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Master {
    /// Bind the worker-facing listener. Call [`start`](Self::start) to begin
    /// accepting registrations.
    pub fn bind(config: MasterConfig) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(config.bind_addr)?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::new(WorkerRegistry::new());
        let coordinator = QueryCoordinator::new(Arc::clone(&registry), config.query_deadline);
        Ok(Arc::new(Self {
            registry,
            coordinator,
            listener,
            local_addr,
            shutting_down: AtomicBool::new(false),
            accept_thread: Mutex::new(None),
            pumps: Mutex::new(Vec::new()),
        }))
    }

    /// Address the wire listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the registration accept loop.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let master = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("daybreak-accept".to_string())
            .spawn(move || master.accept_loop())?;
        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.registry.len()
    }

    pub fn active_queries(&self) -> usize {
        self.coordinator.active_queries()
    }

    /// Broadcast a search to all currently registered workers.
    pub fn submit_query(
        &self,
        vector: Vec<f32>,
        metric: Metric,
        k: i32,
    ) -> Result<i64, MasterError> {
        self.coordinator.submit(vector, metric, k)
    }

    /// Non-blocking result check; consumes the answer exactly once.
    pub fn poll(&self, query_id: i64) -> PollOutcome {
        self.coordinator.poll(query_id)
    }

    /// Block until the query completes or `timeout` elapses.
    pub fn wait(&self, query_id: i64, timeout: Duration) -> PollOutcome {
        self.coordinator.wait(query_id, timeout)
    }

    /// Route a point to its owning worker's queue.
    pub fn add_point(&self, point: Point) -> Result<(), MasterError> {
        let owner = self
            .registry
            .owner_of(point.id)
            .ok_or(MasterError::NoWorkersAvailable)?;
        let worker_id = owner.worker_id();
        owner.enqueue(Message::Add(point)).map_err(|e| match e {
            QueueError::Full => MasterError::QueueFull { worker_id },
            QueueError::Disconnected => MasterError::WorkerUnavailable { worker_id },
        })
    }

    /// Broadcast `Shutdown` to every worker, stop accepting registrations,
    /// and join every connection pump. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down master");

        for worker in self.registry.snapshot() {
            if let Err(e) = worker.enqueue(Message::Shutdown) {
                warn!(
                    worker_id = worker.worker_id(),
                    error = %e,
                    "could not enqueue shutdown"
                );
            }
            self.registry.deregister(worker.worker_id());
        }

        // The accept loop blocks in accept(); poke it awake so it can see
        // the flag and exit.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        for pump in std::mem::take(&mut *self.pumps.lock()) {
            let _ = pump.join();
        }
        info!("master stopped");
    }

    fn accept_loop(self: Arc<Self>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    let master = Arc::clone(&self);
                    let pump = std::thread::Builder::new()
                        .name(format!("daybreak-conn-{peer}"))
                        .spawn(move || master.serve_connection(stream, peer));
                    match pump {
                        Ok(handle) => self.pumps.lock().push(handle),
                        Err(e) => warn!(%peer, error = %e, "could not spawn connection pump"),
                    }
                }
                Err(e) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }

    fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.run_connection(&stream, peer) {
            if !self.shutting_down.load(Ordering::SeqCst) {
                warn!(%peer, error = %e, "worker connection ended");
            }
        }
    }

    /// Handshake, register, then pump the outbound queue until shutdown or
    /// connection failure.
    fn run_connection(&self, stream: &TcpStream, peer: SocketAddr) -> Result<(), ProtocolError> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream.try_clone()?;

        match protocol::read_message(&mut reader)? {
            Message::Register => {}
            other => {
                warn!(%peer, kind = other.kind_name(), "expected register handshake, closing");
                return Ok(());
            }
        }
        writer.write_all(&[REGISTER_ACK])?;
        writer.flush()?;

        let (handle, outbound) = WorkerHandle::connected(self.registry.allocate_id(), peer);
        let worker_id = handle.worker_id();
        self.registry.register(Arc::clone(&handle));
        info!(worker_id, %peer, "worker registered");

        // A registration racing shutdown() can miss the broadcast sweep;
        // turn it away here instead of leaving its pump parked forever.
        if self.shutting_down.load(Ordering::SeqCst) {
            self.registry.deregister(worker_id);
            let _ = protocol::write_message(&mut writer, &Message::Shutdown);
            return Ok(());
        }

        match self.pump(worker_id, &handle, outbound, &mut reader, &mut writer) {
            Ok(()) => Ok(()),
            Err(e) => {
                // A broken connection is an orderly departure of that one
                // worker; its shard is orphaned until the points are
                // re-added, never rebalanced.
                self.registry.deregister(worker_id);
                self.coordinator.on_worker_lost(worker_id);
                Err(e)
            }
        }
    }

    fn pump(
        &self,
        worker_id: u64,
        handle: &Arc<WorkerHandle>,
        outbound: Receiver<Message>,
        reader: &mut BufReader<TcpStream>,
        writer: &mut TcpStream,
    ) -> Result<(), ProtocolError> {
        loop {
            // All queue senders dropped means the worker was deregistered;
            // nothing further will be routed here.
            let Ok(message) = outbound.recv() else {
                return Ok(());
            };
            protocol::write_message(writer, &message)?;

            match message {
                Message::FindKNearest(query) => match protocol::read_message(reader)? {
                    Message::Result(partial) => {
                        self.coordinator
                            .on_worker_reply(query.query_id, worker_id, partial);
                    }
                    other => {
                        return Err(ProtocolError::UnexpectedMessage {
                            expected: "result",
                            got: other.kind_name(),
                        });
                    }
                },
                Message::Shutdown => {
                    let _ = writer.shutdown(std::net::Shutdown::Both);
                    return Ok(());
                }
                _ => {}
            }
            handle.touch();
        }
    }
}
