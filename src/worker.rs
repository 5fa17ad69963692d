//! Worker node: registers with the master and serves its shard.
//!
//! A worker holds one [`PointStore`] shard, connects to the master over a
//! single persistent TCP stream, and processes messages strictly in arrival
//! order. Searches are answered synchronously on the same stream; `Shutdown`
//! (or the master closing the connection) persists the shard and exits.

use std::io::{self, BufReader, Read};
use std::net::TcpStream;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{self, Message, ProtocolError, REGISTER_ACK};
use crate::result_set::ResultSet;
use crate::store::{PointStore, StoreError};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("master rejected registration with acknowledgment byte {0:#04x}")]
    HandshakeRejected(u8),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Master address, `host:port`.
    pub master_addr: String,
    /// Shard persistence path. `None` saves to a process-managed file under
    /// the OS temp directory.
    pub data_path: Option<PathBuf>,
}

/// A shard-holding worker process.
pub struct Worker {
    config: WorkerConfig,
    store: PointStore,
}

impl Worker {
    /// Load the shard (an absent file is an empty start state) and prepare
    /// to connect.
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let store = match &config.data_path {
            Some(path) => {
                let store = PointStore::load(path)?;
                info!(path = %path.display(), points = store.len(), "loaded shard");
                store
            }
            None => PointStore::new(),
        };
        Ok(Self { config, store })
    }

    /// Connect, register, and serve messages until shutdown.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        let stream = TcpStream::connect(&self.config.master_addr)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream.try_clone()?;

        protocol::write_message(&mut writer, &Message::Register)?;
        let mut ack = [0u8; 1];
        reader.read_exact(&mut ack)?;
        if ack[0] != REGISTER_ACK {
            return Err(WorkerError::HandshakeRejected(ack[0]));
        }
        info!(master = %self.config.master_addr, "registered with master");

        loop {
            let message = match protocol::read_message(&mut reader) {
                Ok(message) => message,
                Err(ProtocolError::UnknownKind(kind)) => {
                    // Unrecognized kinds are non-fatal; the frame was fully
                    // consumed, so the stream stays usable.
                    warn!(kind, "ignoring unrecognized message kind");
                    continue;
                }
                Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("master closed the connection, shutting down");
                    self.persist();
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            match message {
                Message::Add(point) => {
                    debug!(id = point.id, dim = point.dim(), "adding point");
                    self.store.add(point);
                }
                Message::FindKNearest(query) => {
                    let results = match self.store.search(&query) {
                        Ok(results) => results,
                        Err(e) => {
                            // The query is rejected here at the boundary
                            // that detected it; an empty partial keeps the
                            // master's completion tracking intact.
                            warn!(query_id = query.query_id, error = %e, "rejecting search");
                            ResultSet::new(query.query_id, query.k.max(0) as usize)
                        }
                    };
                    protocol::write_message(&mut writer, &Message::Result(results))?;
                }
                Message::RemoveById(id) => {
                    if let Err(e) = self.store.remove(id) {
                        warn!(id, error = %e, "rejecting remove");
                    }
                }
                Message::Shutdown => {
                    info!("shutdown requested");
                    self.persist();
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                    return Ok(());
                }
                Message::Register | Message::Result(_) => {
                    warn!(kind = message.kind_name(), "ignoring unexpected message");
                }
            }
        }
    }

    /// Number of points currently held.
    pub fn shard_len(&self) -> usize {
        self.store.len()
    }

    fn persist(&self) {
        let path = match &self.config.data_path {
            Some(path) => path.clone(),
            None => std::env::temp_dir().join(format!("daybreak-worker-{}.tsv", std::process::id())),
        };
        match self.store.save(&path) {
            Ok(()) => info!(path = %path.display(), points = self.store.len(), "shard saved"),
            Err(e) => warn!(path = %path.display(), error = %e, "could not save shard"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Point;
    use tempfile::tempdir;

    #[test]
    fn test_new_with_missing_data_file_starts_empty() {
        let dir = tempdir().unwrap();
        let worker = Worker::new(WorkerConfig {
            master_addr: "127.0.0.1:0".to_string(),
            data_path: Some(dir.path().join("absent.tsv")),
        })
        .unwrap();
        assert_eq!(worker.shard_len(), 0);
    }

    #[test]
    fn test_new_loads_existing_shard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard.tsv");
        let mut store = PointStore::new();
        store.add(Point::new(1, vec![1.0, 2.0]));
        store.add(Point::new(2, vec![3.0, 4.0]));
        store.save(&path).unwrap();

        let worker = Worker::new(WorkerConfig {
            master_addr: "127.0.0.1:0".to_string(),
            data_path: Some(path),
        })
        .unwrap();
        assert_eq!(worker.shard_len(), 2);
    }
}
