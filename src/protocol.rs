//! Wire protocol between master and workers.
//!
//! A single persistent TCP stream per worker carries length-prefixed frames.
//! All integers and floats are big-endian.
//!
//! # Frame layout
//!
//! ```text
//! Offset  Size  Type     Description
//! ──────────────────────────────────────────────
//! 0x00    4     u32 BE   payload length (kind byte included)
//! 0x04    1     u8       message kind
//! 0x05    ...            kind-specific body
//! ```
//!
//! Message kinds:
//! - `Register` (0, worker→master): empty; acknowledged with the single raw
//!   byte [`REGISTER_ACK`] outside framing.
//! - `Add` (1, master→worker): `i32 id, i32 dim, dim × f32`. Fire-and-forget.
//! - `FindKNearest` (2, master→worker): `i64 query_id, i32 k, u8 metric,
//!   i32 dim, dim × f32`. Request-reply; the worker answers with `Result`.
//! - `RemoveById` (3, master→worker): `i32 id`. Defined on the wire but
//!   rejected by the worker engine.
//! - `Shutdown` (4, master→worker): empty, terminal.
//! - `Result` (5, worker→master): `i64 query_id, i32 k, i32 count,
//!   count × (i32 id, f32 distance)`.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::metric::Metric;
use crate::model::{Point, Query};
use crate::result_set::ResultSet;

/// Single acknowledgment byte sent by the master after a registration.
pub const REGISTER_ACK: u8 = b'k';

/// Upper bound on a frame payload. Generous for any realistic vector, tight
/// enough to reject a garbage length prefix before allocating.
pub const MAX_FRAME_LEN: usize = 64 << 20;

const KIND_REGISTER: u8 = 0;
const KIND_ADD: u8 = 1;
const KIND_FIND_K_NEAREST: u8 = 2;
const KIND_REMOVE_BY_ID: u8 = 3;
const KIND_SHUTDOWN: u8 = 4;
const KIND_RESULT: u8 = 5;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("unknown metric tag {0}")]
    UnknownMetric(u8),

    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge { len: usize },

    #[error("truncated frame: needed {needed} more bytes, had {available}")]
    Truncated { needed: usize, available: usize },

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("expected a {expected} message, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },
}

/// A decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Register,
    Add(Point),
    FindKNearest(Query),
    RemoveById(i32),
    Shutdown,
    Result(ResultSet),
}

impl Message {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Register => "register",
            Message::Add(_) => "add",
            Message::FindKNearest(_) => "find-k-nearest",
            Message::RemoveById(_) => "remove-by-id",
            Message::Shutdown => "shutdown",
            Message::Result(_) => "result",
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Message::Register => KIND_REGISTER,
            Message::Add(_) => KIND_ADD,
            Message::FindKNearest(_) => KIND_FIND_K_NEAREST,
            Message::RemoveById(_) => KIND_REMOVE_BY_ID,
            Message::Shutdown => KIND_SHUTDOWN,
            Message::Result(_) => KIND_RESULT,
        }
    }
}

/// Encode `message` as one frame and write it to `writer`.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    let payload = encode_payload(message)?;
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame from `reader` and decode it.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(ProtocolError::Malformed("empty payload"));
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    decode_payload(&payload)
}

fn encode_payload(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(16);
    out.push(message.kind());
    match message {
        Message::Register | Message::Shutdown => {}
        Message::Add(point) => {
            out.extend_from_slice(&point.id.to_be_bytes());
            put_vector(&mut out, &point.vector);
        }
        Message::FindKNearest(query) => {
            out.extend_from_slice(&query.query_id.to_be_bytes());
            out.extend_from_slice(&query.k.to_be_bytes());
            out.push(metric_tag(query.metric));
            put_vector(&mut out, &query.vector);
        }
        Message::RemoveById(id) => {
            out.extend_from_slice(&id.to_be_bytes());
        }
        Message::Result(results) => {
            out.extend_from_slice(&results.query_id().to_be_bytes());
            out.extend_from_slice(&(results.capacity() as i32).to_be_bytes());
            out.extend_from_slice(&(results.len() as i32).to_be_bytes());
            for (id, distance) in results.entries() {
                out.extend_from_slice(&id.to_be_bytes());
                out.extend_from_slice(&distance.to_bits().to_be_bytes());
            }
        }
    }
    if out.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge { len: out.len() });
    }
    Ok(out)
}

fn decode_payload(payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut reader = PayloadReader::new(payload);
    let message = match reader.u8()? {
        KIND_REGISTER => Message::Register,
        KIND_ADD => {
            let id = reader.i32()?;
            let vector = reader.vector()?;
            Message::Add(Point::new(id, vector))
        }
        KIND_FIND_K_NEAREST => {
            let query_id = reader.i64()?;
            let k = reader.i32()?;
            let metric = metric_from_tag(reader.u8()?)?;
            let vector = reader.vector()?;
            Message::FindKNearest(Query::new(query_id, k, vector, metric))
        }
        KIND_REMOVE_BY_ID => Message::RemoveById(reader.i32()?),
        KIND_SHUTDOWN => Message::Shutdown,
        KIND_RESULT => {
            let query_id = reader.i64()?;
            let k = reader.i32()?;
            if k < 0 {
                return Err(ProtocolError::Malformed("negative result capacity"));
            }
            let count = reader.i32()?;
            if count < 0 || count > k {
                return Err(ProtocolError::Malformed("result count exceeds capacity"));
            }
            let mut results = ResultSet::new(query_id, k as usize);
            for _ in 0..count {
                let id = reader.i32()?;
                let distance = reader.f32()?;
                // Re-inserting restores the sortedness invariant even if the
                // peer sent entries out of order.
                results.insert(id, distance);
            }
            Message::Result(results)
        }
        other => return Err(ProtocolError::UnknownKind(other)),
    };
    reader.finish()?;
    Ok(message)
}

fn metric_tag(metric: Metric) -> u8 {
    match metric {
        Metric::Euclidean => 0,
        Metric::Manhattan => 1,
        Metric::Cosine => 2,
        Metric::JensenShannon => 3,
    }
}

fn metric_from_tag(tag: u8) -> Result<Metric, ProtocolError> {
    match tag {
        0 => Ok(Metric::Euclidean),
        1 => Ok(Metric::Manhattan),
        2 => Ok(Metric::Cosine),
        3 => Ok(Metric::JensenShannon),
        other => Err(ProtocolError::UnknownMetric(other)),
    }
}

fn put_vector(out: &mut Vec<u8>, vector: &[f32]) {
    out.extend_from_slice(&(vector.len() as i32).to_be_bytes());
    for &value in vector {
        out.extend_from_slice(&value.to_bits().to_be_bytes());
    }
}

/// Bounds-checked sequential reader over one frame payload.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.buf.len() - self.pos;
        if available < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_bits(u32::from_be_bytes(
            self.take(4)?.try_into().unwrap(),
        )))
    }

    fn vector(&mut self) -> Result<Vec<f32>, ProtocolError> {
        let dim = self.i32()?;
        if dim < 0 {
            return Err(ProtocolError::Malformed("negative vector dimension"));
        }
        // Taking the bytes up front bounds the allocation by what the frame
        // actually carries, whatever the dimension field claims.
        let bytes = self.take(
            (dim as usize)
                .checked_mul(4)
                .ok_or(ProtocolError::Malformed("vector dimension overflow"))?,
        )?;
        let mut vector = Vec::with_capacity(dim as usize);
        for chunk in bytes.chunks_exact(4) {
            vector.push(f32::from_bits(u32::from_be_bytes(chunk.try_into().unwrap())));
        }
        Ok(vector)
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::Malformed("trailing bytes after message"));
        }
        Ok(())
    }
}
