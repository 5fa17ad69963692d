//! Worker-local point store and linear-scan search engine.
//!
//! An append-mostly list of points plus an id→slot index for O(1) upsert.
//! Search is a brute-force O(n) scan feeding a bounded [`ResultSet`]; with
//! small k this is the exact baseline the whole system is built around.
//!
//! # Persistence
//!
//! One point per line, UTF-8: `id<TAB>v0,v1,...,vn`. A missing file at load
//! time is an empty start state, not an error.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::metric::DistanceError;
use crate::model::{Point, Query};
use crate::result_set::ResultSet;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Removal is part of the wire protocol but not supported by the engine.
    #[error("point removal is not supported")]
    RemoveUnsupported,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed point on line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// In-memory point shard held by one worker.
#[derive(Debug, Default)]
pub struct PointStore {
    points: Vec<Point>,
    index: HashMap<i32, usize>,
}

impl PointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Insert a point, replacing any existing point with the same id in
    /// place.
    pub fn add(&mut self, point: Point) {
        match self.index.get(&point.id) {
            Some(&slot) => self.points[slot] = point,
            None => {
                self.index.insert(point.id, self.points.len());
                self.points.push(point);
            }
        }
    }

    /// Remove a point by id.
    ///
    /// Always fails with [`StoreError::RemoveUnsupported`]: the message kind
    /// exists on the wire, but the engine rejects it rather than silently
    /// doing nothing.
    pub fn remove(&mut self, _id: i32) -> Result<(), StoreError> {
        Err(StoreError::RemoveUnsupported)
    }

    /// Look up a point by id.
    pub fn get(&self, id: i32) -> Option<&Point> {
        self.index.get(&id).map(|&slot| &self.points[slot])
    }

    /// Linear-scan every stored point and return the local top-k for the
    /// query.
    ///
    /// A stored point whose dimension differs from the query vector aborts
    /// the scan with the mismatch error; the caller decides how to reject
    /// the query.
    pub fn search(&self, query: &Query) -> Result<ResultSet, DistanceError> {
        let mut results = ResultSet::new(query.query_id, query.k.max(0) as usize);
        for point in &self.points {
            let distance = query.metric.distance(&query.vector, &point.vector)?;
            results.insert(point.id, distance);
        }
        Ok(results)
    }

    /// Load a store from the flat file at `path`. A nonexistent file yields
    /// an empty store.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e.into()),
        };

        let mut store = Self::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            store.add(parse_line(&line, number + 1)?);
        }
        Ok(store)
    }

    /// Write every stored point to `path`, overwriting it.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let mut writer = BufWriter::new(File::create(path)?);
        for point in &self.points {
            write!(writer, "{}\t", point.id)?;
            for (i, value) in point.vector.iter().enumerate() {
                if i > 0 {
                    writer.write_all(b",")?;
                }
                write!(writer, "{value}")?;
            }
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn parse_line(line: &str, number: usize) -> Result<Point, StoreError> {
    let (id_field, vector_field) = line.split_once('\t').ok_or_else(|| StoreError::Parse {
        line: number,
        reason: "missing tab separator".to_string(),
    })?;
    let id: i32 = id_field.parse().map_err(|e| StoreError::Parse {
        line: number,
        reason: format!("bad id {id_field:?}: {e}"),
    })?;
    let vector = vector_field
        .split(',')
        .map(|token| {
            token.parse::<f32>().map_err(|e| StoreError::Parse {
                line: number,
                reason: format!("bad component {token:?}: {e}"),
            })
        })
        .collect::<Result<Vec<f32>, StoreError>>()?;
    Ok(Point::new(id, vector))
}
