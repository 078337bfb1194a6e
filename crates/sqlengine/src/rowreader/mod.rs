//! Composable lazy row readers.
//!
//! A query plan is a tree of readers, each pulling from its sources on
//! demand. Readers are single-use: once `read` returns `None` (or the reader
//! is closed) they stay exhausted. Closing a composite reader closes its
//! sources; double-close is a no-op.

mod cond;
mod distinct;
mod group;
mod join;
mod limit;
mod project;
mod scan;

pub use cond::CondRowReader;
pub use distinct::DistinctRowReader;
pub use group::{AggSpec, GroupedRowReader};
pub use join::JoinRowReader;
pub use limit::LimitRowReader;
pub use project::{Projection, ProjectedRowReader};
pub use scan::RawScanReader;

use crate::errors::Result;
use crate::value::{SqlType, Value};
use kvstore::Snapshot;
use std::collections::{BTreeMap, HashMap};

/// Parameter name to inferred type, ordered by name.
pub type ParamTypes = BTreeMap<String, SqlType>;

/// A single result row: values keyed by fully qualified selector
/// (`db.table.col`), aggregate selector (`COUNT()`) or projection alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub values: HashMap<String, Value>,
}

impl Row {
    pub fn get(&self, selector: &str) -> Option<&Value> {
        self.values.get(selector)
    }
}

/// Describes one output column of a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    /// Row-map key for this column's values.
    pub selector: String,
    /// Client-facing name (bare column name, alias or aggregate spelling).
    pub name: String,
    pub ty: SqlType,
}

/// Shared, read-only state for one query execution.
#[derive(Debug, Clone)]
pub struct QueryCtx {
    pub snapshot: Snapshot,
    pub prefix: Vec<u8>,
    pub distinct_limit: usize,
}

impl std::fmt::Debug for dyn RowReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn RowReader")
    }
}

pub trait RowReader: Send {
    /// Output column descriptors, in emission order.
    fn columns(&self) -> Result<Vec<ColumnDesc>>;

    /// Produces the next row, or `None` once the input is exhausted.
    fn read(&mut self) -> Result<Option<Row>>;

    /// The fully qualified selector this reader's output is naturally
    /// ordered on, if any.
    fn order_by(&self) -> Option<String>;

    /// Propagates placeholder type constraints into `target`.
    fn infer_parameters(&self, target: &mut ParamTypes) -> Result<()>;

    /// Releases the reader and its sources. Idempotent.
    fn close(&mut self);
}
