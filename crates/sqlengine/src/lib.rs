//! Embedded SQL engine over an ordered key-value store.
//!
//! The engine keeps a durable catalog of databases, tables, columns and
//! indexes, plans `SELECT`s into a tree of lazy row readers, and executes DML
//! with order-preserving key encoding so range scans and uniqueness checks
//! are plain store primitives.

pub mod catalog;
pub mod engine;
pub mod errors;
pub mod eval;
pub mod keycodec;
pub mod params;
pub mod planner;
pub mod rowreader;
pub mod schema;
pub mod sql;
pub mod value;

mod executor;

pub use engine::{Engine, ExecSummary, Options, Params, SessionHandle};
pub use errors::{Result, SqlError};
pub use value::{SqlType, Value};
