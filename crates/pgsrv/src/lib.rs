//! Postgres protocol compatibility for keeldb.
//!
//! Working with this crate requires knowledge about the Postgres
//! frontend/backend protocol.
//!
//! - <https://www.postgresql.org/docs/current/protocol-flow.html>
//! - <https://www.postgresql.org/docs/current/protocol-message-formats.html>
//!
//! We implement the simple query flow and the extended query flow over the
//! embedded engine. We do not implement the copy protocol, or the functional
//! call protocol (never).

pub mod codec;
pub mod errors;
pub mod handler;
pub mod messages;

pub use handler::Handler;
