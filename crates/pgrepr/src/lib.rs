//! PostgreSQL type representation for the engine's value model: type OIDs,
//! text/binary formats, DataRow cell encoding and Bind parameter decoding.

pub mod error;
pub mod format;
pub mod types;

pub use error::PgReprError;
pub use format::Format;
pub use types::{decode_param, encode_value, type_oid, type_size};
