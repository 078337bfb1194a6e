use std::io;

pub type Result<T, E = PgSrvError> = std::result::Result<T, E>;

/// Errors that terminate a connection. User-caused failures never surface
/// here; the session reports those as ErrorResponse messages and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum PgSrvError {
    #[error("invalid protocol version: {0}")]
    InvalidProtocolVersion(i32),

    #[error("invalid startup message length: {0}")]
    InvalidMsgLength(i32),

    #[error("message larger than i32 max, size: {0}")]
    MsgTooLarge(usize),

    #[error("missing null byte")]
    MissingNullByte,

    #[error("invalid utf-8 in message")]
    InvalidUtf8,

    #[error("unexpected describe object type: {0}")]
    UnexpectedDescribeObjectType(u8),

    #[error("prepared statement already exists: {0}")]
    StatementAlreadyPresent(String),

    #[error(transparent)]
    PgRepr(#[from] pgrepr::PgReprError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
