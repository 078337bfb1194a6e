pub type Result<T, E = PgReprError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PgReprError {
    #[error("invalid format code: {0}")]
    InvalidFormatCode(i16),

    #[error("unsupported parameter encoding: {0}")]
    UnsupportedParameter(String),

    #[error("failed to parse parameter: {0}")]
    Parse(String),
}
