pub type Result<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key already exists")]
    KeyAlreadyExists,

    #[error("key not found")]
    KeyNotFound,

    #[error("transaction conflict, try again")]
    Conflict,

    #[error("store already closed")]
    AlreadyClosed,
}
