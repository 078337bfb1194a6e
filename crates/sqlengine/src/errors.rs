use kvstore::errors::StoreError;

pub type Result<T, E = SqlError> = std::result::Result<T, E>;

/// Engine error taxonomy.
///
/// Every user-visible failure mode is a distinct kind; the wire layer maps
/// each kind to a stable SQLSTATE. Store-level failures convert through
/// [`SqlError::from`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SqlError {
    #[error("illegal arguments")]
    IllegalArguments,

    #[error("catalog not yet loaded")]
    CatalogNotReady,

    #[error("already closed")]
    AlreadyClosed,

    #[error("no database selected")]
    NoDatabaseSelected,

    #[error("database does not exist")]
    DatabaseDoesNotExist,

    #[error("database already exists")]
    DatabaseAlreadyExists,

    #[error("table does not exist")]
    TableDoesNotExist,

    #[error("table already exists")]
    TableAlreadyExists,

    #[error("column does not exist")]
    ColumnDoesNotExist,

    #[error("index already exists")]
    IndexAlreadyExists,

    #[error("no available index")]
    NoAvailableIndex,

    #[error("invalid value")]
    InvalidValue,

    #[error("max length exceeded")]
    MaxLengthExceeded,

    #[error("primary key can not be null")]
    PKCannotBeNull,

    #[error("indexed column can not be null")]
    IndexedColumnCannotBeNull,

    #[error("column is not nullable")]
    NotNullableColumnCannotBeNull,

    #[error("duplicated column")]
    DuplicatedColumn,

    #[error("duplicated parameters")]
    DuplicatedParameters,

    #[error("missing parameter")]
    MissingParameter,

    #[error("unsupported parameter")]
    UnsupportedParameter,

    #[error("no value should be specified for auto incremental columns")]
    NoValueForAutoIncrement,

    #[error("not yet supported")]
    NoSupported,

    #[error("order is limited to one indexed column")]
    LimitedOrderBy,

    #[error("group by is limited to the column the scan is ordered on")]
    LimitedGroupBy,

    #[error("only COUNT() over all rows is supported")]
    LimitedCount,

    #[error("auto increment is limited to a single integer primary key")]
    LimitedAutoIncrement,

    #[error("key type is not supported")]
    LimitedKeyType,

    #[error("index creation is only supported on empty tables")]
    LimitedIndexCreation,

    #[error("division by zero")]
    DivisionByZero,

    #[error("values are not comparable")]
    NotComparableValues,

    #[error("invalid condition")]
    InvalidCondition,

    #[error("inferred multiple types for parameter")]
    InferredMultipleTypes,

    #[error("expecting a DQL statement")]
    ExpectingDQLStmt,

    #[error("too many rows")]
    TooManyRows,

    #[error("data is corrupted")]
    CorruptedData,

    #[error("illegal mapped key")]
    IllegalMappedKey,

    #[error("transactions can not mix DDL and DML statements")]
    DDLorDMLTxOnly,

    #[error("having clause requires a group clause")]
    HavingClauseRequiresGroupClause,

    #[error("at most one statement is allowed")]
    MaxStmtNumberExceeded,

    #[error("key already exists")]
    KeyAlreadyExists,

    #[error("key not found")]
    KeyNotFound,

    #[error("duplicated key")]
    DuplicatedKey,

    #[error("transaction conflict, try again")]
    TxConflict,

    #[error("syntax error: {0}")]
    Parse(String),
}

impl From<StoreError> for SqlError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::KeyAlreadyExists => SqlError::KeyAlreadyExists,
            StoreError::KeyNotFound => SqlError::KeyNotFound,
            StoreError::Conflict => SqlError::TxConflict,
            StoreError::AlreadyClosed => SqlError::AlreadyClosed,
        }
    }
}
