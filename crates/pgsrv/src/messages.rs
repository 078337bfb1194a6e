use crate::errors::PgSrvError;
use pgrepr::Format;
use sqlengine::SqlError;
use std::collections::HashMap;

/// Version number (v3.0) used during normal frontend startup.
pub const VERSION_V3: i32 = 0x30000;
/// Version number used to request a cancellation.
pub const VERSION_CANCEL: i32 = (1234 << 16) ^ 5678;
/// Version number used to request an SSL connection.
pub const VERSION_SSL: i32 = (1234 << 16) ^ 5679;

/// Messages sent by the frontend during connection startup.
#[derive(Debug)]
pub enum StartupMessage {
    SSLRequest,
    CancelRequest,
    StartupRequest {
        version: i32,
        params: HashMap<String, String>,
    },
}

/// Messages sent by the frontend.
#[derive(Debug)]
pub enum FrontendMessage {
    /// A query (or queries) to execute.
    Query { sql: String },
    /// An encrypted or unencrypted password.
    PasswordMessage { password: String },
    /// An extended query parse message.
    Parse {
        /// The name of the prepared statement. An empty string denotes the
        /// unnamed prepared statement.
        name: String,
        /// The query string to be parsed.
        sql: String,
        /// The object IDs of the parameter data types. Placing a zero here is
        /// equivalent to leaving the type unspecified.
        param_types: Vec<i32>,
    },
    Bind {
        /// The name of the destination portal (an empty string selects the
        /// unnamed portal).
        portal: String,
        /// The name of the source prepared statement (an empty string selects
        /// the unnamed prepared statement).
        statement: String,
        /// The parameter format codes: empty for all-text, one code for all
        /// parameters, or one code per parameter.
        param_formats: Vec<Format>,
        /// The parameter values, null encoded as `None`.
        param_values: Vec<Option<Vec<u8>>>,
        /// The result-column format codes, same length rules as
        /// `param_formats`.
        result_formats: Vec<Format>,
    },
    Describe {
        /// The kind of item to describe: a prepared statement or a portal.
        object_type: DescribeObjectType,
        /// The name of the item to describe (an empty string selects the
        /// unnamed prepared statement or portal).
        name: String,
    },
    Execute {
        /// The name of the portal to execute (an empty string selects the
        /// unnamed portal).
        portal: String,
        /// The maximum number of rows to return, zero meaning "no limit".
        max_rows: i32,
    },
    /// Synchronize after running through the extended query protocol.
    Sync,
    /// Flush the connection.
    Flush,
    /// Close the connection.
    Terminate,
    /// A frame with a type byte this server does not handle. Kept as a
    /// message so the session can answer with an error instead of dropping
    /// the connection.
    Unknown { msg_type: u8 },
}

impl FrontendMessage {
    pub const fn name(&self) -> &'static str {
        match self {
            FrontendMessage::Query { .. } => "query",
            FrontendMessage::PasswordMessage { .. } => "password",
            FrontendMessage::Parse { .. } => "parse",
            FrontendMessage::Bind { .. } => "bind",
            FrontendMessage::Describe { .. } => "describe",
            FrontendMessage::Execute { .. } => "execute",
            FrontendMessage::Sync => "sync",
            FrontendMessage::Flush => "flush",
            FrontendMessage::Terminate => "terminate",
            FrontendMessage::Unknown { .. } => "unknown",
        }
    }

    /// Whether the message belongs to the extended query protocol and is
    /// therefore subject to the discard-until-Sync error recovery.
    pub const fn is_extended(&self) -> bool {
        matches!(
            self,
            FrontendMessage::Parse { .. }
                | FrontendMessage::Bind { .. }
                | FrontendMessage::Describe { .. }
                | FrontendMessage::Execute { .. }
                | FrontendMessage::Sync
                | FrontendMessage::Flush
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TransactionStatus {
    Idle,
    InBlock,
    Failed,
}

#[derive(Debug)]
pub enum BackendMessage {
    ErrorResponse(ErrorResponse),
    NoticeResponse(NoticeResponse),
    AuthenticationOk,
    BackendKeyData { pid: i32, secret: i32 },
    ParameterStatus { key: String, val: String },
    EmptyQueryResponse,
    ReadyForQuery(TransactionStatus),
    CommandComplete { tag: String },
    RowDescription(Vec<FieldDescription>),
    /// One encoded cell per column; `None` is the null cell (-1 length).
    DataRow(Vec<Option<Vec<u8>>>),
    ParseComplete,
    BindComplete,
    NoData,
    ParameterDescription(Vec<i32>),
}

impl From<ErrorResponse> for BackendMessage {
    fn from(error: ErrorResponse) -> Self {
        BackendMessage::ErrorResponse(error)
    }
}

impl From<NoticeResponse> for BackendMessage {
    fn from(notice: NoticeResponse) -> Self {
        BackendMessage::NoticeResponse(notice)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorSeverity {
    Error,
    Fatal,
    Panic,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Fatal => "FATAL",
            ErrorSeverity::Panic => "PANIC",
        }
    }
}

/// 'SQLSTATE' error codes.
///
/// See a complete list here: https://www.postgresql.org/docs/current/errcodes-appendix.html
#[derive(Debug, Clone, Copy)]
pub enum SqlState {
    // Class 00 — Successful Completion
    Successful,

    // Class 01 — Warning
    Warning,

    // Class 08 — Connection Exception
    ProtocolViolation,

    // Class 0A — Feature Not Supported
    FeatureNotSupported,

    // Class 22 — Data Exception
    StringDataRightTruncation,
    DivisionByZero,
    InvalidParameterValue,

    // Class 23 — Integrity Constraint Violation
    NotNullViolation,
    UniqueViolation,

    // Class 25 — Invalid Transaction State
    InvalidTransactionState,

    // Class 26 / 34 — Invalid Statement / Cursor Name
    InvalidSqlStatementName,
    InvalidCursorName,

    // Class 40 — Transaction Rollback
    SerializationFailure,

    // Class 42 — Syntax Error or Access Rule Violation
    SyntaxError,
    GroupingError,
    DatatypeMismatch,
    UndefinedColumn,
    UndefinedTable,
    UndefinedObject,
    DuplicateColumn,
    DuplicateDatabase,
    DuplicateTable,
    DuplicateObject,
    GeneratedAlways,
    IndeterminateDatatype,

    // Class 3D — Invalid Catalog Name
    InvalidCatalogName,

    // Class 54 — Program Limit Exceeded
    ProgramLimitExceeded,

    // Class 55 — Object Not In Prerequisite State
    ObjectNotInPrerequisiteState,

    // Class XX — Internal Error
    InternalError,
    DataCorrupted,
}

impl SqlState {
    pub fn as_code_str(&self) -> &'static str {
        match self {
            SqlState::Successful => "00000",
            SqlState::Warning => "01000",
            SqlState::ProtocolViolation => "08P01",
            SqlState::FeatureNotSupported => "0A000",
            SqlState::StringDataRightTruncation => "22001",
            SqlState::DivisionByZero => "22012",
            SqlState::InvalidParameterValue => "22023",
            SqlState::NotNullViolation => "23502",
            SqlState::UniqueViolation => "23505",
            SqlState::InvalidTransactionState => "25000",
            SqlState::InvalidSqlStatementName => "26000",
            SqlState::InvalidCursorName => "34000",
            SqlState::SerializationFailure => "40001",
            SqlState::SyntaxError => "42601",
            SqlState::GroupingError => "42803",
            SqlState::DatatypeMismatch => "42804",
            SqlState::UndefinedColumn => "42703",
            SqlState::UndefinedTable => "42P01",
            SqlState::UndefinedObject => "42704",
            SqlState::DuplicateColumn => "42701",
            SqlState::DuplicateDatabase => "42P04",
            SqlState::DuplicateTable => "42P07",
            SqlState::DuplicateObject => "42710",
            SqlState::GeneratedAlways => "428C9",
            SqlState::IndeterminateDatatype => "42P18",
            SqlState::InvalidCatalogName => "3D000",
            SqlState::ProgramLimitExceeded => "54000",
            SqlState::ObjectNotInPrerequisiteState => "55000",
            SqlState::InternalError => "XX000",
            SqlState::DataCorrupted => "XX001",
        }
    }
}

#[derive(Debug)]
pub struct ErrorResponse {
    pub severity: ErrorSeverity,
    pub code: SqlState,
    pub message: String,
}

impl ErrorResponse {
    pub fn error(code: SqlState, msg: impl Into<String>) -> ErrorResponse {
        ErrorResponse {
            severity: ErrorSeverity::Error,
            code,
            message: msg.into(),
        }
    }

    pub fn feature_not_supported(msg: impl Into<String>) -> ErrorResponse {
        Self::error(SqlState::FeatureNotSupported, msg)
    }

    pub fn error_internal(msg: impl Into<String>) -> ErrorResponse {
        Self::error(SqlState::InternalError, msg)
    }

    pub fn fatal(code: SqlState, msg: impl Into<String>) -> ErrorResponse {
        ErrorResponse {
            severity: ErrorSeverity::Fatal,
            code,
            message: msg.into(),
        }
    }
}

/// Every engine error kind maps to a stable SQLSTATE.
impl From<&SqlError> for ErrorResponse {
    fn from(e: &SqlError) -> Self {
        use SqlError::*;
        let code = match e {
            IllegalArguments | MissingParameter | UnsupportedParameter | DuplicatedParameters
            | InvalidValue => SqlState::InvalidParameterValue,
            CatalogNotReady => SqlState::ObjectNotInPrerequisiteState,
            AlreadyClosed => SqlState::InternalError,
            NoDatabaseSelected | DatabaseDoesNotExist => SqlState::InvalidCatalogName,
            DatabaseAlreadyExists => SqlState::DuplicateDatabase,
            TableDoesNotExist => SqlState::UndefinedTable,
            TableAlreadyExists => SqlState::DuplicateTable,
            ColumnDoesNotExist => SqlState::UndefinedColumn,
            IndexAlreadyExists => SqlState::DuplicateObject,
            NoAvailableIndex | NoSupported | ExpectingDQLStmt | LimitedOrderBy
            | LimitedGroupBy | LimitedCount | LimitedAutoIncrement | LimitedKeyType
            | LimitedIndexCreation => SqlState::FeatureNotSupported,
            MaxLengthExceeded => SqlState::StringDataRightTruncation,
            PKCannotBeNull | IndexedColumnCannotBeNull | NotNullableColumnCannotBeNull => {
                SqlState::NotNullViolation
            }
            DuplicatedColumn => SqlState::DuplicateColumn,
            NoValueForAutoIncrement => SqlState::GeneratedAlways,
            DivisionByZero => SqlState::DivisionByZero,
            NotComparableValues | InvalidCondition => SqlState::DatatypeMismatch,
            InferredMultipleTypes => SqlState::IndeterminateDatatype,
            TooManyRows | MaxStmtNumberExceeded => SqlState::ProgramLimitExceeded,
            CorruptedData | IllegalMappedKey => SqlState::DataCorrupted,
            DDLorDMLTxOnly => SqlState::InvalidTransactionState,
            HavingClauseRequiresGroupClause => SqlState::GroupingError,
            KeyAlreadyExists | DuplicatedKey => SqlState::UniqueViolation,
            KeyNotFound => SqlState::UndefinedObject,
            TxConflict => SqlState::SerializationFailure,
            Parse(_) => SqlState::SyntaxError,
        };
        ErrorResponse::error(code, e.to_string())
    }
}

#[derive(Debug)]
pub enum NoticeSeverity {
    Warning,
    Notice,
    Debug,
    Info,
    Log,
}

impl NoticeSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeSeverity::Warning => "WARNING",
            NoticeSeverity::Notice => "NOTICE",
            NoticeSeverity::Debug => "DEBUG",
            NoticeSeverity::Info => "INFO",
            NoticeSeverity::Log => "LOG",
        }
    }
}

#[derive(Debug)]
pub struct NoticeResponse {
    pub severity: NoticeSeverity,
    pub code: SqlState,
    pub message: String,
}

impl NoticeResponse {
    pub fn info(msg: impl Into<String>) -> NoticeResponse {
        NoticeResponse {
            severity: NoticeSeverity::Info,
            code: SqlState::Successful,
            message: msg.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_id: i32,
    pub col_id: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_mod: i32,
    pub format: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescribeObjectType {
    Statement = b'S',
    Portal = b'P',
}

impl std::fmt::Display for DescribeObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescribeObjectType::Statement => write!(f, "Statement"),
            DescribeObjectType::Portal => write!(f, "Portal"),
        }
    }
}

impl TryFrom<u8> for DescribeObjectType {
    type Error = PgSrvError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'S' => Ok(DescribeObjectType::Statement),
            b'P' => Ok(DescribeObjectType::Portal),
            _ => Err(PgSrvError::UnexpectedDescribeObjectType(value)),
        }
    }
}
