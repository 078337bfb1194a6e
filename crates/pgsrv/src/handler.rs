use crate::codec::{FramedConn, PgCodec};
use crate::errors::{PgSrvError, Result};
use crate::messages::{
    BackendMessage, DescribeObjectType, ErrorResponse, FieldDescription, FrontendMessage,
    SqlState, StartupMessage, TransactionStatus,
};
use pgrepr::{Format, PgReprError};
use sqlengine::rowreader::{ColumnDesc, RowReader};
use sqlengine::sql::ast::{SelectStmt, Statement};
use sqlengine::{Engine, Params, SessionHandle, SqlError, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Version reported through ParameterStatus at session start.
const SERVER_VERSION: &str = "9.6.0";
/// Fixed row returned for `SELECT VERSION()`.
const VERSION_MESSAGE: &str = "PostgreSQL 9.6.0 (keeldb 0.1.0)";

/// Accepts freshly-opened connections and runs the protocol over them.
pub struct Handler {
    engine: Arc<Engine>,
}

impl Handler {
    pub fn new(engine: Arc<Engine>) -> Handler {
        Handler { engine }
    }

    /// Handle an incoming connection, driving it to completion.
    pub async fn handle_connection<C>(&self, mut conn: C) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let params = loop {
            let startup = PgCodec::decode_startup_from_conn(&mut conn).await?;
            trace!(?startup, "received startup message");
            match startup {
                StartupMessage::SSLRequest => {
                    // TLS is not offered; the client falls back to cleartext
                    // and sends a fresh startup message.
                    conn.write_all(b"N").await?;
                }
                StartupMessage::CancelRequest => return Ok(()),
                StartupMessage::StartupRequest { params, .. } => break params,
            }
        };

        let mut framed = FramedConn::new(conn);

        framed.send(BackendMessage::AuthenticationOk).await?;
        for (key, val) in [
            ("server_version", SERVER_VERSION),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
        ] {
            framed
                .send(BackendMessage::ParameterStatus {
                    key: key.to_string(),
                    val: val.to_string(),
                })
                .await?;
        }

        // Query cancellation is not implemented; the key data only satisfies
        // clients that insist on reading it.
        static CONN_ID: AtomicI32 = AtomicI32::new(1);
        let pid = CONN_ID.fetch_add(1, Ordering::Relaxed);
        framed
            .send(BackendMessage::BackendKeyData {
                pid,
                secret: pid ^ 0x7c0ffee,
            })
            .await?;

        if let Err(e) = self.engine.ensure_catalog_ready() {
            framed
                .send(ErrorResponse::fatal(SqlState::InternalError, e.to_string()).into())
                .await?;
            return Ok(());
        }

        let mut session = self.engine.session();
        if let Some(db) = params.get("database") {
            if let Err(e) = session.use_database(db) {
                framed
                    .send(ErrorResponse::fatal(SqlState::InvalidCatalogName, e.to_string()).into())
                    .await?;
                return Ok(());
            }
        }
        if let Some(user) = params.get("user") {
            debug!(%user, pid, "session started");
        }

        ClientSession::new(session, framed).run().await
    }
}

/// A prepared statement: the parsed tree plus its parameter and result
/// descriptors. `stmt` is `None` for statements held without engine
/// involvement (`SET ...` and the empty statement).
struct PreparedStatement {
    stmt: Option<SelectStmt>,
    params: Vec<(String, sqlengine::SqlType)>,
    results: Vec<ColumnDesc>,
}

/// A prepared statement bound to parameter values and result formats.
struct Portal {
    stmt: Option<SelectStmt>,
    results: Vec<ColumnDesc>,
    params: Params,
    result_formats: Vec<Format>,
}

/// A recoverable failure while processing one message. The session reports
/// it as an ErrorResponse and, in the extended protocol, discards messages
/// until the next Sync.
#[derive(Debug)]
enum StepError {
    Sql(SqlError),
    Repr(PgReprError),
    Session(ErrorResponse),
}

impl From<SqlError> for StepError {
    fn from(e: SqlError) -> Self {
        StepError::Sql(e)
    }
}

impl From<PgReprError> for StepError {
    fn from(e: PgReprError) -> Self {
        StepError::Repr(e)
    }
}

impl StepError {
    fn into_response(self) -> ErrorResponse {
        match self {
            StepError::Sql(e) => ErrorResponse::from(&e),
            StepError::Repr(e) => {
                ErrorResponse::error(SqlState::InvalidParameterValue, e.to_string())
            }
            StepError::Session(resp) => resp,
        }
    }
}

type StepResult<T> = std::result::Result<T, StepError>;

struct ClientSession<C> {
    conn: FramedConn<C>,
    session: SessionHandle,
    statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
    wait_for_sync: bool,
}

impl<C> ClientSession<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn new(session: SessionHandle, conn: FramedConn<C>) -> Self {
        ClientSession {
            conn,
            session,
            statements: HashMap::new(),
            portals: HashMap::new(),
            wait_for_sync: false,
        }
    }

    async fn run(mut self) -> Result<()> {
        self.ready_for_query().await?;

        loop {
            let Some(msg) = self.conn.read().await? else {
                trace!("connection closed");
                return Ok(());
            };

            // When an error occurs in the extended protocol, every following
            // extended message is discarded until a Sync arrives; the Sync
            // itself is processed so exactly one ReadyForQuery answers it.
            if self.wait_for_sync && msg.is_extended() && !matches!(msg, FrontendMessage::Sync) {
                trace!(msg = msg.name(), "discarding until sync");
                continue;
            }

            match msg {
                FrontendMessage::Terminate => return Ok(()),
                FrontendMessage::Query { sql } => self.simple_query(&sql).await?,
                FrontendMessage::PasswordMessage { .. } => {
                    // authentication always succeeded at startup
                }
                FrontendMessage::Parse { name, sql, .. } => {
                    match self.parse_step(&name, &sql) {
                        Ok(()) => self.conn.send(BackendMessage::ParseComplete).await?,
                        Err(StepError::Session(resp))
                            if matches!(resp.code, SqlState::DuplicateObject) =>
                        {
                            // redefining a named statement tears the
                            // connection down
                            self.conn
                                .send(ErrorResponse::fatal(resp.code, resp.message).into())
                                .await?;
                            return Err(PgSrvError::StatementAlreadyPresent(name));
                        }
                        Err(e) => self.fail_extended(e).await?,
                    }
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    param_values,
                    result_formats,
                } => {
                    match self.bind_step(
                        &portal,
                        &statement,
                        &param_formats,
                        param_values,
                        &result_formats,
                    ) {
                        Ok(()) => self.conn.send(BackendMessage::BindComplete).await?,
                        Err(e) => self.fail_extended(e).await?,
                    }
                }
                FrontendMessage::Describe { object_type, name } => {
                    match self.describe_step(object_type, &name) {
                        Ok(msgs) => {
                            for msg in msgs {
                                self.conn.send(msg).await?;
                            }
                        }
                        Err(e) => self.fail_extended(e).await?,
                    }
                }
                FrontendMessage::Execute { portal, .. } => {
                    if let Err(e) = self.execute_step(&portal).await? {
                        self.fail_extended(e).await?;
                    }
                }
                FrontendMessage::Sync => {
                    self.wait_for_sync = false;
                    self.ready_for_query().await?;
                }
                FrontendMessage::Flush => self.conn.flush().await?,
                FrontendMessage::Unknown { msg_type } => {
                    self.conn
                        .send(
                            ErrorResponse::error(
                                SqlState::ProtocolViolation,
                                format!("unknown message type: {}", msg_type as char),
                            )
                            .into(),
                        )
                        .await?;
                }
            }
        }
    }

    async fn ready_for_query(&mut self) -> Result<()> {
        self.conn
            .send(BackendMessage::ReadyForQuery(TransactionStatus::Idle))
            .await
    }

    /// Reports a recoverable extended-protocol error and arms the
    /// discard-until-Sync state.
    async fn fail_extended(&mut self, e: StepError) -> Result<()> {
        self.conn.send(e.into_response().into()).await?;
        self.wait_for_sync = true;
        Ok(())
    }

    // --- simple query protocol ---

    async fn simple_query(&mut self, sql: &str) -> Result<()> {
        trace!(%sql, "simple query");

        if is_set_statement(sql) {
            self.command_complete("SET").await?;
            return self.ready_for_query().await;
        }
        if is_version_query(sql) {
            self.send_version_row().await?;
            return self.ready_for_query().await;
        }

        let stmts = match sqlengine::sql::parse(sql) {
            Ok(stmts) => stmts,
            Err(e) => {
                self.conn.send(ErrorResponse::from(&e).into()).await?;
                return self.ready_for_query().await;
            }
        };

        if stmts.is_empty() {
            // a lone ";" still gets an acknowledgement
            self.command_complete("ok").await?;
            return self.ready_for_query().await;
        }

        for stmt in stmts {
            if let Err(e) = self.simple_statement(stmt).await? {
                self.conn.send(e.into_response().into()).await?;
                break;
            }
        }
        self.ready_for_query().await
    }

    /// Runs one statement of a simple query. The outer result is a fatal
    /// connection error, the inner one a user error.
    async fn simple_statement(&mut self, stmt: Statement) -> Result<StepResult<()>> {
        match stmt {
            Statement::UseDatabase { .. } => Ok(Err(StepError::Session(
                ErrorResponse::feature_not_supported(
                    "USE DATABASE is not supported in the pgsql protocol",
                ),
            ))),
            Statement::CreateDatabase { .. } => Ok(Err(StepError::Session(
                ErrorResponse::feature_not_supported(
                    "CREATE DATABASE is not supported in the pgsql protocol",
                ),
            ))),
            Statement::Select(select) => {
                let reader = match self.session.query_stmt(&select, &Params::new()) {
                    Ok(reader) => reader,
                    Err(e) => return Ok(Err(e.into())),
                };
                let count = match self.stream_rows(reader, None).await? {
                    Ok(count) => count,
                    Err(e) => return Ok(Err(e)),
                };
                self.command_complete(&format!("SELECT {}", count)).await?;
                Ok(Ok(()))
            }
            stmt => {
                let summary = match self.session.exec_stmts(&[stmt.clone()], &Params::new()) {
                    Ok(summary) => summary,
                    Err(e) => return Ok(Err(e.into())),
                };
                self.command_complete(&command_tag(&stmt, summary.updated_rows))
                    .await?;
                Ok(Ok(()))
            }
        }
    }

    /// Sends RowDescription and DataRows for a reader; text format unless
    /// per-column formats are given. Returns the emitted row count.
    async fn stream_rows(
        &mut self,
        mut reader: Box<dyn RowReader>,
        formats: Option<&[Format]>,
    ) -> Result<StepResult<usize>> {
        let cols = match reader.columns() {
            Ok(cols) => cols,
            Err(e) => return Ok(Err(e.into())),
        };
        self.conn
            .send(BackendMessage::RowDescription(field_descriptions(
                &cols, formats,
            )))
            .await?;

        let mut count = 0;
        loop {
            match reader.read() {
                Ok(Some(row)) => {
                    let cells = match row_cells(&cols, &row, formats) {
                        Ok(cells) => cells,
                        Err(e) => {
                            reader.close();
                            return Ok(Err(e));
                        }
                    };
                    self.conn.send(BackendMessage::DataRow(cells)).await?;
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    reader.close();
                    return Ok(Err(e.into()));
                }
            }
        }
        reader.close();
        Ok(Ok(count))
    }

    async fn send_version_row(&mut self) -> Result<()> {
        self.conn
            .send(BackendMessage::RowDescription(vec![FieldDescription {
                name: "version".to_string(),
                table_id: 0,
                col_id: 0,
                type_oid: pgrepr::type_oid(sqlengine::SqlType::Varchar),
                type_size: pgrepr::type_size(sqlengine::SqlType::Varchar),
                type_mod: -1,
                format: Format::Text.as_i16(),
            }]))
            .await?;
        self.conn
            .send(BackendMessage::DataRow(vec![Some(
                VERSION_MESSAGE.as_bytes().to_vec(),
            )]))
            .await?;
        self.command_complete("SELECT 1").await
    }

    async fn command_complete(&mut self, tag: &str) -> Result<()> {
        self.conn
            .send(BackendMessage::CommandComplete {
                tag: tag.to_string(),
            })
            .await
    }

    // --- extended query protocol ---

    fn parse_step(&mut self, name: &str, sql: &str) -> StepResult<()> {
        if self.statements.contains_key(name) && !name.is_empty() {
            return Err(StepError::Session(ErrorResponse::error(
                SqlState::DuplicateObject,
                format!("prepared statement already exists: {}", name),
            )));
        }

        let prepared = if is_set_statement(sql) || sql.trim().trim_end_matches(';').is_empty() {
            // held without engine involvement; Execute answers with
            // EmptyQueryResponse
            PreparedStatement {
                stmt: None,
                params: Vec::new(),
                results: Vec::new(),
            }
        } else {
            let mut stmts = sqlengine::sql::parse(sql)?;
            if stmts.len() > 1 {
                return Err(StepError::Sql(SqlError::MaxStmtNumberExceeded));
            }
            let Statement::Select(select) = stmts.remove(0) else {
                // only queries may be prepared
                return Err(StepError::Sql(SqlError::ExpectingDQLStmt));
            };

            let (results, params) = self.session.describe(&select)?;
            PreparedStatement {
                stmt: Some(select),
                params: params.into_iter().collect(),
                results,
            }
        };

        // the unnamed statement is silently replaced
        self.statements.insert(name.to_string(), prepared);
        Ok(())
    }

    fn bind_step(
        &mut self,
        portal: &str,
        statement: &str,
        param_formats: &[Format],
        param_values: Vec<Option<Vec<u8>>>,
        result_formats: &[Format],
    ) -> StepResult<()> {
        if self.portals.contains_key(portal) && !portal.is_empty() {
            return Err(StepError::Session(ErrorResponse::error(
                SqlState::DuplicateObject,
                format!("portal already exists: {}", portal),
            )));
        }
        let Some(stmt) = self.statements.get(statement) else {
            return Err(StepError::Session(ErrorResponse::error(
                SqlState::InvalidSqlStatementName,
                format!("unknown prepared statement: {}", statement),
            )));
        };

        if param_values.len() != stmt.params.len() {
            return Err(StepError::Session(ErrorResponse::error(
                SqlState::ProtocolViolation,
                format!(
                    "bind supplies {} parameters, statement needs {}",
                    param_values.len(),
                    stmt.params.len()
                ),
            )));
        }
        let param_formats = expand_formats(param_formats, stmt.params.len())?;

        let mut params = Params::new();
        for (((name, ty), format), value) in stmt
            .params
            .iter()
            .zip(param_formats.iter())
            .zip(param_values)
        {
            let value = match value {
                None => Value::Null(*ty),
                Some(raw) => pgrepr::decode_param(*ty, *format, &raw)?,
            };
            params.insert(name.clone(), value);
        }

        let result_formats = expand_formats(result_formats, stmt.results.len())?;

        self.portals.insert(
            portal.to_string(),
            Portal {
                stmt: stmt.stmt.clone(),
                results: stmt.results.clone(),
                params,
                result_formats,
            },
        );
        Ok(())
    }

    fn describe_step(
        &mut self,
        object_type: DescribeObjectType,
        name: &str,
    ) -> StepResult<Vec<BackendMessage>> {
        match object_type {
            DescribeObjectType::Statement => {
                let Some(stmt) = self.statements.get(name) else {
                    return Err(StepError::Session(ErrorResponse::error(
                        SqlState::InvalidSqlStatementName,
                        format!("unknown prepared statement: {}", name),
                    )));
                };
                let oids = stmt
                    .params
                    .iter()
                    .map(|(_, ty)| pgrepr::type_oid(*ty))
                    .collect();
                let mut msgs = vec![BackendMessage::ParameterDescription(oids)];
                if stmt.results.is_empty() {
                    msgs.push(BackendMessage::NoData);
                } else {
                    msgs.push(BackendMessage::RowDescription(field_descriptions(
                        &stmt.results,
                        None,
                    )));
                }
                Ok(msgs)
            }
            DescribeObjectType::Portal => {
                let Some(portal) = self.portals.get(name) else {
                    return Err(StepError::Session(ErrorResponse::error(
                        SqlState::InvalidCursorName,
                        format!("unknown portal: {}", name),
                    )));
                };
                if portal.results.is_empty() {
                    Ok(vec![BackendMessage::NoData])
                } else {
                    Ok(vec![BackendMessage::RowDescription(field_descriptions(
                        &portal.results,
                        Some(&portal.result_formats),
                    ))])
                }
            }
        }
    }

    async fn execute_step(&mut self, name: &str) -> Result<StepResult<()>> {
        let Some(portal) = self.portals.get(name) else {
            return Ok(Err(StepError::Session(ErrorResponse::error(
                SqlState::InvalidCursorName,
                format!("unknown portal: {}", name),
            ))));
        };

        let Some(select) = portal.stmt.clone() else {
            self.conn.send(BackendMessage::EmptyQueryResponse).await?;
            return Ok(Ok(()));
        };
        let params = portal.params.clone();
        let formats = portal.result_formats.clone();

        let reader = match self.session.query_stmt(&select, &params) {
            Ok(reader) => reader,
            Err(e) => return Ok(Err(e.into())),
        };

        let cols = match reader.columns() {
            Ok(cols) => cols,
            Err(e) => return Ok(Err(e.into())),
        };

        // Bind already announced the row shape; Execute emits only the rows.
        let mut reader = reader;
        let mut count = 0;
        loop {
            match reader.read() {
                Ok(Some(row)) => {
                    let cells = match row_cells(&cols, &row, Some(&formats)) {
                        Ok(cells) => cells,
                        Err(e) => {
                            reader.close();
                            return Ok(Err(e));
                        }
                    };
                    self.conn.send(BackendMessage::DataRow(cells)).await?;
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    reader.close();
                    return Ok(Err(e.into()));
                }
            }
        }
        reader.close();
        self.command_complete(&format!("SELECT {}", count)).await?;
        Ok(Ok(()))
    }
}

/// Expands the protocol's format-code shorthand (none = all text, one = all
/// the same) into one format per element.
fn expand_formats(formats: &[Format], len: usize) -> StepResult<Vec<Format>> {
    match formats.len() {
        0 => Ok(vec![Format::Text; len]),
        1 => Ok(vec![formats[0]; len]),
        n if n == len => Ok(formats.to_vec()),
        n => Err(StepError::Session(ErrorResponse::error(
            SqlState::ProtocolViolation,
            format!("expected {} format codes, got {}", len, n),
        ))),
    }
}

fn field_descriptions(cols: &[ColumnDesc], formats: Option<&[Format]>) -> Vec<FieldDescription> {
    cols.iter()
        .enumerate()
        .map(|(pos, col)| FieldDescription {
            name: col.name.clone(),
            table_id: 0,
            col_id: 0,
            type_oid: pgrepr::type_oid(col.ty),
            type_size: pgrepr::type_size(col.ty),
            type_mod: -1,
            format: formats
                .and_then(|f| f.get(pos))
                .copied()
                .unwrap_or(Format::Text)
                .as_i16(),
        })
        .collect()
}

fn row_cells(
    cols: &[ColumnDesc],
    row: &sqlengine::rowreader::Row,
    formats: Option<&[Format]>,
) -> StepResult<Vec<Option<Vec<u8>>>> {
    let mut cells = Vec::with_capacity(cols.len());
    for (pos, col) in cols.iter().enumerate() {
        let format = formats
            .and_then(|f| f.get(pos))
            .copied()
            .unwrap_or(Format::Text);
        match row.get(&col.selector) {
            None => cells.push(None),
            Some(value) if value.is_null() => cells.push(None),
            Some(value) => cells.push(Some(pgrepr::encode_value(value, format)?)),
        }
    }
    Ok(cells)
}

fn is_set_statement(sql: &str) -> bool {
    let mut words = sql.split_whitespace();
    matches!(words.next(), Some(first) if first.eq_ignore_ascii_case("set")) && words.next().is_some()
}

fn is_version_query(sql: &str) -> bool {
    let normalized: String = sql
        .to_ascii_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ';')
        .collect();
    normalized == "selectversion()"
}

fn command_tag(stmt: &Statement, rows: usize) -> String {
    match stmt {
        Statement::Insert(insert) if insert.is_upsert => format!("UPSERT {}", rows),
        Statement::Insert(_) => format!("INSERT 0 {}", rows),
        Statement::Update(_) => format!("UPDATE {}", rows),
        Statement::Delete(_) => format!("DELETE {}", rows),
        Statement::CreateTable { .. } => "CREATE TABLE".to_string(),
        Statement::CreateIndex { .. } => "CREATE INDEX".to_string(),
        Statement::CreateDatabase { .. } => "CREATE DATABASE".to_string(),
        Statement::UseDatabase { .. } => "USE".to_string(),
        Statement::Select(_) => format!("SELECT {}", rows),
    }
}
