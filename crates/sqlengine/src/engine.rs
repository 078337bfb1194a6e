//! Engine entry points and per-session handles.

use crate::catalog::Catalog;
use crate::errors::{Result, SqlError};
use crate::executor;
use crate::params;
use crate::planner;
use crate::rowreader::{ColumnDesc, ParamTypes, QueryCtx, RowReader};
use crate::sql::ast::{SelectStmt, Statement};
use crate::sql::{self, ast};
use crate::value::Value;
use crate::eval;
use kvstore::MemStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Named parameter values for one execution.
pub type Params = BTreeMap<String, Value>;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Byte prefix every persisted key lives under.
    pub prefix: Vec<u8>,
    /// Upper bound on the distinct-set a `SELECT DISTINCT` may accumulate.
    pub distinct_limit: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            prefix: vec![0x02],
            distinct_limit: 1 << 16,
        }
    }
}

impl Options {
    pub fn with_prefix(mut self, prefix: Vec<u8>) -> Options {
        self.prefix = prefix;
        self
    }

    pub fn with_distinct_limit(mut self, limit: usize) -> Options {
        self.distinct_limit = limit;
        self
    }
}

/// Result of executing a batch of non-query statements.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExecSummary {
    pub updated_rows: usize,
    pub last_insert_pk: Option<i64>,
}

/// The embedded SQL engine: a catalog and an executor over an ordered
/// key-value store. Shared by every session; catalog mutations serialize
/// behind the exclusive side of one lock, read paths take the shared side.
pub struct Engine {
    store: MemStore,
    opts: Options,
    catalog: RwLock<Catalog>,
    ready: AtomicBool,
}

impl Engine {
    pub fn new(store: MemStore, opts: Options) -> Engine {
        Engine {
            store,
            opts,
            catalog: RwLock::new(Catalog::default()),
            ready: AtomicBool::new(false),
        }
    }

    /// Loads the catalog from the store. Until this completes (explicitly or
    /// through the first `exec`), catalog reads fail with `CatalogNotReady`.
    pub fn ensure_catalog_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut guard = self.catalog.write();
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let snapshot = self.store.snapshot()?;
        *guard = Catalog::load(&snapshot, &self.opts.prefix)?;
        self.ready.store(true, Ordering::Release);
        debug!("catalog ready");
        Ok(())
    }

    /// Discards the in-memory catalog and rebuilds it from the store. Also
    /// used internally after a failed DDL batch, whose in-memory mutations
    /// must not outlive the aborted transaction.
    pub fn reload_catalog(&self) -> Result<()> {
        let mut guard = self.catalog.write();
        let snapshot = self.store.snapshot()?;
        *guard = Catalog::load(&snapshot, &self.opts.prefix)?;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn check_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SqlError::CatalogNotReady)
        }
    }

    /// Opens a session handle. Sessions are cheap and engine state is shared.
    pub fn session(self: &Arc<Self>) -> SessionHandle {
        SessionHandle {
            engine: Arc::clone(self),
            cur_db: None,
        }
    }

    pub fn exists_database(&self, name: &str) -> Result<bool> {
        self.check_ready()?;
        Ok(self.catalog.read().exists_database(name))
    }

    pub fn close(&self) {
        self.store.close();
    }

    fn query_ctx(&self) -> Result<QueryCtx> {
        Ok(QueryCtx {
            snapshot: self.store.snapshot()?,
            prefix: self.opts.prefix.clone(),
            distinct_limit: self.opts.distinct_limit,
        })
    }
}

/// A per-connection handle: the selected database plus a reference to the
/// shared engine. Prepared-statement state lives in the wire session, not
/// here.
pub struct SessionHandle {
    engine: Arc<Engine>,
    cur_db: Option<String>,
}

impl SessionHandle {
    pub fn database(&self) -> Option<&str> {
        self.cur_db.as_deref()
    }

    pub fn use_database(&mut self, name: &str) -> Result<()> {
        self.engine.check_ready()?;
        if !self.engine.catalog.read().exists_database(name) {
            return Err(SqlError::DatabaseDoesNotExist);
        }
        self.cur_db = Some(name.to_string());
        Ok(())
    }

    fn current_db(&self) -> Result<&str> {
        self.cur_db.as_deref().ok_or(SqlError::NoDatabaseSelected)
    }

    /// Parses and executes a batch of non-query statements atomically.
    pub fn exec(&mut self, sql: &str, params: &Params) -> Result<ExecSummary> {
        let stmts = sql::parse(sql)?;
        self.exec_stmts(&stmts, params)
    }

    /// Executes parsed statements in one store transaction. A batch is either
    /// all DDL or all DML.
    pub fn exec_stmts(&mut self, stmts: &[Statement], params: &Params) -> Result<ExecSummary> {
        self.engine.ensure_catalog_ready()?;

        let has_ddl = stmts.iter().any(|s| s.is_ddl());
        let has_dml = stmts.iter().any(|s| !s.is_ddl());
        if has_ddl && has_dml {
            return Err(SqlError::DDLorDMLTxOnly);
        }

        let result = self.exec_batch(stmts, params);
        if result.is_err() && has_ddl {
            // drop catalog mutations made on behalf of the aborted batch
            if let Err(reload) = self.engine.reload_catalog() {
                tracing::warn!(%reload, "catalog reload after failed batch");
            }
        }
        result
    }

    fn exec_batch(&mut self, stmts: &[Statement], params: &Params) -> Result<ExecSummary> {
        let params = normalize_params(params)?;
        let prefix = self.engine.opts.prefix.clone();
        let ctx = self.engine.query_ctx()?;

        let mut catalog = self.engine.catalog.write();
        let mut tx = self.engine.store.begin()?;
        let mut summary = ExecSummary::default();

        for stmt in stmts {
            match stmt {
                Statement::CreateDatabase {
                    name,
                    if_not_exists,
                } => {
                    if *if_not_exists && catalog.exists_database(name) {
                        continue;
                    }
                    catalog.create_database(&mut tx, &prefix, name)?;
                }
                Statement::UseDatabase { name } => {
                    catalog.db(name)?;
                    self.cur_db = Some(name.clone());
                }
                Statement::CreateTable {
                    table,
                    if_not_exists,
                    cols,
                    pk,
                } => {
                    let db = self.current_db()?;
                    if *if_not_exists && catalog.db(db)?.table(table).is_ok() {
                        continue;
                    }
                    catalog.create_table(&mut tx, &prefix, db, table, cols, pk)?;
                }
                Statement::CreateIndex {
                    table,
                    cols,
                    unique,
                    if_not_exists,
                } => {
                    let db = self.current_db()?.to_string();
                    let schema = catalog.db(&db)?.table(table)?;
                    let mut ids = Vec::with_capacity(cols.len());
                    for name in cols {
                        ids.push(schema.col_by_name(name)?.id);
                    }
                    if schema.index_on(&ids).is_some() {
                        if *if_not_exists {
                            continue;
                        }
                        return Err(SqlError::IndexAlreadyExists);
                    }
                    // no backfill: only empty tables may gain indexes
                    if !executor::table_is_empty(&ctx, catalog.db(&db)?.id, schema.id)? {
                        return Err(SqlError::LimitedIndexCreation);
                    }
                    catalog.create_index(&mut tx, &prefix, &db, table, cols, *unique)?;
                }
                Statement::Insert(insert) => {
                    let db = self.current_db()?.to_string();
                    let db_id = catalog.db(&db)?.id;
                    let table = catalog.db(&db)?.table(&insert.table)?.clone();
                    let bound = bind_insert(insert, &params)?;
                    let outcome = executor::exec_insert(
                        &mut tx,
                        &mut catalog,
                        &prefix,
                        db_id,
                        &db,
                        &table,
                        &bound,
                    )?;
                    summary.updated_rows += outcome.rows;
                    summary.last_insert_pk = outcome.last_pk.or(summary.last_insert_pk);
                }
                Statement::Update(update) => {
                    let db = self.current_db()?.to_string();
                    let db_id = catalog.db(&db)?.id;
                    let table = catalog.db(&db)?.table(&update.table)?.clone();
                    let bound = bind_update(update, &params)?;
                    let outcome = executor::exec_update(
                        &mut tx, &ctx, &prefix, db_id, &db, &table, &bound,
                    )?;
                    summary.updated_rows += outcome.rows;
                }
                Statement::Delete(delete) => {
                    let db = self.current_db()?.to_string();
                    let db_id = catalog.db(&db)?.id;
                    let table = catalog.db(&db)?.table(&delete.table)?.clone();
                    let bound = bind_delete(delete, &params)?;
                    let outcome = executor::exec_delete(
                        &mut tx, &ctx, &prefix, db_id, &db, &table, &bound,
                    )?;
                    summary.updated_rows += outcome.rows;
                }
                Statement::Select(_) => return Err(SqlError::IllegalArguments),
            }
        }

        tx.commit()?;
        Ok(summary)
    }

    /// Parses a single `SELECT` and opens a reader over a fresh snapshot.
    pub fn query(&self, sql: &str, params: &Params) -> Result<Box<dyn RowReader>> {
        let mut stmts = sql::parse(sql)?;
        if stmts.len() != 1 {
            return Err(SqlError::MaxStmtNumberExceeded);
        }
        match stmts.remove(0) {
            Statement::Select(select) => self.query_stmt(&select, params),
            _ => Err(SqlError::ExpectingDQLStmt),
        }
    }

    /// Plans an already-parsed `SELECT` with the given parameter bindings.
    pub fn query_stmt(&self, select: &SelectStmt, params: &Params) -> Result<Box<dyn RowReader>> {
        self.engine.check_ready()?;
        let params = normalize_params(params)?;
        let bound = bind_select(select, &params)?;

        let ctx = self.engine.query_ctx()?;
        let catalog = self.engine.catalog.read();
        planner::plan_select(&catalog, ctx, self.current_db()?, &bound)
    }

    /// Plans a select without binding parameters, returning its result
    /// column descriptors and inferred parameter types. Backs the extended
    /// protocol's Parse/Describe path.
    pub fn describe(&self, select: &SelectStmt) -> Result<(Vec<ColumnDesc>, ParamTypes)> {
        self.engine.ensure_catalog_ready()?;
        let ctx = self.engine.query_ctx()?;
        let catalog = self.engine.catalog.read();
        let reader = planner::plan_select(&catalog, ctx, self.current_db()?, select)?;
        let cols = reader.columns()?;
        let mut params = ParamTypes::new();
        reader.infer_parameters(&mut params)?;
        Ok((cols, params))
    }

    /// Assigns a type to every placeholder of a statement.
    pub fn infer_parameters(&self, stmt: &Statement) -> Result<ParamTypes> {
        self.engine.ensure_catalog_ready()?;
        let mut target = ParamTypes::new();

        match stmt {
            Statement::Select(select) => {
                // an unbound reader tree carries the typing context
                let ctx = self.engine.query_ctx()?;
                let catalog = self.engine.catalog.read();
                let reader = planner::plan_select(&catalog, ctx, self.current_db()?, select)?;
                reader.infer_parameters(&mut target)?;
            }
            Statement::Insert(insert) => {
                let catalog = self.engine.catalog.read();
                let table = catalog.db(self.current_db()?)?.table(&insert.table)?;
                params::infer_insert(insert, table, &mut target)?;
            }
            Statement::Update(update) => {
                let db = self.current_db()?;
                let catalog = self.engine.catalog.read();
                let table = catalog.db(db)?.table(&update.table)?;
                let qualified = ast::UpdateStmt {
                    table: update.table.clone(),
                    sets: update.sets.clone(),
                    filter: update
                        .filter
                        .as_ref()
                        .map(|f| planner::qualify_single_table(db, table, f))
                        .transpose()?,
                };
                params::infer_update(&qualified, db, table, &mut target)?;
            }
            Statement::Delete(delete) => {
                let db = self.current_db()?;
                let catalog = self.engine.catalog.read();
                let table = catalog.db(db)?.table(&delete.table)?;
                if let Some(filter) = &delete.filter {
                    let qualified = planner::qualify_single_table(db, table, filter)?;
                    let cols = table
                        .cols
                        .iter()
                        .map(|c| {
                            (
                                format!("{}.{}.{}", db, table.name, c.name),
                                c.ty,
                            )
                        })
                        .collect();
                    params::infer_from_expr(&qualified, &cols, &mut target)?;
                }
            }
            _ => {}
        }
        Ok(target)
    }
}

/// Lowercases parameter names and rejects case-insensitive duplicates.
fn normalize_params(params: &Params) -> Result<Params> {
    let mut normalized = Params::new();
    for (name, value) in params {
        if normalized
            .insert(name.to_lowercase(), value.clone())
            .is_some()
        {
            return Err(SqlError::DuplicatedParameters);
        }
    }
    Ok(normalized)
}

fn bind_insert(stmt: &ast::InsertStmt, params: &Params) -> Result<ast::InsertStmt> {
    let mut bound = stmt.clone();
    for row in &mut bound.rows {
        for expr in row.iter_mut() {
            *expr = eval::substitute_params(expr, params)?;
        }
    }
    Ok(bound)
}

fn bind_update(stmt: &ast::UpdateStmt, params: &Params) -> Result<ast::UpdateStmt> {
    let mut bound = stmt.clone();
    for (_, expr) in &mut bound.sets {
        *expr = eval::substitute_params(expr, params)?;
    }
    if let Some(filter) = &mut bound.filter {
        *filter = eval::substitute_params(filter, params)?;
    }
    Ok(bound)
}

fn bind_delete(stmt: &ast::DeleteStmt, params: &Params) -> Result<ast::DeleteStmt> {
    let mut bound = stmt.clone();
    if let Some(filter) = &mut bound.filter {
        *filter = eval::substitute_params(filter, params)?;
    }
    Ok(bound)
}

fn bind_select(stmt: &SelectStmt, params: &Params) -> Result<SelectStmt> {
    let mut bound = stmt.clone();
    for selector in &mut bound.selectors {
        if let ast::Selector::Expr { expr, .. } = selector {
            *expr = eval::substitute_params(expr, params)?;
        }
    }
    for join in &mut bound.joins {
        join.on = eval::substitute_params(&join.on, params)?;
    }
    if let Some(filter) = &mut bound.filter {
        *filter = eval::substitute_params(filter, params)?;
    }
    if let Some(having) = &mut bound.having {
        *having = eval::substitute_params(having, params)?;
    }
    Ok(bound)
}
