//! DML execution: insert, upsert, update, delete, and secondary-index
//! maintenance.

use crate::catalog::Catalog;
use crate::errors::{Result, SqlError};
use crate::eval;
use crate::keycodec::{
    encode_id, encode_key_segment, encode_row, map_key, NS_PRIMARY, NS_SECONDARY,
    NS_UNIQUE_SECONDARY,
};
use crate::planner;
use crate::rowreader::{QueryCtx, Row};
use crate::schema::TableSchema;
use crate::sql::ast::{DeleteStmt, InsertStmt, UpdateStmt};
use crate::value::Value;
use kvstore::Tx;
use tracing::trace;

#[derive(Debug, Default)]
pub(crate) struct DmlOutcome {
    pub rows: usize,
    pub last_pk: Option<i64>,
}

pub(crate) fn exec_insert(
    tx: &mut Tx,
    catalog: &mut Catalog,
    prefix: &[u8],
    db_id: u32,
    db_name: &str,
    table: &TableSchema,
    stmt: &InsertStmt,
) -> Result<DmlOutcome> {
    for (pos, name) in stmt.cols.iter().enumerate() {
        table.col_by_name(name)?;
        if stmt.cols[..pos].contains(name) {
            return Err(SqlError::DuplicatedColumn);
        }
    }

    let pk_col = table.pk_col().clone();
    let empty = Row::default();
    let mut outcome = DmlOutcome::default();

    for value_exprs in &stmt.rows {
        let mut values: Vec<Value> = table.cols.iter().map(|c| Value::Null(c.ty)).collect();
        for (name, expr) in stmt.cols.iter().zip(value_exprs) {
            let col = table.col_by_name(name)?;
            let pos = table
                .cols
                .iter()
                .position(|c| c.id == col.id)
                .expect("column comes from this table");
            values[pos] = eval::eval(expr, &empty)?;
        }

        let pk_pos = table
            .cols
            .iter()
            .position(|c| c.id == pk_col.id)
            .expect("primary key column exists");

        if pk_col.auto_increment {
            if stmt.is_upsert {
                if values[pk_pos].is_null() {
                    return Err(SqlError::PKCannotBeNull);
                }
            } else {
                if !values[pk_pos].is_null() {
                    return Err(SqlError::NoValueForAutoIncrement);
                }
                values[pk_pos] = Value::Integer(catalog.next_pk(db_name, &table.name)?);
            }
        }

        check_constraints(table, &values)?;

        let pk_segment = encode_key_segment(&values[pk_pos], &pk_col)?;
        let row_key = primary_key(prefix, db_id, table.id, &pk_segment);
        let payload = encode_row(&values, &table.cols)?;

        let old_values = match tx.get(&row_key)? {
            Some(old) => Some(crate::keycodec::decode_row(&old, &table.cols)?),
            None => None,
        };

        if stmt.is_upsert {
            if pk_col.auto_increment && old_values.is_none() {
                return Err(SqlError::KeyNotFound);
            }
            tx.set(row_key, payload);
        } else {
            if old_values.is_some() {
                return Err(SqlError::KeyAlreadyExists);
            }
            tx.insert(row_key, payload)?;
        }

        maintain_indexes(
            tx,
            prefix,
            db_id,
            table,
            old_values.as_deref(),
            &values,
            &pk_segment,
        )?;

        if let Value::Integer(pk) = &values[pk_pos] {
            outcome.last_pk = Some(*pk);
            if pk_col.auto_increment {
                catalog.observe_pk(db_name, &table.name, *pk)?;
            }
        }
        outcome.rows += 1;
    }

    trace!(table = %table.name, rows = outcome.rows, upsert = stmt.is_upsert, "rows written");
    Ok(outcome)
}

pub(crate) fn exec_update(
    tx: &mut Tx,
    ctx: &QueryCtx,
    prefix: &[u8],
    db_id: u32,
    db_name: &str,
    table: &TableSchema,
    stmt: &UpdateStmt,
) -> Result<DmlOutcome> {
    let pk_col = table.pk_col().clone();
    for (name, _) in &stmt.sets {
        let col = table.col_by_name(name)?;
        if col.id == pk_col.id {
            // rewriting the key under a row is not supported
            return Err(SqlError::NoSupported);
        }
    }

    let filter = stmt
        .filter
        .as_ref()
        .map(|f| planner::qualify_single_table(db_name, table, f))
        .transpose()?;
    let sets: Vec<(u32, crate::sql::ast::Expr)> = stmt
        .sets
        .iter()
        .map(|(name, expr)| {
            Ok((
                table.col_by_name(name)?.id,
                planner::qualify_single_table(db_name, table, expr)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut reader =
        planner::plan_table_scan(ctx.clone(), db_id, db_name, table, filter.as_ref(), None, false)?;

    let mut outcome = DmlOutcome::default();
    while let Some(row) = reader.read()? {
        let old_values = row_values(db_name, table, &row)?;
        let mut new_values = old_values.clone();
        for (col_id, expr) in &sets {
            let pos = table
                .cols
                .iter()
                .position(|c| c.id == *col_id)
                .expect("assignment targets a table column");
            new_values[pos] = eval::eval(expr, &row)?;
        }
        check_constraints(table, &new_values)?;

        let pk_pos = table
            .cols
            .iter()
            .position(|c| c.id == pk_col.id)
            .expect("primary key column exists");
        let pk_segment = encode_key_segment(&new_values[pk_pos], &pk_col)?;
        let row_key = primary_key(prefix, db_id, table.id, &pk_segment);

        tx.set(row_key, encode_row(&new_values, &table.cols)?);
        maintain_indexes(
            tx,
            prefix,
            db_id,
            table,
            Some(&old_values),
            &new_values,
            &pk_segment,
        )?;
        outcome.rows += 1;
    }
    reader.close();

    trace!(table = %table.name, rows = outcome.rows, "rows updated");
    Ok(outcome)
}

pub(crate) fn exec_delete(
    tx: &mut Tx,
    ctx: &QueryCtx,
    prefix: &[u8],
    db_id: u32,
    db_name: &str,
    table: &TableSchema,
    stmt: &DeleteStmt,
) -> Result<DmlOutcome> {
    let filter = stmt
        .filter
        .as_ref()
        .map(|f| planner::qualify_single_table(db_name, table, f))
        .transpose()?;

    let mut reader =
        planner::plan_table_scan(ctx.clone(), db_id, db_name, table, filter.as_ref(), None, false)?;

    let pk_col = table.pk_col().clone();
    let pk_pos = table
        .cols
        .iter()
        .position(|c| c.id == pk_col.id)
        .expect("primary key column exists");

    let mut outcome = DmlOutcome::default();
    while let Some(row) = reader.read()? {
        let values = row_values(db_name, table, &row)?;
        let pk_segment = encode_key_segment(&values[pk_pos], &pk_col)?;

        tx.delete(primary_key(prefix, db_id, table.id, &pk_segment));
        for index in table.indexes.iter().skip(1) {
            let segment = index_segment(table, index, &values)?;
            tx.delete(secondary_key(prefix, db_id, table, index, &segment, &pk_segment));
        }
        outcome.rows += 1;
    }
    reader.close();

    trace!(table = %table.name, rows = outcome.rows, "rows deleted");
    Ok(outcome)
}

/// Whether the primary-row namespace of a table holds any entry.
pub(crate) fn table_is_empty(ctx: &QueryCtx, db_id: u32, table_id: u32) -> Result<bool> {
    let ns = map_key(
        &ctx.prefix,
        NS_PRIMARY,
        &[&encode_id(db_id), &encode_id(table_id)],
    );
    let mut iter = ctx.snapshot.range(kvstore::KeyRange::prefixed(&ns), false);
    Ok(iter.next()?.is_none())
}

fn primary_key(prefix: &[u8], db_id: u32, table_id: u32, pk_segment: &[u8]) -> Vec<u8> {
    let mut key = map_key(
        prefix,
        NS_PRIMARY,
        &[&encode_id(db_id), &encode_id(table_id)],
    );
    key.extend_from_slice(pk_segment);
    key
}

fn secondary_key(
    prefix: &[u8],
    db_id: u32,
    table: &TableSchema,
    index: &crate::schema::Index,
    segment: &[u8],
    pk_segment: &[u8],
) -> Vec<u8> {
    let ns_tag = if index.unique {
        NS_UNIQUE_SECONDARY
    } else {
        NS_SECONDARY
    };
    let mut key = map_key(
        prefix,
        ns_tag,
        &[&encode_id(db_id), &encode_id(table.id), &encode_id(index.id)],
    );
    key.extend_from_slice(segment);
    if !index.unique {
        // the appended primary key keeps non-unique entries distinct
        key.extend_from_slice(pk_segment);
    }
    key
}

/// Concatenated key segments of an index over a row's values.
fn index_segment(
    table: &TableSchema,
    index: &crate::schema::Index,
    values: &[Value],
) -> Result<Vec<u8>> {
    let mut segment = Vec::new();
    for col_id in &index.cols {
        let pos = table
            .cols
            .iter()
            .position(|c| c.id == *col_id)
            .ok_or(SqlError::CorruptedData)?;
        let col = &table.cols[pos];
        segment.extend(encode_key_segment(&values[pos], col)?);
    }
    Ok(segment)
}

/// Removes stale entries and writes fresh ones for every secondary index.
/// Unique indexes are checked by comparing the stored primary key against the
/// incoming one.
fn maintain_indexes(
    tx: &mut Tx,
    prefix: &[u8],
    db_id: u32,
    table: &TableSchema,
    old_values: Option<&[Value]>,
    new_values: &[Value],
    pk_segment: &[u8],
) -> Result<()> {
    for index in table.indexes.iter().skip(1) {
        let segment = index_segment(table, index, new_values)?;

        if let Some(old_values) = old_values {
            let old_segment = index_segment(table, index, old_values)?;
            if old_segment != segment {
                tx.delete(secondary_key(
                    prefix,
                    db_id,
                    table,
                    index,
                    &old_segment,
                    pk_segment,
                ));
            }
        }

        let key = secondary_key(prefix, db_id, table, index, &segment, pk_segment);
        if index.unique {
            if let Some(existing_pk) = tx.get(&key)? {
                if existing_pk != pk_segment {
                    return Err(SqlError::DuplicatedKey);
                }
            }
        }
        tx.set(key, pk_segment.to_vec());
    }
    Ok(())
}

/// Constraint checks over a full row image: primary key, indexed columns and
/// declared NOT NULL columns reject nulls.
fn check_constraints(table: &TableSchema, values: &[Value]) -> Result<()> {
    let pk_id = table.primary_index().cols[0];
    for (col, value) in table.cols.iter().zip(values) {
        if !value.is_null() {
            continue;
        }
        if col.id == pk_id {
            return Err(SqlError::PKCannotBeNull);
        }
        if table.is_indexed(col.id) {
            return Err(SqlError::IndexedColumnCannotBeNull);
        }
        if col.not_null {
            return Err(SqlError::NotNullableColumnCannotBeNull);
        }
    }
    Ok(())
}

/// Extracts a table's column values from a scanned row, in column order.
fn row_values(db_name: &str, table: &TableSchema, row: &Row) -> Result<Vec<Value>> {
    table
        .cols
        .iter()
        .map(|col| {
            row.get(&format!("{}.{}.{}", db_name, table.name, col.name))
                .cloned()
                .ok_or(SqlError::ColumnDoesNotExist)
        })
        .collect()
}
