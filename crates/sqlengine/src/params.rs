//! Placeholder type inference.
//!
//! A single walk over an expression or statement assigns a type to every
//! named placeholder from the first typed context it appears in: comparison
//! against a column, argument position of an insert, arithmetic, or a boolean
//! position. Reuse under a different concrete type fails; a placeholder no
//! context constrains resolves to `Any`.

use crate::errors::{Result, SqlError};
use crate::rowreader::{ColumnDesc, ParamTypes};
use crate::schema::TableSchema;
use crate::sql::ast::{BinOp, ColRef, Expr, InsertStmt, UpdateStmt};
use crate::value::SqlType;
use std::collections::HashMap;

/// Selector-to-type map for a reader's output columns.
pub fn column_types(cols: &[ColumnDesc]) -> HashMap<String, SqlType> {
    cols.iter().map(|c| (c.selector.clone(), c.ty)).collect()
}

/// Records an inferred type, upgrading `Any` and rejecting conflicts.
pub fn constrain(target: &mut ParamTypes, name: &str, ty: SqlType) -> Result<()> {
    match target.get(name) {
        None => {
            target.insert(name.to_string(), ty);
            Ok(())
        }
        Some(SqlType::Any) => {
            if ty != SqlType::Any {
                target.insert(name.to_string(), ty);
            }
            Ok(())
        }
        Some(existing) => {
            if ty == SqlType::Any || *existing == ty {
                Ok(())
            } else {
                Err(SqlError::InferredMultipleTypes)
            }
        }
    }
}

/// Static type of an expression side, when determinable.
fn side_type(expr: &Expr, cols: &HashMap<String, SqlType>) -> Option<SqlType> {
    match expr {
        Expr::Literal(v) => match v.ty() {
            SqlType::Any => None,
            ty => Some(ty),
        },
        Expr::Col(col) => cols.get(&col.to_string()).copied(),
        Expr::Param(_) => None,
        Expr::Agg { func, col } => match func {
            crate::sql::ast::AggFn::Count
            | crate::sql::ast::AggFn::Sum
            | crate::sql::ast::AggFn::Avg => Some(SqlType::Integer),
            _ => col
                .as_ref()
                .and_then(|c| cols.get(&c.to_string()).copied()),
        },
        Expr::Not(_) | Expr::IsNull { .. } | Expr::In { .. } => Some(SqlType::Boolean),
        Expr::Binary { op, .. } if op.is_comparison() => Some(SqlType::Boolean),
        Expr::Binary { op, .. } => match op {
            BinOp::And | BinOp::Or => Some(SqlType::Boolean),
            _ => Some(SqlType::Integer),
        },
    }
}

/// Walks an expression in boolean position, collecting placeholder types.
pub fn infer_from_expr(
    expr: &Expr,
    cols: &HashMap<String, SqlType>,
    target: &mut ParamTypes,
) -> Result<()> {
    infer_expr(expr, cols, Some(SqlType::Boolean), target)
}

fn infer_expr(
    expr: &Expr,
    cols: &HashMap<String, SqlType>,
    expected: Option<SqlType>,
    target: &mut ParamTypes,
) -> Result<()> {
    match expr {
        Expr::Param(name) => constrain(target, name, expected.unwrap_or(SqlType::Any)),
        Expr::Literal(_) | Expr::Col(_) | Expr::Agg { .. } => Ok(()),
        Expr::Not(e) => infer_expr(e, cols, Some(SqlType::Boolean), target),
        Expr::IsNull { expr, .. } => infer_expr(expr, cols, None, target),
        Expr::In { expr, list } => {
            let elem_ty = side_type(expr, cols).or_else(|| {
                list.iter().find_map(|e| side_type(e, cols))
            });
            infer_expr(expr, cols, elem_ty, target)?;
            for e in list {
                infer_expr(e, cols, elem_ty, target)?;
            }
            Ok(())
        }
        Expr::Binary { op, left, right } => {
            if op.is_comparison() {
                let lty = side_type(left, cols);
                let rty = side_type(right, cols);
                infer_expr(left, cols, rty, target)?;
                infer_expr(right, cols, lty, target)
            } else {
                let operand = match op {
                    BinOp::And | BinOp::Or => SqlType::Boolean,
                    _ => SqlType::Integer,
                };
                infer_expr(left, cols, Some(operand), target)?;
                infer_expr(right, cols, Some(operand), target)
            }
        }
    }
}

/// Inference for `INSERT`/`UPSERT`: placeholders take the type of the column
/// they are inserted into.
pub fn infer_insert(
    stmt: &InsertStmt,
    table: &TableSchema,
    target: &mut ParamTypes,
) -> Result<()> {
    let cols = table_column_types(table);
    for row in &stmt.rows {
        for (name, expr) in stmt.cols.iter().zip(row) {
            let col = table.col_by_name(name)?;
            infer_expr(expr, &cols, Some(col.ty), target)?;
        }
    }
    Ok(())
}

/// Inference for `UPDATE`: assignment targets type their value expressions.
pub fn infer_update(
    stmt: &UpdateStmt,
    db: &str,
    table: &TableSchema,
    target: &mut ParamTypes,
) -> Result<()> {
    let cols = table_column_types_qualified(db, table);
    for (name, expr) in &stmt.sets {
        let col = table.col_by_name(name)?;
        infer_expr(expr, &cols, Some(col.ty), target)?;
    }
    if let Some(filter) = &stmt.filter {
        infer_from_expr(filter, &cols, target)?;
    }
    Ok(())
}

fn table_column_types(table: &TableSchema) -> HashMap<String, SqlType> {
    table
        .cols
        .iter()
        .map(|c| (c.name.clone(), c.ty))
        .collect()
}

fn table_column_types_qualified(db: &str, table: &TableSchema) -> HashMap<String, SqlType> {
    table
        .cols
        .iter()
        .map(|c| (format!("{}.{}.{}", db, table.name, c.name), c.ty))
        .collect()
}

/// Resolution context mapping unqualified references onto a fully qualified
/// selector. Used by inference over filter expressions of DML statements.
pub fn qualify_ref(col: &ColRef, db: &str, table: &str) -> ColRef {
    ColRef {
        db: Some(col.db.clone().unwrap_or_else(|| db.to_string())),
        table: Some(col.table.clone().unwrap_or_else(|| table.to_string())),
        col: col.col.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parser::parse;
    use crate::sql::ast::Statement;

    fn cols() -> HashMap<String, SqlType> {
        let mut cols = HashMap::new();
        cols.insert("db.t.a".to_string(), SqlType::Integer);
        cols.insert("db.t.v".to_string(), SqlType::Varchar);
        cols
    }

    fn filter_of(sql: &str) -> Expr {
        let mut stmts = parse(sql).unwrap();
        match stmts.remove(0) {
            Statement::Select(sel) => {
                let mut filter = sel.filter.unwrap();
                qualify_all(&mut filter);
                filter
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    fn qualify_all(expr: &mut Expr) {
        match expr {
            Expr::Col(col) => *col = qualify_ref(col, "db", "t"),
            Expr::Not(e) => qualify_all(e),
            Expr::Binary { left, right, .. } => {
                qualify_all(left);
                qualify_all(right);
            }
            Expr::In { expr, list } => {
                qualify_all(expr);
                for e in list {
                    qualify_all(e);
                }
            }
            Expr::IsNull { expr, .. } => qualify_all(expr),
            _ => {}
        }
    }

    #[test]
    fn comparison_with_column_types_parameter() {
        let filter = filter_of("SELECT * FROM t WHERE a > @low AND v = @name");
        let mut target = ParamTypes::new();
        infer_from_expr(&filter, &cols(), &mut target).unwrap();
        assert_eq!(target.get("low"), Some(&SqlType::Integer));
        assert_eq!(target.get("name"), Some(&SqlType::Varchar));
    }

    #[test]
    fn conflicting_contexts_fail() {
        let filter = filter_of("SELECT * FROM t WHERE a = @p OR v = @p");
        let mut target = ParamTypes::new();
        assert_eq!(
            infer_from_expr(&filter, &cols(), &mut target).unwrap_err(),
            SqlError::InferredMultipleTypes
        );
    }

    #[test]
    fn unconstrained_parameter_is_any() {
        let filter = filter_of("SELECT * FROM t WHERE @p IS NULL");
        let mut target = ParamTypes::new();
        infer_from_expr(&filter, &cols(), &mut target).unwrap();
        assert_eq!(target.get("p"), Some(&SqlType::Any));
    }

    #[test]
    fn any_upgrades_to_concrete() {
        let filter = filter_of("SELECT * FROM t WHERE @p IS NULL AND a = @p");
        let mut target = ParamTypes::new();
        infer_from_expr(&filter, &cols(), &mut target).unwrap();
        assert_eq!(target.get("p"), Some(&SqlType::Integer));
    }

    #[test]
    fn in_list_constrains_elements() {
        let filter = filter_of("SELECT * FROM t WHERE a IN (@x, @y)");
        let mut target = ParamTypes::new();
        infer_from_expr(&filter, &cols(), &mut target).unwrap();
        assert_eq!(target.get("x"), Some(&SqlType::Integer));
        assert_eq!(target.get("y"), Some(&SqlType::Integer));
    }

    #[test]
    fn arithmetic_constrains_to_integer() {
        let filter = filter_of("SELECT * FROM t WHERE a = @x + 1");
        let mut target = ParamTypes::new();
        infer_from_expr(&filter, &cols(), &mut target).unwrap();
        assert_eq!(target.get("x"), Some(&SqlType::Integer));
    }

    #[test]
    fn positional_parameters_are_named() {
        let filter = filter_of("SELECT * FROM t WHERE a = ? AND v = ?");
        let mut target = ParamTypes::new();
        infer_from_expr(&filter, &cols(), &mut target).unwrap();
        let names: Vec<_> = target.keys().cloned().collect();
        assert_eq!(names, vec!["param1", "param2"]);
        assert_eq!(target.get("param1"), Some(&SqlType::Integer));
        assert_eq!(target.get("param2"), Some(&SqlType::Varchar));
    }
}
