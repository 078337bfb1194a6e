//! Expression evaluation over rows.
//!
//! Expressions reaching this module have been resolved by the planner: every
//! column reference is fully qualified and parameters have been substituted
//! with literals (except when a tree is walked purely for type inference).

use crate::errors::{Result, SqlError};
use crate::rowreader::Row;
use crate::sql::ast::{AggFn, BinOp, ColRef, Expr};
use crate::value::{SqlType, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The row-map key for a fully qualified column reference.
pub fn col_selector(col: &ColRef) -> String {
    col.to_string()
}

/// The row-map key under which an aggregate's result is stored.
pub fn agg_selector(func: AggFn, col: &Option<ColRef>) -> String {
    match col {
        Some(col) => format!("{}({})", func.name(), col),
        None => format!("{}()", func.name()),
    }
}

/// Replaces every parameter with its bound value.
pub fn substitute_params(expr: &Expr, params: &BTreeMap<String, Value>) -> Result<Expr> {
    Ok(match expr {
        Expr::Param(name) => match params.get(name) {
            Some(v) => Expr::Literal(v.clone()),
            None => return Err(SqlError::MissingParameter),
        },
        Expr::Literal(_) | Expr::Col(_) | Expr::Agg { .. } => expr.clone(),
        Expr::Not(e) => Expr::Not(Box::new(substitute_params(e, params)?)),
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(substitute_params(left, params)?),
            right: Box::new(substitute_params(right, params)?),
        },
        Expr::In { expr, list } => Expr::In {
            expr: Box::new(substitute_params(expr, params)?),
            list: list
                .iter()
                .map(|e| substitute_params(e, params))
                .collect::<Result<_>>()?,
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(substitute_params(expr, params)?),
            negated: *negated,
        },
    })
}

/// Replaces column references present in `row` with their values. Used by the
/// join reader to constrain the right-hand scan with the current left row.
pub fn substitute_cols(expr: &Expr, row: &Row) -> Expr {
    match expr {
        Expr::Col(col) => match row.values.get(&col_selector(col)) {
            Some(v) => Expr::Literal(v.clone()),
            None => expr.clone(),
        },
        Expr::Literal(_) | Expr::Param(_) | Expr::Agg { .. } => expr.clone(),
        Expr::Not(e) => Expr::Not(Box::new(substitute_cols(e, row))),
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(substitute_cols(left, row)),
            right: Box::new(substitute_cols(right, row)),
        },
        Expr::In { expr, list } => Expr::In {
            expr: Box::new(substitute_cols(expr, row)),
            list: list.iter().map(|e| substitute_cols(e, row)).collect(),
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(substitute_cols(expr, row)),
            negated: *negated,
        },
    }
}

/// Evaluates an expression against a row.
pub fn eval(expr: &Expr, row: &Row) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Param(_) => Err(SqlError::MissingParameter),
        Expr::Col(col) => row
            .values
            .get(&col_selector(col))
            .cloned()
            .ok_or(SqlError::ColumnDoesNotExist),
        Expr::Agg { func, col } => row
            .values
            .get(&agg_selector(*func, col))
            .cloned()
            .ok_or(SqlError::ColumnDoesNotExist),
        Expr::Not(e) => match to_bool(eval(e, row)?)? {
            Some(b) => Ok(Value::Boolean(!b)),
            None => Ok(Value::Null(SqlType::Boolean)),
        },
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, row)?;
            Ok(Value::Boolean(v.is_null() != *negated))
        }
        Expr::In { expr, list } => eval_in(expr, list, row),
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, row),
    }
}

/// Evaluates a predicate. `None` means the SQL value was null.
pub fn eval_bool(expr: &Expr, row: &Row) -> Result<Option<bool>> {
    to_bool(eval(expr, row)?)
}

fn to_bool(v: Value) -> Result<Option<bool>> {
    match v {
        Value::Boolean(b) => Ok(Some(b)),
        Value::Null(_) => Ok(None),
        _ => Err(SqlError::InvalidCondition),
    }
}

fn eval_in(expr: &Expr, list: &[Expr], row: &Row) -> Result<Value> {
    let needle = eval(expr, row)?;
    let mut saw_null = needle.is_null();
    for candidate in list {
        let candidate = eval(candidate, row)?;
        match needle.compare(&candidate)? {
            Some(Ordering::Equal) => return Ok(Value::Boolean(true)),
            Some(_) => {}
            None => saw_null = true,
        }
    }
    if saw_null {
        Ok(Value::Null(SqlType::Boolean))
    } else {
        Ok(Value::Boolean(false))
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, row: &Row) -> Result<Value> {
    match op {
        BinOp::And => {
            let l = to_bool(eval(left, row)?)?;
            let r = to_bool(eval(right, row)?)?;
            Ok(match (l, r) {
                (Some(false), _) | (_, Some(false)) => Value::Boolean(false),
                (Some(true), Some(true)) => Value::Boolean(true),
                _ => Value::Null(SqlType::Boolean),
            })
        }
        BinOp::Or => {
            let l = to_bool(eval(left, row)?)?;
            let r = to_bool(eval(right, row)?)?;
            Ok(match (l, r) {
                (Some(true), _) | (_, Some(true)) => Value::Boolean(true),
                (Some(false), Some(false)) => Value::Boolean(false),
                _ => Value::Null(SqlType::Boolean),
            })
        }
        BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let l = eval(left, row)?;
            let r = eval(right, row)?;
            match l.compare(&r)? {
                None => Ok(Value::Null(SqlType::Boolean)),
                Some(ord) => {
                    let b = match op {
                        BinOp::Eq => ord == Ordering::Equal,
                        BinOp::Ne => ord != Ordering::Equal,
                        BinOp::Lt => ord == Ordering::Less,
                        BinOp::Le => ord != Ordering::Greater,
                        BinOp::Gt => ord == Ordering::Greater,
                        BinOp::Ge => ord != Ordering::Less,
                        _ => unreachable!(),
                    };
                    Ok(Value::Boolean(b))
                }
            }
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let l = eval(left, row)?;
            let r = eval(right, row)?;
            if l.is_null() || r.is_null() {
                return Ok(Value::Null(SqlType::Integer));
            }
            let (Value::Integer(a), Value::Integer(b)) = (&l, &r) else {
                return Err(SqlError::InvalidValue);
            };
            let out = match op {
                BinOp::Add => a.wrapping_add(*b),
                BinOp::Sub => a.wrapping_sub(*b),
                BinOp::Mul => a.wrapping_mul(*b),
                BinOp::Div => {
                    if *b == 0 {
                        return Err(SqlError::DivisionByZero);
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            Ok(Value::Integer(out))
        }
    }
}

/// Static result type of an expression, for result-column descriptors.
pub fn infer_expr_type(expr: &Expr, col_type: &impl Fn(&ColRef) -> Result<SqlType>) -> Result<SqlType> {
    match expr {
        Expr::Literal(v) => Ok(v.ty()),
        Expr::Param(_) => Ok(SqlType::Any),
        Expr::Col(col) => col_type(col),
        Expr::Agg { func, col } => match func {
            AggFn::Count => Ok(SqlType::Integer),
            AggFn::Sum | AggFn::Avg => Ok(SqlType::Integer),
            AggFn::Min | AggFn::Max => match col {
                Some(col) => col_type(col),
                None => Err(SqlError::IllegalArguments),
            },
        },
        Expr::Not(_) | Expr::IsNull { .. } | Expr::In { .. } => Ok(SqlType::Boolean),
        Expr::Binary { op, .. } if op.is_comparison() => Ok(SqlType::Boolean),
        Expr::Binary { op, .. } => match op {
            BinOp::And | BinOp::Or => Ok(SqlType::Boolean),
            _ => Ok(SqlType::Integer),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        let mut row = Row::default();
        row.values
            .insert("db.t.a".into(), Value::Integer(10));
        row.values
            .insert("db.t.v".into(), Value::Varchar("x".into()));
        row.values
            .insert("db.t.n".into(), Value::Null(SqlType::Integer));
        row
    }

    fn col(name: &str) -> Expr {
        Expr::Col(ColRef {
            db: Some("db".into()),
            table: Some("t".into()),
            col: name.into(),
        })
    }

    fn lit(v: Value) -> Expr {
        Expr::Literal(v)
    }

    fn binary(op: BinOp, l: Expr, r: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(l),
            right: Box::new(r),
        }
    }

    #[test]
    fn comparisons() {
        let e = binary(BinOp::Gt, col("a"), lit(Value::Integer(5)));
        assert_eq!(eval_bool(&e, &row()).unwrap(), Some(true));

        let e = binary(BinOp::Eq, col("v"), lit(Value::Varchar("y".into())));
        assert_eq!(eval_bool(&e, &row()).unwrap(), Some(false));
    }

    #[test]
    fn null_comparison_is_unknown() {
        let e = binary(BinOp::Eq, col("n"), lit(Value::Integer(1)));
        assert_eq!(eval_bool(&e, &row()).unwrap(), None);
    }

    #[test]
    fn three_valued_and_or() {
        let null = lit(Value::Null(SqlType::Boolean));
        let t = lit(Value::Boolean(true));
        let f = lit(Value::Boolean(false));

        let e = binary(BinOp::And, f.clone(), null.clone());
        assert_eq!(eval_bool(&e, &row()).unwrap(), Some(false));
        let e = binary(BinOp::And, t.clone(), null.clone());
        assert_eq!(eval_bool(&e, &row()).unwrap(), None);
        let e = binary(BinOp::Or, t, null.clone());
        assert_eq!(eval_bool(&e, &row()).unwrap(), Some(true));
        let e = binary(BinOp::Or, f, null);
        assert_eq!(eval_bool(&e, &row()).unwrap(), None);
    }

    #[test]
    fn arithmetic_and_division_by_zero() {
        let e = binary(BinOp::Div, col("a"), lit(Value::Integer(0)));
        assert_eq!(eval(&e, &row()).unwrap_err(), SqlError::DivisionByZero);

        let e = binary(
            BinOp::Add,
            binary(BinOp::Mul, col("a"), lit(Value::Integer(2))),
            lit(Value::Integer(1)),
        );
        assert_eq!(eval(&e, &row()).unwrap(), Value::Integer(21));
    }

    #[test]
    fn in_list() {
        let e = Expr::In {
            expr: Box::new(col("a")),
            list: vec![lit(Value::Integer(1)), lit(Value::Integer(10))],
        };
        assert_eq!(eval_bool(&e, &row()).unwrap(), Some(true));

        let e = Expr::In {
            expr: Box::new(col("a")),
            list: vec![lit(Value::Integer(1)), lit(Value::Null(SqlType::Integer))],
        };
        assert_eq!(eval_bool(&e, &row()).unwrap(), None);
    }

    #[test]
    fn is_null() {
        let e = Expr::IsNull {
            expr: Box::new(col("n")),
            negated: false,
        };
        assert_eq!(eval_bool(&e, &row()).unwrap(), Some(true));
        let e = Expr::IsNull {
            expr: Box::new(col("a")),
            negated: true,
        };
        assert_eq!(eval_bool(&e, &row()).unwrap(), Some(true));
    }

    #[test]
    fn non_boolean_condition_is_invalid() {
        let e = binary(BinOp::Add, col("a"), lit(Value::Integer(1)));
        assert_eq!(eval_bool(&e, &row()).unwrap_err(), SqlError::InvalidCondition);
    }

    #[test]
    fn missing_parameter() {
        let e = Expr::Param("p".into());
        assert_eq!(eval(&e, &row()).unwrap_err(), SqlError::MissingParameter);
        assert_eq!(
            substitute_params(&e, &BTreeMap::new()).unwrap_err(),
            SqlError::MissingParameter
        );
    }

    #[test]
    fn mismatched_comparison_types_fail() {
        let e = binary(BinOp::Eq, col("a"), lit(Value::Varchar("x".into())));
        assert_eq!(eval(&e, &row()).unwrap_err(), SqlError::NotComparableValues);
    }
}
