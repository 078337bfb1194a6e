//! Query planning: name resolution, index selection, range derivation and
//! reader-tree assembly.

use crate::catalog::Catalog;
use crate::errors::{Result, SqlError};
use crate::eval;
use crate::rowreader::{
    AggSpec, CondRowReader, DistinctRowReader, GroupedRowReader, JoinRowReader, LimitRowReader,
    ProjectedRowReader, Projection, QueryCtx, RawScanReader, RowReader,
};
use crate::schema::TableSchema;
use crate::sql::ast::{AggFn, BinOp, ColRef, Expr, SelectStmt, Selector};
use crate::value::Value;
use std::cmp::Ordering;
use std::ops::Bound;
use tracing::trace;

/// Plans a select into a reader tree:
/// index scan, joins, residual filter, aggregation, projection, distinct,
/// limit.
pub fn plan_select(
    catalog: &Catalog,
    ctx: QueryCtx,
    cur_db: &str,
    select: &SelectStmt,
) -> Result<Box<dyn RowReader>> {
    let db = catalog.db(cur_db)?;
    let main = db.table(&select.table)?.clone();

    // all tables visible to unqualified column references, main table first
    let mut tables = vec![main.clone()];
    for join in &select.joins {
        tables.push(db.table(&join.table)?.clone());
    }
    let scope = Scope {
        db_name: &db.name,
        tables: &tables,
    };

    let filter = select
        .filter
        .as_ref()
        .map(|f| scope.qualify_expr(f))
        .transpose()?;

    // ordering: at most one column, and it must belong to the scanned table
    if select.order_by.len() > 1 {
        return Err(SqlError::LimitedOrderBy);
    }
    let order = select
        .order_by
        .first()
        .map(|spec| -> Result<(u32, bool)> {
            let col = scope.qualify_col(&spec.col)?;
            if col.table.as_deref() != Some(main.name.as_str()) {
                return Err(SqlError::LimitedOrderBy);
            }
            Ok((main.col_by_name(&col.col)?.id, spec.desc))
        })
        .transpose()?;

    let forced = select
        .use_index
        .as_ref()
        .map(|cols| -> Result<usize> {
            let mut ids = Vec::with_capacity(cols.len());
            for name in cols {
                ids.push(main.col_by_name(name)?.id);
            }
            main.index_on(&ids).ok_or(SqlError::NoAvailableIndex)
        })
        .transpose()?;

    let (index_pos, desc) = choose_index(&main, order, forced)?;
    trace!(table = %main.name, index_pos, desc, "index chosen");

    let leading = leading_selector(cur_db, &main, index_pos);
    let (lower, upper) = column_range(filter.as_ref(), &leading);

    let mut reader: Box<dyn RowReader> = Box::new(RawScanReader::new(
        ctx.clone(),
        db.id,
        cur_db.to_string(),
        main.clone(),
        index_pos,
        lower,
        upper,
        desc,
    )?);

    for join in &select.joins {
        let right = db.table(&join.table)?.clone();
        let on = scope.qualify_expr(&join.on)?;
        reader = Box::new(JoinRowReader::new(
            reader,
            ctx.clone(),
            db.id,
            cur_db.to_string(),
            right,
            on,
        ));
    }

    if let Some(filter) = &filter {
        reader = Box::new(CondRowReader::new(reader, filter.clone()));
    }

    // aggregation
    let selectors = scope.qualify_selectors(&select.selectors)?;
    let having = select
        .having
        .as_ref()
        .map(|h| scope.qualify_expr(h))
        .transpose()?;

    if select.group_by.len() > 1 {
        return Err(SqlError::LimitedGroupBy);
    }
    let group_col = select
        .group_by
        .first()
        .map(|col| scope.qualify_col(col))
        .transpose()?;

    let mut aggs = Vec::new();
    for selector in &selectors {
        if let Selector::Expr { expr, .. } = selector {
            collect_aggs(expr, &mut aggs)?;
        }
    }
    if let Some(having) = &having {
        collect_aggs(having, &mut aggs)?;
    }

    let aggregated = !aggs.is_empty() || group_col.is_some();
    if aggregated {
        let group_selector = group_col.as_ref().map(eval::col_selector);
        if let Some(group_selector) = &group_selector {
            if reader.order_by().as_ref() != Some(group_selector) {
                return Err(SqlError::LimitedGroupBy);
            }
        }
        if having.is_some() && group_selector.is_none() {
            return Err(SqlError::HavingClauseRequiresGroupClause);
        }
        reader = Box::new(GroupedRowReader::new(reader, group_selector, aggs)?);
        if let Some(having) = having {
            reader = Box::new(CondRowReader::new(reader, having));
        }
    } else if having.is_some() {
        return Err(SqlError::HavingClauseRequiresGroupClause);
    }

    let projections = build_projections(&selectors, group_col.as_ref(), aggregated, &*reader)?;
    reader = Box::new(ProjectedRowReader::new(reader, projections));

    if select.distinct {
        reader = Box::new(DistinctRowReader::new(reader, ctx.distinct_limit)?);
    }
    if let Some(limit) = select.limit {
        reader = Box::new(LimitRowReader::new(reader, limit));
    }

    Ok(reader)
}

/// Plans a scan over one table, picking whichever index the filter narrows
/// best; used for the right-hand side of joins and for DML row selection.
pub fn plan_table_scan(
    ctx: QueryCtx,
    db_id: u32,
    db_name: &str,
    table: &TableSchema,
    filter: Option<&Expr>,
    order_col: Option<u32>,
    desc: bool,
) -> Result<Box<dyn RowReader>> {
    let (index_pos, desc) = choose_index(table, order_col.map(|c| (c, desc)), None)?;

    let mut best = (
        index_pos,
        column_range(filter, &leading_selector(db_name, table, index_pos)),
    );
    if order_col.is_none() {
        // free to pick the narrowest index
        for pos in 0..table.indexes.len() {
            let range = column_range(filter, &leading_selector(db_name, table, pos));
            if range_narrowness(&range) > range_narrowness(&best.1) {
                best = (pos, range);
            }
        }
    }
    let (index_pos, (lower, upper)) = best;

    let mut reader: Box<dyn RowReader> = Box::new(RawScanReader::new(
        ctx,
        db_id,
        db_name.to_string(),
        table.clone(),
        index_pos,
        lower,
        upper,
        desc,
    )?);
    if let Some(filter) = filter {
        reader = Box::new(CondRowReader::new(reader, filter.clone()));
    }
    Ok(reader)
}

/// Picks the index satisfying the requested order: the narrowest candidate
/// whose leading column is the ordering column, or the primary index when no
/// order was requested.
fn choose_index(
    table: &TableSchema,
    order: Option<(u32, bool)>,
    forced: Option<usize>,
) -> Result<(usize, bool)> {
    match order {
        None => Ok((forced.unwrap_or(0), false)),
        Some((order_col, desc)) => {
            let candidates: Vec<usize> = match forced {
                Some(pos) => vec![pos],
                None => (0..table.indexes.len()).collect(),
            };
            candidates
                .into_iter()
                .filter(|pos| table.indexes[*pos].cols[0] == order_col)
                .min_by_key(|pos| (table.indexes[*pos].cols.len(), *pos))
                .map(|pos| (pos, desc))
                .ok_or(SqlError::NoAvailableIndex)
        }
    }
}

fn leading_selector(db: &str, table: &TableSchema, index_pos: usize) -> String {
    let col_id = table.indexes[index_pos].cols[0];
    let col = table
        .col_by_id(col_id)
        .expect("index references an existing column");
    format!("{}.{}.{}", db, table.name, col.name)
}

/// Extracts the conjunctive range constraining `selector` from a predicate.
///
/// Only conjunctions contribute; a disjunction or any predicate the walker
/// does not understand collapses to the open range. Contradictory ranges are
/// preserved verbatim so execution observes zero rows.
pub fn column_range(filter: Option<&Expr>, selector: &str) -> (Bound<Value>, Bound<Value>) {
    match filter {
        None => (Bound::Unbounded, Bound::Unbounded),
        Some(expr) => range_of(expr, selector),
    }
}

fn range_of(expr: &Expr, selector: &str) -> (Bound<Value>, Bound<Value>) {
    let open = (Bound::Unbounded, Bound::Unbounded);
    match expr {
        Expr::Binary {
            op: BinOp::And,
            left,
            right,
        } => intersect(range_of(left, selector), range_of(right, selector)),
        Expr::Binary { op, left, right } if op.is_comparison() => {
            match (left.as_ref(), right.as_ref()) {
                (Expr::Col(col), Expr::Literal(v)) if matches_col(col, selector) => {
                    bound_from(*op, v)
                }
                (Expr::Literal(v), Expr::Col(col)) if matches_col(col, selector) => {
                    bound_from(flip(*op), v)
                }
                _ => open,
            }
        }
        _ => open,
    }
}

fn matches_col(col: &ColRef, selector: &str) -> bool {
    col.to_string() == selector
}

fn flip(op: BinOp) -> BinOp {
    match op {
        BinOp::Lt => BinOp::Gt,
        BinOp::Le => BinOp::Ge,
        BinOp::Gt => BinOp::Lt,
        BinOp::Ge => BinOp::Le,
        other => other,
    }
}

fn bound_from(op: BinOp, v: &Value) -> (Bound<Value>, Bound<Value>) {
    if v.is_null() {
        return (Bound::Unbounded, Bound::Unbounded);
    }
    match op {
        BinOp::Eq => (Bound::Included(v.clone()), Bound::Included(v.clone())),
        BinOp::Lt => (Bound::Unbounded, Bound::Excluded(v.clone())),
        BinOp::Le => (Bound::Unbounded, Bound::Included(v.clone())),
        BinOp::Gt => (Bound::Excluded(v.clone()), Bound::Unbounded),
        BinOp::Ge => (Bound::Included(v.clone()), Bound::Unbounded),
        _ => (Bound::Unbounded, Bound::Unbounded),
    }
}

fn intersect(
    a: (Bound<Value>, Bound<Value>),
    b: (Bound<Value>, Bound<Value>),
) -> (Bound<Value>, Bound<Value>) {
    (max_lower(a.0, b.0), min_upper(a.1, b.1))
}

fn max_lower(a: Bound<Value>, b: Bound<Value>) -> Bound<Value> {
    pick(a, b, Ordering::Greater)
}

fn min_upper(a: Bound<Value>, b: Bound<Value>) -> Bound<Value> {
    pick(a, b, Ordering::Less)
}

fn pick(a: Bound<Value>, b: Bound<Value>, prefer: Ordering) -> Bound<Value> {
    let (av, bv) = match (&a, &b) {
        (Bound::Unbounded, _) => return b,
        (_, Bound::Unbounded) => return a,
        (
            Bound::Included(av) | Bound::Excluded(av),
            Bound::Included(bv) | Bound::Excluded(bv),
        ) => (av, bv),
    };
    match av.compare(bv) {
        Ok(Some(ord)) if ord == prefer => a,
        Ok(Some(Ordering::Equal)) => {
            // the exclusive bound is the tighter one
            if matches!(a, Bound::Excluded(_)) {
                a
            } else {
                b
            }
        }
        Ok(Some(_)) => b,
        // incomparable values: keep the first constraint, the residual
        // filter decides at run time
        Ok(None) | Err(_) => a,
    }
}

fn range_narrowness(range: &(Bound<Value>, Bound<Value>)) -> u8 {
    let mut n = 0;
    if !matches!(range.0, Bound::Unbounded) {
        n += 1;
    }
    if !matches!(range.1, Bound::Unbounded) {
        n += 1;
    }
    n
}

fn collect_aggs(expr: &Expr, aggs: &mut Vec<AggSpec>) -> Result<()> {
    match expr {
        Expr::Agg { func, col } => {
            match (func, col) {
                (AggFn::Count, Some(_)) => return Err(SqlError::LimitedCount),
                (AggFn::Count, None) => {}
                (_, None) => return Err(SqlError::IllegalArguments),
                (_, Some(_)) => {}
            }
            let key = eval::agg_selector(*func, col);
            if !aggs
                .iter()
                .any(|a| eval::agg_selector(a.func, &a.col) == key)
            {
                aggs.push(AggSpec {
                    func: *func,
                    col: col.clone(),
                });
            }
            Ok(())
        }
        Expr::Not(e) => collect_aggs(e, aggs),
        Expr::Binary { left, right, .. } => {
            collect_aggs(left, aggs)?;
            collect_aggs(right, aggs)
        }
        Expr::In { expr, list } => {
            collect_aggs(expr, aggs)?;
            for e in list {
                collect_aggs(e, aggs)?;
            }
            Ok(())
        }
        Expr::IsNull { expr, .. } => collect_aggs(expr, aggs),
        Expr::Literal(_) | Expr::Col(_) | Expr::Param(_) => Ok(()),
    }
}

fn build_projections(
    selectors: &[Selector],
    group_col: Option<&ColRef>,
    aggregated: bool,
    source: &dyn RowReader,
) -> Result<Vec<Projection>> {
    let mut projections = Vec::new();
    for (pos, selector) in selectors.iter().enumerate() {
        match selector {
            Selector::All => {
                if aggregated {
                    return Err(SqlError::NoSupported);
                }
                for col in source.columns()? {
                    let mut parts = col.selector.split('.');
                    let (Some(db), Some(table), Some(name)) =
                        (parts.next(), parts.next(), parts.next())
                    else {
                        return Err(SqlError::CorruptedData);
                    };
                    projections.push(Projection {
                        expr: Expr::Col(ColRef {
                            db: Some(db.to_string()),
                            table: Some(table.to_string()),
                            col: name.to_string(),
                        }),
                        selector: col.selector.clone(),
                        name: col.name.clone(),
                    });
                }
            }
            Selector::Expr { expr, alias } => {
                if aggregated {
                    let allowed = match expr {
                        Expr::Agg { .. } => true,
                        Expr::Col(col) => Some(col) == group_col,
                        _ => false,
                    };
                    if !allowed {
                        return Err(SqlError::NoSupported);
                    }
                }
                let (selector, name) = match (alias, expr) {
                    (Some(alias), _) => (alias.clone(), alias.clone()),
                    (None, Expr::Col(col)) => (eval::col_selector(col), col.col.clone()),
                    (None, Expr::Agg { func, col }) => {
                        let s = eval::agg_selector(*func, col);
                        (s.clone(), s)
                    }
                    (None, _) => {
                        let name = format!("col{}", pos + 1);
                        (name.clone(), name)
                    }
                };
                projections.push(Projection {
                    expr: expr.clone(),
                    selector,
                    name,
                });
            }
        }
    }
    Ok(projections)
}

/// Fully qualifies every column reference in an expression against a single
/// table. Used for DML filters, which always target one table.
pub fn qualify_single_table(db_name: &str, table: &TableSchema, expr: &Expr) -> Result<Expr> {
    let tables = std::slice::from_ref(table);
    let scope = Scope { db_name, tables };
    scope.qualify_expr(expr)
}

/// Name-resolution scope: the selected database plus every table the query
/// references, in declaration order.
struct Scope<'a> {
    db_name: &'a str,
    tables: &'a [TableSchema],
}

impl Scope<'_> {
    fn qualify_col(&self, col: &ColRef) -> Result<ColRef> {
        if let Some(db) = &col.db {
            if db != self.db_name {
                return Err(SqlError::DatabaseDoesNotExist);
            }
        }
        let table = match &col.table {
            Some(name) => {
                let table = self
                    .tables
                    .iter()
                    .find(|t| &t.name == name)
                    .ok_or(SqlError::TableDoesNotExist)?;
                table.col_by_name(&col.col)?;
                table
            }
            None => self
                .tables
                .iter()
                .find(|t| t.col_by_name(&col.col).is_ok())
                .ok_or(SqlError::ColumnDoesNotExist)?,
        };
        Ok(ColRef {
            db: Some(self.db_name.to_string()),
            table: Some(table.name.clone()),
            col: col.col.clone(),
        })
    }

    fn qualify_expr(&self, expr: &Expr) -> Result<Expr> {
        Ok(match expr {
            Expr::Col(col) => Expr::Col(self.qualify_col(col)?),
            Expr::Agg { func, col } => Expr::Agg {
                func: *func,
                col: col.as_ref().map(|c| self.qualify_col(c)).transpose()?,
            },
            Expr::Literal(_) | Expr::Param(_) => expr.clone(),
            Expr::Not(e) => Expr::Not(Box::new(self.qualify_expr(e)?)),
            Expr::Binary { op, left, right } => Expr::Binary {
                op: *op,
                left: Box::new(self.qualify_expr(left)?),
                right: Box::new(self.qualify_expr(right)?),
            },
            Expr::In { expr, list } => Expr::In {
                expr: Box::new(self.qualify_expr(expr)?),
                list: list
                    .iter()
                    .map(|e| self.qualify_expr(e))
                    .collect::<Result<_>>()?,
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: Box::new(self.qualify_expr(expr)?),
                negated: *negated,
            },
        })
    }

    fn qualify_selectors(&self, selectors: &[Selector]) -> Result<Vec<Selector>> {
        selectors
            .iter()
            .map(|s| match s {
                Selector::All => Ok(Selector::All),
                Selector::Expr { expr, alias } => Ok(Selector::Expr {
                    expr: self.qualify_expr(expr)?,
                    alias: alias.clone(),
                }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(selector: &str) -> Expr {
        let mut parts = selector.split('.');
        Expr::Col(ColRef {
            db: Some(parts.next().unwrap().to_string()),
            table: Some(parts.next().unwrap().to_string()),
            col: parts.next().unwrap().to_string(),
        })
    }

    fn cmp(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn int(v: i64) -> Expr {
        Expr::Literal(Value::Integer(v))
    }

    #[test]
    fn conjunction_narrows_both_bounds() {
        // ts > 100 AND ts < 200
        let filter = cmp(
            BinOp::And,
            cmp(BinOp::Gt, col("d.t.ts"), int(100)),
            cmp(BinOp::Lt, col("d.t.ts"), int(200)),
        );
        let (lower, upper) = column_range(Some(&filter), "d.t.ts");
        assert_eq!(lower, Bound::Excluded(Value::Integer(100)));
        assert_eq!(upper, Bound::Excluded(Value::Integer(200)));
    }

    #[test]
    fn equality_closes_the_range() {
        let filter = cmp(BinOp::Eq, col("d.t.ts"), int(7));
        let (lower, upper) = column_range(Some(&filter), "d.t.ts");
        assert_eq!(lower, Bound::Included(Value::Integer(7)));
        assert_eq!(upper, Bound::Included(Value::Integer(7)));
    }

    #[test]
    fn flipped_operands_still_constrain() {
        // 100 <= ts means ts >= 100
        let filter = cmp(BinOp::Le, int(100), col("d.t.ts"));
        let (lower, upper) = column_range(Some(&filter), "d.t.ts");
        assert_eq!(lower, Bound::Included(Value::Integer(100)));
        assert_eq!(upper, Bound::Unbounded);
    }

    #[test]
    fn disjunction_collapses_to_open() {
        let filter = cmp(
            BinOp::Or,
            cmp(BinOp::Eq, col("d.t.ts"), int(1)),
            cmp(BinOp::Eq, col("d.t.other"), int(2)),
        );
        let (lower, upper) = column_range(Some(&filter), "d.t.ts");
        assert_eq!(lower, Bound::Unbounded);
        assert_eq!(upper, Bound::Unbounded);
    }

    #[test]
    fn contradictory_ranges_are_preserved() {
        // ts > 200 AND ts < 100 keeps both bounds verbatim
        let filter = cmp(
            BinOp::And,
            cmp(BinOp::Gt, col("d.t.ts"), int(200)),
            cmp(BinOp::Lt, col("d.t.ts"), int(100)),
        );
        let (lower, upper) = column_range(Some(&filter), "d.t.ts");
        assert_eq!(lower, Bound::Excluded(Value::Integer(200)));
        assert_eq!(upper, Bound::Excluded(Value::Integer(100)));
    }

    #[test]
    fn other_columns_do_not_constrain() {
        let filter = cmp(BinOp::Eq, col("d.t.other"), int(1));
        let (lower, upper) = column_range(Some(&filter), "d.t.ts");
        assert_eq!(lower, Bound::Unbounded);
        assert_eq!(upper, Bound::Unbounded);
    }

    #[test]
    fn tighter_conjunct_wins() {
        // ts >= 10 AND ts > 10 collapses to the exclusive bound
        let filter = cmp(
            BinOp::And,
            cmp(BinOp::Ge, col("d.t.ts"), int(10)),
            cmp(BinOp::Gt, col("d.t.ts"), int(10)),
        );
        let (lower, _) = column_range(Some(&filter), "d.t.ts");
        assert_eq!(lower, Bound::Excluded(Value::Integer(10)));
    }
}
