use super::{ColumnDesc, ParamTypes, QueryCtx, Row, RowReader};
use crate::errors::Result;
use crate::eval;
use crate::params;
use crate::planner;
use crate::schema::TableSchema;
use crate::sql::ast::Expr;

/// Inner nested-loop join.
///
/// For every left row the `ON` predicate is rewritten with the left values
/// substituted in, and a fresh right-side reader is planned from it so the
/// right scan range is as narrow as the predicate allows. Rows with no right
/// match drop.
pub struct JoinRowReader {
    left: Box<dyn RowReader>,
    ctx: QueryCtx,
    db_id: u32,
    db: String,
    right_table: TableSchema,
    on: Expr,
    current_left: Option<Row>,
    right: Option<Box<dyn RowReader>>,
    closed: bool,
}

impl JoinRowReader {
    pub fn new(
        left: Box<dyn RowReader>,
        ctx: QueryCtx,
        db_id: u32,
        db: String,
        right_table: TableSchema,
        on: Expr,
    ) -> JoinRowReader {
        JoinRowReader {
            left,
            ctx,
            db_id,
            db,
            right_table,
            on,
            current_left: None,
            right: None,
            closed: false,
        }
    }

    fn right_columns(&self) -> Vec<ColumnDesc> {
        self.right_table
            .cols
            .iter()
            .map(|col| ColumnDesc {
                selector: format!("{}.{}.{}", self.db, self.right_table.name, col.name),
                name: col.name.clone(),
                ty: col.ty,
            })
            .collect()
    }

    fn open_right(&mut self, left_row: &Row) -> Result<Box<dyn RowReader>> {
        let constrained = eval::substitute_cols(&self.on, left_row);
        planner::plan_table_scan(
            self.ctx.clone(),
            self.db_id,
            &self.db,
            &self.right_table,
            Some(&constrained),
            None,
            false,
        )
    }
}

impl RowReader for JoinRowReader {
    fn columns(&self) -> Result<Vec<ColumnDesc>> {
        let mut cols = self.left.columns()?;
        cols.extend(self.right_columns());
        Ok(cols)
    }

    fn read(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            if let Some(right) = &mut self.right {
                if let Some(right_row) = right.read()? {
                    let mut row = self
                        .current_left
                        .clone()
                        .expect("left row present while right reader is open");
                    row.values.extend(right_row.values);
                    return Ok(Some(row));
                }
                right.close();
                self.right = None;
                self.current_left = None;
            }

            match self.left.read()? {
                None => return Ok(None),
                Some(left_row) => {
                    self.right = Some(self.open_right(&left_row)?);
                    self.current_left = Some(left_row);
                }
            }
        }
    }

    fn order_by(&self) -> Option<String> {
        // nested-loop join preserves the left input's order
        self.left.order_by()
    }

    fn infer_parameters(&self, target: &mut ParamTypes) -> Result<()> {
        self.left.infer_parameters(target)?;
        let mut cols = params::column_types(&self.left.columns()?);
        cols.extend(params::column_types(&self.right_columns()));
        params::infer_from_expr(&self.on, &cols, target)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.left.close();
            if let Some(right) = &mut self.right {
                right.close();
            }
        }
    }
}
