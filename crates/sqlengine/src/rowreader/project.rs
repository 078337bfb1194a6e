use super::{ColumnDesc, ParamTypes, Row, RowReader};
use crate::errors::{Result, SqlError};
use crate::eval;
use crate::params;
use crate::sql::ast::Expr;

/// One output column of a projection.
#[derive(Debug, Clone)]
pub struct Projection {
    pub expr: Expr,
    /// Row-map key of the output value (alias or canonical selector).
    pub selector: String,
    /// Client-facing column name.
    pub name: String,
}

/// Rewrites each source row to the selected expressions.
pub struct ProjectedRowReader {
    source: Box<dyn RowReader>,
    projections: Vec<Projection>,
    closed: bool,
}

impl ProjectedRowReader {
    pub fn new(source: Box<dyn RowReader>, projections: Vec<Projection>) -> ProjectedRowReader {
        ProjectedRowReader {
            source,
            projections,
            closed: false,
        }
    }
}

impl RowReader for ProjectedRowReader {
    fn columns(&self) -> Result<Vec<ColumnDesc>> {
        let source_cols = self.source.columns()?;
        let col_type = |col: &crate::sql::ast::ColRef| {
            let selector = eval::col_selector(col);
            source_cols
                .iter()
                .find(|c| c.selector == selector)
                .map(|c| c.ty)
                .ok_or(SqlError::ColumnDoesNotExist)
        };
        self.projections
            .iter()
            .map(|p| {
                // aggregate results are already typed columns of the source
                let canonical = match &p.expr {
                    Expr::Col(c) => Some(eval::col_selector(c)),
                    Expr::Agg { func, col } => Some(eval::agg_selector(*func, col)),
                    _ => None,
                };
                let ty = match canonical
                    .and_then(|sel| source_cols.iter().find(|c| c.selector == sel))
                {
                    Some(col) => col.ty,
                    None => eval::infer_expr_type(&p.expr, &col_type)?,
                };
                Ok(ColumnDesc {
                    selector: p.selector.clone(),
                    name: p.name.clone(),
                    ty,
                })
            })
            .collect()
    }

    fn read(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        let Some(source_row) = self.source.read()? else {
            return Ok(None);
        };
        let mut row = Row::default();
        for p in &self.projections {
            row.values
                .insert(p.selector.clone(), eval::eval(&p.expr, &source_row)?);
        }
        Ok(Some(row))
    }

    fn order_by(&self) -> Option<String> {
        // the source order survives only if the ordering column is projected
        let source_order = self.source.order_by()?;
        self.projections
            .iter()
            .find(|p| matches!(&p.expr, Expr::Col(c) if eval::col_selector(c) == source_order))
            .map(|p| p.selector.clone())
    }

    fn infer_parameters(&self, target: &mut ParamTypes) -> Result<()> {
        self.source.infer_parameters(target)?;
        let cols = params::column_types(&self.source.columns()?);
        for p in &self.projections {
            params::infer_from_expr(&p.expr, &cols, target)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.close();
        }
    }
}
