use super::{ColumnDesc, ParamTypes, Row, RowReader};
use crate::errors::Result;
use crate::eval;
use crate::params;
use crate::sql::ast::Expr;

/// Filters its source by a boolean predicate; rows where the predicate is
/// false or null are skipped.
pub struct CondRowReader {
    source: Box<dyn RowReader>,
    cond: Expr,
    closed: bool,
}

impl CondRowReader {
    pub fn new(source: Box<dyn RowReader>, cond: Expr) -> CondRowReader {
        CondRowReader {
            source,
            cond,
            closed: false,
        }
    }
}

impl RowReader for CondRowReader {
    fn columns(&self) -> Result<Vec<ColumnDesc>> {
        self.source.columns()
    }

    fn read(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        while let Some(row) = self.source.read()? {
            if eval::eval_bool(&self.cond, &row)? == Some(true) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn order_by(&self) -> Option<String> {
        self.source.order_by()
    }

    fn infer_parameters(&self, target: &mut ParamTypes) -> Result<()> {
        self.source.infer_parameters(target)?;
        let cols = params::column_types(&self.source.columns()?);
        params::infer_from_expr(&self.cond, &cols, target)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SqlError;
    use crate::sql::ast::{BinOp, ColRef};
    use crate::value::{SqlType, Value};

    /// A source whose every capability fails, to check propagation.
    struct FailingReader {
        fail_inferring_params: bool,
    }

    impl RowReader for FailingReader {
        fn columns(&self) -> Result<Vec<ColumnDesc>> {
            Err(SqlError::IllegalArguments)
        }

        fn read(&mut self) -> Result<Option<Row>> {
            Err(SqlError::IllegalArguments)
        }

        fn order_by(&self) -> Option<String> {
            None
        }

        fn infer_parameters(&self, _target: &mut ParamTypes) -> Result<()> {
            if self.fail_inferring_params {
                Err(SqlError::IllegalArguments)
            } else {
                Ok(())
            }
        }

        fn close(&mut self) {}
    }

    /// Replays a fixed set of rows.
    struct VecReader {
        cols: Vec<ColumnDesc>,
        rows: std::vec::IntoIter<Row>,
    }

    impl RowReader for VecReader {
        fn columns(&self) -> Result<Vec<ColumnDesc>> {
            Ok(self.cols.clone())
        }

        fn read(&mut self) -> Result<Option<Row>> {
            Ok(self.rows.next())
        }

        fn order_by(&self) -> Option<String> {
            None
        }

        fn infer_parameters(&self, _target: &mut ParamTypes) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn row(value: Value) -> Row {
        let mut row = Row::default();
        row.values.insert("d.t.a".to_string(), value);
        row
    }

    fn reader_over(values: Vec<Value>) -> Box<dyn RowReader> {
        Box::new(VecReader {
            cols: vec![ColumnDesc {
                selector: "d.t.a".to_string(),
                name: "a".to_string(),
                ty: SqlType::Integer,
            }],
            rows: values.into_iter().map(row).collect::<Vec<_>>().into_iter(),
        })
    }

    fn col_a() -> Expr {
        Expr::Col(ColRef {
            db: Some("d".to_string()),
            table: Some("t".to_string()),
            col: "a".to_string(),
        })
    }

    #[test]
    fn source_failures_propagate() {
        let source = Box::new(FailingReader {
            fail_inferring_params: true,
        });
        let mut reader = CondRowReader::new(source, Expr::Literal(Value::Boolean(true)));

        assert_eq!(reader.columns().unwrap_err(), SqlError::IllegalArguments);
        assert_eq!(reader.read().unwrap_err(), SqlError::IllegalArguments);

        let mut target = ParamTypes::new();
        assert_eq!(
            reader.infer_parameters(&mut target).unwrap_err(),
            SqlError::IllegalArguments
        );
    }

    #[test]
    fn false_and_null_predicates_skip_rows() {
        let source = reader_over(vec![
            Value::Integer(1),
            Value::Null(SqlType::Integer),
            Value::Integer(5),
        ]);
        // a > 2 is null for the null row and false for 1
        let cond = Expr::Binary {
            op: BinOp::Gt,
            left: Box::new(col_a()),
            right: Box::new(Expr::Literal(Value::Integer(2))),
        };
        let mut reader = CondRowReader::new(source, cond);

        let emitted = reader.read().unwrap().unwrap();
        assert_eq!(emitted.get("d.t.a"), Some(&Value::Integer(5)));
        assert!(reader.read().unwrap().is_none());
    }

    #[test]
    fn non_boolean_predicate_is_invalid() {
        let source = reader_over(vec![Value::Integer(1)]);
        let mut reader = CondRowReader::new(source, Expr::Literal(Value::Integer(42)));
        assert_eq!(reader.read().unwrap_err(), SqlError::InvalidCondition);
    }

    #[test]
    fn closed_reader_reads_nothing() {
        let source = reader_over(vec![Value::Integer(1)]);
        let mut reader = CondRowReader::new(source, Expr::Literal(Value::Boolean(true)));
        reader.close();
        reader.close(); // double close is a no-op
        assert!(reader.read().unwrap().is_none());
    }
}
