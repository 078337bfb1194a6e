use super::{ColumnDesc, ParamTypes, Row, RowReader};
use crate::errors::{Result, SqlError};
use crate::value::Value;
use std::collections::HashSet;

/// Suppresses duplicate rows, remembering every emitted key tuple up to a
/// configured limit.
pub struct DistinctRowReader {
    source: Box<dyn RowReader>,
    cols: Vec<ColumnDesc>,
    seen: HashSet<Vec<u8>>,
    limit: usize,
    closed: bool,
}

impl DistinctRowReader {
    pub fn new(source: Box<dyn RowReader>, limit: usize) -> Result<DistinctRowReader> {
        let cols = source.columns()?;
        Ok(DistinctRowReader {
            source,
            cols,
            seen: HashSet::new(),
            limit,
            closed: false,
        })
    }

    /// Internal fingerprint of the row's projected values. Only used for set
    /// membership, so the encoding just needs to be injective.
    fn fingerprint(&self, row: &Row) -> Vec<u8> {
        let mut buf = Vec::new();
        for col in &self.cols {
            match row.get(&col.selector) {
                None | Some(Value::Null(_)) => buf.push(0),
                Some(Value::Integer(i)) => {
                    buf.push(1);
                    buf.extend_from_slice(&i.to_be_bytes());
                }
                Some(Value::Varchar(s)) => {
                    buf.push(2);
                    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                    buf.extend_from_slice(s.as_bytes());
                }
                Some(Value::Boolean(b)) => {
                    buf.push(3);
                    buf.push(u8::from(*b));
                }
                Some(Value::Blob(b)) => {
                    buf.push(4);
                    buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
                    buf.extend_from_slice(b);
                }
            }
        }
        buf
    }
}

impl RowReader for DistinctRowReader {
    fn columns(&self) -> Result<Vec<ColumnDesc>> {
        Ok(self.cols.clone())
    }

    fn read(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        while let Some(row) = self.source.read()? {
            let key = self.fingerprint(&row);
            if self.seen.contains(&key) {
                continue;
            }
            if self.seen.len() >= self.limit {
                return Err(SqlError::TooManyRows);
            }
            self.seen.insert(key);
            return Ok(Some(row));
        }
        Ok(None)
    }

    fn order_by(&self) -> Option<String> {
        self.source.order_by()
    }

    fn infer_parameters(&self, target: &mut ParamTypes) -> Result<()> {
        self.source.infer_parameters(target)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.close();
        }
    }
}
