use super::{ColumnDesc, ParamTypes, Row, RowReader};
use crate::errors::Result;

/// Caps the number of rows emitted by its source.
pub struct LimitRowReader {
    source: Box<dyn RowReader>,
    limit: u64,
    emitted: u64,
    closed: bool,
}

impl LimitRowReader {
    pub fn new(source: Box<dyn RowReader>, limit: u64) -> LimitRowReader {
        LimitRowReader {
            source,
            limit,
            emitted: 0,
            closed: false,
        }
    }
}

impl RowReader for LimitRowReader {
    fn columns(&self) -> Result<Vec<ColumnDesc>> {
        self.source.columns()
    }

    fn read(&mut self) -> Result<Option<Row>> {
        if self.closed || self.emitted >= self.limit {
            return Ok(None);
        }
        match self.source.read()? {
            Some(row) => {
                self.emitted += 1;
                Ok(Some(row))
            }
            None => Ok(None),
        }
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
