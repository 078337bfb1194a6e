use super::{ColumnDesc, ParamTypes, Row, RowReader};
use crate::errors::{Result, SqlError};
use crate::eval;
use crate::sql::ast::{AggFn, ColRef};
use crate::value::{SqlType, Value};
use std::cmp::Ordering;

/// One aggregate to maintain over the input.
#[derive(Debug, Clone)]
pub struct AggSpec {
    pub func: AggFn,
    /// Fully qualified argument column; `None` only for `COUNT()`.
    pub col: Option<ColRef>,
}

impl AggSpec {
    fn out_selector(&self) -> String {
        eval::agg_selector(self.func, &self.col)
    }
}

struct Accumulator {
    spec: AggSpec,
    arg_selector: Option<String>,
    arg_ty: SqlType,
    count: i64,
    sum: i64,
    extreme: Option<Value>,
}

impl Accumulator {
    fn new(spec: AggSpec, arg_ty: SqlType) -> Accumulator {
        let arg_selector = spec.col.as_ref().map(eval::col_selector);
        Accumulator {
            spec,
            arg_selector,
            arg_ty,
            count: 0,
            sum: 0,
            extreme: None,
        }
    }

    fn reset(&mut self) {
        self.count = 0;
        self.sum = 0;
        self.extreme = None;
    }

    fn update(&mut self, row: &Row) -> Result<()> {
        if self.spec.func == AggFn::Count {
            self.count += 1;
            return Ok(());
        }

        let selector = self.arg_selector.as_ref().expect("non-count aggregates take a column");
        let value = row.get(selector).ok_or(SqlError::ColumnDoesNotExist)?;
        if value.is_null() {
            return Ok(());
        }

        match self.spec.func {
            AggFn::Sum | AggFn::Avg => {
                let Value::Integer(v) = value else {
                    return Err(SqlError::InvalidValue);
                };
                self.sum = self.sum.wrapping_add(*v);
                self.count += 1;
            }
            AggFn::Min => {
                let replace = match &self.extreme {
                    None => true,
                    Some(cur) => value.compare(cur)? == Some(Ordering::Less),
                };
                if replace {
                    self.extreme = Some(value.clone());
                }
            }
            AggFn::Max => {
                let replace = match &self.extreme {
                    None => true,
                    Some(cur) => value.compare(cur)? == Some(Ordering::Greater),
                };
                if replace {
                    self.extreme = Some(value.clone());
                }
            }
            AggFn::Count => unreachable!(),
        }
        Ok(())
    }

    fn output(&self) -> Value {
        match self.spec.func {
            AggFn::Count => Value::Integer(self.count),
            AggFn::Sum => {
                if self.count == 0 {
                    Value::Null(SqlType::Integer)
                } else {
                    Value::Integer(self.sum)
                }
            }
            AggFn::Avg => {
                if self.count == 0 {
                    Value::Null(SqlType::Integer)
                } else {
                    Value::Integer(self.sum / self.count)
                }
            }
            AggFn::Min | AggFn::Max => self
                .extreme
                .clone()
                .unwrap_or(Value::Null(self.arg_ty)),
        }
    }

    fn output_ty(&self) -> SqlType {
        match self.spec.func {
            AggFn::Count | AggFn::Sum | AggFn::Avg => SqlType::Integer,
            AggFn::Min | AggFn::Max => self.arg_ty,
        }
    }
}

/// Aggregates its input.
///
/// Without a group column the whole input collapses into one row. With a
/// group column the input must already be ordered on it; groups are emitted
/// per contiguous run, so no hash of groups is held in memory.
pub struct GroupedRowReader {
    source: Box<dyn RowReader>,
    group_selector: Option<String>,
    group_desc: Option<ColumnDesc>,
    accumulators: Vec<Accumulator>,
    current_group: Option<Value>,
    in_group: bool,
    done: bool,
    closed: bool,
}

impl GroupedRowReader {
    pub fn new(
        source: Box<dyn RowReader>,
        group_selector: Option<String>,
        aggs: Vec<AggSpec>,
    ) -> Result<GroupedRowReader> {
        let source_cols = source.columns()?;

        let group_desc = match &group_selector {
            Some(selector) => Some(
                source_cols
                    .iter()
                    .find(|c| &c.selector == selector)
                    .cloned()
                    .ok_or(SqlError::ColumnDoesNotExist)?,
            ),
            None => None,
        };

        let mut accumulators = Vec::with_capacity(aggs.len());
        for spec in aggs {
            let arg_ty = match &spec.col {
                Some(col) => {
                    let selector = eval::col_selector(col);
                    source_cols
                        .iter()
                        .find(|c| c.selector == selector)
                        .map(|c| c.ty)
                        .ok_or(SqlError::ColumnDoesNotExist)?
                }
                None => SqlType::Integer,
            };
            accumulators.push(Accumulator::new(spec, arg_ty));
        }

        Ok(GroupedRowReader {
            source,
            group_selector,
            group_desc,
            accumulators,
            current_group: None,
            in_group: false,
            done: false,
            closed: false,
        })
    }

    fn emit(&mut self) -> Row {
        let mut row = Row::default();
        if let (Some(desc), Some(group)) = (&self.group_desc, &self.current_group) {
            row.values.insert(desc.selector.clone(), group.clone());
        }
        for acc in &self.accumulators {
            row.values.insert(acc.spec.out_selector(), acc.output());
        }
        for acc in &mut self.accumulators {
            acc.reset();
        }
        row
    }
}

impl RowReader for GroupedRowReader {
    fn columns(&self) -> Result<Vec<ColumnDesc>> {
        let mut cols = Vec::new();
        if let Some(desc) = &self.group_desc {
            cols.push(desc.clone());
        }
        for acc in &self.accumulators {
            let selector = acc.spec.out_selector();
            cols.push(ColumnDesc {
                name: selector.clone(),
                selector,
                ty: acc.output_ty(),
            });
        }
        Ok(cols)
    }

    fn read(&mut self) -> Result<Option<Row>> {
        if self.closed || self.done {
            return Ok(None);
        }

        let Some(group_selector) = self.group_selector.clone() else {
            // whole-input aggregation always yields exactly one row
            while let Some(row) = self.source.read()? {
                for acc in &mut self.accumulators {
                    acc.update(&row)?;
                }
            }
            self.done = true;
            return Ok(Some(self.emit()));
        };

        while let Some(row) = self.source.read()? {
            let group = row
                .get(&group_selector)
                .cloned()
                .ok_or(SqlError::ColumnDoesNotExist)?;

            if self.in_group && self.current_group.as_ref() != Some(&group) {
                let emitted = self.emit();
                self.current_group = Some(group.clone());
                for acc in &mut self.accumulators {
                    acc.update(&row)?;
                }
                return Ok(Some(emitted));
            }

            if !self.in_group {
                self.in_group = true;
                self.current_group = Some(group);
            }
            for acc in &mut self.accumulators {
                acc.update(&row)?;
            }
        }

        self.done = true;
        if self.in_group {
            Ok(Some(self.emit()))
        } else {
            Ok(None)
        }
    }

    fn order_by(&self) -> Option<String> {
        self.group_selector.clone()
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
