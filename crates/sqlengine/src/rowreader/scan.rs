use super::{ColumnDesc, ParamTypes, QueryCtx, Row, RowReader};
use crate::errors::{Result, SqlError};
use crate::keycodec::{
    decode_row, encode_id, encode_key_segment, map_key, NS_PRIMARY, NS_SECONDARY,
    NS_UNIQUE_SECONDARY,
};
use crate::schema::TableSchema;
use crate::value::Value;
use kvstore::{bytes_successor, KeyRange, ScanIter};
use std::ops::Bound;

/// Streams rows of one table in the order of a chosen index.
///
/// Primary-index entries carry the row payload directly. Secondary entries
/// carry the encoded primary key as payload; the full row is dereferenced
/// with a point lookup on the primary index.
pub struct RawScanReader {
    ctx: QueryCtx,
    db_id: u32,
    db: String,
    table: TableSchema,
    index_pos: usize,
    iter: ScanIter,
    closed: bool,
}

impl RawScanReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: QueryCtx,
        db_id: u32,
        db: String,
        table: TableSchema,
        index_pos: usize,
        lower: Bound<Value>,
        upper: Bound<Value>,
        desc: bool,
    ) -> Result<RawScanReader> {
        let index = table
            .indexes
            .get(index_pos)
            .ok_or(SqlError::NoAvailableIndex)?;

        let ns = if index_pos == 0 {
            map_key(
                &ctx.prefix,
                NS_PRIMARY,
                &[&encode_id(db_id), &encode_id(table.id)],
            )
        } else {
            let ns_tag = if index.unique {
                NS_UNIQUE_SECONDARY
            } else {
                NS_SECONDARY
            };
            map_key(
                &ctx.prefix,
                ns_tag,
                &[&encode_id(db_id), &encode_id(table.id), &encode_id(index.id)],
            )
        };

        let leading = table
            .col_by_id(index.cols[0])
            .ok_or(SqlError::CorruptedData)?
            .clone();

        let start = match &lower {
            Bound::Unbounded => Bound::Included(ns.clone()),
            Bound::Included(v) => {
                let mut key = ns.clone();
                key.extend(encode_key_segment(v, &leading)?);
                Bound::Included(key)
            }
            Bound::Excluded(v) => {
                let mut key = ns.clone();
                key.extend(encode_key_segment(v, &leading)?);
                Bound::Excluded(key)
            }
        };
        let end = match &upper {
            Bound::Unbounded => match bytes_successor(ns.clone()) {
                Some(s) => Bound::Excluded(s),
                None => Bound::Unbounded,
            },
            Bound::Included(v) => {
                let mut key = ns.clone();
                key.extend(encode_key_segment(v, &leading)?);
                match bytes_successor(key) {
                    Some(s) => Bound::Excluded(s),
                    None => Bound::Unbounded,
                }
            }
            Bound::Excluded(v) => {
                let mut key = ns.clone();
                key.extend(encode_key_segment(v, &leading)?);
                Bound::Excluded(key)
            }
        };

        let iter = ctx.snapshot.range(KeyRange::new(start, end), desc);
        Ok(RawScanReader {
            ctx,
            db_id,
            db,
            table,
            index_pos,
            iter,
            closed: false,
        })
    }

    fn row_from_payload(&self, payload: &[u8]) -> Result<Row> {
        let values = decode_row(payload, &self.table.cols)?;
        let mut row = Row::default();
        for (col, value) in self.table.cols.iter().zip(values) {
            row.values.insert(
                format!("{}.{}.{}", self.db, self.table.name, col.name),
                value,
            );
        }
        Ok(row)
    }

    /// Point lookup of the full row behind a secondary entry.
    fn deref_primary(&self, pk_segment: &[u8]) -> Result<Row> {
        let mut key = map_key(
            &self.ctx.prefix,
            NS_PRIMARY,
            &[&encode_id(self.db_id), &encode_id(self.table.id)],
        );
        key.extend_from_slice(pk_segment);
        let payload = self
            .ctx
            .snapshot
            .get(&key)?
            .ok_or(SqlError::CorruptedData)?;
        self.row_from_payload(&payload)
    }
}

impl RowReader for RawScanReader {
    fn columns(&self) -> Result<Vec<ColumnDesc>> {
        Ok(self
            .table
            .cols
            .iter()
            .map(|col| ColumnDesc {
                selector: format!("{}.{}.{}", self.db, self.table.name, col.name),
                name: col.name.clone(),
                ty: col.ty,
            })
            .collect())
    }

    fn read(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        match self.iter.next()? {
            None => Ok(None),
            Some((_, payload)) if self.index_pos == 0 => Ok(Some(self.row_from_payload(&payload)?)),
            Some((_, pk_segment)) => Ok(Some(self.deref_primary(&pk_segment)?)),
        }
    }

    fn order_by(&self) -> Option<String> {
        let index = &self.table.indexes[self.index_pos];
        let col = self.table.col_by_id(index.cols[0])?;
        Some(format!("{}.{}.{}", self.db, self.table.name, col.name))
    }

    fn infer_parameters(&self, _target: &mut ParamTypes) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
