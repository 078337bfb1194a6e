//! Durable catalog: databases, tables, columns and indexes.
//!
//! Catalog records persist as individual key-value entries under the engine's
//! byte prefix (`CTL.*` namespaces). Booting scans each namespace in id order
//! and rebuilds the in-memory structures; ids are assigned monotonically and
//! never reused, including across reboots.

use crate::errors::{Result, SqlError};
use crate::keycodec::{
    decode_id, decode_row, encode_id, map_key, NS_CTL_COLUMN, NS_CTL_DATABASE, NS_CTL_INDEX,
    NS_CTL_TABLE, NS_PRIMARY,
};
use crate::schema::{Column, DatabaseSchema, Index, TableSchema};
use crate::sql::ast::ColumnDef;
use crate::value::{SqlType, Value};
use kvstore::{KeyRange, Snapshot, Tx};
use tracing::debug;

const FLAG_NOT_NULL: u8 = 1 << 0;
const FLAG_AUTO_INCREMENT: u8 = 1 << 1;

#[derive(Debug, Default)]
pub struct Catalog {
    dbs: Vec<DatabaseSchema>,
    next_db_id: u32,
}

impl Catalog {
    /// Rebuilds the catalog from persisted records.
    pub fn load(snapshot: &Snapshot, prefix: &[u8]) -> Result<Catalog> {
        let mut dbs = Vec::new();
        let mut next_db_id = 1;

        let mut iter = snapshot.range(
            KeyRange::prefixed(&map_key(prefix, NS_CTL_DATABASE, &[])),
            false,
        );
        while let Some((key, value)) = iter.next()? {
            let id = decode_id(tail(&key, prefix, NS_CTL_DATABASE)?)?;
            let name = decode_name(&value)?;
            let mut db = DatabaseSchema {
                id,
                name,
                tables: Vec::new(),
            };
            load_tables(snapshot, prefix, &mut db)?;
            next_db_id = next_db_id.max(id + 1);
            dbs.push(db);
        }

        debug!(databases = dbs.len(), "catalog loaded");
        Ok(Catalog { dbs, next_db_id })
    }

    pub fn db(&self, name: &str) -> Result<&DatabaseSchema> {
        self.dbs
            .iter()
            .find(|db| db.name == name)
            .ok_or(SqlError::DatabaseDoesNotExist)
    }

    pub fn db_mut(&mut self, name: &str) -> Result<&mut DatabaseSchema> {
        self.dbs
            .iter_mut()
            .find(|db| db.name == name)
            .ok_or(SqlError::DatabaseDoesNotExist)
    }

    pub fn exists_database(&self, name: &str) -> bool {
        self.dbs.iter().any(|db| db.name == name)
    }

    /// Creates a database, persisting its record through `tx`.
    pub fn create_database(&mut self, tx: &mut Tx, prefix: &[u8], name: &str) -> Result<u32> {
        if self.exists_database(name) {
            return Err(SqlError::DatabaseAlreadyExists);
        }
        let id = self.next_db_id;
        self.next_db_id += 1;

        tx.set(
            map_key(prefix, NS_CTL_DATABASE, &[&encode_id(id)]),
            name.as_bytes().to_vec(),
        );
        self.dbs.push(DatabaseSchema {
            id,
            name: name.to_string(),
            tables: Vec::new(),
        });
        debug!(db = name, id, "database created");
        Ok(id)
    }

    /// Creates a table with its columns and primary index.
    pub fn create_table(
        &mut self,
        tx: &mut Tx,
        prefix: &[u8],
        db_name: &str,
        table_name: &str,
        col_defs: &[ColumnDef],
        pk: &str,
    ) -> Result<u32> {
        let db = self.db(db_name)?;
        if db.tables.iter().any(|t| t.name == table_name) {
            return Err(SqlError::TableAlreadyExists);
        }
        let db_id = db.id;
        let table_id = db.tables.iter().map(|t| t.id + 1).max().unwrap_or(1);

        let mut cols = Vec::with_capacity(col_defs.len());
        for (pos, def) in col_defs.iter().enumerate() {
            if col_defs[..pos].iter().any(|d| d.name == def.name) {
                return Err(SqlError::DuplicatedColumn);
            }
            cols.push(Column {
                id: pos as u32 + 1,
                name: def.name.clone(),
                ty: def.ty,
                max_len: def.max_len,
                not_null: def.not_null || def.name == pk,
                auto_increment: def.auto_increment,
            });
        }

        let pk_col = cols
            .iter()
            .find(|c| c.name == pk)
            .ok_or(SqlError::ColumnDoesNotExist)?;
        pk_col.key_len()?;
        for col in &cols {
            if col.auto_increment && (col.name != pk || col.ty != SqlType::Integer) {
                return Err(SqlError::LimitedAutoIncrement);
            }
        }

        let primary = Index {
            id: 0,
            cols: vec![pk_col.id],
            unique: true,
        };

        tx.set(
            map_key(
                prefix,
                NS_CTL_TABLE,
                &[&encode_id(db_id), &encode_id(table_id)],
            ),
            table_name.as_bytes().to_vec(),
        );
        for col in &cols {
            tx.set(column_key(prefix, db_id, table_id, col), encode_column(col));
        }
        tx.set(
            index_key(prefix, db_id, table_id, primary.id),
            encode_index(&primary),
        );

        let table = TableSchema {
            id: table_id,
            name: table_name.to_string(),
            cols,
            indexes: vec![primary],
            max_pk: 0,
        };
        self.db_mut(db_name)?.tables.push(table);
        debug!(db = db_name, table = table_name, id = table_id, "table created");
        Ok(table_id)
    }

    /// Creates a secondary index over existing columns.
    pub fn create_index(
        &mut self,
        tx: &mut Tx,
        prefix: &[u8],
        db_name: &str,
        table_name: &str,
        col_names: &[String],
        unique: bool,
    ) -> Result<u32> {
        let db = self.db(db_name)?;
        let db_id = db.id;
        let table = db.table(table_name)?;
        let table_id = table.id;

        let mut col_ids = Vec::with_capacity(col_names.len());
        for name in col_names {
            let col = table.col_by_name(name)?;
            col.key_len()?;
            if col_ids.contains(&col.id) {
                return Err(SqlError::DuplicatedColumn);
            }
            col_ids.push(col.id);
        }
        if table.index_on(&col_ids).is_some() {
            return Err(SqlError::IndexAlreadyExists);
        }

        let index_id = table.indexes.iter().map(|ix| ix.id).max().unwrap_or(0) + 1;
        let index = Index {
            id: index_id,
            cols: col_ids,
            unique,
        };
        tx.set(
            index_key(prefix, db_id, table_id, index_id),
            encode_index(&index),
        );

        self.db_mut(db_name)?
            .table_mut(table_name)?
            .indexes
            .push(index);
        debug!(db = db_name, table = table_name, index = index_id, "index created");
        Ok(index_id)
    }

    /// Bumps the in-memory auto-increment watermark.
    pub fn observe_pk(&mut self, db_name: &str, table_name: &str, pk: i64) -> Result<()> {
        let table = self.db_mut(db_name)?.table_mut(table_name)?;
        table.max_pk = table.max_pk.max(pk);
        Ok(())
    }

    /// Reserves the next auto-increment primary key.
    pub fn next_pk(&mut self, db_name: &str, table_name: &str) -> Result<i64> {
        let table = self.db_mut(db_name)?.table_mut(table_name)?;
        table.max_pk += 1;
        Ok(table.max_pk)
    }
}

fn load_tables(snapshot: &Snapshot, prefix: &[u8], db: &mut DatabaseSchema) -> Result<()> {
    let table_ns = map_key(prefix, NS_CTL_TABLE, &[&encode_id(db.id)]);
    let mut iter = snapshot.range(KeyRange::prefixed(&table_ns), false);
    while let Some((key, value)) = iter.next()? {
        let rest = tail(&key, prefix, NS_CTL_TABLE)?;
        let table_id = decode_id(&rest[4..])?;
        let mut table = TableSchema {
            id: table_id,
            name: decode_name(&value)?,
            cols: Vec::new(),
            indexes: Vec::new(),
            max_pk: 0,
        };
        load_columns(snapshot, prefix, db.id, &mut table)?;
        load_indexes(snapshot, prefix, db.id, &mut table)?;
        if table.indexes.is_empty() || table.cols.is_empty() {
            return Err(SqlError::CorruptedData);
        }
        load_max_pk(snapshot, prefix, db.id, &mut table)?;
        db.tables.push(table);
    }
    Ok(())
}

fn load_columns(
    snapshot: &Snapshot,
    prefix: &[u8],
    db_id: u32,
    table: &mut TableSchema,
) -> Result<()> {
    let col_ns = map_key(
        prefix,
        NS_CTL_COLUMN,
        &[&encode_id(db_id), &encode_id(table.id)],
    );
    let mut iter = snapshot.range(KeyRange::prefixed(&col_ns), false);
    while let Some((key, value)) = iter.next()? {
        let rest = tail(&key, prefix, NS_CTL_COLUMN)?;
        if rest.len() < 12 {
            return Err(SqlError::IllegalMappedKey);
        }
        let col_id = decode_id(&rest[8..])?;
        let ty_name = std::str::from_utf8(&rest[12..]).map_err(|_| SqlError::IllegalMappedKey)?;
        let ty = SqlType::from_name(ty_name).ok_or(SqlError::IllegalMappedKey)?;
        table.cols.push(decode_column(col_id, ty, &value)?);
    }
    Ok(())
}

fn load_indexes(
    snapshot: &Snapshot,
    prefix: &[u8],
    db_id: u32,
    table: &mut TableSchema,
) -> Result<()> {
    let ix_ns = map_key(
        prefix,
        NS_CTL_INDEX,
        &[&encode_id(db_id), &encode_id(table.id)],
    );
    let mut iter = snapshot.range(KeyRange::prefixed(&ix_ns), false);
    while let Some((key, value)) = iter.next()? {
        let rest = tail(&key, prefix, NS_CTL_INDEX)?;
        if rest.len() < 12 {
            return Err(SqlError::IllegalMappedKey);
        }
        let index_id = decode_id(&rest[8..])?;
        table.indexes.push(decode_index(index_id, &value)?);
    }
    Ok(())
}

/// Re-derives the auto-increment watermark from the greatest stored primary
/// key.
fn load_max_pk(
    snapshot: &Snapshot,
    prefix: &[u8],
    db_id: u32,
    table: &mut TableSchema,
) -> Result<()> {
    if !table.pk_col().auto_increment {
        return Ok(());
    }
    let row_ns = map_key(
        prefix,
        NS_PRIMARY,
        &[&encode_id(db_id), &encode_id(table.id)],
    );
    let mut iter = snapshot.range(KeyRange::prefixed(&row_ns), true);
    if let Some((_, payload)) = iter.next()? {
        let values = decode_row(&payload, &table.cols)?;
        let pk_pos = table
            .cols
            .iter()
            .position(|c| c.id == table.primary_index().cols[0])
            .ok_or(SqlError::CorruptedData)?;
        if let Value::Integer(pk) = &values[pk_pos] {
            table.max_pk = *pk;
        }
    }
    Ok(())
}

fn tail<'a>(key: &'a [u8], prefix: &[u8], ns: &str) -> Result<&'a [u8]> {
    let head = prefix.len() + ns.len();
    if key.len() < head {
        return Err(SqlError::IllegalMappedKey);
    }
    Ok(&key[head..])
}

fn decode_name(value: &[u8]) -> Result<String> {
    std::str::from_utf8(value)
        .map(|s| s.to_string())
        .map_err(|_| SqlError::CorruptedData)
}

fn column_key(prefix: &[u8], db_id: u32, table_id: u32, col: &Column) -> Vec<u8> {
    map_key(
        prefix,
        NS_CTL_COLUMN,
        &[
            &encode_id(db_id),
            &encode_id(table_id),
            &encode_id(col.id),
            col.ty.name().as_bytes(),
        ],
    )
}

fn index_key(prefix: &[u8], db_id: u32, table_id: u32, index_id: u32) -> Vec<u8> {
    map_key(
        prefix,
        NS_CTL_INDEX,
        &[&encode_id(db_id), &encode_id(table_id), &encode_id(index_id)],
    )
}

fn encode_column(col: &Column) -> Vec<u8> {
    let mut flags = 0u8;
    if col.not_null {
        flags |= FLAG_NOT_NULL;
    }
    if col.auto_increment {
        flags |= FLAG_AUTO_INCREMENT;
    }
    let mut value = vec![flags];
    value.extend_from_slice(&(col.max_len as u32).to_be_bytes());
    value.extend_from_slice(col.name.as_bytes());
    value
}

fn decode_column(id: u32, ty: SqlType, value: &[u8]) -> Result<Column> {
    if value.len() < 5 {
        return Err(SqlError::CorruptedData);
    }
    let flags = value[0];
    let max_len = decode_id(&value[1..5])? as usize;
    let name = decode_name(&value[5..])?;
    Ok(Column {
        id,
        name,
        ty,
        max_len,
        not_null: flags & FLAG_NOT_NULL != 0,
        auto_increment: flags & FLAG_AUTO_INCREMENT != 0,
    })
}

fn encode_index(index: &Index) -> Vec<u8> {
    let mut value = vec![u8::from(index.unique)];
    value.extend_from_slice(&(index.cols.len() as u32).to_be_bytes());
    for col_id in &index.cols {
        value.extend_from_slice(&col_id.to_be_bytes());
    }
    value
}

fn decode_index(id: u32, value: &[u8]) -> Result<Index> {
    if value.len() < 5 {
        return Err(SqlError::CorruptedData);
    }
    let unique = match value[0] {
        0 => false,
        1 => true,
        _ => return Err(SqlError::CorruptedData),
    };
    let ncols = decode_id(&value[1..5])? as usize;
    if value.len() != 5 + ncols * 4 {
        return Err(SqlError::CorruptedData);
    }
    let cols = (0..ncols)
        .map(|i| decode_id(&value[5 + i * 4..]))
        .collect::<Result<Vec<_>>>()?;
    Ok(Index { id, cols, unique })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemStore;

    fn col_def(name: &str, ty: SqlType) -> ColumnDef {
        ColumnDef {
            name: name.into(),
            ty,
            max_len: 0,
            not_null: false,
            auto_increment: false,
        }
    }

    fn reload(store: &MemStore, prefix: &[u8]) -> Catalog {
        Catalog::load(&store.snapshot().unwrap(), prefix).unwrap()
    }

    #[test]
    fn create_and_reload_database() {
        let store = MemStore::new();
        let prefix = b"\x02";
        let mut catalog = reload(&store, prefix);

        let mut tx = store.begin().unwrap();
        catalog.create_database(&mut tx, prefix, "db1").unwrap();
        catalog
            .create_table(
                &mut tx,
                prefix,
                "db1",
                "t1",
                &[
                    col_def("id", SqlType::Integer),
                    col_def("name", SqlType::Varchar),
                ],
                "id",
            )
            .unwrap();
        tx.commit().unwrap();

        let catalog = reload(&store, prefix);
        let db = catalog.db("db1").unwrap();
        let table = db.table("t1").unwrap();
        assert_eq!(table.cols.len(), 2);
        assert_eq!(table.pk_col().name, "id");
        assert!(table.pk_col().not_null);
        assert_eq!(table.indexes.len(), 1);
        assert!(table.indexes[0].unique);
    }

    #[test]
    fn ids_are_monotonic_across_reloads() {
        let store = MemStore::new();
        let prefix = b"\x02";

        let mut catalog = reload(&store, prefix);
        let mut tx = store.begin().unwrap();
        let first = catalog.create_database(&mut tx, prefix, "db1").unwrap();
        let second = catalog.create_database(&mut tx, prefix, "db2").unwrap();
        tx.commit().unwrap();
        assert!(second > first);

        let mut catalog = reload(&store, prefix);
        let mut tx = store.begin().unwrap();
        let third = catalog.create_database(&mut tx, prefix, "db3").unwrap();
        tx.commit().unwrap();
        assert!(third > second);
    }

    #[test]
    fn duplicate_objects_are_rejected() {
        let store = MemStore::new();
        let prefix = b"\x02";
        let mut catalog = reload(&store, prefix);

        let mut tx = store.begin().unwrap();
        catalog.create_database(&mut tx, prefix, "db1").unwrap();
        assert_eq!(
            catalog.create_database(&mut tx, prefix, "db1").unwrap_err(),
            SqlError::DatabaseAlreadyExists
        );

        catalog
            .create_table(&mut tx, prefix, "db1", "t1", &[col_def("id", SqlType::Integer)], "id")
            .unwrap();
        assert_eq!(
            catalog
                .create_table(&mut tx, prefix, "db1", "t1", &[col_def("id", SqlType::Integer)], "id")
                .unwrap_err(),
            SqlError::TableAlreadyExists
        );
    }

    #[test]
    fn create_table_validations() {
        let store = MemStore::new();
        let prefix = b"\x02";
        let mut catalog = reload(&store, prefix);
        let mut tx = store.begin().unwrap();
        catalog.create_database(&mut tx, prefix, "db1").unwrap();

        // unknown primary key column
        assert_eq!(
            catalog
                .create_table(&mut tx, prefix, "db1", "t", &[col_def("a", SqlType::Integer)], "id")
                .unwrap_err(),
            SqlError::ColumnDoesNotExist
        );

        // unbounded varchar can not be a key
        assert_eq!(
            catalog
                .create_table(&mut tx, prefix, "db1", "t", &[col_def("v", SqlType::Varchar)], "v")
                .unwrap_err(),
            SqlError::LimitedKeyType
        );

        // duplicated column names
        assert_eq!(
            catalog
                .create_table(
                    &mut tx,
                    prefix,
                    "db1",
                    "t",
                    &[col_def("a", SqlType::Integer), col_def("a", SqlType::Varchar)],
                    "a"
                )
                .unwrap_err(),
            SqlError::DuplicatedColumn
        );

        // auto-increment on a non-pk column
        let mut bad = col_def("b", SqlType::Integer);
        bad.auto_increment = true;
        assert_eq!(
            catalog
                .create_table(
                    &mut tx,
                    prefix,
                    "db1",
                    "t",
                    &[col_def("a", SqlType::Integer), bad],
                    "a"
                )
                .unwrap_err(),
            SqlError::LimitedAutoIncrement
        );
    }

    #[test]
    fn secondary_index_round_trip() {
        let store = MemStore::new();
        let prefix = b"\x02";
        let mut catalog = reload(&store, prefix);

        let mut tx = store.begin().unwrap();
        catalog.create_database(&mut tx, prefix, "db1").unwrap();
        let mut v = col_def("v", SqlType::Varchar);
        v.max_len = 16;
        catalog
            .create_table(
                &mut tx,
                prefix,
                "db1",
                "t1",
                &[col_def("id", SqlType::Integer), v],
                "id",
            )
            .unwrap();
        catalog
            .create_index(&mut tx, prefix, "db1", "t1", &["v".to_string()], true)
            .unwrap();
        assert_eq!(
            catalog
                .create_index(&mut tx, prefix, "db1", "t1", &["v".to_string()], false)
                .unwrap_err(),
            SqlError::IndexAlreadyExists
        );
        tx.commit().unwrap();

        let catalog = reload(&store, prefix);
        let table = catalog.db("db1").unwrap().table("t1").unwrap();
        assert_eq!(table.indexes.len(), 2);
        assert!(table.indexes[1].unique);
        assert_eq!(table.indexes[1].cols, vec![2]);
    }
}
