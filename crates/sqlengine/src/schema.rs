use crate::errors::{Result, SqlError};
use crate::value::SqlType;

/// Widest key segment an index column may produce, in bytes.
pub const MAX_KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct DatabaseSchema {
    pub id: u32,
    pub name: String,
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    pub fn table(&self, name: &str) -> Result<&TableSchema> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .ok_or(SqlError::TableDoesNotExist)
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut TableSchema> {
        self.tables
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or(SqlError::TableDoesNotExist)
    }
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub id: u32,
    pub name: String,
    pub cols: Vec<Column>,
    /// `indexes[0]` is the primary index and is always unique.
    pub indexes: Vec<Index>,
    /// Greatest primary-key value ever assigned, for auto-increment.
    pub max_pk: i64,
}

impl TableSchema {
    pub fn primary_index(&self) -> &Index {
        &self.indexes[0]
    }

    pub fn pk_col(&self) -> &Column {
        let id = self.indexes[0].cols[0];
        self.col_by_id(id).expect("primary key column must exist")
    }

    pub fn col_by_name(&self, name: &str) -> Result<&Column> {
        self.cols
            .iter()
            .find(|c| c.name == name)
            .ok_or(SqlError::ColumnDoesNotExist)
    }

    pub fn col_by_id(&self, id: u32) -> Option<&Column> {
        self.cols.iter().find(|c| c.id == id)
    }

    /// Whether the column participates in any index.
    pub fn is_indexed(&self, col_id: u32) -> bool {
        self.indexes.iter().any(|ix| ix.cols.contains(&col_id))
    }

    /// Position of an index with exactly the given columns, if any.
    pub fn index_on(&self, col_ids: &[u32]) -> Option<usize> {
        self.indexes.iter().position(|ix| ix.cols == col_ids)
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub id: u32,
    pub name: String,
    pub ty: SqlType,
    /// Declared maximum length in bytes; 0 means unspecified.
    pub max_len: usize,
    pub not_null: bool,
    pub auto_increment: bool,
}

impl Column {
    /// Fixed width of this column's key segment.
    ///
    /// Indexable columns always have a fixed width: integers and booleans by
    /// construction, varchar/blob by declared length. `LimitedKeyType` means
    /// the column can not participate in an index.
    pub fn key_len(&self) -> Result<usize> {
        match self.ty {
            SqlType::Integer => Ok(8),
            SqlType::Boolean => Ok(1),
            SqlType::Varchar | SqlType::Blob => {
                if self.max_len == 0 || self.max_len > MAX_KEY_LEN {
                    Err(SqlError::LimitedKeyType)
                } else {
                    Ok(self.max_len)
                }
            }
            SqlType::Any => Err(SqlError::LimitedKeyType),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub id: u32,
    pub cols: Vec<u32>,
    pub unique: bool,
}
