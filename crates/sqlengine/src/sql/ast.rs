use crate::value::{SqlType, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateDatabase {
        name: String,
        if_not_exists: bool,
    },
    UseDatabase {
        name: String,
    },
    CreateTable {
        table: String,
        if_not_exists: bool,
        cols: Vec<ColumnDef>,
        pk: String,
    },
    CreateIndex {
        table: String,
        cols: Vec<String>,
        unique: bool,
        if_not_exists: bool,
    },
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    Select(SelectStmt),
}

impl Statement {
    /// Data-definition statements mutate the catalog; everything else is DML.
    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Statement::CreateDatabase { .. }
                | Statement::UseDatabase { .. }
                | Statement::CreateTable { .. }
                | Statement::CreateIndex { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: SqlType,
    pub max_len: usize,
    pub not_null: bool,
    pub auto_increment: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    pub cols: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
    /// `UPSERT INTO` writes unconditionally; `INSERT INTO` fails on an
    /// existing primary key.
    pub is_upsert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub sets: Vec<(String, Expr)>,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub filter: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub distinct: bool,
    pub selectors: Vec<Selector>,
    pub table: String,
    /// `USE INDEX ON (cols...)` restricts planning to the index on exactly
    /// those columns.
    pub use_index: Option<Vec<String>>,
    pub joins: Vec<Join>,
    pub filter: Option<Expr>,
    pub group_by: Vec<ColRef>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    All,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub table: String,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSpec {
    pub col: ColRef,
    pub desc: bool,
}

/// A possibly-qualified column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColRef {
    pub db: Option<String>,
    pub table: Option<String>,
    pub col: String,
}

impl ColRef {
    pub fn unqualified(col: impl Into<String>) -> ColRef {
        ColRef {
            db: None,
            table: None,
            col: col.into(),
        }
    }
}

impl fmt::Display for ColRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(db) = &self.db {
            write!(f, "{}.", db)?;
        }
        if let Some(table) = &self.table {
            write!(f, "{}.", table)?;
        }
        f.write_str(&self.col)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Col(ColRef),
    Param(String),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Agg {
        func: AggFn,
        col: Option<ColRef>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFn {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggFn {
    pub fn name(&self) -> &'static str {
        match self {
            AggFn::Count => "COUNT",
            AggFn::Sum => "SUM",
            AggFn::Min => "MIN",
            AggFn::Max => "MAX",
            AggFn::Avg => "AVG",
        }
    }
}

impl Expr {
    /// Whether the expression contains an aggregate call.
    pub fn has_aggregates(&self) -> bool {
        match self {
            Expr::Agg { .. } => true,
            Expr::Not(e) => e.has_aggregates(),
            Expr::Binary { left, right, .. } => left.has_aggregates() || right.has_aggregates(),
            Expr::In { expr, list } => {
                expr.has_aggregates() || list.iter().any(|e| e.has_aggregates())
            }
            Expr::IsNull { expr, .. } => expr.has_aggregates(),
            Expr::Literal(_) | Expr::Col(_) | Expr::Param(_) => false,
        }
    }
}
