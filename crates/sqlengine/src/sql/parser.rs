use super::ast::*;
use super::lexer::{Lexer, Token};
use crate::errors::{Result, SqlError};
use crate::value::{SqlType, Value};
use std::iter::Peekable;

/// Recursive-descent parser for the engine's SQL dialect.
///
/// The parser only checks that the syntax is well-formed; name resolution and
/// index selection happen later, in the planner.
pub struct Parser<'a> {
    lexer: Peekable<Lexer<'a>>,
}

/// Parses a string of semicolon-separated statements.
pub fn parse(input: &str) -> Result<Vec<Statement>> {
    let mut parser = Parser {
        lexer: Lexer::new(input).peekable(),
    };
    let mut stmts = Vec::new();
    loop {
        while parser.skip(&Token::Semicolon) {}
        if parser.peek()?.is_none() {
            return Ok(stmts);
        }
        stmts.push(parser.parse_statement()?);
        match parser.peek()? {
            None => return Ok(stmts),
            Some(Token::Semicolon) => continue,
            Some(token) => return Err(unexpected(token)),
        }
    }
}

fn unexpected(token: &Token) -> SqlError {
    SqlError::Parse(format!("unexpected token {}", token))
}

impl Parser<'_> {
    fn peek(&mut self) -> Result<Option<&Token>> {
        if matches!(self.lexer.peek(), Some(Err(_))) {
            // propagate the owned lexer error
            return Err(self.lexer.next().unwrap().unwrap_err());
        }
        match self.lexer.peek() {
            Some(Ok(token)) => Ok(Some(token)),
            Some(Err(_)) => unreachable!(),
            None => Ok(None),
        }
    }

    fn next(&mut self) -> Result<Token> {
        self.lexer
            .next()
            .transpose()?
            .ok_or_else(|| SqlError::Parse("unexpected end of input".into()))
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        let token = self.next()?;
        if token == expected {
            Ok(())
        } else {
            Err(SqlError::Parse(format!(
                "expected {}, got {}",
                expected, token
            )))
        }
    }

    fn skip(&mut self, token: &Token) -> bool {
        if matches!(self.lexer.peek(), Some(Ok(t)) if t == token) {
            self.lexer.next();
            true
        } else {
            false
        }
    }

    fn next_ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Ident(ident) => Ok(ident),
            token => Err(SqlError::Parse(format!(
                "expected identifier, got {}",
                token
            ))),
        }
    }

    /// Consumes the given keyword, erroring when absent.
    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        match self.next()? {
            Token::Ident(ident) if ident == kw => Ok(()),
            token => Err(SqlError::Parse(format!("expected {}, got {}", kw, token))),
        }
    }

    /// Consumes the given keyword if it is next.
    fn skip_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.lexer.peek(), Some(Ok(Token::Ident(ident))) if ident == kw) {
            self.lexer.next();
            true
        } else {
            false
        }
    }

    fn peek_keyword(&mut self, kw: &str) -> bool {
        matches!(self.lexer.peek(), Some(Ok(Token::Ident(ident))) if ident == kw)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        match self.peek()? {
            Some(Token::Ident(ident)) => match ident.as_str() {
                "create" => self.parse_create(),
                "use" => self.parse_use(),
                "insert" => self.parse_insert(false),
                "upsert" => self.parse_insert(true),
                "update" => self.parse_update(),
                "delete" => self.parse_delete(),
                "select" => Ok(Statement::Select(self.parse_select()?)),
                // recognized but unsupported statements
                "alter" | "drop" | "begin" | "commit" | "rollback" => Err(SqlError::NoSupported),
                _ => Err(SqlError::Parse(format!("unexpected statement {}", ident))),
            },
            Some(token) => Err(unexpected(token)),
            None => Err(SqlError::Parse("unexpected end of input".into())),
        }
    }

    fn parse_if_not_exists(&mut self) -> Result<bool> {
        if self.skip_keyword("if") {
            self.expect_keyword("not")?;
            self.expect_keyword("exists")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn parse_create(&mut self) -> Result<Statement> {
        self.expect_keyword("create")?;
        if self.skip_keyword("database") {
            let if_not_exists = self.parse_if_not_exists()?;
            return Ok(Statement::CreateDatabase {
                name: self.next_ident()?,
                if_not_exists,
            });
        }
        if self.skip_keyword("table") {
            return self.parse_create_table();
        }
        let unique = self.skip_keyword("unique");
        if self.skip_keyword("index") {
            let if_not_exists = self.parse_if_not_exists()?;
            self.expect_keyword("on")?;
            let table = self.next_ident()?;
            self.expect(Token::LParen)?;
            let mut cols = vec![self.next_ident()?];
            while self.skip(&Token::Comma) {
                cols.push(self.next_ident()?);
            }
            self.expect(Token::RParen)?;
            return Ok(Statement::CreateIndex {
                table,
                cols,
                unique,
                if_not_exists,
            });
        }
        Err(SqlError::Parse("expected DATABASE, TABLE or INDEX".into()))
    }

    fn parse_create_table(&mut self) -> Result<Statement> {
        let if_not_exists = self.parse_if_not_exists()?;
        let table = self.next_ident()?;
        self.expect(Token::LParen)?;

        let mut cols = Vec::new();
        let mut pk = None;
        loop {
            if self.skip_keyword("primary") {
                self.expect_keyword("key")?;
                pk = Some(self.next_ident()?);
            } else {
                cols.push(self.parse_column_def()?);
            }
            if !self.skip(&Token::Comma) {
                break;
            }
        }
        self.expect(Token::RParen)?;

        let pk = pk.ok_or_else(|| SqlError::Parse("missing PRIMARY KEY".into()))?;
        Ok(Statement::CreateTable {
            table,
            if_not_exists,
            cols,
            pk,
        })
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.next_ident()?;
        let ty = match self.next_ident()?.as_str() {
            "integer" => SqlType::Integer,
            "varchar" => SqlType::Varchar,
            "boolean" => SqlType::Boolean,
            "blob" => SqlType::Blob,
            // a recognized grammar with an unsupported type
            _ => return Err(SqlError::NoSupported),
        };

        let mut max_len = 0;
        if self.skip(&Token::LBracket) {
            max_len = match self.next()? {
                Token::Int(n) if n > 0 => n as usize,
                token => return Err(SqlError::Parse(format!("invalid length {}", token))),
            };
            self.expect(Token::RBracket)?;
        }

        let mut not_null = false;
        let mut auto_increment = false;
        loop {
            if self.skip_keyword("not") {
                self.expect_keyword("null")?;
                not_null = true;
            } else if self.skip_keyword("auto_increment") {
                auto_increment = true;
            } else {
                break;
            }
        }

        Ok(ColumnDef {
            name,
            ty,
            max_len,
            not_null,
            auto_increment,
        })
    }

    fn parse_use(&mut self) -> Result<Statement> {
        self.expect_keyword("use")?;
        self.expect_keyword("database")?;
        Ok(Statement::UseDatabase {
            name: self.next_ident()?,
        })
    }

    fn parse_insert(&mut self, is_upsert: bool) -> Result<Statement> {
        self.next()?; // INSERT or UPSERT
        self.expect_keyword("into")?;
        let table = self.next_ident()?;

        self.expect(Token::LParen)?;
        let mut cols = vec![self.next_ident()?];
        while self.skip(&Token::Comma) {
            cols.push(self.next_ident()?);
        }
        self.expect(Token::RParen)?;

        self.expect_keyword("values")?;
        let mut rows = Vec::new();
        loop {
            self.expect(Token::LParen)?;
            let mut row = vec![self.parse_expression()?];
            while self.skip(&Token::Comma) {
                row.push(self.parse_expression()?);
            }
            self.expect(Token::RParen)?;
            if row.len() != cols.len() {
                return Err(SqlError::Parse(
                    "values count does not match column count".into(),
                ));
            }
            rows.push(row);
            if !self.skip(&Token::Comma) {
                break;
            }
        }

        Ok(Statement::Insert(InsertStmt {
            table,
            cols,
            rows,
            is_upsert,
        }))
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.expect_keyword("update")?;
        let table = self.next_ident()?;
        self.expect_keyword("set")?;

        let mut sets = Vec::new();
        loop {
            let col = self.next_ident()?;
            self.expect(Token::Eq)?;
            sets.push((col, self.parse_expression()?));
            if !self.skip(&Token::Comma) {
                break;
            }
        }

        let filter = if self.skip_keyword("where") {
            Some(self.parse_expression()?)
        } else {
            None
        };

        Ok(Statement::Update(UpdateStmt {
            table,
            sets,
            filter,
        }))
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect_keyword("delete")?;
        self.expect_keyword("from")?;
        let table = self.next_ident()?;
        let filter = if self.skip_keyword("where") {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Statement::Delete(DeleteStmt { table, filter }))
    }

    pub(crate) fn parse_select(&mut self) -> Result<SelectStmt> {
        self.expect_keyword("select")?;
        let distinct = self.skip_keyword("distinct");

        let mut selectors = vec![self.parse_selector()?];
        while self.skip(&Token::Comma) {
            selectors.push(self.parse_selector()?);
        }

        self.expect_keyword("from")?;
        let table = self.next_ident()?;

        let use_index = if self.skip_keyword("use") {
            self.expect_keyword("index")?;
            self.expect_keyword("on")?;
            let mut cols = Vec::new();
            if self.skip(&Token::LParen) {
                cols.push(self.next_ident()?);
                while self.skip(&Token::Comma) {
                    cols.push(self.next_ident()?);
                }
                self.expect(Token::RParen)?;
            } else {
                cols.push(self.next_ident()?);
            }
            Some(cols)
        } else {
            None
        };

        let mut joins = Vec::new();
        loop {
            if self.skip_keyword("inner") {
                self.expect_keyword("join")?;
            } else if !self.skip_keyword("join") {
                break;
            }
            let join_table = self.next_ident()?;
            self.expect_keyword("on")?;
            joins.push(Join {
                table: join_table,
                on: self.parse_expression()?,
            });
        }

        let filter = if self.skip_keyword("where") {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let mut group_by = Vec::new();
        if self.skip_keyword("group") {
            self.expect_keyword("by")?;
            group_by.push(self.parse_col_ref()?);
            while self.skip(&Token::Comma) {
                group_by.push(self.parse_col_ref()?);
            }
        }

        let having = if self.skip_keyword("having") {
            Some(self.parse_expression()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.skip_keyword("order") {
            self.expect_keyword("by")?;
            loop {
                let col = self.parse_col_ref()?;
                let desc = if self.skip_keyword("desc") {
                    true
                } else {
                    self.skip_keyword("asc");
                    false
                };
                order_by.push(OrderSpec { col, desc });
                if !self.skip(&Token::Comma) {
                    break;
                }
            }
        }

        let limit = if self.skip_keyword("limit") {
            match self.next()? {
                Token::Int(n) if n >= 0 => Some(n as u64),
                token => return Err(SqlError::Parse(format!("invalid limit {}", token))),
            }
        } else {
            None
        };

        Ok(SelectStmt {
            distinct,
            selectors,
            table,
            use_index,
            joins,
            filter,
            group_by,
            having,
            order_by,
            limit,
        })
    }

    fn parse_selector(&mut self) -> Result<Selector> {
        if self.skip(&Token::Star) {
            return Ok(Selector::All);
        }
        let expr = self.parse_expression()?;
        let alias = if self.skip_keyword("as") {
            Some(self.next_ident()?)
        } else {
            None
        };
        Ok(Selector::Expr { expr, alias })
    }

    /// `col`, `table.col` or `db.table.col`.
    fn parse_col_ref(&mut self) -> Result<ColRef> {
        let first = self.next_ident()?;
        if !self.skip(&Token::Period) {
            return Ok(ColRef::unqualified(first));
        }
        let second = self.next_ident()?;
        if !self.skip(&Token::Period) {
            return Ok(ColRef {
                db: None,
                table: Some(first),
                col: second,
            });
        }
        let third = self.next_ident()?;
        Ok(ColRef {
            db: Some(first),
            table: Some(second),
            col: third,
        })
    }

    pub(crate) fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut expr = self.parse_and()?;
        while self.skip_keyword("or") {
            expr = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(expr),
                right: Box::new(self.parse_and()?),
            };
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut expr = self.parse_not()?;
        while self.skip_keyword("and") {
            expr = Expr::Binary {
                op: BinOp::And,
                left: Box::new(expr),
                right: Box::new(self.parse_not()?),
            };
        }
        Ok(expr)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.skip_keyword("not") {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;

        let op = match self.peek()? {
            Some(Token::Eq) => Some(BinOp::Eq),
            Some(Token::Neq) => Some(BinOp::Ne),
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::Le) => Some(BinOp::Le),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::Ge) => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.next()?;
            return Ok(Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(self.parse_additive()?),
            });
        }

        if self.skip_keyword("is") {
            let negated = self.skip_keyword("not");
            self.expect_keyword("null")?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        let negated_in = self.peek_keyword("not");
        if negated_in {
            self.next()?;
            self.expect_keyword("in")?;
        }
        if negated_in || self.skip_keyword("in") {
            self.expect(Token::LParen)?;
            let mut list = vec![self.parse_expression()?];
            while self.skip(&Token::Comma) {
                list.push(self.parse_expression()?);
            }
            self.expect(Token::RParen)?;
            let expr = Expr::In {
                expr: Box::new(left),
                list,
            };
            return Ok(if negated_in {
                Expr::Not(Box::new(expr))
            } else {
                expr
            });
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.peek()? {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(self.parse_multiplicative()?),
            };
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let op = match self.peek()? {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.next()?;
            expr = Expr::Binary {
                op,
                left: Box::new(expr),
                right: Box::new(self.parse_primary()?),
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next()? {
            Token::Int(i) => Ok(Expr::Literal(Value::Integer(i))),
            Token::Str(s) => Ok(Expr::Literal(Value::Varchar(s))),
            Token::Blob(b) => Ok(Expr::Literal(Value::Blob(b))),
            Token::Param(name) => Ok(Expr::Param(name)),
            Token::Minus => match self.next()? {
                Token::Int(i) => Ok(Expr::Literal(Value::Integer(-i))),
                token => Err(SqlError::Parse(format!("expected integer, got {}", token))),
            },
            Token::LParen => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::Ident(ident) => match ident.as_str() {
                "true" => Ok(Expr::Literal(Value::Boolean(true))),
                "false" => Ok(Expr::Literal(Value::Boolean(false))),
                "null" => Ok(Expr::Literal(Value::Null(SqlType::Any))),
                "count" | "sum" | "min" | "max" | "avg"
                    if matches!(self.peek()?, Some(Token::LParen)) =>
                {
                    self.parse_agg_call(&ident)
                }
                _ => self.parse_col_ref_from(ident),
            },
            token => Err(unexpected(&token)),
        }
    }

    fn parse_agg_call(&mut self, func: &str) -> Result<Expr> {
        let func = match func {
            "count" => AggFn::Count,
            "sum" => AggFn::Sum,
            "min" => AggFn::Min,
            "max" => AggFn::Max,
            "avg" => AggFn::Avg,
            _ => unreachable!("caller checked the function name"),
        };
        self.expect(Token::LParen)?;
        let col = if self.skip(&Token::RParen) {
            None
        } else {
            let col = self.parse_col_ref()?;
            self.expect(Token::RParen)?;
            Some(col)
        };
        Ok(Expr::Agg { func, col })
    }

    fn parse_col_ref_from(&mut self, first: String) -> Result<Expr> {
        if !self.skip(&Token::Period) {
            return Ok(Expr::Col(ColRef::unqualified(first)));
        }
        let second = self.next_ident()?;
        if !self.skip(&Token::Period) {
            return Ok(Expr::Col(ColRef {
                db: None,
                table: Some(first),
                col: second,
            }));
        }
        let third = self.next_ident()?;
        Ok(Expr::Col(ColRef {
            db: Some(first),
            table: Some(second),
            col: third,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(input: &str) -> Statement {
        let mut stmts = parse(input).unwrap();
        assert_eq!(stmts.len(), 1);
        stmts.remove(0)
    }

    #[test]
    fn parse_create_table() {
        let stmt = parse_one(
            "CREATE TABLE t (id INTEGER AUTO_INCREMENT, v VARCHAR[10] NOT NULL, PRIMARY KEY id)",
        );
        match stmt {
            Statement::CreateTable {
                table, cols, pk, ..
            } => {
                assert_eq!(table, "t");
                assert_eq!(pk, "id");
                assert_eq!(cols.len(), 2);
                assert!(cols[0].auto_increment);
                assert_eq!(cols[1].ty, SqlType::Varchar);
                assert_eq!(cols[1].max_len, 10);
                assert!(cols[1].not_null);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_multi_row_upsert() {
        let stmt = parse_one("UPSERT INTO t(id, v) VALUES (1, 'a'), (2, 'b')");
        match stmt {
            Statement::Insert(insert) => {
                assert!(insert.is_upsert);
                assert_eq!(insert.cols, vec!["id", "v"]);
                assert_eq!(insert.rows.len(), 2);
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_select_with_everything() {
        let stmt = parse_one(
            "SELECT DISTINCT t.a AS x, COUNT() FROM t USE INDEX ON (a) \
             INNER JOIN u ON t.a = u.a WHERE t.a > 3 AND u.b IN (1, 2) \
             GROUP BY a HAVING COUNT() > 1 ORDER BY a DESC LIMIT 10",
        );
        match stmt {
            Statement::Select(sel) => {
                assert!(sel.distinct);
                assert_eq!(sel.selectors.len(), 2);
                assert_eq!(sel.table, "t");
                assert_eq!(sel.use_index, Some(vec!["a".to_string()]));
                assert_eq!(sel.joins.len(), 1);
                assert!(sel.filter.is_some());
                assert_eq!(sel.group_by, vec![ColRef::unqualified("a")]);
                assert!(sel.having.is_some());
                assert_eq!(sel.order_by.len(), 1);
                assert!(sel.order_by[0].desc);
                assert_eq!(sel.limit, Some(10));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn parse_multiple_statements() {
        let stmts = parse("CREATE DATABASE d; USE DATABASE d;").unwrap();
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn empty_input_yields_no_statements() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse(";").unwrap().is_empty());
    }

    #[test]
    fn alter_table_is_unsupported() {
        assert_eq!(
            parse("ALTER TABLE t ADD COLUMN c VARCHAR").unwrap_err(),
            SqlError::NoSupported
        );
    }

    #[test]
    fn unknown_column_type_is_unsupported() {
        assert_eq!(
            parse("CREATE TABLE t (ts TIMESTAMP, PRIMARY KEY ts)").unwrap_err(),
            SqlError::NoSupported
        );
    }

    #[test]
    fn params_keep_their_names() {
        let stmt = parse_one("SELECT * FROM t WHERE a = @low OR a = $2 OR a = ?");
        match stmt {
            Statement::Select(sel) => {
                let filter = format!("{:?}", sel.filter.unwrap());
                assert!(filter.contains("\"low\""));
                assert!(filter.contains("\"param2\""));
                assert!(filter.contains("\"param1\""));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn precedence_binds_and_over_or() {
        let stmt = parse_one("SELECT * FROM t WHERE a = 1 OR b = 2 AND c = 3");
        let filter = match stmt {
            Statement::Select(sel) => sel.filter.unwrap(),
            other => panic!("unexpected statement {:?}", other),
        };
        match filter {
            Expr::Binary { op: BinOp::Or, .. } => {}
            other => panic!("expected OR at the top, got {:?}", other),
        }
    }
}
