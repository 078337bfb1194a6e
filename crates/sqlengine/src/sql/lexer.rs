use crate::errors::{Result, SqlError};
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Unquoted identifiers are lowercased; keywords are matched on them by
    /// the parser.
    Ident(String),
    Int(i64),
    Str(String),
    /// `x'0a1b'` hex blob literal.
    Blob(Vec<u8>),
    /// `@name`, `$N` and `?` placeholders, already normalized to a name.
    Param(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Period,
    Star,
    Plus,
    Minus,
    Slash,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => f.write_str(s),
            Token::Int(i) => write!(f, "{}", i),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Blob(_) => f.write_str("blob literal"),
            Token::Param(p) => write!(f, "@{}", p),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::LBracket => f.write_str("["),
            Token::RBracket => f.write_str("]"),
            Token::Comma => f.write_str(","),
            Token::Semicolon => f.write_str(";"),
            Token::Period => f.write_str("."),
            Token::Star => f.write_str("*"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Slash => f.write_str("/"),
            Token::Eq => f.write_str("="),
            Token::Neq => f.write_str("!="),
            Token::Lt => f.write_str("<"),
            Token::Le => f.write_str("<="),
            Token::Gt => f.write_str(">"),
            Token::Ge => f.write_str(">="),
        }
    }
}

/// Tokenizes SQL text. Positional placeholders (`$N`, `?`) are rewritten to
/// the synthetic names `param1`, `param2`, ... so the rest of the engine only
/// deals with named parameters.
pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    positional: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Lexer<'a> {
        Lexer {
            chars: input.chars().peekable(),
            positional: 0,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn scan_ident(&mut self, first: char) -> Token {
        let mut ident = String::from(first.to_ascii_lowercase());
        while let Some(c) = self.chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
            ident.push(c.to_ascii_lowercase());
        }
        Token::Ident(ident)
    }

    fn scan_number(&mut self, first: char) -> Result<Token> {
        let mut digits = String::from(first);
        while let Some(c) = self.chars.next_if(|c| c.is_ascii_digit()) {
            digits.push(c);
        }
        digits
            .parse::<i64>()
            .map(Token::Int)
            .map_err(|_| SqlError::Parse(format!("invalid integer literal {}", digits)))
    }

    fn scan_string(&mut self) -> Result<Token> {
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some('\'') => {
                    // '' escapes a single quote
                    if self.chars.next_if(|c| *c == '\'').is_some() {
                        s.push('\'');
                    } else {
                        return Ok(Token::Str(s));
                    }
                }
                Some(c) => s.push(c),
                None => return Err(SqlError::Parse("unterminated string literal".into())),
            }
        }
    }

    fn scan_blob(&mut self) -> Result<Token> {
        let mut hex = String::new();
        loop {
            match self.chars.next() {
                Some('\'') => break,
                Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                Some(c) => {
                    return Err(SqlError::Parse(format!("invalid blob literal char {}", c)))
                }
                None => return Err(SqlError::Parse("unterminated blob literal".into())),
            }
        }
        if hex.len() % 2 != 0 {
            return Err(SqlError::Parse("odd-length blob literal".into()));
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).expect("checked hex digits"))
            .collect();
        Ok(Token::Blob(bytes))
    }

    fn scan_param(&mut self, marker: char) -> Result<Token> {
        match marker {
            '@' => {
                let mut name = String::new();
                while let Some(c) = self.chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_')
                {
                    name.push(c.to_ascii_lowercase());
                }
                if name.is_empty() {
                    return Err(SqlError::Parse("empty parameter name".into()));
                }
                Ok(Token::Param(name))
            }
            '$' => {
                let mut digits = String::new();
                while let Some(c) = self.chars.next_if(|c| c.is_ascii_digit()) {
                    digits.push(c);
                }
                if digits.is_empty() {
                    return Err(SqlError::Parse("invalid positional parameter".into()));
                }
                Ok(Token::Param(format!("param{}", digits)))
            }
            _ => {
                // bare '?'
                self.positional += 1;
                Ok(Token::Param(format!("param{}", self.positional)))
            }
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token>;

    fn next(&mut self) -> Option<Result<Token>> {
        self.skip_whitespace();
        let c = self.chars.next()?;
        let token = match c {
            '(' => Ok(Token::LParen),
            ')' => Ok(Token::RParen),
            '[' => Ok(Token::LBracket),
            ']' => Ok(Token::RBracket),
            ',' => Ok(Token::Comma),
            ';' => Ok(Token::Semicolon),
            '.' => Ok(Token::Period),
            '*' => Ok(Token::Star),
            '+' => Ok(Token::Plus),
            '-' => Ok(Token::Minus),
            '/' => Ok(Token::Slash),
            '=' => Ok(Token::Eq),
            '!' => match self.chars.next_if(|c| *c == '=') {
                Some(_) => Ok(Token::Neq),
                None => Err(SqlError::Parse("unexpected character !".into())),
            },
            '<' => match self.chars.peek() {
                Some('=') => {
                    self.chars.next();
                    Ok(Token::Le)
                }
                Some('>') => {
                    self.chars.next();
                    Ok(Token::Neq)
                }
                _ => Ok(Token::Lt),
            },
            '>' => match self.chars.next_if(|c| *c == '=') {
                Some(_) => Ok(Token::Ge),
                None => Ok(Token::Gt),
            },
            '\'' => self.scan_string(),
            '@' | '$' | '?' => self.scan_param(c),
            'x' | 'X' if self.chars.peek() == Some(&'\'') => {
                self.chars.next();
                self.scan_blob()
            }
            c if c.is_ascii_alphabetic() || c == '_' => Ok(self.scan_ident(c)),
            c if c.is_ascii_digit() => self.scan_number(c),
            c => Err(SqlError::Parse(format!("unexpected character {}", c))),
        };
        Some(token)
    }
}
