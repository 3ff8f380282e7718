//! Row filters typed into the browser's filter field.
//!
//! Clauses are parsed with a small grammar and compiled to a parameterized
//! `WHERE` clause:
//!
//! ```text
//! clause := conj (OR conj)*
//! conj   := pred (AND pred)*
//! pred   := column op literal | column IS [NOT] NULL
//!         | column [NOT] (LIKE | ILIKE) 'pattern' | ( clause )
//! op     := = | != | <> | < | <= | > | >=
//! ```
//!
//! Deployments that trust their users can enable raw filters: anything the
//! grammar rejects is then handed to the database verbatim.

use super::{Cell, Column, ColumnType};
use crate::error::{AppError, AppResult};

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    ILike,
    NotILike,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Like => "LIKE",
            CompareOp::NotLike => "NOT LIKE",
            CompareOp::ILike => "ILIKE",
            CompareOp::NotILike => "NOT ILIKE",
        }
    }

    fn is_pattern(&self) -> bool {
        matches!(self, CompareOp::Like | CompareOp::NotLike | CompareOp::ILike | CompareOp::NotILike)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Compare { column: String, op: CompareOp, value: Cell },
    IsNull { column: String, negated: bool },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Expr(Expr),
    /// Trusted clause passed to the database unchanged.
    Raw(String),
}

impl Filter {
    /// Parse a user clause. With `allow_raw`, clauses outside the grammar become
    /// raw filters instead of errors.
    pub fn parse(clause: &str, allow_raw: bool) -> AppResult<Filter> {
        let clause = clause.trim();
        match parse_clause(clause) {
            Ok(expr) => Ok(Filter::Expr(expr)),
            Err(_) if allow_raw && !clause.is_empty() => {
                tracing::warn!(target: "tabledesk::browser", "using raw filter clause");
                Ok(Filter::Raw(clause.to_string()))
            }
            Err(msg) => Err(AppError::validation("bad_filter".to_string(), format!("unsupported filter: {}", msg))),
        }
    }

    pub fn is_raw(&self) -> bool { matches!(self, Filter::Raw(_)) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kw { And, Or, Not, Is, Null, Like, ILike, True, False }

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Keyword(Kw),
    Str(String),
    Num(String),
    Op(CompareOp),
    LParen,
    RParen,
}

fn keyword(word: &str) -> Option<Kw> {
    match word.to_ascii_uppercase().as_str() {
        "AND" => Some(Kw::And),
        "OR" => Some(Kw::Or),
        "NOT" => Some(Kw::Not),
        "IS" => Some(Kw::Is),
        "NULL" => Some(Kw::Null),
        "LIKE" => Some(Kw::Like),
        "ILIKE" => Some(Kw::ILike),
        "TRUE" => Some(Kw::True),
        "FALSE" => Some(Kw::False),
        _ => None,
    }
}

/// Read a `quote`-delimited run where a doubled quote stands for itself.
fn read_quoted(chars: &[char], start: usize, quote: char) -> Result<(String, usize), String> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if i + 1 < chars.len() && chars[i + 1] == quote {
                out.push(quote);
                i += 2;
                continue;
            }
            return Ok((out, i + 1));
        }
        out.push(chars[i]);
        i += 1;
    }
    Err(format!("unterminated {} literal", if quote == '\'' { "string" } else { "identifier" }))
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() { i += 1; continue; }
        match c {
            '(' => { out.push(Token::LParen); i += 1; }
            ')' => { out.push(Token::RParen); i += 1; }
            '\'' => {
                let (s, next) = read_quoted(&chars, i, '\'')?;
                out.push(Token::Str(s));
                i = next;
            }
            '"' => {
                let (s, next) = read_quoted(&chars, i, '"')?;
                if s.is_empty() { return Err("empty quoted identifier".into()); }
                out.push(Token::Ident(s));
                i = next;
            }
            '=' => { out.push(Token::Op(CompareOp::Eq)); i += 1; }
            '!' if chars.get(i + 1) == Some(&'=') => { out.push(Token::Op(CompareOp::Ne)); i += 2; }
            '<' => match chars.get(i + 1) {
                Some('=') => { out.push(Token::Op(CompareOp::Le)); i += 2; }
                Some('>') => { out.push(Token::Op(CompareOp::Ne)); i += 2; }
                _ => { out.push(Token::Op(CompareOp::Lt)); i += 1; }
            },
            '>' => match chars.get(i + 1) {
                Some('=') => { out.push(Token::Op(CompareOp::Ge)); i += 2; }
                _ => { out.push(Token::Op(CompareOp::Gt)); i += 1; }
            },
            c if c.is_ascii_digit()
                || ((c == '-' || c == '.') && chars.get(i + 1).map(|n| n.is_ascii_digit() || *n == '.').unwrap_or(false)) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() {
                    let d = chars[i];
                    let exp_sign = (d == '+' || d == '-') && matches!(chars[i - 1], 'e' | 'E');
                    if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign { i += 1; } else { break; }
                }
                out.push(Token::Num(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') { i += 1; }
                let word: String = chars[start..i].iter().collect();
                match keyword(&word) {
                    Some(k) => out.push(Token::Keyword(k)),
                    // unquoted identifiers fold to lower case, as in PostgreSQL
                    None => out.push(Token::Ident(word.to_lowercase())),
                }
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> { self.tokens.get(self.pos) }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() { self.pos += 1; }
        t
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if self.peek() == Some(&Token::Keyword(kw)) { self.pos += 1; true } else { false }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut parts = vec![self.parse_and()?];
        while self.eat_kw(Kw::Or) { parts.push(self.parse_and()?); }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::Or(parts) })
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut parts = vec![self.parse_pred()?];
        while self.eat_kw(Kw::And) { parts.push(self.parse_pred()?); }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::And(parts) })
    }

    fn parse_pred(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::LParen) => {
                self.depth += 1;
                if self.depth > MAX_DEPTH { return Err("filter nested too deeply".into()); }
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing ')'".into()),
                }
            }
            Some(Token::Ident(column)) => self.parse_after_column(column),
            Some(other) => Err(format!("expected a column name, found {:?}", other)),
            None => Err("expected a column name".into()),
        }
    }

    fn parse_after_column(&mut self, column: String) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Keyword(Kw::Is)) => {
                let negated = self.eat_kw(Kw::Not);
                if !self.eat_kw(Kw::Null) { return Err("expected NULL after IS".into()); }
                Ok(Expr::IsNull { column, negated })
            }
            Some(Token::Op(op)) => Ok(Expr::Compare { column, op, value: self.parse_literal()? }),
            Some(Token::Keyword(Kw::Like)) => self.parse_pattern(column, CompareOp::Like),
            Some(Token::Keyword(Kw::ILike)) => self.parse_pattern(column, CompareOp::ILike),
            Some(Token::Keyword(Kw::Not)) => match self.next() {
                Some(Token::Keyword(Kw::Like)) => self.parse_pattern(column, CompareOp::NotLike),
                Some(Token::Keyword(Kw::ILike)) => self.parse_pattern(column, CompareOp::NotILike),
                _ => Err("expected LIKE or ILIKE after NOT".into()),
            },
            _ => Err(format!("expected an operator after '{}'", column)),
        }
    }

    fn parse_pattern(&mut self, column: String, op: CompareOp) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Compare { column, op, value: Cell::Text(s) }),
            _ => Err(format!("{} needs a quoted pattern", op.sql())),
        }
    }

    fn parse_literal(&mut self) -> Result<Cell, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Cell::Text(s)),
            Some(Token::Num(n)) => {
                if let Ok(i) = n.parse::<i64>() { return Ok(Cell::Int(i)); }
                n.parse::<f64>().map(Cell::Float).map_err(|_| format!("bad number '{}'", n))
            }
            Some(Token::Keyword(Kw::True)) => Ok(Cell::Bool(true)),
            Some(Token::Keyword(Kw::False)) => Ok(Cell::Bool(false)),
            Some(Token::Keyword(Kw::Null)) => Err("compare with NULL using IS NULL".into()),
            _ => Err("expected a literal value".into()),
        }
    }
}

pub fn parse_clause(clause: &str) -> Result<Expr, String> {
    let tokens = lex(clause)?;
    if tokens.is_empty() { return Err("empty filter".into()); }
    let mut p = Parser { tokens, pos: 0, depth: 0 };
    let expr = p.parse_or()?;
    if let Some(t) = p.peek() {
        return Err(format!("unexpected {:?}", t));
    }
    Ok(expr)
}

fn find_column<'a>(columns: &'a [Column], name: &str) -> AppResult<(usize, &'a Column)> {
    columns
        .iter()
        .enumerate()
        .find(|(_, c)| c.name == name)
        .ok_or_else(|| AppError::validation("unknown_column".to_string(), format!("unknown column '{}'", name)))
}

fn bind_value(col: &Column, op: CompareOp, value: &Cell) -> AppResult<Cell> {
    let mismatch = || AppError::validation(
        "filter_type".to_string(),
        format!("{:?} cannot be compared with {} column '{}'", value, col.kind.as_str(), col.name),
    );
    if op.is_pattern() {
        return match (col.kind, value) {
            (ColumnType::Text, Cell::Text(_)) => Ok(value.clone()),
            _ => Err(AppError::validation("filter_type".to_string(), format!("{} needs a text column, '{}' is {}", op.sql(), col.name, col.kind.as_str()))),
        };
    }
    match (value, col.kind) {
        (Cell::Text(s), ColumnType::Text) => Ok(Cell::Text(s.clone())),
        (Cell::Text(s), kind) if !s.is_empty() => Cell::parse_as(s, kind).map_err(|_| mismatch()),
        (Cell::Int(i), ColumnType::Integer) => Ok(Cell::Int(*i)),
        (Cell::Int(i), ColumnType::Float) => Ok(Cell::Float(*i as f64)),
        (Cell::Float(f), ColumnType::Float) | (Cell::Float(f), ColumnType::Integer) => Ok(Cell::Float(*f)),
        (Cell::Bool(b), ColumnType::Boolean) => Ok(Cell::Bool(*b)),
        _ => Err(mismatch()),
    }
}

/// Translate a LIKE pattern (`%`, `_`, backslash escape) and match it.
pub fn like_match(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    enum Pat { Any, One, Lit(char) }
    let (text, pattern) = if case_insensitive {
        (text.to_lowercase(), pattern.to_lowercase())
    } else {
        (text.to_string(), pattern.to_string())
    };
    let mut pats = Vec::new();
    let mut it = pattern.chars();
    while let Some(c) = it.next() {
        match c {
            '%' => pats.push(Pat::Any),
            '_' => pats.push(Pat::One),
            '\\' => pats.push(Pat::Lit(it.next().unwrap_or('\\'))),
            c => pats.push(Pat::Lit(c)),
        }
    }
    let t: Vec<char> = text.chars().collect();
    let mut reach = vec![false; t.len() + 1];
    reach[0] = true;
    for p in &pats {
        let mut next = vec![false; t.len() + 1];
        match p {
            Pat::Any => {
                let mut seen = false;
                for i in 0..=t.len() {
                    seen |= reach[i];
                    next[i] = seen;
                }
            }
            Pat::One => for i in 1..=t.len() { next[i] = reach[i - 1]; },
            Pat::Lit(c) => for i in 1..=t.len() { next[i] = reach[i - 1] && t[i - 1] == *c; },
        }
        reach = next;
    }
    reach[t.len()]
}

impl Expr {
    /// Resolve column names and coerce literals to the column types.
    pub fn bind(&self, columns: &[Column]) -> AppResult<Expr> {
        match self {
            Expr::Compare { column, op, value } => {
                let (_, col) = find_column(columns, column)?;
                Ok(Expr::Compare { column: col.name.clone(), op: *op, value: bind_value(col, *op, value)? })
            }
            Expr::IsNull { column, negated } => {
                let (_, col) = find_column(columns, column)?;
                Ok(Expr::IsNull { column: col.name.clone(), negated: *negated })
            }
            Expr::And(parts) => Ok(Expr::And(parts.iter().map(|p| p.bind(columns)).collect::<AppResult<Vec<_>>>()?)),
            Expr::Or(parts) => Ok(Expr::Or(parts.iter().map(|p| p.bind(columns)).collect::<AppResult<Vec<_>>>()?)),
        }
    }

    /// Render as SQL with `$n` placeholders; `column_sql` yields the expression
    /// for a column name.
    pub fn write_sql(&self, out: &mut String, params: &mut Vec<Cell>, column_sql: &dyn Fn(&str) -> String) {
        match self {
            Expr::Compare { column, op, value } => {
                params.push(value.clone());
                out.push_str(&format!("{} {} ${}", column_sql(column), op.sql(), params.len()));
            }
            Expr::IsNull { column, negated } => {
                out.push_str(&column_sql(column));
                out.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::And(parts) | Expr::Or(parts) => {
                let sep = if matches!(self, Expr::And(_)) { " AND " } else { " OR " };
                out.push('(');
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 { out.push_str(sep); }
                    p.write_sql(out, params, column_sql);
                }
                out.push(')');
            }
        }
    }

    /// Evaluate a bound expression against one row. Unknown (null) comparisons
    /// do not match.
    pub fn matches(&self, columns: &[Column], row: &[Cell]) -> bool {
        let cell = |name: &str| columns.iter().position(|c| c.name == name).and_then(|i| row.get(i));
        match self {
            Expr::Compare { column, op, value } => {
                let Some(c) = cell(column) else { return false; };
                match op {
                    CompareOp::Like | CompareOp::NotLike | CompareOp::ILike | CompareOp::NotILike => {
                        let (Cell::Text(s), Cell::Text(p)) = (c, value) else { return false; };
                        let ci = matches!(op, CompareOp::ILike | CompareOp::NotILike);
                        let hit = like_match(s, p, ci);
                        if matches!(op, CompareOp::Like | CompareOp::ILike) { hit } else { !hit }
                    }
                    _ => match c.compare(value) {
                        None => false,
                        Some(ord) => match op {
                            CompareOp::Eq => ord.is_eq(),
                            CompareOp::Ne => ord.is_ne(),
                            CompareOp::Lt => ord.is_lt(),
                            CompareOp::Le => ord.is_le(),
                            CompareOp::Gt => ord.is_gt(),
                            _ => ord.is_ge(),
                        },
                    },
                }
            }
            Expr::IsNull { column, negated } => match cell(column) {
                Some(c) => c.is_null() != *negated,
                None => false,
            },
            Expr::And(parts) => parts.iter().all(|p| p.matches(columns, row)),
            Expr::Or(parts) => parts.iter().any(|p| p.matches(columns, row)),
        }
    }
}
