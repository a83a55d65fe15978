use std::fmt::Write as _;

use sea_query::backend::{
    EscapeBuilder, OperLeftAssocDecider, PrecedenceDecider, QuotedBuilder, TableRefBuilder,
};
use sea_query::prepare::SqlWriter;
use sea_query::{BinOper, Oper, Quote, SimpleExpr, SubQueryStatement, Value};
use strata_sql::{DataType, Flavor};

use crate::entity::value_to_datatype;
use crate::error::{Error, Result};

/// A finished statement ready for the connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// SQL text with `?` placeholders.
    pub sql: String,

    /// One value per placeholder, in order.
    pub params: Vec<DataType>,
}

/// SQL flavor the engine writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// Backtick quoting, `LIMIT offset,count`, `SQL_CALC_FOUND_ROWS`.
    #[default]
    MySql,
    /// Double-quote quoting, `LIMIT count OFFSET offset`, window-function totals.
    Sqlite,
}

impl Dialect {
    /// Quote an identifier. Dotted names are quoted per part.
    #[must_use]
    pub fn quote(self, ident: &str) -> String {
        let q = char::from(self.quote_char());
        ident.split('.').map(|part| format!("{q}{part}{q}")).collect::<Vec<_>>().join(".")
    }

    /// Quote an alias such as `t1.name` as a single identifier.
    #[must_use]
    pub fn quote_label(self, label: &str) -> String {
        let q = char::from(self.quote_char());
        format!("{q}{label}{q}")
    }

    const fn quote_char(self) -> u8 {
        match self {
            Self::MySql => b'`',
            Self::Sqlite => b'"',
        }
    }

    /// Body of a `LIMIT` clause selecting `count` rows after `offset`.
    #[must_use]
    pub fn limit(self, offset: u64, count: u64) -> String {
        match self {
            Self::MySql => format!("{offset},{count}"),
            Self::Sqlite => format!("{count} OFFSET {offset}"),
        }
    }

    /// Insert of a single row made entirely of column defaults.
    pub(crate) fn insert_defaults(self, table: &str) -> String {
        match self {
            Self::MySql => format!("INSERT INTO {} () VALUES ()", self.quote(table)),
            Self::Sqlite => format!("INSERT INTO {} DEFAULT VALUES", self.quote(table)),
        }
    }

    pub(crate) fn builder(self) -> QueryBuilder {
        QueryBuilder {
            quote: Quote::new(self.quote_char()),
            placeholder: "?",
            numbered: false,
        }
    }
}

impl From<Flavor> for Dialect {
    fn from(flavor: Flavor) -> Self {
        match flavor {
            Flavor::MySql => Self::MySql,
            Flavor::Sqlite => Self::Sqlite,
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(Error::config(format!("unsupported dialect `{other}`"))),
        }
    }
}

/// A positional argument for a `?` placeholder in caller-supplied SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Binds one value.
    Value(Value),
    /// Expands its placeholder to `?, ?, ...`, or `NULL` when empty.
    List(Vec<Value>),
}

impl Arg {
    /// A list argument for `IN (?)` style placeholders.
    pub fn list<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<T> for Arg {
    fn from(value: T) -> Self {
        Self::Value(value.into())
    }
}

/// Build a `Vec<Arg>` from positional values.
///
/// ```ignore
/// db.get_all::<Student>("WHERE name = ? AND id IN (?)", params!["nick", Arg::list([1, 2])])
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Arg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Arg::from($arg)),+]
    };
}

/// Expand list arguments in `sql` and flatten `args` to one value per placeholder.
///
/// Placeholders inside quoted strings or identifiers are ignored.
pub(crate) fn expand_args(sql: &str, args: Vec<Arg>) -> Result<(String, Vec<Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::with_capacity(args.len());
    let mut args = args.into_iter();
    let mut quote: Option<char> = None;

    for ch in sql.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                out.push(c);
            }
            (Some(_), c) => out.push(c),
            (None, '\'' | '"' | '`') => {
                quote = Some(ch);
                out.push(ch);
            }
            (None, '?') => match args.next() {
                Some(Arg::Value(value)) => {
                    out.push('?');
                    values.push(value);
                }
                Some(Arg::List(list)) if list.is_empty() => out.push_str("NULL"),
                Some(Arg::List(list)) => {
                    out.push_str(&vec!["?"; list.len()].join(", "));
                    values.extend(list);
                }
                None => {
                    return Err(Error::invalid(format!("not enough arguments for `{sql}`")));
                }
            },
            (None, c) => out.push(c),
        }
    }

    let extra = args.count();
    if extra > 0 {
        return Err(Error::invalid(format!("{extra} argument(s) left unbound by `{sql}`")));
    }
    Ok((out, values))
}

/// Number of `?` placeholders in `sql` outside quoted strings and identifiers.
pub(crate) fn placeholder_count(sql: &str) -> usize {
    let mut quote: Option<char> = None;
    let mut count = 0;
    for ch in sql.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (None, '?') => count += 1,
            (None, _) => {}
        }
    }
    count
}

/// Assemble SQL text and its bound values into a [`Query`], logging the result.
pub(crate) fn finish(table: &str, sql: String, values: Vec<Value>) -> Result<Query> {
    let params = values.into_iter().map(value_to_datatype).collect::<Result<Vec<_>>>()?;
    tracing::debug!(table, sql = %sql, param_count = params.len(), "generated SQL");
    Ok(Query { sql, params })
}

/// Prefix `sql` with a `/*comment*/` for each non-empty comment.
pub(crate) fn with_comments(sql: String, comments: &[&str]) -> String {
    let mut out = String::new();
    for comment in comments.iter().filter(|c| !c.trim().is_empty()) {
        // a closing marker inside the comment would end it early
        let _ = write!(out, "/*{}*/", comment.replace("*/", "* /"));
    }
    out.push_str(&sql);
    out
}

pub(crate) struct QueryBuilder {
    pub quote: Quote,
    pub placeholder: &'static str, // "?" or "$"
    pub numbered: bool,            // false for "?", true for "$1, $2, ..."
}

impl QuotedBuilder for QueryBuilder {
    fn quote(&self) -> Quote {
        self.quote
    }
}

impl EscapeBuilder for QueryBuilder {}

impl TableRefBuilder for QueryBuilder {}

impl OperLeftAssocDecider for QueryBuilder {
    fn well_known_left_associative(&self, op: &BinOper) -> bool {
        // Copied from sea-query 0.32.7 backend/query_builder.rs `common_well_known_left_associative`
        matches!(
            op,
            BinOper::And | BinOper::Or | BinOper::Add | BinOper::Sub | BinOper::Mul | BinOper::Mod
        )
    }
}

impl PrecedenceDecider for QueryBuilder {
    fn inner_expr_well_known_greater_precedence(
        &self, _inner: &SimpleExpr, _outer_oper: &Oper,
    ) -> bool {
        // Conservative approach that forces parentheses
        false
    }
}

impl sea_query::backend::QueryBuilder for QueryBuilder {
    fn prepare_query_statement(&self, query: &SubQueryStatement, sql: &mut dyn SqlWriter) {
        match query {
            SubQueryStatement::SelectStatement(s) => self.prepare_select_statement(s, sql),
            SubQueryStatement::InsertStatement(s) => self.prepare_insert_statement(s, sql),
            SubQueryStatement::UpdateStatement(s) => self.prepare_update_statement(s, sql),
            SubQueryStatement::DeleteStatement(s) => self.prepare_delete_statement(s, sql),
            SubQueryStatement::WithStatement(s) => self.prepare_with_query(s, sql),
        }
    }

    fn prepare_value(&self, value: &Value, sql: &mut dyn SqlWriter) {
        sql.push_param(value.clone(), self);
    }

    fn placeholder(&self) -> (&str, bool) {
        (self.placeholder, self.numbered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_lists() {
        let (sql, values) = expand_args(
            "WHERE name = ? AND id IN (?) AND note != '?'",
            params!["nick", Arg::list([1, 2, 3])],
        )
        .unwrap();
        assert_eq!(sql, "WHERE name = ? AND id IN (?, ?, ?) AND note != '?'");
        assert_eq!(values.len(), 4);
    }

    #[test]
    fn empty_list_is_null() {
        let (sql, values) =
            expand_args("WHERE id IN (?)", vec![Arg::list(Vec::<i64>::new())]).unwrap();
        assert_eq!(sql, "WHERE id IN (NULL)");
        assert!(values.is_empty());
    }

    #[test]
    fn counts_placeholders() {
        assert_eq!(placeholder_count("a = ? AND b = '?' AND c IN (?)"), 2);
    }

    #[test]
    fn argument_count_mismatch() {
        assert!(matches!(expand_args("WHERE a = ?", params![]), Err(Error::InvalidParameter(_))));
        assert!(matches!(
            expand_args("WHERE a = 1", params![1]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn dialects() {
        assert_eq!(Dialect::MySql.quote("t1.name"), "`t1`.`name`");
        assert_eq!(Dialect::Sqlite.quote_label("t1.name"), "\"t1.name\"");
        assert_eq!(Dialect::MySql.limit(10, 5), "10,5");
        assert_eq!(Dialect::Sqlite.limit(10, 5), "5 OFFSET 10");
        assert_eq!(Dialect::Sqlite.insert_defaults("t"), "INSERT INTO \"t\" DEFAULT VALUES");
        assert_eq!("SQLite".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert!("oracle".parse::<Dialect>().is_err());
        assert_eq!(Dialect::from(Flavor::Sqlite), Dialect::Sqlite);
    }

    #[test]
    fn comments_prefix() {
        let sql = with_comments("SELECT 1".to_string(), &["global", "", "local */ x"]);
        assert_eq!(sql, "/*global*//*local * / x*/SELECT 1");
    }
}
