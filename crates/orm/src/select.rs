use std::marker::PhantomData;

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::fragment::PostSql;
use crate::meta::{ColumnSpec, EntityMeta, JoinKind, LEFT_ALIAS, RIGHT_ALIAS, meta};
use crate::options::{Feature, Features};
use crate::query::{Arg, Dialect, Query, expand_args, finish};
use crate::scope;

/// Label of the window-function column carrying the unpaged total (`SQLite`).
pub(crate) const TOTAL_LABEL: &str = "__strata_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Projection {
    Columns,
    Keys,
    Count,
    Probe,
}

#[derive(Debug, Clone, Copy)]
enum Window {
    Page { offset: u64, count: u64 },
    Limit(u64),
}

/// Builder for constructing SELECT queries from a post-SQL fragment.
pub struct SelectBuilder<T: Entity> {
    post_sql: String,
    args: Vec<Arg>,
    projection: Projection,
    window: Option<Window>,
    with_total: bool,
    _marker: PhantomData<T>,
}

impl<T: Entity> Default for SelectBuilder<T> {
    fn default() -> Self {
        Self {
            post_sql: String::new(),
            args: Vec::new(),
            projection: Projection::Columns,
            window: None,
            with_total: false,
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> Clone for SelectBuilder<T> {
    fn clone(&self) -> Self {
        Self {
            post_sql: self.post_sql.clone(),
            args: self.args.clone(),
            projection: self.projection,
            window: self.window,
            with_total: self.with_total,
            _marker: PhantomData,
        }
    }
}

impl<T: Entity> SelectBuilder<T> {
    /// Creates a new SELECT query builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caller fragment (`WHERE ... GROUP BY ... ORDER BY ... LIMIT ...`) and its arguments.
    #[must_use]
    pub fn post_sql(mut self, sql: impl Into<String>, args: Vec<Arg>) -> Self {
        self.post_sql = sql.into();
        self.args = args;
        self
    }

    /// Select key columns only.
    #[must_use]
    pub const fn key_only(mut self) -> Self {
        self.projection = Projection::Keys;
        self
    }

    /// Select `COUNT(*)` of the matching rows (or groups).
    #[must_use]
    pub const fn count(mut self) -> Self {
        self.projection = Projection::Count;
        self
    }

    /// Select a constant per matching row, for existence checks.
    #[must_use]
    pub const fn probe(mut self) -> Self {
        self.projection = Projection::Probe;
        self
    }

    /// Return `count` rows after `offset`, replacing any caller LIMIT and
    /// ordering by key when the fragment gives no order.
    #[must_use]
    pub const fn page(mut self, offset: u64, count: u64) -> Self {
        self.window = Some(Window::Page { offset, count });
        self
    }

    /// Return at most `count` rows, replacing any caller LIMIT.
    #[must_use]
    pub const fn limit(mut self, count: u64) -> Self {
        self.window = Some(Window::Limit(count));
        self
    }

    /// Also compute the unpaged row count in the same statement.
    #[must_use]
    pub const fn with_total(mut self) -> Self {
        self.with_total = true;
        self
    }

    /// Build the SELECT query.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment or its arguments are malformed, or
    /// when a key-only select is asked of an entity without key columns.
    pub fn build(self, dialect: Dialect, features: &Features) -> Result<Query> {
        let meta = meta::<T>();
        let (post_sql, values) = expand_args(&self.post_sql, self.args)?;
        let mut post = PostSql::parse(&post_sql)?;

        let (mut columns, from) = match &meta.join {
            Some(_) => join_source(meta, dialect, features, self.projection, &mut post)?,
            None => table_source(meta, dialect, features, self.projection, &mut post)?,
        };

        match self.window {
            Some(Window::Page { offset, count }) => {
                let keys = order_keys(meta, dialect)?;
                post.paginate(
                    dialect.limit(offset, count),
                    &keys,
                    features.is_on(Feature::AutoOrderForPagination),
                );
            }
            Some(Window::Limit(count)) => {
                post.limit = Some(dialect.limit(0, count));
            }
            None => {}
        }

        let mut modifier = "";
        if self.with_total {
            match dialect {
                Dialect::MySql => modifier = "SQL_CALC_FOUND_ROWS ",
                Dialect::Sqlite => {
                    columns.push(format!("COUNT(*) OVER () AS {}", dialect.quote_label(TOTAL_LABEL)));
                }
            }
        }

        let sql = if self.projection == Projection::Count {
            count_sql(&from, &mut post)
        } else {
            format!("SELECT {modifier}{} FROM {from} {post}", columns.join(", "))
        };

        let table = if meta.join.is_some() { meta.name.to_string() } else { scope::table_name(meta) };
        finish(&table, sql.trim_end().to_string(), values)
    }
}

/// `column = normal` for `meta`'s soft-delete column, when soft delete applies.
pub(crate) fn live_predicate(meta: &EntityMeta, dialect: Dialect, alias: Option<&str>) -> Option<String> {
    let column = meta.soft_delete_column().filter(|_| scope::soft_delete_enabled(meta))?;
    let (normal, _) = column.soft_delete?;
    Some(format!("{} = {normal}", qualified(dialect, alias, column.name)))
}

fn qualified(dialect: Dialect, alias: Option<&str>, column: &str) -> String {
    match alias {
        Some(alias) => format!("{alias}.{}", dialect.quote(column)),
        None => dialect.quote(column),
    }
}

fn table_source(
    meta: &EntityMeta, dialect: Dialect, features: &Features, projection: Projection,
    post: &mut PostSql,
) -> Result<(Vec<String>, String)> {
    let columns = match projection {
        Projection::Keys => {
            meta.key_columns()?.into_iter().map(|c| dialect.quote(c.name)).collect()
        }
        Projection::Columns => {
            meta.columns.iter().map(|c| column_expr(c, dialect, features, None)).collect()
        }
        Projection::Count | Projection::Probe => vec!["1".to_string()],
    };

    if let Some(predicate) = live_predicate(meta, dialect, None) {
        post.and_where(&predicate);
    }

    Ok((columns, dialect.quote(&scope::table_name(meta))))
}

fn join_source(
    meta: &EntityMeta, dialect: Dialect, features: &Features, projection: Projection,
    post: &mut PostSql,
) -> Result<(Vec<String>, String)> {
    let (join, left, right) = meta.join_sides()?;

    let columns = match projection {
        Projection::Keys => {
            return Err(Error::config(format!("`{}` is a join projection without keys", meta.name)));
        }
        Projection::Columns => [(left, LEFT_ALIAS), (right, RIGHT_ALIAS)]
            .into_iter()
            .flat_map(|(side, alias)| {
                side.columns.iter().map(move |c| column_expr(c, dialect, features, Some(alias)))
            })
            .collect(),
        Projection::Count | Projection::Probe => vec!["1".to_string()],
    };

    // the outer side's predicate joins the ON condition so unmatched rows survive
    let left_live = live_predicate(left, dialect, Some(LEFT_ALIAS));
    let right_live = live_predicate(right, dialect, Some(RIGHT_ALIAS));
    let (where_live, on_live) = match join.kind {
        JoinKind::Join | JoinKind::Straight => (vec![left_live, right_live], None),
        JoinKind::Left => (vec![left_live], right_live),
        JoinKind::Right => (vec![right_live], left_live),
    };

    let where_live: Vec<String> = where_live.into_iter().flatten().collect();
    if !where_live.is_empty() {
        post.and_where(&where_live.join(" AND "));
    }

    let on = match on_live {
        Some(predicate) => format!("({}) AND {predicate}", join.on),
        None => join.on.to_string(),
    };
    let from = format!(
        "{} {LEFT_ALIAS} {} {} {RIGHT_ALIAS} ON {on}",
        dialect.quote(&scope::table_name(left)),
        join.kind.keyword(),
        dialect.quote(&scope::table_name(right)),
    );

    Ok((columns, from))
}

fn column_expr(
    column: &ColumnSpec, dialect: Dialect, features: &Features, alias: Option<&str>,
) -> String {
    let label = alias.map_or_else(
        || dialect.quote(column.name),
        |alias| dialect.quote_label(&format!("{alias}.{}", column.name)),
    );

    match column.computed {
        Some(expr) => {
            let is_sum = expr.trim_start().get(..4).is_some_and(|head| head.eq_ignore_ascii_case("SUM("));
            if is_sum && features.is_on(Feature::SumNullToZero) {
                format!("COALESCE({expr},0) AS {label}")
            } else {
                format!("{expr} AS {label}")
            }
        }
        None if alias.is_some() => format!("{} AS {label}", qualified(dialect, alias, column.name)),
        None => label,
    }
}

// Key columns used for deterministic page order.
fn order_keys(meta: &EntityMeta, dialect: Dialect) -> Result<Vec<String>> {
    let (keys, alias) = match &meta.join {
        Some(_) => {
            let (_, left, _) = meta.join_sides()?;
            (left.columns.iter().filter(|c| c.key).collect::<Vec<_>>(), Some(LEFT_ALIAS))
        }
        None => (meta.columns.iter().filter(|c| c.key).collect(), None),
    };
    Ok(keys.into_iter().map(|c| qualified(dialect, alias, c.name)).collect())
}

fn count_sql(from: &str, post: &mut PostSql) -> String {
    post.order_by = None;
    post.limit = None;
    if post.group_by.is_some() {
        format!("SELECT COUNT(*) FROM (SELECT 1 FROM {from} {post}) __strata_count")
    } else {
        format!("SELECT COUNT(*) FROM {from} {post}")
    }
}
