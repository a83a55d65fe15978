use sea_query::{Alias, CaseStatement, Condition, Expr, Value};

use crate::diff::changed_columns;
use crate::entity::{Entity, value_to_datatype};
use crate::error::{Error, Result};
use crate::fragment::PostSql;
use crate::meta::{ColumnSpec, EntityMeta, meta};
use crate::query::{Arg, Dialect, Query, expand_args, finish, placeholder_count};
use crate::scope;
use crate::select::live_predicate;

/// Builder for constructing an UPDATE of one entity, matched by key.
///
/// Null fields are left out of the SET list unless [`UpdateBuilder::with_null`]
/// is used. A CAS column is advanced by one and compared with its current value.
pub struct UpdateBuilder<'a, T: Entity> {
    entity: &'a T,
    with_null: bool,
    post_sql: Option<(String, Vec<Arg>)>,
}

impl<'a, T: Entity> UpdateBuilder<'a, T> {
    /// Creates a new UPDATE query builder for `entity`.
    #[must_use]
    pub const fn new(entity: &'a T) -> Self {
        Self {
            entity,
            with_null: false,
            post_sql: None,
        }
    }

    /// Also write null fields, setting their columns to NULL.
    #[must_use]
    pub const fn with_null(mut self) -> Self {
        self.with_null = true;
        self
    }

    /// An extra condition ANDed with the key match.
    #[must_use]
    pub fn post_sql(mut self, sql: impl Into<String>, args: Vec<Arg>) -> Self {
        self.post_sql = Some((sql.into(), args));
        self
    }

    /// Build the UPDATE query, or `None` when there is no column to set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullKeyValue`] for a null key, [`Error::CasVersionMismatch`]
    /// for a null CAS value, and [`Error::Configuration`] for bad key or CAS metadata.
    pub fn build(self, dialect: Dialect) -> Result<Option<Query>> {
        let meta = meta::<T>();
        let table = scope::table_name(meta);
        let (mut guards, guard_values) = row_guards(meta, self.entity, dialect)?;

        let mut statement = sea_query::Query::update();
        statement.table(Alias::new(&table));

        let mut assigned = 0;
        for column in meta.columns.iter().filter(|c| c.writes_on_update()) {
            match self.entity.column_value(column.name)? {
                Some(value) => statement.value(Alias::new(column.name), value),
                None if self.with_null => statement.value(Alias::new(column.name), Expr::cust("NULL")),
                None => continue,
            };
            assigned += 1;
        }
        if assigned == 0 {
            tracing::debug!(table, "no column to update");
            return Ok(None);
        }
        if let Some(cas) = meta.cas_column()? {
            statement.value(Alias::new(cas.name), increment(cas, dialect));
        }

        let (set_sql, values) = statement.build(dialect.builder());
        let mut values = values.0;

        let mut post = match self.post_sql {
            Some((sql, args)) => {
                let (sql, extra) = expand_args(&sql, args)?;
                values.extend(extra);
                PostSql::parse(&sql)?
            }
            None => PostSql::default(),
        };
        guards.extend(live_predicate(meta, dialect, None));
        post.and_where(&guards.join(" AND "));
        values.extend(guard_values);

        finish(&table, format!("{set_sql} {post}"), values).map(Some)
    }
}

/// Builder for an UPDATE with a caller-written SET clause, matched by key.
pub struct CustomUpdateBuilder<'a, T: Entity> {
    entity: &'a T,
    set_sql: String,
    args: Vec<Arg>,
}

impl<'a, T: Entity> CustomUpdateBuilder<'a, T> {
    /// `set_sql` may start with the `SET` keyword.
    #[must_use]
    pub fn new(entity: &'a T, set_sql: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            entity,
            set_sql: set_sql.into(),
            args,
        }
    }

    /// Build the UPDATE query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a blank SET clause and the key
    /// and CAS errors of [`UpdateBuilder::build`].
    pub fn build(self, dialect: Dialect) -> Result<Query> {
        let meta = meta::<T>();
        let table = scope::table_name(meta);
        let (mut guards, guard_values) = row_guards(meta, self.entity, dialect)?;

        let (assignments, mut values) = set_clause(meta, &self.set_sql, self.args, dialect)?;
        guards.extend(live_predicate(meta, dialect, None));
        values.extend(guard_values);

        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {}",
            dialect.quote(&table),
            guards.join(" AND ")
        );
        finish(&table, sql, values)
    }
}

/// Builder for an UPDATE with caller-written SET and WHERE clauses.
pub struct UpdateAllBuilder<T: Entity> {
    set_sql: String,
    post_sql: String,
    args: Vec<Arg>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Entity> UpdateAllBuilder<T> {
    /// `args` bind the placeholders of `set_sql` followed by those of `post_sql`.
    #[must_use]
    pub fn new(set_sql: impl Into<String>, post_sql: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            set_sql: set_sql.into(),
            post_sql: post_sql.into(),
            args,
            _marker: std::marker::PhantomData,
        }
    }

    /// Build the UPDATE query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a blank SET clause or when the
    /// argument count does not match the placeholders.
    pub fn build(self, dialect: Dialect) -> Result<Query> {
        let meta = meta::<T>();
        let table = scope::table_name(meta);

        let mut args = self.args;
        let post_args = args.split_off(placeholder_count(&self.set_sql).min(args.len()));
        let (assignments, mut values) = set_clause(meta, &self.set_sql, args, dialect)?;
        let (post_sql, post_values) = expand_args(&self.post_sql, post_args)?;
        values.extend(post_values);

        let mut post = PostSql::parse(&post_sql)?;
        if let Some(live) = live_predicate(meta, dialect, None) {
            post.and_where(&live);
        }

        let sql = format!("UPDATE {} SET {assignments} {post}", dialect.quote(&table));
        finish(&table, sql.trim_end().to_string(), values)
    }
}

/// Builder for a single UPDATE writing many entities through `CASE` arms.
pub struct BatchUpdateBuilder<'a, T: Entity> {
    rows: &'a [T],
}

impl<'a, T: Entity> BatchUpdateBuilder<'a, T> {
    /// Creates a batch UPDATE for `rows`.
    #[must_use]
    pub const fn new(rows: &'a [T]) -> Self {
        Self { rows }
    }

    /// Build the UPDATE, or `None` when every row carries keys only.
    ///
    /// Each written column becomes `CASE WHEN <row key> THEN <value> ... ELSE
    /// <column> END`, with arms only for rows holding a value. The statement
    /// matches rows by key and, when declared, by their current CAS value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullKeyValue`] for a null key and
    /// [`Error::CasVersionMismatch`] for a null CAS value, before any SQL is built.
    pub fn build(self, dialect: Dialect) -> Result<Option<Query>> {
        let meta = meta::<T>();
        let table = scope::table_name(meta);
        let keys = meta.key_columns()?;
        let cas = meta.cas_column()?;

        let mut key_match = Vec::with_capacity(self.rows.len());
        let mut row_match = Vec::with_capacity(self.rows.len());
        let mut next_versions = Vec::new();
        for row in self.rows {
            let mut condition = Condition::all();
            for key in &keys {
                let value = row.column_value(key.name)?.ok_or(Error::NullKeyValue {
                    entity: meta.name,
                    column: key.name,
                })?;
                condition = condition.add(Expr::col(Alias::new(key.name)).eq(value));
            }
            key_match.push(condition.clone());

            if let Some(cas) = cas {
                let current = row.column_value(cas.name)?.ok_or(Error::CasVersionMismatch { affected: 0 })?;
                next_versions.push(next_version(cas, current.clone())?);
                condition = condition.add(Expr::col(Alias::new(cas.name)).eq(current));
            }
            row_match.push(condition);
        }

        let columns = changed_columns(meta, self.rows)?;
        if columns.is_empty() {
            tracing::debug!(table, rows = self.rows.len(), "batch carries keys only");
            return Ok(None);
        }

        let mut statement = sea_query::Query::update();
        statement.table(Alias::new(&table));

        for column in columns {
            let mut case = CaseStatement::new();
            for (row, condition) in self.rows.iter().zip(&key_match) {
                if let Some(value) = row.column_value(column.name)? {
                    case = case.case(condition.clone(), Expr::val(value));
                }
            }
            statement.value(Alias::new(column.name), case.finally(Expr::col(Alias::new(column.name))));
        }

        if let Some(cas) = cas {
            let mut case = CaseStatement::new();
            for (condition, next) in key_match.iter().zip(next_versions) {
                case = case.case(condition.clone(), Expr::val(next));
            }
            statement.value(Alias::new(cas.name), case.finally(Expr::col(Alias::new(cas.name))));
        }

        let any_row = row_match.into_iter().fold(Condition::any(), Condition::add);
        let mut filter = Condition::all().add(any_row);
        if let Some(live) = live_predicate(meta, dialect, None) {
            filter = filter.add(Expr::cust(live));
        }
        statement.cond_where(filter);

        let (sql, values) = statement.build(dialect.builder());
        finish(&table, sql, values.0).map(Some)
    }
}

/// Write `old + 1` into `entity`'s CAS column after a successful update.
pub(crate) fn advance_cas_version<T: Entity>(meta: &EntityMeta, entity: &mut T) -> Result<()> {
    let Some(cas) = meta.cas_column()? else {
        return Ok(());
    };
    if let Some(current) = entity.column_value(cas.name)? {
        let next = next_version(cas, current)?;
        entity.set_column(cas.name, &strata_sql::DataType::Int64(Some(next)))?;
    }
    Ok(())
}

// `key = ? AND ... [AND cas = ?]` for one entity, with the bound values.
fn row_guards<T: Entity>(
    meta: &EntityMeta, entity: &T, dialect: Dialect,
) -> Result<(Vec<String>, Vec<Value>)> {
    let mut guards = Vec::new();
    let mut values = Vec::new();

    for key in meta.key_columns()? {
        let value = entity.column_value(key.name)?.ok_or(Error::NullKeyValue {
            entity: meta.name,
            column: key.name,
        })?;
        guards.push(format!("{} = ?", dialect.quote(key.name)));
        values.push(value);
    }

    if let Some(cas) = meta.cas_column()? {
        let value = entity.column_value(cas.name)?.ok_or(Error::CasVersionMismatch { affected: 0 })?;
        guards.push(format!("{} = ?", dialect.quote(cas.name)));
        values.push(value);
    }

    Ok((guards, values))
}

// Caller assignments plus the CAS increment.
fn set_clause(
    meta: &EntityMeta, set_sql: &str, args: Vec<Arg>, dialect: Dialect,
) -> Result<(String, Vec<Value>)> {
    let set_sql = strip_set(set_sql);
    if set_sql.is_empty() {
        return Err(Error::invalid(format!("blank SET clause for `{}`", meta.name)));
    }
    let (mut assignments, values) = expand_args(set_sql, args)?;
    if let Some(cas) = meta.cas_column()? {
        assignments = format!("{assignments}, {} = {}", dialect.quote(cas.name), increment_sql(cas, dialect));
    }
    Ok((assignments, values))
}

fn strip_set(sql: &str) -> &str {
    let sql = sql.trim();
    match sql.get(..4) {
        Some(head) if head.eq_ignore_ascii_case("SET ") => sql[4..].trim_start(),
        _ => sql,
    }
}

fn increment(cas: &ColumnSpec, dialect: Dialect) -> sea_query::SimpleExpr {
    Expr::cust(increment_sql(cas, dialect))
}

fn increment_sql(cas: &ColumnSpec, dialect: Dialect) -> String {
    format!("{} + 1", dialect.quote(cas.name))
}

fn next_version(cas: &ColumnSpec, current: Value) -> Result<i64> {
    value_to_datatype(current)?
        .as_i64()
        .and_then(|v| v.checked_add(1))
        .ok_or_else(|| Error::config(format!("CAS column `{}` is not an integer", cas.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Entity, params};

    #[derive(Debug, Default, Entity)]
    #[table(name = "t_student")]
    struct Student {
        #[column(key)]
        id: Option<i64>,
        name: Option<String>,
        age: Option<i32>,
        #[column(cas_version)]
        version: Option<i32>,
        #[column(soft_delete)]
        deleted: Option<bool>,
    }

    #[derive(Debug, Default, Entity)]
    #[table(name = "t_plain")]
    struct Plain {
        #[column(key)]
        id: Option<i64>,
        name: Option<String>,
    }

    fn student(id: i64, name: Option<&str>, version: Option<i32>) -> Student {
        Student {
            id: Some(id),
            name: name.map(ToString::to_string),
            version,
            ..Student::default()
        }
    }

    #[test]
    fn skips_nulls_and_guards_cas() {
        let query = UpdateBuilder::new(&student(1, Some("nick"), Some(3))).build(Dialect::MySql).unwrap().unwrap();
        assert_eq!(
            query.sql,
            "UPDATE `t_student` SET `name` = ?, `version` = `version` + 1 \
             WHERE `id` = ? AND `version` = ? AND `deleted` = 0"
        );
        assert_eq!(query.params.len(), 3);
    }

    #[test]
    fn with_null_writes_every_column() {
        let query = UpdateBuilder::new(&student(1, Some("nick"), Some(3)))
            .with_null()
            .build(Dialect::MySql)
            .unwrap()
            .unwrap();
        assert!(query.sql.contains("`age` = NULL"));
    }

    #[test]
    fn nothing_to_set() {
        assert!(UpdateBuilder::new(&student(1, None, Some(3))).build(Dialect::MySql).unwrap().is_none());
    }

    #[test]
    fn null_cas_fails_fast() {
        let result = UpdateBuilder::new(&student(1, Some("nick"), None)).build(Dialect::MySql);
        assert!(matches!(result, Err(Error::CasVersionMismatch { affected: 0 })));

        let plain = Plain::default();
        assert!(matches!(UpdateBuilder::new(&plain).build(Dialect::MySql), Err(Error::NullKeyValue { .. })));
    }

    #[test]
    fn extra_condition_is_wrapped() {
        let query = UpdateBuilder::new(&Plain {
            id: Some(1),
            name: Some("a".to_string()),
        })
        .post_sql("WHERE name = ? OR name IS NULL", params!["b"])
        .build(Dialect::Sqlite)
        .unwrap()
        .unwrap();
        assert_eq!(
            query.sql,
            "UPDATE \"t_plain\" SET \"name\" = ? WHERE (name = ? OR name IS NULL) AND \"id\" = ?"
        );
        assert_eq!(query.params.len(), 3);
    }

    #[test]
    fn custom_and_update_all() {
        let query = CustomUpdateBuilder::new(&student(1, None, Some(2)), "SET age = age + ?", params![1])
            .build(Dialect::MySql)
            .unwrap();
        assert_eq!(
            query.sql,
            "UPDATE `t_student` SET age = age + ?, `version` = `version` + 1 \
             WHERE `id` = ? AND `version` = ? AND `deleted` = 0"
        );

        let query = UpdateAllBuilder::<Plain>::new("name = ?", "WHERE id > ?", params!["x", 5])
            .build(Dialect::MySql)
            .unwrap();
        assert_eq!(query.sql, "UPDATE `t_plain` SET name = ? WHERE id > ?");
        assert_eq!(query.params.len(), 2);

        assert!(matches!(
            UpdateAllBuilder::<Plain>::new(" ", "", params![]).build(Dialect::MySql),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn batch_uses_case_arms() {
        let rows = vec![student(1, Some("a"), Some(1)), student(2, None, Some(5))];
        let query = BatchUpdateBuilder::new(&rows).build(Dialect::MySql).unwrap().unwrap();
        assert!(query.sql.starts_with("UPDATE `t_student` SET `name` = (CASE WHEN"));
        assert!(query.sql.contains("ELSE `name` END)"));
        assert!(query.sql.contains("ELSE `version` END)"));
        assert!(!query.sql.contains("`age`"));
        assert!(query.sql.contains("`deleted` = 0"));

        let keys_only = vec![student(1, None, Some(1))];
        assert!(BatchUpdateBuilder::new(&keys_only).build(Dialect::MySql).unwrap().is_none());

        let null_cas = vec![student(1, Some("a"), Some(1)), student(2, Some("b"), None)];
        assert!(matches!(
            BatchUpdateBuilder::new(&null_cas).build(Dialect::MySql),
            Err(Error::CasVersionMismatch { affected: 0 })
        ));
    }

    #[test]
    fn cas_advances_in_memory() {
        let mut row = student(1, None, Some(4));
        advance_cas_version(meta::<Student>(), &mut row).unwrap();
        assert_eq!(row.version, Some(5));
    }
}
