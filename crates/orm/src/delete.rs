use std::marker::PhantomData;

use sea_query::Value;

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::fragment::PostSql;
use crate::meta::{EntityMeta, meta};
use crate::query::{Arg, Dialect, Query, expand_args, finish};
use crate::scope;
use crate::select::live_predicate;

/// Builder for constructing the statements that delete matching rows.
///
/// Without a soft-delete column the rows are physically deleted. With one, the
/// marker is set to its deleted literal. When a deletion-log table is declared
/// the rows are copied there and then physically deleted. A scope that turns
/// soft delete off for the entity forces a physical delete.
pub struct DeleteBuilder<T: Entity> {
    post_sql: String,
    args: Vec<Arg>,
    _marker: PhantomData<T>,
}

impl<T: Entity> DeleteBuilder<T> {
    /// Delete the rows matched by a caller fragment, which must have a WHERE clause.
    #[must_use]
    pub fn new(post_sql: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            post_sql: post_sql.into(),
            args,
            _marker: PhantomData,
        }
    }

    /// Delete the rows whose keys match `entities`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullKeyValue`] when an entity has a null key and
    /// [`Error::InvalidParameter`] when `entities` is empty.
    pub fn by_keys(entities: &[T], dialect: Dialect) -> Result<Self> {
        let meta = meta::<T>();
        let keys = meta.key_columns()?;
        if entities.is_empty() {
            return Err(Error::invalid(format!("no `{}` to delete", meta.name)));
        }

        let mut disjuncts = Vec::with_capacity(entities.len());
        let mut args = Vec::new();
        for entity in entities {
            let mut conjuncts = Vec::with_capacity(keys.len());
            for key in &keys {
                let value = entity.column_value(key.name)?.ok_or(Error::NullKeyValue {
                    entity: meta.name,
                    column: key.name,
                })?;
                conjuncts.push(format!("{} = ?", dialect.quote(key.name)));
                args.push(Arg::Value(value));
            }
            disjuncts.push(conjuncts.join(" AND "));
        }

        let where_body = if disjuncts.len() == 1 {
            disjuncts.remove(0)
        } else {
            disjuncts.iter().map(|d| format!("({d})")).collect::<Vec<_>>().join(" OR ")
        };
        Ok(Self::new(format!("WHERE {where_body}"), args))
    }

    /// Delete the row whose single key column equals `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOnlyOneKeyColumn`] for composite keys and
    /// [`Error::NullKeyValue`] for a null `key`.
    pub fn by_key_value(key: Value, dialect: Dialect) -> Result<Self> {
        let meta = meta::<T>();
        let column = meta.single_key()?;
        if crate::entity::value_to_datatype(key.clone())?.is_null() {
            return Err(Error::NullKeyValue {
                entity: meta.name,
                column: column.name,
            });
        }
        Ok(Self::new(format!("WHERE {} = ?", dialect.quote(column.name)), vec![Arg::Value(key)]))
    }

    /// Build the statements, in execution order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] when the fragment has no WHERE clause.
    pub fn build(self, dialect: Dialect) -> Result<Vec<Query>> {
        let meta = meta::<T>();
        let table = scope::table_name(meta);

        let (post_sql, values) = expand_args(&self.post_sql, self.args)?;
        let mut post = PostSql::parse(&post_sql)?;
        if post.where_body.as_deref().is_none_or(|body| body.trim().is_empty()) {
            return Err(Error::invalid(format!("refusing to delete from `{table}` without a filter")));
        }

        let live = live_predicate(meta, dialect, None);
        if let Some(live) = &live {
            post.and_where(live);
        }
        let quoted = dialect.quote(&table);

        match mode(meta, live.is_some()) {
            Mode::Physical => {
                Ok(vec![finish(&table, format!("DELETE FROM {quoted} {post}"), values)?])
            }
            Mode::Soft => {
                let (column, deleted) = meta
                    .soft_delete_column()
                    .and_then(|c| c.soft_delete.map(|(_, deleted)| (c.name, deleted)))
                    .ok_or_else(|| Error::config(format!("`{}` has no soft-delete column", meta.name)))?;
                let sql = format!("UPDATE {quoted} SET {} = {deleted} {post}", dialect.quote(column));
                Ok(vec![finish(&table, sql, values)?])
            }
            Mode::Log(log_table) => {
                let copy = format!(
                    "INSERT INTO {} SELECT * FROM {quoted} {post}",
                    dialect.quote(log_table)
                );
                Ok(vec![
                    finish(&table, copy, values.clone())?,
                    finish(&table, format!("DELETE FROM {quoted} {post}"), values)?,
                ])
            }
        }
    }
}

enum Mode {
    Physical,
    Soft,
    Log(&'static str),
}

fn mode(meta: &EntityMeta, soft_column: bool) -> Mode {
    if !scope::soft_delete_enabled(meta) {
        return Mode::Physical;
    }
    match (meta.soft_delete_table, soft_column) {
        (Some(log_table), _) => Mode::Log(log_table),
        (None, true) => Mode::Soft,
        (None, false) => Mode::Physical,
    }
}
