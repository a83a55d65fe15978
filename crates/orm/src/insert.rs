use sea_query::{Alias, Expr, SimpleExpr, Value};

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::meta::{ColumnSpec, EntityMeta, meta};
use crate::query::{Dialect, Query, finish};
use crate::scope;

/// Builder for constructing single or multi-row INSERT queries from entities.
///
/// Only columns holding a value in at least one row are written. The CAS
/// column is expected to be defaulted by the caller (see
/// [`default_cas_version`]); the soft-delete column is written as its normal
/// literal when unset.
pub struct InsertBuilder<'a, T: Entity> {
    rows: &'a [T],
}

impl<'a, T: Entity> InsertBuilder<'a, T> {
    /// Insert a single entity.
    #[must_use]
    pub fn new(entity: &'a T) -> Self {
        Self {
            rows: std::slice::from_ref(entity),
        }
    }

    /// Insert several entities with one statement.
    #[must_use]
    pub const fn batch(rows: &'a [T]) -> Self {
        Self { rows }
    }

    /// Build the INSERT query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for an empty batch, or an error when
    /// a value cannot be converted.
    pub fn build(self, dialect: Dialect) -> Result<Query> {
        let meta = meta::<T>();
        let table = scope::table_name(meta);
        if self.rows.is_empty() {
            return Err(Error::invalid(format!("nothing to insert into `{table}`")));
        }

        let mut values: Vec<Vec<Option<Value>>> = Vec::with_capacity(self.rows.len());
        for row in self.rows {
            let row_values = meta
                .columns
                .iter()
                .filter(|c| c.writes_on_insert())
                .map(|c| row.column_value(c.name))
                .collect::<Result<Vec<_>>>()?;
            values.push(row_values);
        }

        let writable: Vec<&ColumnSpec> = meta.columns.iter().filter(|c| c.writes_on_insert()).collect();
        let selected: Vec<usize> = (0..writable.len())
            .filter(|&n| writable[n].soft_delete.is_some() || values.iter().any(|row| row[n].is_some()))
            .collect();

        if selected.is_empty() {
            let sql = dialect.insert_defaults(&table);
            if self.rows.len() > 1 {
                return Err(Error::invalid(format!(
                    "cannot insert {} rows of defaults into `{table}` with one statement",
                    self.rows.len()
                )));
            }
            return finish(&table, sql, Vec::new());
        }

        let mut statement = sea_query::Query::insert();
        statement.into_table(Alias::new(&table));
        statement.columns(selected.iter().map(|&n| Alias::new(writable[n].name)));

        for row in values {
            let exprs = selected.iter().map(|&n| insert_expr(writable[n], row[n].clone()));
            statement.values(exprs).map_err(|e| Error::invalid(e.to_string()))?;
        }

        let (sql, values) = statement.build(dialect.builder());
        finish(&table, sql, values.0)
    }
}

fn insert_expr(column: &ColumnSpec, value: Option<Value>) -> SimpleExpr {
    match (value, column.soft_delete) {
        (Some(value), _) => SimpleExpr::Value(value),
        (None, Some((normal, _))) => Expr::cust(normal),
        // absent from this row but present in another
        (None, None) => Expr::cust("NULL"),
    }
}

/// Set an unset CAS column to `1` before insert.
///
/// # Errors
///
/// Returns an error when more than one CAS column is declared, or when the
/// field cannot hold an integer.
pub(crate) fn default_cas_version<T: Entity>(meta: &EntityMeta, entity: &mut T) -> Result<()> {
    if let Some(cas) = meta.cas_column()?
        && entity.column_value(cas.name)?.is_none()
    {
        entity.set_column(cas.name, &strata_sql::DataType::Int64(Some(1)))?;
    }
    Ok(())
}
