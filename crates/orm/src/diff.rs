//! Column selection for multi-row updates.

use crate::entity::Entity;
use crate::error::Result;
use crate::meta::{ColumnSpec, EntityMeta};

/// Updatable columns holding a value in at least one of `rows`, in declaration order.
///
/// An empty result means every row carries keys only and there is nothing to write.
pub(crate) fn changed_columns<'m, T: Entity>(
    meta: &'m EntityMeta, rows: &[T],
) -> Result<Vec<&'m ColumnSpec>> {
    let mut changed = Vec::new();
    for column in meta.columns.iter().filter(|c| c.writes_on_update()) {
        for row in rows {
            if row.column_value(column.name)?.is_some() {
                changed.push(column);
                break;
            }
        }
    }
    Ok(changed)
}
