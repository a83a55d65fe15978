use strata_sql::Row;

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::meta::{EntityMeta, meta};

/// Map one result row onto a new `T`.
///
/// Labels match column names ignoring case. Result columns without a declared
/// field are ignored. A declared column missing from the row keeps its default
/// unless `strict` is set, in which case it is an [`Error::UnknownColumn`].
pub(crate) fn map_row<T: Entity>(row: &Row, strict: bool) -> Result<T> {
    let meta = meta::<T>();
    if meta.join.is_some() {
        return T::map_join_row(row, strict);
    }

    let mut entity = T::default();
    map_columns(&mut entity, meta, row, None, strict)?;
    Ok(entity)
}

/// Map the `alias.`-prefixed columns of a join row onto a join side.
///
/// Returns `None` when every column of the side is null, as for the outer
/// side of a LEFT or RIGHT join without a partner row.
#[doc(hidden)]
pub fn map_side<T: Entity>(row: &Row, alias: &str, strict: bool) -> Result<Option<T>> {
    let mut entity = T::default();
    let present = map_columns(&mut entity, meta::<T>(), row, Some(alias), strict)?;
    Ok((present > 0).then_some(entity))
}

// Returns the number of non-null columns assigned.
fn map_columns<T: Entity>(
    entity: &mut T, meta: &EntityMeta, row: &Row, alias: Option<&str>, strict: bool,
) -> Result<usize> {
    let mut present = 0;

    for column in &meta.columns {
        let value = match alias {
            Some(alias) => row.get(&format!("{alias}.{}", column.name)),
            None => row.get(column.name),
        };

        match value {
            Some(value) if value.is_null() => {}
            Some(value) => {
                entity.set_column(column.name, value)?;
                present += 1;
            }
            None if strict => {
                return Err(Error::UnknownColumn {
                    entity: meta.name,
                    column: column.name.to_string(),
                });
            }
            None => {
                tracing::trace!(entity = meta.name, column = column.name, "column not in result");
            }
        }
    }

    Ok(present)
}

#[cfg(test)]
mod tests {
    use strata_sql::{DataType, Field};

    use super::*;
    use crate::Entity;

    #[derive(Debug, Default, Entity)]
    #[table(name = "t_school")]
    struct School {
        #[column(key)]
        id: Option<i64>,
        #[column(name = "school_name")]
        name: Option<String>,
        #[column(json)]
        tags: Option<Vec<String>>,
    }

    #[derive(Debug, Default, Entity)]
    #[join(kind = "left", on = "t1.id = t2.id")]
    struct Pair {
        #[join_left]
        left: Option<School>,
        #[join_right]
        right: Option<School>,
    }

    fn row(fields: &[(&str, DataType)]) -> Row {
        Row {
            index: "0".to_string(),
            fields: fields
                .iter()
                .map(|(name, value)| Field {
                    name: (*name).to_string(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    #[test]
    fn maps_by_label_ignoring_case() {
        let row = row(&[
            ("ID", DataType::Int64(Some(7))),
            ("School_Name", DataType::Str(Some("North".to_string()))),
            ("tags", DataType::Str(Some(r#"["a","b"]"#.to_string()))),
            ("extra", DataType::Int32(Some(1))),
        ]);
        let school: School = map_row(&row, false).unwrap();
        assert_eq!(school.id, Some(7));
        assert_eq!(school.name.as_deref(), Some("North"));
        assert_eq!(school.tags, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn missing_columns() {
        let row = row(&[("id", DataType::Int64(Some(7)))]);
        let school: School = map_row(&row, false).unwrap();
        assert_eq!(school.name, None);

        let Err(err) = map_row::<School>(&row, true) else {
            panic!("expected unknown column");
        };
        assert!(matches!(err, Error::UnknownColumn { ref column, .. } if column == "school_name"));
    }

    #[test]
    fn join_sides_split_by_alias() {
        let row = row(&[
            ("t1.id", DataType::Int64(Some(1))),
            ("t1.school_name", DataType::Str(Some("North".to_string()))),
            ("t1.tags", DataType::NULL),
            ("t2.id", DataType::NULL),
            ("t2.school_name", DataType::NULL),
            ("t2.tags", DataType::NULL),
        ]);
        let pair: Pair = map_row(&row, false).unwrap();
        assert_eq!(pair.left.and_then(|s| s.id), Some(1));
        assert!(pair.right.is_none());
    }
}
