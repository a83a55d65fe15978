//! Entity metadata and its process-wide cache.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::RwLock;

use crate::entity::Entity;
use crate::error::{Error, Result};

static CACHE: LazyLock<RwLock<HashMap<TypeId, &'static EntityMeta>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Metadata for `T`, built on first use and kept for the life of the process.
pub fn meta<T: Entity>() -> &'static EntityMeta {
    let id = TypeId::of::<T>();
    if let Some(meta) = CACHE.read().get(&id) {
        return *meta;
    }

    let mut cache = CACHE.write();
    *cache.entry(id).or_insert_with(|| {
        tracing::trace!(entity = std::any::type_name::<T>(), "describing entity");
        Box::leak(Box::new(T::describe()))
    })
}

/// Declared shape of an entity.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    /// Rust type name, used in messages.
    pub name: &'static str,

    /// Identity of the described type.
    pub type_id: TypeId,

    /// Default table name. Scoped overrides take precedence.
    pub table: &'static str,

    /// Table receiving a copy of deleted rows.
    pub soft_delete_table: Option<&'static str>,

    /// Declared columns in field order.
    pub columns: Vec<ColumnSpec>,

    /// Relation fields in field order.
    pub relations: Vec<RelationSpec>,

    /// Present when the entity is a two-table join projection.
    pub join: Option<JoinSpec>,
}

/// A column bound to a struct field.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub field: &'static str,
    pub key: bool,
    pub auto_increment: bool,
    pub json: bool,
    pub cas_version: bool,
    /// `(normal, deleted)` SQL literals of a soft-delete marker column.
    pub soft_delete: Option<(&'static str, &'static str)>,
    /// Server-evaluated expression, selected as `expr AS name` and never written.
    pub computed: Option<&'static str>,
    pub insertable: bool,
    pub updatable: bool,
}

impl ColumnSpec {
    /// A plain column named `name`, bound to `field`.
    #[must_use]
    pub const fn new(name: &'static str, field: &'static str) -> Self {
        Self {
            name,
            field,
            key: false,
            auto_increment: false,
            json: false,
            cas_version: false,
            soft_delete: None,
            computed: None,
            insertable: true,
            updatable: true,
        }
    }

    /// Whether the column takes part in INSERT statements.
    #[must_use]
    pub const fn writes_on_insert(&self) -> bool {
        self.insertable && self.computed.is_none()
    }

    /// Whether the column may appear as a SET target.
    #[must_use]
    pub const fn writes_on_update(&self) -> bool {
        self.updatable
            && self.computed.is_none()
            && !self.key
            && !self.cas_version
            && self.soft_delete.is_none()
    }
}

/// Cardinality of a relation field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// `Option<R>`: the first matching remote row wins.
    One,
    /// `Option<Vec<R>>`: every matching remote row is collected.
    Many,
}

/// A field filled by a batched secondary fetch.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct RelationSpec {
    pub field: &'static str,
    pub local_column: &'static str,
    pub remote_column: &'static str,
    /// Metadata of the remote (element) type.
    pub remote: fn() -> &'static EntityMeta,
    /// Fragment ANDed with the generated `remote IN (...)` predicate.
    pub extra_where: Option<&'static str>,
    /// Whether a data provider supplies the rows instead of a generated query.
    pub provider: bool,
    pub cardinality: Cardinality,
}

/// Join flavor of a join projection.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Join,
    Left,
    Right,
    Straight,
}

impl JoinKind {
    /// SQL keyword placed between the two tables.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Join => "JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
            Self::Straight => "STRAIGHT_JOIN",
        }
    }
}

/// Two-table join projection. The left side is aliased `t1`, the right `t2`.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub kind: JoinKind,
    pub on: &'static str,
    pub left_field: &'static str,
    pub right_field: &'static str,
    pub left: fn() -> &'static EntityMeta,
    pub right: fn() -> &'static EntityMeta,
}

/// Alias of the left join side.
pub const LEFT_ALIAS: &str = "t1";
/// Alias of the right join side.
pub const RIGHT_ALIAS: &str = "t2";

impl EntityMeta {
    /// Look up a declared column by database name, ignoring ASCII case.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Look up a relation by field name.
    #[must_use]
    pub fn relation(&self, field: &str) -> Option<&RelationSpec> {
        self.relations.iter().find(|r| r.field == field)
    }

    /// Key columns, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when no key column is declared.
    pub fn key_columns(&self) -> Result<Vec<&ColumnSpec>> {
        let keys: Vec<_> = self.columns.iter().filter(|c| c.key).collect();
        if keys.is_empty() {
            return Err(Error::config(format!("`{}` has no key column", self.name)));
        }
        Ok(keys)
    }

    /// The only key column.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] without keys and
    /// [`Error::NotOnlyOneKeyColumn`] with more than one.
    pub fn single_key(&self) -> Result<&ColumnSpec> {
        let keys = self.key_columns()?;
        match keys.as_slice() {
            [key] => Ok(*key),
            _ => Err(Error::NotOnlyOneKeyColumn {
                entity: self.name,
                found: keys.len(),
            }),
        }
    }

    /// The CAS version column, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when more than one is declared.
    pub fn cas_column(&self) -> Result<Option<&ColumnSpec>> {
        let mut cas = self.columns.iter().filter(|c| c.cas_version);
        let first = cas.next();
        if cas.next().is_some() {
            return Err(Error::config(format!("`{}` has more than one casVersion column", self.name)));
        }
        Ok(first)
    }

    /// The soft-delete marker column, if any.
    #[must_use]
    pub fn soft_delete_column(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.soft_delete.is_some())
    }

    /// Left and right side metadata of a join projection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the entity is not a join projection.
    pub fn join_sides(&self) -> Result<(&JoinSpec, &'static Self, &'static Self)> {
        let join = self
            .join
            .as_ref()
            .ok_or_else(|| Error::config(format!("`{}` is not a join projection", self.name)))?;
        Ok((join, (join.left)(), (join.right)()))
    }
}
