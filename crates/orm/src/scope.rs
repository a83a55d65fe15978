//! Task-scoped overrides of table names, soft delete, comments and features.
//!
//! Overrides apply to everything awaited inside [`Scope::run`] and are gone
//! once the future completes, fails, panics or is dropped.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::future::Future;

use crate::entity::Entity;
use crate::meta::EntityMeta;
use crate::options::{Feature, Features};

tokio::task_local! {
    static OVERRIDES: Overrides;
}

#[derive(Debug, Clone, Default)]
struct Overrides {
    table_names: HashMap<TypeId, String>,
    soft_delete_off: HashSet<TypeId>,
    comment: Option<String>,
    features: HashMap<Feature, bool>,
}

fn with_current<R>(f: impl FnOnce(&Overrides) -> R) -> Option<R> {
    OVERRIDES.try_with(f).ok()
}

/// Builder for a block of scoped overrides.
///
/// A new scope starts from the overrides of the scope it is created in.
///
/// ```ignore
/// let archived = db
///     .scope()
///     .table_name::<Student>("t_student_del")
///     .run(db.get_all::<Student>("WHERE name = ?", params!["nick"]))
///     .await?;
/// ```
#[derive(Debug, Clone)]
#[must_use]
pub struct Scope {
    overrides: Overrides,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// A scope inheriting the current overrides.
    pub fn new() -> Self {
        Self {
            overrides: with_current(Clone::clone).unwrap_or_default(),
        }
    }

    /// Read and write `T` through `table` instead of its declared table.
    pub fn table_name<T: Entity>(mut self, table: impl Into<String>) -> Self {
        self.overrides.table_names.insert(TypeId::of::<T>(), table.into());
        self
    }

    /// Stop injecting `T`'s soft-delete predicate; deletes become physical.
    pub fn without_soft_delete<T: Entity>(mut self) -> Self {
        self.overrides.soft_delete_off.insert(TypeId::of::<T>());
        self
    }

    /// Prefix statements with `/*comment*/`, after any global comment.
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.overrides.comment = Some(comment.into());
        self
    }

    /// Override a feature switch.
    pub fn feature(mut self, feature: Feature, on: bool) -> Self {
        self.overrides.features.insert(feature, on);
        self
    }

    /// Drive `future` with these overrides installed.
    pub async fn run<F: Future>(self, future: F) -> F::Output {
        OVERRIDES.scope(self.overrides, future).await
    }
}

/// Effective table name of `meta`.
pub(crate) fn table_name(meta: &EntityMeta) -> String {
    with_current(|o| o.table_names.get(&meta.type_id).cloned())
        .flatten()
        .unwrap_or_else(|| meta.table.to_string())
}

/// Whether soft delete (marker column and deletion-log table) is honored for `meta`.
pub(crate) fn soft_delete_enabled(meta: &EntityMeta) -> bool {
    !with_current(|o| o.soft_delete_off.contains(&meta.type_id)).unwrap_or(false)
}

pub(crate) fn comment() -> Option<String> {
    with_current(|o| o.comment.clone()).flatten()
}

/// `defaults` with the current scope's feature overrides applied.
pub(crate) fn features(defaults: Features) -> Features {
    with_current(|o| {
        o.features.iter().fold(defaults, |features, (feature, on)| features.with(*feature, *on))
    })
    .unwrap_or(defaults)
}
