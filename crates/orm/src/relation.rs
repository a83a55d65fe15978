//! Batched resolution of relation fields.
//!
//! Every relation field of a batch is filled with a single fetch: either one
//! `remote IN (...)` query against the remote entity or one call to a
//! [`DataProvider`]. Rows are then matched back to their owners by value.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use sea_query::Value;
use strata_sql::DataType;

use crate::db::Db;
use crate::entity::{Entity, value_to_datatype};
use crate::error::{Error, Result};
use crate::fragment::PostSql;
use crate::meta::{ColumnSpec, EntityMeta, RelationSpec, meta};
use crate::query::Arg;

/// Resolves one relation field (or join side) across a batch of entities.
///
/// Handlers are generated by `#[derive(Entity)]`; see [`Entity::relations`].
pub trait Relation<S>: Send + Sync {
    /// Name of the field this handler fills.
    fn field(&self) -> &'static str;

    /// Fill the field on every item with at most one fetch.
    fn resolve<'a>(&'a self, db: &'a Db, items: &'a mut [S]) -> BoxFuture<'a, Result<()>>;
}

/// Source of remote rows for a relation declared with `provider = Type`.
///
/// The provider receives the distinct local values of the whole batch and
/// returns the remote rows for all of them; matching is done by the engine.
pub trait DataProvider<R>: Send + Sync {
    /// Fetch the remote rows whose remote column holds one of `request.values`.
    fn fetch<'a>(&'a self, db: &'a Db, request: ProviderRequest<'a>) -> BoxFuture<'a, Result<Vec<R>>>;
}

/// What a [`DataProvider`] is asked for.
#[derive(Debug, Clone, Copy)]
pub struct ProviderRequest<'a> {
    /// Distinct non-null local values, in first-seen order.
    pub values: &'a [DataType],
    /// The relation being resolved.
    pub relation: &'a RelationSpec,
    /// Metadata of the entity owning the relation field.
    pub source: &'static EntityMeta,
    /// Metadata of the remote entity.
    pub remote: &'static EntityMeta,
}

type ManySlot<S, R> = fn(&mut S) -> &mut Option<Vec<R>>;
type OneSlot<S, R> = fn(&mut S) -> &mut Option<R>;

/// Handler for a collection relation, `Option<Vec<R>>`.
///
/// Items without a match get an empty collection unless they already hold one.
pub struct Many<S, R> {
    field: &'static str,
    slot: ManySlot<S, R>,
    provider: Option<Arc<dyn DataProvider<R>>>,
}

impl<S: Entity, R: Entity + Clone> Many<S, R> {
    /// A handler filling `field` through `slot` from a generated query.
    #[must_use]
    pub const fn new(field: &'static str, slot: ManySlot<S, R>) -> Self {
        Self {
            field,
            slot,
            provider: None,
        }
    }

    /// A handler filling `field` through `slot` from `provider`.
    #[must_use]
    pub fn with_provider(
        field: &'static str, slot: ManySlot<S, R>, provider: impl DataProvider<R> + 'static,
    ) -> Self {
        Self {
            field,
            slot,
            provider: Some(Arc::new(provider)),
        }
    }
}

impl<S: Entity, R: Entity + Clone> Relation<S> for Many<S, R> {
    fn field(&self) -> &'static str {
        self.field
    }

    fn resolve<'a>(&'a self, db: &'a Db, items: &'a mut [S]) -> BoxFuture<'a, Result<()>> {
        async move {
            let fetched = fetch::<S, R>(db, self.field, self.provider.as_deref(), items).await?;

            for item in items.iter_mut() {
                let matched = match &fetched {
                    Some(remote) => remote.matches(item)?,
                    None => Vec::new(),
                };
                let slot = (self.slot)(item);
                if !matched.is_empty() {
                    *slot = Some(matched.into_iter().cloned().collect());
                } else if slot.is_none() {
                    *slot = Some(Vec::new());
                }
            }
            Ok(())
        }
        .boxed()
    }
}

/// Handler for a singular relation, `Option<R>`.
///
/// The first remote row in fetch order wins. Items without a match are left untouched.
pub struct One<S, R> {
    field: &'static str,
    slot: OneSlot<S, R>,
    provider: Option<Arc<dyn DataProvider<R>>>,
}

impl<S: Entity, R: Entity + Clone> One<S, R> {
    /// A handler filling `field` through `slot` from a generated query.
    #[must_use]
    pub const fn new(field: &'static str, slot: OneSlot<S, R>) -> Self {
        Self {
            field,
            slot,
            provider: None,
        }
    }

    /// A handler filling `field` through `slot` from `provider`.
    #[must_use]
    pub fn with_provider(
        field: &'static str, slot: OneSlot<S, R>, provider: impl DataProvider<R> + 'static,
    ) -> Self {
        Self {
            field,
            slot,
            provider: Some(Arc::new(provider)),
        }
    }
}

impl<S: Entity, R: Entity + Clone> Relation<S> for One<S, R> {
    fn field(&self) -> &'static str {
        self.field
    }

    fn resolve<'a>(&'a self, db: &'a Db, items: &'a mut [S]) -> BoxFuture<'a, Result<()>> {
        async move {
            let Some(remote) = fetch::<S, R>(db, self.field, self.provider.as_deref(), items).await?
            else {
                return Ok(());
            };

            for item in items.iter_mut() {
                if let Some(first) = remote.matches(item)?.first() {
                    *(self.slot)(item) = Some((*first).clone());
                }
            }
            Ok(())
        }
        .boxed()
    }
}

/// Handler resolving the relations of one side of a join projection.
pub struct JoinSide<S, A> {
    field: &'static str,
    slot: OneSlot<S, A>,
    _marker: PhantomData<fn() -> A>,
}

impl<S: Entity, A: Entity> JoinSide<S, A> {
    /// A handler for the side stored in `field`.
    #[must_use]
    pub const fn new(field: &'static str, slot: OneSlot<S, A>) -> Self {
        Self {
            field,
            slot,
            _marker: PhantomData,
        }
    }
}

impl<S: Entity, A: Entity> Relation<S> for JoinSide<S, A> {
    fn field(&self) -> &'static str {
        self.field
    }

    fn resolve<'a>(&'a self, db: &'a Db, items: &'a mut [S]) -> BoxFuture<'a, Result<()>> {
        async move {
            let mut positions = Vec::new();
            let mut sides = Vec::new();
            for (n, item) in items.iter_mut().enumerate() {
                if let Some(side) = (self.slot)(item).take() {
                    positions.push(n);
                    sides.push(side);
                }
            }

            let resolved = db.handle_relations(&mut sides).await;

            // sides go back even when resolution failed
            for (n, side) in positions.into_iter().zip(sides) {
                *(self.slot)(&mut items[n]) = Some(side);
            }
            resolved
        }
        .boxed()
    }
}

// Remote rows indexed by the text form of their remote column.
struct Fetched<R> {
    rows: Vec<R>,
    index: IndexMap<String, Vec<usize>>,
    local: &'static ColumnSpec,
}

impl<R> Fetched<R> {
    fn matches<S: Entity>(&self, item: &S) -> Result<Vec<&R>> {
        let Some(value) = item.column_value(self.local.name)? else {
            return Ok(Vec::new());
        };
        let Some(text) = value_to_datatype(value)?.as_text() else {
            return Ok(Vec::new());
        };
        Ok(self.index.get(&text).map(|rows| rows.iter().map(|&n| &self.rows[n]).collect()).unwrap_or_default())
    }
}

async fn fetch<S: Entity, R: Entity>(
    db: &Db, field: &'static str, provider: Option<&dyn DataProvider<R>>, items: &[S],
) -> Result<Option<Fetched<R>>> {
    let source = meta::<S>();
    let relation = source
        .relation(field)
        .ok_or_else(|| Error::config(format!("`{}` has no relation field `{field}`", source.name)))?;
    let remote = (relation.remote)();
    let (local, remote_column) = columns(source, remote, relation)?;

    // distinct non-null local values, keyed by text form
    let mut distinct: IndexMap<String, (Value, DataType)> = IndexMap::new();
    for item in items {
        if let Some(value) = item.column_value(local.name)? {
            let data = value_to_datatype(value.clone())?;
            if let Some(text) = data.as_text() {
                distinct.entry(text).or_insert((value, data));
            }
        }
    }
    if distinct.is_empty() {
        tracing::trace!(entity = source.name, field, "no local values, relation not fetched");
        return Ok(None);
    }

    let (values, data): (Vec<Value>, Vec<DataType>) = distinct.into_values().unzip();
    let rows: Vec<R> = match provider {
        Some(provider) => {
            let request = ProviderRequest {
                values: &data,
                relation,
                source,
                remote,
            };
            provider.fetch(db, request).await?
        }
        None => {
            let mut post = PostSql::parse(relation.extra_where.unwrap_or_default())?;
            if post.where_body.is_none() && !post.head.is_empty() {
                post.where_body = Some(std::mem::take(&mut post.head));
            }
            post.and_where(&format!("{} IN (?)", db.dialect().quote(remote_column.name)));
            db.get_all::<R>(&post.to_string(), vec![Arg::List(values)]).await?
        }
    };

    let local_kinds: HashSet<&str> = data.iter().map(DataType::kind).collect();
    let mut remote_kinds = HashSet::new();
    let mut index: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (n, row) in rows.iter().enumerate() {
        let Some(value) = row.column_value(remote_column.name)? else {
            continue;
        };
        let data = value_to_datatype(value)?;
        remote_kinds.insert(data.kind());
        if let Some(text) = data.as_text() {
            index.entry(text).or_default().push(n);
        }
    }
    if !remote_kinds.is_empty() && remote_kinds != local_kinds {
        tracing::warn!(
            entity = source.name,
            field,
            local = ?local_kinds,
            remote = ?remote_kinds,
            "relation columns differ in type, matching by text form"
        );
    }

    Ok(Some(Fetched { rows, index, local }))
}

// Both relation columns must be declared on their entities.
fn columns(
    source: &'static EntityMeta, remote: &'static EntityMeta, relation: &RelationSpec,
) -> Result<(&'static ColumnSpec, &'static ColumnSpec)> {
    let local = source.column(relation.local_column).ok_or_else(|| {
        Error::config(format!(
            "relation `{}` of `{}`: local column `{}` is not declared",
            relation.field, source.name, relation.local_column
        ))
    })?;
    let remote_column = remote.column(relation.remote_column).ok_or_else(|| {
        Error::config(format!(
            "relation `{}` of `{}`: remote column `{}` is not declared on `{}`",
            relation.field, source.name, relation.remote_column, remote.name
        ))
    })?;
    Ok((local, remote_column))
}
