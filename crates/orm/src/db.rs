//! The [`Db`] facade: builds statements, runs them on a [`Connection`] and
//! maps the results back into entities.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use sea_query::Value;
use serde::Serialize;
use strata_sql::{AfterCommit, Connection, DataType, Inserted, Row};

use crate::delete::DeleteBuilder;
use crate::entity::{Entity, FetchValue, fetch_column, value_to_datatype};
use crate::error::{Error, Result};
use crate::insert::{InsertBuilder, default_cas_version};
use crate::interceptor::{Interceptor, Operation};
use crate::mapper::map_row;
use crate::meta::{EntityMeta, meta};
use crate::options::{Feature, Features, Options};
use crate::query::{Arg, Dialect, Query, expand_args, finish, with_comments};
use crate::scope::{self, Scope};
use crate::select::{SelectBuilder, TOTAL_LABEL};
use crate::update::{
    BatchUpdateBuilder, CustomUpdateBuilder, UpdateAllBuilder, UpdateBuilder, advance_cas_version,
};

/// Details of a statement that ran longer than [`Options::slow_sql_threshold`].
#[derive(Debug)]
pub struct SlowSql<'a> {
    /// SQL text as sent, comments included.
    pub sql: &'a str,
    /// Bound values.
    pub params: &'a [DataType],
    /// Wall-clock execution time.
    pub elapsed: Duration,
}

type SlowSqlCallback = Arc<dyn Fn(&SlowSql<'_>) -> anyhow::Result<()> + Send + Sync>;

/// One page of results.
#[derive(Debug, Clone, Serialize)]
pub struct PageData<T> {
    /// Rows matching the filter across all pages, `-1` when not computed.
    pub total: i64,
    /// Rows of this page.
    pub data: Vec<T>,
    /// Effective page size after clamping.
    pub page_size: u64,
}

impl<T> PageData<T> {
    /// Number of pages, when the total is known.
    #[must_use]
    pub fn total_pages(&self) -> Option<u64> {
        let total = u64::try_from(self.total).ok()?;
        total.checked_add(self.page_size.saturating_sub(1))?.checked_div(self.page_size)
    }
}

/// Entity-mapping access to a database.
///
/// Cheap to clone; clones share the connection, options and interceptors.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Arc<dyn Connection>,
    options: Options,
    dialect: Dialect,
    interceptors: Vec<Arc<dyn Interceptor>>,
    slow_sql: Option<SlowSqlCallback>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("conn", &self.inner.conn)
            .field("options", &self.inner.options)
            .field("dialect", &self.inner.dialect)
            .field("interceptors", &self.inner.interceptors.len())
            .finish_non_exhaustive()
    }
}

/// Startup assembly of a [`Db`].
#[must_use]
pub struct DbBuilder {
    conn: Arc<dyn Connection>,
    options: Options,
    interceptors: Vec<Arc<dyn Interceptor>>,
    slow_sql: Option<SlowSqlCallback>,
}

impl DbBuilder {
    /// Replace the default options. A `None` dialect follows the connection.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Register an interceptor. Interceptors run in registration order.
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Called for every statement slower than [`Options::slow_sql_threshold`].
    /// A failing callback is logged and otherwise ignored.
    pub fn slow_sql_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SlowSql<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.slow_sql = Some(Arc::new(callback));
        self
    }

    /// Finish assembly.
    pub fn build(self) -> Db {
        let dialect = self.options.dialect.unwrap_or_else(|| self.conn.flavor().into());
        Db {
            inner: Arc::new(Inner {
                conn: self.conn,
                options: self.options,
                dialect,
                interceptors: self.interceptors,
                slow_sql: self.slow_sql,
            }),
        }
    }
}

// Entity and operation a statement is run for; raw SQL has none.
#[derive(Clone, Copy)]
struct Target {
    operation: Operation,
    meta: &'static EntityMeta,
}

impl Target {
    fn of<T: Entity>(operation: Operation) -> Option<Self> {
        Some(Self {
            operation,
            meta: meta::<T>(),
        })
    }
}

impl Db {
    /// A `Db` with default options.
    #[must_use]
    pub fn new(conn: impl Connection) -> Self {
        Self::builder(conn).build()
    }

    /// Start assembling a `Db` around `conn`.
    pub fn builder(conn: impl Connection) -> DbBuilder {
        DbBuilder {
            conn: Arc::new(conn),
            options: Options::default(),
            interceptors: Vec::new(),
            slow_sql: None,
        }
    }

    /// Engine options.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    /// SQL flavor written by this engine.
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    /// Feature switches in effect for the current task.
    #[must_use]
    pub fn features(&self) -> Features {
        scope::features(self.inner.options.features)
    }

    /// Start a block of scoped overrides. See [`Scope`].
    pub fn scope(&self) -> Scope {
        Scope::new()
    }

    /// Fetch the row whose single key column equals `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOnlyOneKeyColumn`] for composite keys, before any SQL runs.
    pub async fn get_by_key<T: Entity>(&self, key: impl Into<Value> + Send) -> Result<Option<T>> {
        let meta = meta::<T>();
        let column = meta.single_key()?;
        let key = key.into();
        if value_to_datatype(key.clone())?.is_null() {
            return Err(Error::NullKeyValue {
                entity: meta.name,
                column: column.name,
            });
        }

        let post_sql = format!("WHERE {} = ?", self.dialect().quote(column.name));
        self.get_one(&post_sql, vec![Arg::Value(key)]).await
    }

    /// Fetch the rows whose single key column is one of `keys`.
    ///
    /// The map follows the order of `keys` and has no entry for keys without a row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOnlyOneKeyColumn`] for composite keys.
    pub async fn get_by_key_batch<T, K>(&self, keys: &[K]) -> Result<IndexMap<K, T>>
    where
        T: Entity,
        K: Into<Value> + Clone + Eq + Hash + Send + Sync,
    {
        let meta = meta::<T>();
        let column = meta.single_key()?;
        if keys.is_empty() {
            return Ok(IndexMap::new());
        }

        let values: Vec<Value> = keys.iter().cloned().map(Into::into).collect();
        let post_sql = format!("WHERE {} IN (?)", self.dialect().quote(column.name));
        let rows: Vec<T> = self.get_all(&post_sql, vec![Arg::List(values)]).await?;

        let mut by_key: IndexMap<String, T> = IndexMap::with_capacity(rows.len());
        for row in rows {
            if let Some(text) = key_text(row.column_value(column.name)?)? {
                by_key.insert(text, row);
            }
        }

        let mut found = IndexMap::with_capacity(by_key.len());
        for key in keys {
            if let Some(text) = key_text(Some(key.clone().into()))?
                && let Some(row) = by_key.swap_remove(&text)
            {
                found.insert(key.clone(), row);
            }
        }
        Ok(found)
    }

    /// Fetch every row matched by `post_sql` and resolve relations.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment is malformed or the query fails.
    pub async fn get_all<T: Entity>(&self, post_sql: &str, args: Vec<Arg>) -> Result<Vec<T>> {
        self.select(SelectBuilder::new().post_sql(post_sql, args)).await
    }

    /// Fetch only the key columns of every matching row.
    ///
    /// Neither interceptors nor relation resolution apply. Rows are mapped
    /// leniently since the other columns are absent by construction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when `T` has no key column.
    pub async fn get_all_key<T: Entity>(&self, post_sql: &str, args: Vec<Arg>) -> Result<Vec<T>> {
        let query = SelectBuilder::<T>::new()
            .post_sql(post_sql, args)
            .key_only()
            .build(self.dialect(), &self.features())?;
        let rows = self.query_rows(&query, None).await?;
        rows.iter().map(|row| map_row(row, false)).collect()
    }

    /// Fetch the first row matched by `post_sql`.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment is malformed or the query fails.
    pub async fn get_one<T: Entity>(&self, post_sql: &str, args: Vec<Arg>) -> Result<Option<T>> {
        let rows = self.select(SelectBuilder::new().post_sql(post_sql, args).limit(1)).await?;
        Ok(rows.into_iter().next())
    }

    /// Fetch the rows equal to `example` on each of its non-null columns.
    ///
    /// # Errors
    ///
    /// Returns an error when a field cannot be bound or the query fails.
    pub async fn get_by_example<T: Entity>(&self, example: &T) -> Result<Vec<T>> {
        let dialect = self.dialect();
        let mut predicates = Vec::new();
        let mut args = Vec::new();
        for column in meta::<T>().columns.iter().filter(|c| c.computed.is_none()) {
            if let Some(value) = example.column_value(column.name)? {
                predicates.push(format!("{} = ?", dialect.quote(column.name)));
                args.push(Arg::Value(value));
            }
        }

        let post_sql =
            if predicates.is_empty() { String::new() } else { format!("WHERE {}", predicates.join(" AND ")) };
        self.get_all(&post_sql, args).await
    }

    /// Run caller SQL and map its rows onto `T`, resolving relations.
    ///
    /// The statement is sent as written: no soft-delete predicate, no interceptors.
    ///
    /// # Errors
    ///
    /// Returns an error when the arguments do not match the placeholders or
    /// the query fails.
    pub async fn get_raw<T: Entity>(&self, sql: &str, args: Vec<Arg>) -> Result<Vec<T>> {
        let rows = self.get_raw_rows(sql, args).await?;
        let mut items = self.map_rows(&rows)?;
        self.handle_relations(&mut items).await?;
        Ok(items)
    }

    /// Run caller SQL and read the first column of every row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Mapping`] when a value does not convert to `V`.
    pub async fn get_raw_scalars<V: FetchValue>(&self, sql: &str, args: Vec<Arg>) -> Result<Vec<V>> {
        let rows = self.get_raw_rows(sql, args).await?;
        let null = DataType::NULL;
        rows.iter().map(|row| fetch_column("scalar", row.first().unwrap_or(&null))).collect()
    }

    /// Run caller SQL and return every row as a JSON object keyed by column label.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn get_raw_maps(
        &self, sql: &str, args: Vec<Arg>,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        let rows = self.get_raw_rows(sql, args).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                row.fields.into_iter().map(|field| (field.name, strata_sql::to_json(field.value))).collect()
            })
            .collect())
    }

    /// Run caller SQL and return the rows untouched.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn get_raw_rows(&self, sql: &str, args: Vec<Arg>) -> Result<Vec<Row>> {
        let (sql, values) = expand_args(sql, args)?;
        let query = finish("raw", sql, values)?;
        self.query_rows(&query, None).await
    }

    /// Fetch page `page` (1-based) of `page_size` rows, with the unpaged total.
    ///
    /// Any LIMIT in `post_sql` is replaced. Without ORDER BY or GROUP BY the
    /// rows are ordered by key so that pages are stable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a zero page or page size.
    pub async fn get_page<T: Entity>(
        &self, page: u64, page_size: u64, post_sql: &str, args: Vec<Arg>,
    ) -> Result<PageData<T>> {
        self.page(page, page_size, post_sql, args, true).await
    }

    /// As [`Db::get_page`] without computing the total, which is reported as `-1`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a zero page or page size.
    pub async fn get_page_without_count<T: Entity>(
        &self, page: u64, page_size: u64, post_sql: &str, args: Vec<Arg>,
    ) -> Result<PageData<T>> {
        self.page(page, page_size, post_sql, args, false).await
    }

    /// Count every live row of `T`.
    ///
    /// # Errors
    ///
    /// Returns an error when the query fails.
    pub async fn get_count<T: Entity>(&self) -> Result<u64> {
        self.get_count_where::<T>("", Vec::new()).await
    }

    /// Count the rows (or groups) matched by `post_sql`.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment is malformed or the query fails.
    pub async fn get_count_where<T: Entity>(&self, post_sql: &str, args: Vec<Arg>) -> Result<u64> {
        let query =
            SelectBuilder::<T>::new().post_sql(post_sql, args).count().build(self.dialect(), &self.features())?;
        let rows = self.query_rows(&query, Target::of::<T>(Operation::Select)).await?;
        let count = rows.first().and_then(Row::first).and_then(DataType::as_i64).unwrap_or_default();
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Whether any row matches `post_sql`.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment is malformed or the query fails.
    pub async fn exists<T: Entity>(&self, post_sql: &str, args: Vec<Arg>) -> Result<bool> {
        let query = SelectBuilder::<T>::new()
            .post_sql(post_sql, args)
            .probe()
            .limit(1)
            .build(self.dialect(), &self.features())?;
        let rows = self.query_rows(&query, Target::of::<T>(Operation::Select)).await?;
        Ok(!rows.is_empty())
    }

    /// Whether at least `count` rows match `post_sql`.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment is malformed or the query fails.
    pub async fn exists_at_least<T: Entity>(
        &self, count: u64, post_sql: &str, args: Vec<Arg>,
    ) -> Result<bool> {
        if count == 1 {
            return self.exists::<T>(post_sql, args).await;
        }
        Ok(self.get_count_where::<T>(post_sql, args).await? >= count)
    }

    /// Insert `entity`, defaulting its CAS version to 1 and writing back a
    /// generated auto-increment key. Returns the number of rows inserted.
    ///
    /// # Errors
    ///
    /// Returns an error when a field cannot be bound or the statement fails.
    pub async fn insert<T: Entity>(&self, entity: &mut T) -> Result<u64> {
        let meta = meta::<T>();
        default_cas_version(meta, entity)?;
        let query = InsertBuilder::new(&*entity).build(self.dialect())?;
        let inserted = self.exec_insert(&query, Target::of::<T>(Operation::Insert)).await?;

        if let Some(id) = inserted.last_id
            && let Some(key) = meta.columns.iter().find(|c| c.key && c.auto_increment)
            && entity.column_value(key.name)?.is_none()
        {
            entity.set_column(key.name, &DataType::Int64(Some(id)))?;
        }
        Ok(inserted.rows)
    }

    /// Insert every entity, one statement each, writing back generated keys.
    ///
    /// # Errors
    ///
    /// Stops at the first failing insert.
    pub async fn insert_batch<T: Entity>(&self, entities: &mut [T]) -> Result<u64> {
        let mut inserted = 0;
        for entity in entities.iter_mut() {
            inserted += self.insert(entity).await?;
        }
        Ok(inserted)
    }

    /// Insert every entity with one multi-row statement. Generated keys are not read back.
    ///
    /// # Errors
    ///
    /// Returns an error when a field cannot be bound or the statement fails.
    pub async fn insert_batch_without_return_id<T: Entity>(&self, entities: &mut [T]) -> Result<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        let meta = meta::<T>();
        for entity in entities.iter_mut() {
            default_cas_version(meta, entity)?;
        }
        let query = InsertBuilder::batch(entities).build(self.dialect())?;
        self.exec(&query, Target::of::<T>(Operation::Insert)).await
    }

    /// Update `entity` by key, skipping null fields.
    ///
    /// With a CAS column the stored version must equal the entity's; on
    /// success the entity's version is advanced by one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CasVersionMismatch`] when the version is null or no row matched.
    pub async fn update<T: Entity>(&self, entity: &mut T) -> Result<u64> {
        let query = UpdateBuilder::new(&*entity).build(self.dialect())?;
        self.apply_update(entity, query).await
    }

    /// As [`Db::update`], writing null fields as NULL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CasVersionMismatch`] when the version is null or no row matched.
    pub async fn update_with_null<T: Entity>(&self, entity: &mut T) -> Result<u64> {
        let query = UpdateBuilder::new(&*entity).with_null().build(self.dialect())?;
        self.apply_update(entity, query).await
    }

    /// As [`Db::update`], additionally requiring `post_sql`'s condition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CasVersionMismatch`] when the version is null or no row matched.
    pub async fn update_where<T: Entity>(
        &self, entity: &mut T, post_sql: &str, args: Vec<Arg>,
    ) -> Result<u64> {
        let query = UpdateBuilder::new(&*entity).post_sql(post_sql, args).build(self.dialect())?;
        self.apply_update(entity, query).await
    }

    /// Apply a caller-written SET clause to the row keyed by `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a blank SET clause.
    pub async fn update_custom<T: Entity>(
        &self, entity: &mut T, set_sql: &str, args: Vec<Arg>,
    ) -> Result<u64> {
        let query = CustomUpdateBuilder::new(&*entity, set_sql, args).build(self.dialect())?;
        self.apply_update(entity, Some(query)).await
    }

    /// Apply a caller-written SET clause to every live row matched by `post_sql`.
    ///
    /// `args` bind the placeholders of `set_sql` first, then those of `post_sql`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a blank SET clause.
    pub async fn update_all<T: Entity>(
        &self, set_sql: &str, post_sql: &str, args: Vec<Arg>,
    ) -> Result<u64> {
        let query = UpdateAllBuilder::<T>::new(set_sql, post_sql, args).build(self.dialect())?;
        self.exec(&query, Target::of::<T>(Operation::Update)).await
    }

    /// Update every entity with one statement, skipping null fields per row.
    ///
    /// With a CAS column, versions advance in memory only when every row matched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CasVersionMismatch`] when a version is null (before
    /// any SQL runs) or when fewer rows matched than were given; rows that did
    /// match stay updated.
    pub async fn update_batch<T: Entity>(&self, entities: &mut [T]) -> Result<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        let meta = meta::<T>();
        let Some(query) = BatchUpdateBuilder::new(entities).build(self.dialect())? else {
            return Ok(0);
        };
        let affected = self.exec(&query, Target::of::<T>(Operation::Update)).await?;

        if meta.cas_column()?.is_some() {
            let expected = u64::try_from(entities.len()).unwrap_or(u64::MAX);
            if affected < expected {
                return Err(Error::CasVersionMismatch { affected });
            }
            for entity in entities.iter_mut() {
                advance_cas_version(meta, entity)?;
            }
        }
        Ok(affected)
    }

    /// Delete the row keyed by `entity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullKeyValue`] when a key field is null.
    pub async fn delete_by_key<T: Entity>(&self, entity: &T) -> Result<u64> {
        let builder = DeleteBuilder::by_keys(std::slice::from_ref(entity), self.dialect())?;
        self.apply_delete(builder).await
    }

    /// Delete the row whose single key column equals `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotOnlyOneKeyColumn`] for composite keys.
    pub async fn delete_by_key_value<T: Entity>(&self, key: impl Into<Value> + Send) -> Result<u64> {
        let builder = DeleteBuilder::<T>::by_key_value(key.into(), self.dialect())?;
        self.apply_delete(builder).await
    }

    /// Delete the rows keyed by `entities` with one statement.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullKeyValue`] when a key field is null.
    pub async fn delete_batch<T: Entity>(&self, entities: &[T]) -> Result<u64> {
        if entities.is_empty() {
            return Ok(0);
        }
        let builder = DeleteBuilder::by_keys(entities, self.dialect())?;
        self.apply_delete(builder).await
    }

    /// Delete the rows matched by `post_sql`, which must carry a WHERE clause.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a fragment without a WHERE clause.
    pub async fn delete_where<T: Entity>(&self, post_sql: &str, args: Vec<Arg>) -> Result<u64> {
        self.apply_delete(DeleteBuilder::<T>::new(post_sql, args)).await
    }

    /// Fill every relation field of `items`, one fetch per field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a relation naming undeclared columns.
    pub async fn handle_relations<T: Entity>(&self, items: &mut [T]) -> Result<()> {
        self.resolve_relations(items, None).await
    }

    /// Fill only the relation fields named in `fields`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a name is not a relation field of `T`.
    pub async fn handle_relations_named<T: Entity>(&self, items: &mut [T], fields: &[&str]) -> Result<()> {
        self.resolve_relations(items, Some(fields)).await
    }

    /// Run `callback` once the current transaction commits.
    ///
    /// Returns `false`, with a warning, when no transaction is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for a missing callback.
    pub fn execute_after_commit(&self, callback: Option<AfterCommit>) -> Result<bool> {
        let callback = callback.ok_or_else(|| Error::invalid("after-commit callback is missing"))?;
        let Some(tx) = self.inner.conn.current_transaction() else {
            tracing::warn!("no open transaction, after-commit callback dropped");
            return Ok(false);
        };
        tx.register_after_commit(callback);
        Ok(true)
    }

    /// Mark the current transaction rollback-only.
    ///
    /// Returns `false`, with a warning, when no transaction is open.
    ///
    /// # Errors
    ///
    /// Infallible today; kept fallible for connections that report failures.
    pub fn rollback(&self) -> Result<bool> {
        let Some(tx) = self.inner.conn.current_transaction() else {
            tracing::warn!("no open transaction to roll back");
            return Ok(false);
        };
        tx.mark_rollback_only();
        Ok(true)
    }

    async fn select<T: Entity>(&self, builder: SelectBuilder<T>) -> Result<Vec<T>> {
        let query = builder.build(self.dialect(), &self.features())?;
        let rows = self.query_rows(&query, Target::of::<T>(Operation::Select)).await?;
        let mut items = self.map_rows(&rows)?;
        self.handle_relations(&mut items).await?;
        Ok(items)
    }

    async fn page<T: Entity>(
        &self, page: u64, page_size: u64, post_sql: &str, args: Vec<Arg>, with_total: bool,
    ) -> Result<PageData<T>> {
        if page == 0 || page_size == 0 {
            return Err(Error::invalid(format!("page {page} of size {page_size} is out of range")));
        }
        let mut page_size = page_size;
        if let Some(max) = self.inner.options.max_page_size
            && page_size > max
        {
            tracing::warn!(requested = page_size, max, "page size clamped");
            page_size = max;
        }
        let offset = (page - 1)
            .checked_mul(page_size)
            .ok_or_else(|| Error::invalid(format!("page {page} of size {page_size} overflows")))?;

        let builder = SelectBuilder::<T>::new().post_sql(post_sql, args);
        let target = Target::of::<T>(Operation::Select);
        let (rows, total) = if with_total {
            self.page_with_total(builder, offset, page_size).await?
        } else {
            let query = builder.page(offset, page_size).build(self.dialect(), &self.features())?;
            (self.query_rows(&query, target).await?, -1)
        };

        let mut data = self.map_rows(&rows)?;
        self.handle_relations(&mut data).await?;
        Ok(PageData { total, data, page_size })
    }

    // The page rows and the unpaged total from the same statement.
    async fn page_with_total<T: Entity>(
        &self, builder: SelectBuilder<T>, offset: u64, page_size: u64,
    ) -> Result<(Vec<Row>, i64)> {
        let target = Target::of::<T>(Operation::Select);
        let query = builder.clone().page(offset, page_size).with_total().build(self.dialect(), &self.features())?;
        let rows = self.query_rows(&query, target).await?;

        let total = match self.dialect() {
            Dialect::MySql => {
                // must follow the paged statement with nothing in between
                let found = finish(meta::<T>().name, "SELECT FOUND_ROWS()".to_string(), Vec::new())?;
                let counted = self.query_rows(&found, None).await?;
                counted.first().and_then(Row::first).and_then(DataType::as_i64).unwrap_or_default()
            }
            Dialect::Sqlite => match rows.first() {
                Some(row) => window_total(row),
                None if offset == 0 => 0,
                None => {
                    // past the last page: probe the first row for the total
                    let probe = builder.page(0, 1).with_total().build(self.dialect(), &self.features())?;
                    let probed = self.query_rows(&probe, None).await?;
                    probed.first().map_or(0, window_total)
                }
            },
        };
        Ok((rows, total))
    }

    async fn resolve_relations<T: Entity>(&self, items: &mut [T], fields: Option<&[&str]>) -> Result<()> {
        let relations = T::relations();
        if let Some(fields) = fields
            && let Some(unknown) = fields.iter().find(|f| !relations.iter().any(|r| r.field() == **f))
        {
            return Err(Error::config(format!("`{}` has no relation field `{unknown}`", meta::<T>().name)));
        }
        if items.is_empty() {
            return Ok(());
        }

        for relation in relations {
            if fields.is_some_and(|fields| !fields.contains(&relation.field())) {
                continue;
            }
            relation.resolve(self, items).await?;
        }
        Ok(())
    }

    async fn apply_update<T: Entity>(&self, entity: &mut T, query: Option<Query>) -> Result<u64> {
        let Some(query) = query else {
            return Ok(0);
        };
        let meta = meta::<T>();
        let affected = self.exec(&query, Target::of::<T>(Operation::Update)).await?;

        if meta.cas_column()?.is_some() {
            if affected == 0 {
                return Err(Error::CasVersionMismatch { affected });
            }
            advance_cas_version(meta, entity)?;
        }
        Ok(affected)
    }

    async fn apply_delete<T: Entity>(&self, builder: DeleteBuilder<T>) -> Result<u64> {
        let mut affected = 0;
        for query in builder.build(self.dialect())? {
            affected = self.exec(&query, Target::of::<T>(Operation::Delete)).await?;
        }
        Ok(affected)
    }

    fn map_rows<T: Entity>(&self, rows: &[Row]) -> Result<Vec<T>> {
        let strict = self.features().is_on(Feature::UnknownColumnFatal);
        rows.iter().map(|row| map_row(row, strict)).collect()
    }

    async fn query_rows(&self, query: &Query, target: Option<Target>) -> Result<Vec<Row>> {
        let sql = self.before(query, target)?;
        let started = Instant::now();
        let rows = self.inner.conn.query(sql.clone(), query.params.clone()).await?;
        self.after(query, target, &sql, started, len_u64(rows.len()));
        Ok(rows)
    }

    async fn exec(&self, query: &Query, target: Option<Target>) -> Result<u64> {
        let sql = self.before(query, target)?;
        let started = Instant::now();
        let affected = self.inner.conn.exec(sql.clone(), query.params.clone()).await?;
        self.after(query, target, &sql, started, affected);
        Ok(affected)
    }

    async fn exec_insert(&self, query: &Query, target: Option<Target>) -> Result<Inserted> {
        let sql = self.before(query, target)?;
        let started = Instant::now();
        let inserted = self.inner.conn.exec_returning_id(sql.clone(), query.params.clone()).await?;
        self.after(query, target, &sql, started, inserted.rows);
        Ok(inserted)
    }

    // Interceptor veto, comment prefix and statement log.
    fn before(&self, query: &Query, target: Option<Target>) -> Result<String> {
        if let Some(Target { operation, meta }) = target {
            for interceptor in &self.inner.interceptors {
                if !interceptor.before(operation, meta, query) {
                    return Err(Error::InterceptorRejected {
                        operation: operation.as_str(),
                        entity: meta.name,
                    });
                }
            }
        }

        let scoped = scope::comment();
        let global = self.inner.options.global_comment.as_deref().unwrap_or_default();
        let sql = with_comments(query.sql.clone(), &[global, scoped.as_deref().unwrap_or_default()]);

        let operation = target.map_or("raw", |t| t.operation.as_str());
        if self.features().is_on(Feature::LogSqlAtInfo) {
            tracing::info!(operation, sql = %sql, params = ?query.params, "executing SQL");
        } else {
            tracing::debug!(operation, sql = %sql, params = ?query.params, "executing SQL");
        }
        Ok(sql)
    }

    // Slow-statement report and interceptor notification.
    fn after(&self, query: &Query, target: Option<Target>, sql: &str, started: Instant, affected: u64) {
        let elapsed = started.elapsed();
        if elapsed > self.inner.options.slow_sql_threshold {
            tracing::warn!(sql, elapsed_ms = elapsed.as_millis(), "slow SQL");
            if let Some(callback) = &self.inner.slow_sql {
                let slow = SlowSql {
                    sql,
                    params: &query.params,
                    elapsed,
                };
                if let Err(e) = callback(&slow) {
                    tracing::error!(error = %e, "slow SQL callback failed");
                }
            }
        }

        if let Some(Target { operation, meta }) = target {
            for interceptor in self.inner.interceptors.iter().rev() {
                interceptor.after(operation, meta, query, affected);
            }
        }
    }
}

fn window_total(row: &Row) -> i64 {
    row.get(TOTAL_LABEL).and_then(DataType::as_i64).unwrap_or_default()
}

fn key_text(value: Option<Value>) -> Result<Option<String>> {
    match value {
        Some(value) => Ok(value_to_datatype(value)?.as_text()),
        None => Ok(None),
    }
}

fn len_u64(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}
