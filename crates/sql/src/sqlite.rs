//! `SQLite` implementation of [`Connection`].
//!
//! Intended for development and tests. Every clone shares one underlying
//! session, so statements issued in sequence observe each other's state.

#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::cast_possible_wrap)]
#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use fromenv::FromEnv;
use futures::FutureExt;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection as RawConnection, params_from_iter};
use tracing::instrument;

use crate::resource::{
    AfterCommit, Backend, Connection, Flavor, FutureResult, Inserted, Transaction,
};
use crate::types::{DataType, Field, Row};

/// Options used to open the `SQLite` database.
///
/// This struct is used to load connection options from environment variables.
#[derive(Debug, Clone, FromEnv)]
pub struct ConnectOptions {
    #[env(from = "SQL_DATABASE", default = "file::memory:?cache=shared")]
    pub database: String,
}

impl crate::FromEnv for ConnectOptions {
    fn from_env() -> Result<Self> {
        Self::from_env().finalize().context("issue loading connection options")
    }
}

/// A shared `SQLite` session with explicit transaction control.
#[derive(Debug, Clone)]
pub struct SqliteConnection {
    // rusqlite::Connection isn't `Sync`
    conn: Arc<Mutex<RawConnection>>,
    tx: Arc<Mutex<Option<Arc<SqliteTransaction>>>>,
}

impl Backend for SqliteConnection {
    type ConnectOptions = ConnectOptions;

    #[instrument]
    async fn connect_with(options: Self::ConnectOptions) -> Result<Self> {
        tracing::debug!("initializing SQLite connection to: {}", options.database);

        let conn =
            RawConnection::open(&options.database).context("failed to open SQLite database")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tx: Arc::new(Mutex::new(None)),
        })
    }
}

impl SqliteConnection {
    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if `SQLite` cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = RawConnection::open_in_memory().context("failed to open SQLite database")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tx: Arc::new(Mutex::new(None)),
        })
    }

    /// Start a transaction on the shared session.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction is already open or `BEGIN` fails.
    pub fn begin(&self) -> Result<Arc<dyn Transaction>> {
        let mut current = self.tx.lock();
        if current.is_some() {
            bail!("a transaction is already open");
        }
        self.conn.lock().execute_batch("BEGIN").context("failed to begin transaction")?;

        let tx = Arc::new(SqliteTransaction::default());
        *current = Some(Arc::clone(&tx));
        tracing::debug!("transaction started");
        Ok(tx)
    }

    /// Commit the open transaction and run its after-commit callbacks.
    ///
    /// A transaction marked rollback-only is rolled back instead. Returns
    /// whether the transaction committed.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open or `COMMIT` fails.
    pub fn commit(&self) -> Result<bool> {
        let Some(tx) = self.tx.lock().take() else {
            bail!("no transaction is open");
        };

        if tx.is_rollback_only() {
            self.conn.lock().execute_batch("ROLLBACK").context("failed to roll back")?;
            tracing::debug!("transaction marked rollback-only, rolled back");
            return Ok(false);
        }

        self.conn.lock().execute_batch("COMMIT").context("failed to commit transaction")?;

        let callbacks = std::mem::take(&mut *tx.callbacks.lock());
        for callback in callbacks {
            if let Err(e) = callback() {
                tracing::error!(error = %e, "after-commit callback failed");
            }
        }
        Ok(true)
    }

    /// Roll back the open transaction, discarding its after-commit callbacks.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open or `ROLLBACK` fails.
    pub fn rollback(&self) -> Result<()> {
        let Some(tx) = self.tx.lock().take() else {
            bail!("no transaction is open");
        };
        tx.callbacks.lock().clear();
        self.conn.lock().execute_batch("ROLLBACK").context("failed to roll back")?;
        tracing::debug!("transaction rolled back");
        Ok(())
    }
}

impl Connection for SqliteConnection {
    fn query(&self, query: String, params: Vec<DataType>) -> FutureResult<Vec<Row>> {
        tracing::trace!("executing query: {}", query);
        let conn = Arc::clone(&self.conn);

        async move {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&query).context("failed to prepare statement")?;

            let sqlite_params: Vec<_> = params.iter().map(datatype_to_sqlite_value).collect();
            let column_names: Vec<String> =
                stmt.column_names().iter().map(ToString::to_string).collect();

            let mut rows = stmt
                .query(params_from_iter(sqlite_params.iter()))
                .context("failed to execute query")?;

            let mut result_rows = Vec::new();
            let mut index = 0;
            while let Some(row) = rows.next().context("failed to fetch row")? {
                let mut fields = Vec::with_capacity(column_names.len());
                for (i, name) in column_names.iter().enumerate() {
                    let value = row.get_ref(i).context("failed to get column value")?;
                    fields.push(Field {
                        name: name.clone(),
                        value: sqlite_value_to_datatype(value)?,
                    });
                }

                result_rows.push(Row {
                    index: index.to_string(),
                    fields,
                });
                index += 1;
            }

            Ok(result_rows)
        }
        .boxed()
    }

    fn exec(&self, query: String, params: Vec<DataType>) -> FutureResult<u64> {
        tracing::trace!("executing statement: {}", query);
        let conn = Arc::clone(&self.conn);

        async move {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&query).context("failed to prepare statement")?;
            let sqlite_params: Vec<_> = params.iter().map(datatype_to_sqlite_value).collect();

            let rows_affected = stmt
                .execute(params_from_iter(sqlite_params.iter()))
                .context("failed to execute statement")?;

            Ok(rows_affected as u64)
        }
        .boxed()
    }

    fn exec_returning_id(&self, query: String, params: Vec<DataType>) -> FutureResult<Inserted> {
        tracing::trace!("executing insert: {}", query);
        let conn = Arc::clone(&self.conn);

        async move {
            let conn = conn.lock();
            let mut stmt = conn.prepare(&query).context("failed to prepare statement")?;
            let sqlite_params: Vec<_> = params.iter().map(datatype_to_sqlite_value).collect();

            let rows = stmt
                .execute(params_from_iter(sqlite_params.iter()))
                .context("failed to execute insert")?;
            let last_id = (rows > 0).then(|| conn.last_insert_rowid());

            Ok(Inserted {
                rows: rows as u64,
                last_id,
            })
        }
        .boxed()
    }

    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.tx.lock().as_ref().map(|tx| Arc::clone(tx) as Arc<dyn Transaction>)
    }

    fn flavor(&self) -> Flavor {
        Flavor::Sqlite
    }
}

#[derive(Default)]
struct SqliteTransaction {
    callbacks: Mutex<Vec<AfterCommit>>,
    rollback_only: AtomicBool,
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("callbacks", &self.callbacks.lock().len())
            .field("rollback_only", &self.is_rollback_only())
            .finish()
    }
}

impl Transaction for SqliteTransaction {
    fn register_after_commit(&self, callback: AfterCommit) {
        self.callbacks.lock().push(callback);
    }

    fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }
}

fn datatype_to_sqlite_value(dt: &DataType) -> rusqlite::types::Value {
    use rusqlite::types::Value;

    match dt {
        DataType::Boolean(Some(b)) => Value::Integer(i64::from(*b)),
        DataType::Int32(Some(i)) => Value::Integer(i64::from(*i)),
        DataType::Int64(Some(i)) => Value::Integer(*i),
        DataType::Uint32(Some(u)) => Value::Integer(i64::from(*u)),
        DataType::Uint64(Some(u)) => Value::Integer(*u as i64),
        DataType::Float(Some(f)) => Value::Real(f64::from(*f)),
        DataType::Double(Some(f)) => Value::Real(*f),
        DataType::Str(Some(s))
        | DataType::Date(Some(s))
        | DataType::Time(Some(s))
        | DataType::Timestamp(Some(s)) => Value::Text(s.clone()),
        DataType::Binary(Some(b)) => Value::Blob(b.clone()),
        _ => Value::Null,
    }
}

fn sqlite_value_to_datatype(value: ValueRef) -> Result<DataType> {
    match value {
        ValueRef::Null => Ok(DataType::NULL),
        ValueRef::Integer(i) => Ok(DataType::Int64(Some(i))),
        ValueRef::Real(f) => Ok(DataType::Double(Some(f))),
        ValueRef::Text(t) => {
            let s = std::str::from_utf8(t).context("invalid UTF-8 in text value")?;
            Ok(DataType::Str(Some(s.to_string())))
        }
        ValueRef::Blob(b) => Ok(DataType::Binary(Some(b.to_vec()))),
    }
}
