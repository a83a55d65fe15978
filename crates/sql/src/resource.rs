use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;

use crate::types::{DataType, Row};

/// Result type for asynchronous operations.
pub type FutureResult<T> = BoxFuture<'static, Result<T>>;

/// Callback run once the surrounding transaction has committed.
pub type AfterCommit = Box<dyn FnOnce() -> Result<()> + Send>;

/// SQL providers implement the [`Connection`] trait to let the mapping engine
/// execute statements against a backend (`MySQL`, `SQLite`, etc).
///
/// Calls issued back to back on one connection must run on the same session
/// and in order; the engine relies on this to read session state (such as
/// `FOUND_ROWS()`) produced by the immediately preceding statement.
pub trait Connection: Debug + Send + Sync + 'static {
    /// Execute a query and return the resulting rows.
    fn query(&self, query: String, params: Vec<DataType>) -> FutureResult<Vec<Row>>;

    /// Execute a statement that does not return rows (e.g., an `INSERT`, `UPDATE`, or `DELETE`).
    fn exec(&self, query: String, params: Vec<DataType>) -> FutureResult<u64>;

    /// Execute an `INSERT` and report the generated key, when the backend exposes one.
    fn exec_returning_id(&self, query: String, params: Vec<DataType>) -> FutureResult<Inserted>;

    /// The transaction currently open on this connection, if any.
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        None
    }

    /// SQL flavor the backend speaks.
    fn flavor(&self) -> Flavor {
        Flavor::MySql
    }
}

/// SQL flavor spoken by a [`Connection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Flavor {
    /// `MySQL` and compatible servers.
    #[default]
    MySql,
    /// `SQLite`.
    Sqlite,
}

/// Outcome of [`Connection::exec_returning_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    /// Number of rows inserted.
    pub rows: u64,

    /// Generated key of the last inserted row.
    pub last_id: Option<i64>,
}

/// Handle to an open transaction.
pub trait Transaction: Debug + Send + Sync {
    /// Run `callback` after the transaction commits. Callbacks are dropped on rollback.
    fn register_after_commit(&self, callback: AfterCommit);

    /// Force the transaction to roll back when it completes.
    fn mark_rollback_only(&self);

    /// Whether [`Transaction::mark_rollback_only`] has been called.
    fn is_rollback_only(&self) -> bool;
}

/// Implemented by backend resources to allow them to be connected from
/// environment-provided options.
pub trait Backend: Sized + Sync + Send {
    /// The options used to connect to the backend.
    type ConnectOptions: FromEnv;

    /// Connect to the resource.
    #[must_use]
    fn connect() -> impl Future<Output = Result<Self>> {
        async { Self::connect_with(Self::ConnectOptions::from_env()?).await }
    }

    /// Connect to the resource with the specified options.
    fn connect_with(options: Self::ConnectOptions) -> impl Future<Output = Result<Self>>;
}

/// Trait for creating options from environment variables.
pub trait FromEnv: Sized {
    /// Create options from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    fn from_env() -> Result<Self>;
}
