//! # Strata SQL
//!
//! The database capability consumed by the Strata mapping engine: dynamically
//! typed values and rows, the [`Connection`] and [`Transaction`] traits, and a
//! `SQLite` backed implementation for development and tests.

mod resource;
#[cfg(feature = "sqlite")]
mod sqlite;
mod types;

pub use self::resource::*;
#[cfg(feature = "sqlite")]
pub use self::sqlite::{ConnectOptions, SqliteConnection};
pub use self::types::*;
