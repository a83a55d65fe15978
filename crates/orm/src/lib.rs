//! Entity-to-SQL mapping engine.
//!
//! Plain structs are annotated with table, column, key and relation metadata;
//! the engine writes parameterized SQL for them, runs it through a
//! [`strata_sql::Connection`] and maps rows back into structs, relations
//! included. Soft delete and optimistic concurrency (CAS version columns) are
//! applied to every generated statement.
//!
//! # Quick Start
//!
//! ## Define an Entity
//!
//! ```ignore
//! use strata_orm::Entity;
//!
//! #[derive(Debug, Clone, Default, Entity)]
//! #[table(name = "t_student")]
//! pub struct Student {
//!     #[column(key, auto_increment)]
//!     pub id: Option<i64>,
//!     pub name: Option<String>,
//!     pub school_id: Option<i64>,
//!     #[column(cas_version)]
//!     pub version: Option<i32>,
//!     #[column(soft_delete)]
//!     pub deleted: Option<bool>,
//!     #[relation(local = "school_id", remote = "id")]
//!     pub school: Option<School>,
//!     #[relation(local = "id", remote = "student_id", extra_where = "WHERE score > 60")]
//!     pub passed: Option<Vec<Course>>,
//! }
//! ```
//!
//! ## Reads and Writes
//!
//! ```ignore
//! use strata_orm::{Arg, Db, params};
//!
//! let db = Db::new(connection);
//!
//! let mut student = Student { name: Some("nick".into()), ..Student::default() };
//! db.insert(&mut student).await?;                 // id written back, version = 1
//!
//! student.name = Some("nicky".into());
//! db.update(&mut student).await?;                 // version = 2, nulls untouched
//!
//! let page = db
//!     .get_page::<Student>(2, 10, "WHERE name LIKE ? OR school_id IN (?)", params!["n%", Arg::list([1, 2])])
//!     .await?;                                    // deleted rows never leak through the OR
//!
//! db.delete_by_key(&student).await?;             // sets `deleted = 1`
//! ```
//!
//! ## Scoped Overrides
//!
//! ```ignore
//! let archived = db
//!     .scope()
//!     .table_name::<Student>("t_student_del")
//!     .comment("archive-report")
//!     .run(db.get_all::<Student>("WHERE school_id = ?", params![3]))
//!     .await?;
//! ```

// lets `#[derive(Entity)]` output in unit tests name this crate
#[cfg(test)]
extern crate self as strata_orm;

mod db;
mod delete;
mod diff;
mod entity;
mod error;
mod fragment;
mod insert;
mod interceptor;
mod mapper;
mod meta;
mod options;
mod query;
mod relation;
mod scope;
mod select;
mod update;

pub use db::{Db, DbBuilder, PageData, SlowSql};
pub use delete::DeleteBuilder;
pub use entity::{Entity, FetchValue, ToColumn};
pub use error::{Error, Result};
pub use fragment::PostSql;
pub use insert::InsertBuilder;
pub use interceptor::{Interceptor, Operation};
pub use meta::{
    Cardinality, ColumnSpec, EntityMeta, JoinKind, JoinSpec, LEFT_ALIAS, RIGHT_ALIAS, RelationSpec, meta,
};
pub use options::{Feature, Features, Options};
pub use query::{Arg, Dialect, Query};
pub use relation::{DataProvider, JoinSide, Many, One, ProviderRequest, Relation};
pub use scope::Scope;
pub use select::SelectBuilder;
// Re-export the collaborator types used in parameters, rows and callbacks.
pub use strata_sql::{AfterCommit, DataType, Field, Row};
pub use strata_orm_macro::Entity;
pub use update::{BatchUpdateBuilder, CustomUpdateBuilder, UpdateAllBuilder, UpdateBuilder};

// Re-exports for `#[derive(Entity)]` output only.
#[doc(hidden)]
pub mod __private {
    pub use sea_query::Value;

    pub use crate::entity::{fetch_column, json_from_column, json_to_column};
    pub use crate::mapper::map_side;
}
