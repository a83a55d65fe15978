//! Common test helpers shared across integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use strata_orm::{
    DataProvider, Db, Dialect, Entity, EntityMeta, Interceptor, Operation, Options, ProviderRequest,
    Query,
};
use strata_sql::{Connection, SqliteConnection};

// Common test entities used across multiple test files

#[derive(Debug, Clone, Default, Entity)]
#[table(name = "t_student", soft_delete_table = "t_student_del")]
pub struct Student {
    #[column(key, auto_increment)]
    pub id: Option<i64>,
    pub name: Option<String>,
    pub age: Option<i32>,
    pub school_id: Option<i64>,
    #[column(cas_version)]
    pub version: Option<i32>,
    #[column(soft_delete)]
    pub deleted: Option<bool>,
    #[relation(local = "id", remote = "student_id")]
    pub courses: Option<Vec<Course>>,
    #[relation(local = "id", remote = "student_id", extra_where = "score >= 60")]
    pub passed: Option<Vec<Course>>,
    #[relation(local = "school_id", remote = "id")]
    pub school: Option<School>,
}

#[derive(Debug, Clone, Default, Entity)]
#[table(name = "t_school")]
pub struct School {
    #[column(key)]
    pub id: Option<i64>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Entity)]
#[table(name = "t_course")]
pub struct Course {
    #[column(key, auto_increment)]
    pub id: Option<i64>,
    pub student_id: Option<i64>,
    pub name: Option<String>,
    pub score: Option<i32>,
    #[column(soft_delete)]
    pub deleted: Option<bool>,
}

/// Students with their school; students without one keep a `None` school.
#[derive(Debug, Default, Entity)]
#[join(kind = "left", on = "t1.school_id = t2.id")]
pub struct StudentSchool {
    #[join_left]
    pub student: Option<Student>,
    #[join_right]
    pub school: Option<School>,
}

/// A narrow view of `t_student` whose courses come from [`CourseProvider`].
#[derive(Debug, Clone, Default, Entity)]
#[table(name = "t_student")]
pub struct StudentCard {
    #[column(key)]
    pub id: Option<i64>,
    pub name: Option<String>,
    #[relation(local = "id", remote = "student_id", provider = CourseProvider)]
    pub courses: Option<Vec<Course>>,
}

/// Number of [`CourseProvider`] instances ever built.
pub static PROVIDERS_BUILT: AtomicUsize = AtomicUsize::new(0);

/// Supplies one synthetic course per requested student id.
#[derive(Debug)]
pub struct CourseProvider;

impl Default for CourseProvider {
    fn default() -> Self {
        PROVIDERS_BUILT.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl DataProvider<Course> for CourseProvider {
    fn fetch<'a>(&'a self, _db: &'a Db, request: ProviderRequest<'a>) -> BoxFuture<'a, strata_orm::Result<Vec<Course>>> {
        async move {
            Ok(request
                .values
                .iter()
                .map(|value| Course {
                    student_id: value.as_i64(),
                    name: Some(format!("provided by {}", request.remote.name)),
                    ..Course::default()
                })
                .collect())
        }
        .boxed()
    }
}

/// Statement counts seen by a [`Recorder`].
#[derive(Debug, Default)]
pub struct Counts {
    pub selects: AtomicUsize,
    pub course_selects: AtomicUsize,
    pub writes: AtomicUsize,
}

/// Counts statements per operation and optionally vetoes one operation.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    pub counts: Arc<Counts>,
    pub veto: Option<Operation>,
}

impl Recorder {
    pub fn course_selects(&self) -> usize {
        self.counts.course_selects.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.counts.writes.load(Ordering::SeqCst)
    }
}

impl Interceptor for Recorder {
    fn before(&self, operation: Operation, meta: &EntityMeta, _query: &Query) -> bool {
        if self.veto == Some(operation) {
            return false;
        }
        if operation == Operation::Select {
            self.counts.selects.fetch_add(1, Ordering::SeqCst);
            if meta.table == "t_course" {
                self.counts.course_selects.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            self.counts.writes.fetch_add(1, Ordering::SeqCst);
        }
        true
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE t_student (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, age INTEGER, \
     school_id INTEGER, version INTEGER, deleted INTEGER NOT NULL DEFAULT 0)",
    "CREATE TABLE t_student_del (id INTEGER, name TEXT, age INTEGER, school_id INTEGER, \
     version INTEGER, deleted INTEGER)",
    "CREATE TABLE t_school (id INTEGER PRIMARY KEY, name TEXT)",
    "CREATE TABLE t_course (id INTEGER PRIMARY KEY AUTOINCREMENT, student_id INTEGER, name TEXT, \
     score INTEGER, deleted INTEGER NOT NULL DEFAULT 0)",
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `SQLite` options for the in-memory test database.
pub fn sqlite_options() -> Options {
    Options {
        dialect: Some(Dialect::Sqlite),
        ..Options::default()
    }
}

/// A fresh in-memory database with the test schema.
pub async fn connection() -> SqliteConnection {
    init_tracing();
    let conn = SqliteConnection::open_in_memory().expect("open database");
    for statement in SCHEMA {
        conn.exec((*statement).to_string(), Vec::new()).await.expect("create schema");
    }
    conn
}

/// A `Db` over a fresh database, plus the connection for transaction control.
pub async fn setup() -> (Db, SqliteConnection) {
    let conn = connection().await;
    let db = Db::builder(conn.clone()).options(sqlite_options()).build();
    (db, conn)
}

pub fn student(name: &str, age: i32) -> Student {
    Student {
        name: Some(name.to_string()),
        age: Some(age),
        ..Student::default()
    }
}

// Identifier quotes dropped (string literals kept) and whitespace collapsed.
fn canonical(sql: &str) -> String {
    let mut in_literal = false;
    let unquoted: String = sql
        .chars()
        .filter(|&ch| {
            if ch == '\'' {
                in_literal = !in_literal;
            }
            in_literal || !matches!(ch, '"' | '`')
        })
        .collect();
    unquoted.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Assert that `actual` contains every fragment, in order, ignoring identifier
/// quoting and whitespace so one set of fragments holds for either dialect.
pub fn assert_sql_contains(actual: &str, fragments: &[&str]) {
    let actual = canonical(actual);
    let mut rest = actual.as_str();
    for fragment in fragments.iter().map(|f| canonical(f)) {
        match rest.find(&fragment) {
            Some(at) => rest = &rest[at + fragment.len()..],
            None => panic!("`{fragment}` not found in order in `{actual}`"),
        }
    }
}
