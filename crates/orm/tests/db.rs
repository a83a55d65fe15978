//! End-to-end behavior of `Db` against an in-memory `SQLite` database.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use common::{
    Course, PROVIDERS_BUILT, Recorder, School, Student, StudentCard, StudentSchool, connection, setup,
    sqlite_options, student,
};
use parking_lot::Mutex;
use strata_orm::{Db, Dialect, Entity, Error, Feature, Operation, Options, params};
use strata_sql::{AfterCommit, Connection, Transaction};

async fn course(db: &Db, student_id: i64, name: &str, score: i32) -> Course {
    let mut course = Course {
        student_id: Some(student_id),
        name: Some(name.to_string()),
        score: Some(score),
        ..Course::default()
    };
    db.insert(&mut course).await.expect("insert course");
    course
}

async fn school(db: &Db, id: i64, name: &str) {
    let mut school = School {
        id: Some(id),
        name: Some(name.to_string()),
    };
    db.insert(&mut school).await.expect("insert school");
}

#[tokio::test]
async fn insert_writes_back_key_and_version() {
    let (db, _conn) = setup().await;

    let mut amy = student("amy", 20);
    assert_eq!(db.insert(&mut amy).await.unwrap(), 1);
    assert_eq!(amy.id, Some(1));
    assert_eq!(amy.version, Some(1));

    let stored: Student = db.get_by_key(1_i64).await.unwrap().expect("stored");
    assert_eq!(stored.name.as_deref(), Some("amy"));
    assert_eq!(stored.deleted, Some(false));
}

#[tokio::test]
async fn cas_version_guards_updates() {
    let (db, _conn) = setup().await;
    let mut amy = student("amy", 20);
    db.insert(&mut amy).await.unwrap();
    let stale = amy.clone();

    amy.name = Some("amy b".to_string());
    amy.age = None;
    assert_eq!(db.update(&mut amy).await.unwrap(), 1);
    assert_eq!(amy.version, Some(2));

    let stored: Student = db.get_by_key(amy.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(stored.version, Some(2));
    assert_eq!(stored.name.as_deref(), Some("amy b"));
    // null fields are left alone
    assert_eq!(stored.age, Some(20));

    let mut stale = stale;
    stale.name = Some("lost".to_string());
    assert!(matches!(db.update(&mut stale).await, Err(Error::CasVersionMismatch { affected: 0 })));
    assert_eq!(stale.version, Some(1));
}

#[tokio::test]
async fn update_with_null_clears_fields() {
    let (db, _conn) = setup().await;
    let mut amy = student("amy", 20);
    db.insert(&mut amy).await.unwrap();

    amy.age = None;
    db.update_with_null(&mut amy).await.unwrap();

    let stored: Student = db.get_by_key(amy.id.unwrap()).await.unwrap().unwrap();
    assert_eq!(stored.age, None);
    assert_eq!(stored.version, Some(2));
}

#[tokio::test]
async fn batch_update_reports_partial_match() {
    let (db, _conn) = setup().await;
    let mut rows = vec![student("a", 1), student("b", 2), student("c", 3)];
    db.insert_batch(&mut rows).await.unwrap();

    for row in &mut rows {
        row.age = Some(40);
    }
    rows[1].version = Some(7);
    rows[2].version = Some(9);

    let err = db.update_batch(&mut rows).await.unwrap_err();
    assert!(matches!(err, Error::CasVersionMismatch { affected: 1 }));
    // versions stay put in memory when the batch did not fully match
    assert_eq!(rows[0].version, Some(1));

    let changed = db.get_count_where::<Student>("WHERE age = ?", params![40]).await.unwrap();
    assert_eq!(changed, 1);
    let first: Student = db.get_by_key(rows[0].id.unwrap()).await.unwrap().unwrap();
    assert_eq!(first.version, Some(2));
}

#[tokio::test]
async fn batch_update_advances_every_version() {
    let (db, _conn) = setup().await;
    let mut rows = vec![student("a", 1), student("b", 2)];
    db.insert_batch(&mut rows).await.unwrap();

    rows[0].name = Some("a2".to_string());
    rows[1].age = Some(22);
    assert_eq!(db.update_batch(&mut rows).await.unwrap(), 2);
    assert!(rows.iter().all(|row| row.version == Some(2)));

    let stored: Vec<Student> = db.get_all("ORDER BY id", params![]).await.unwrap();
    assert_eq!(stored[0].name.as_deref(), Some("a2"));
    assert_eq!(stored[0].age, Some(1));
    assert_eq!(stored[1].name.as_deref(), Some("b"));
    assert_eq!(stored[1].age, Some(22));
}

#[tokio::test]
async fn collection_relations_fill_and_preserve() {
    let (db, _conn) = setup().await;
    school(&db, 1, "north").await;

    let mut amy = student("amy", 20);
    amy.school_id = Some(1);
    db.insert(&mut amy).await.unwrap();
    let mut bob = student("bob", 21);
    db.insert(&mut bob).await.unwrap();

    let amy_id = amy.id.unwrap();
    course(&db, amy_id, "math", 50).await;
    course(&db, amy_id, "art", 80).await;

    let students: Vec<Student> = db.get_all("ORDER BY id", params![]).await.unwrap();
    let (amy, bob) = (&students[0], &students[1]);
    assert_eq!(amy.courses.as_ref().map(Vec::len), Some(2));
    let passed = amy.passed.as_ref().unwrap();
    assert_eq!(passed.len(), 1);
    assert_eq!(passed[0].name.as_deref(), Some("art"));
    assert_eq!(amy.school.as_ref().and_then(|s| s.name.as_deref()), Some("north"));

    assert!(bob.courses.as_ref().is_some_and(Vec::is_empty));
    assert!(bob.school.is_none());

    // values already present are kept when nothing matches
    let mut loaded = vec![Student {
        id: bob.id,
        school_id: Some(99),
        courses: Some(vec![Course {
            name: Some("kept".to_string()),
            ..Course::default()
        }]),
        school: Some(School {
            id: Some(99),
            name: Some("kept".to_string()),
        }),
        ..Student::default()
    }];
    db.handle_relations(&mut loaded).await.unwrap();
    assert_eq!(loaded[0].courses.as_ref().unwrap()[0].name.as_deref(), Some("kept"));
    assert_eq!(loaded[0].school.as_ref().unwrap().name.as_deref(), Some("kept"));
}

#[tokio::test]
async fn relations_fetch_once_per_field() {
    let conn = connection().await;
    let recorder = Recorder::default();
    let db = Db::builder(conn).options(sqlite_options()).interceptor(recorder.clone()).build();

    for n in 0..5 {
        let mut s = student(&format!("s{n}"), 20 + n);
        db.insert(&mut s).await.unwrap();
        course(&db, s.id.unwrap(), "math", 70).await;
    }
    assert_eq!(recorder.writes(), 10);

    let students: Vec<Student> = db.get_all("", params![]).await.unwrap();
    assert_eq!(students.len(), 5);
    assert!(students.iter().all(|s| s.courses.as_ref().is_some_and(|c| c.len() == 1)));
    // one query for `courses` and one for `passed`
    assert_eq!(recorder.course_selects(), 2);
}

#[tokio::test]
async fn named_relations_only() {
    let (db, _conn) = setup().await;
    let mut amy = student("amy", 20);
    db.insert(&mut amy).await.unwrap();
    course(&db, amy.id.unwrap(), "math", 90).await;

    let mut students: Vec<Student> = db.get_all_key("", params![]).await.unwrap();
    assert!(students[0].name.is_none());
    assert!(students[0].courses.is_none());

    db.handle_relations_named(&mut students, &["passed"]).await.unwrap();
    assert!(students[0].courses.is_none());
    assert_eq!(students[0].passed.as_ref().map(Vec::len), Some(1));

    let unknown = db.handle_relations_named(&mut students, &["grades"]).await;
    assert!(matches!(unknown, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn key_only_reads_tolerate_missing_columns() {
    let (db, _conn) = setup().await;
    let mut amy = student("amy", 20);
    db.insert(&mut amy).await.unwrap();

    let keys: Vec<Student> = db
        .scope()
        .feature(Feature::UnknownColumnFatal, true)
        .run(db.get_all_key("", params![]))
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].id, amy.id);
    assert!(keys[0].name.is_none());
}

#[tokio::test]
async fn provider_supplies_relation_rows() {
    let (db, _conn) = setup().await;
    let mut rows = vec![student("amy", 20), student("bob", 21)];
    db.insert_batch(&mut rows).await.unwrap();

    let cards: Vec<StudentCard> = db.get_all("ORDER BY id", params![]).await.unwrap();
    for card in &cards {
        let courses = card.courses.as_ref().unwrap();
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].student_id, card.id);
        assert_eq!(courses[0].name.as_deref(), Some("provided by Course"));
    }
}

#[test]
fn relation_handlers_are_built_once() {
    let first = StudentCard::relations();
    let second = StudentCard::relations();
    assert_eq!(first.len(), 1);
    assert!(Arc::ptr_eq(&first[0], &second[0]));
    assert_eq!(PROVIDERS_BUILT.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn soft_deleted_rows_never_leak() {
    let (db, conn) = setup().await;
    for n in 0..10 {
        db.insert(&mut student(&format!("live{n}"), 20)).await.unwrap();
        conn.exec(
            "INSERT INTO t_student (name, age, version, deleted) VALUES ('gone', 20, 1, 1)".to_string(),
            Vec::new(),
        )
        .await
        .unwrap();
    }

    let live: Vec<Student> = db.get_all("WHERE 1=1 OR 1=1", params![]).await.unwrap();
    assert_eq!(live.len(), 10);
    assert_eq!(db.get_count::<Student>().await.unwrap(), 10);

    let everything: Vec<Student> = db
        .scope()
        .without_soft_delete::<Student>()
        .run(db.get_all("WHERE 1=1 OR 1=1", params![]))
        .await
        .unwrap();
    assert_eq!(everything.len(), 20);
}

#[tokio::test]
async fn delete_moves_rows_to_log_table() {
    let (db, _conn) = setup().await;
    let mut amy = student("amy", 20);
    db.insert(&mut amy).await.unwrap();

    assert_eq!(db.delete_by_key(&amy).await.unwrap(), 1);
    assert!(db.get_by_key::<Student>(amy.id.unwrap()).await.unwrap().is_none());

    let logged: Vec<Student> = db
        .scope()
        .table_name::<Student>("t_student_del")
        .run(db.get_all("WHERE id = ?", params![amy.id.unwrap()]))
        .await
        .unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].name.as_deref(), Some("amy"));

    let remaining = db.get_raw_scalars::<i64>("SELECT COUNT(*) FROM t_student", params![]).await.unwrap();
    assert_eq!(remaining, vec![0]);
}

#[tokio::test]
async fn delete_marks_soft_rows() {
    let (db, _conn) = setup().await;
    let mut amy = student("amy", 20);
    db.insert(&mut amy).await.unwrap();
    let id = amy.id.unwrap();
    course(&db, id, "math", 40).await;
    course(&db, id, "art", 90).await;

    assert_eq!(db.delete_where::<Course>("WHERE score < ?", params![60]).await.unwrap(), 1);
    assert!(matches!(db.delete_where::<Course>("", params![]).await, Err(Error::InvalidParameter(_))));

    let live: Vec<Course> = db.get_all("", params![]).await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].name.as_deref(), Some("art"));

    let all: Vec<Course> =
        db.scope().without_soft_delete::<Course>().run(db.get_all("", params![])).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|c| c.deleted == Some(true)));

    // without soft delete the row is removed
    let removed = db
        .scope()
        .without_soft_delete::<Course>()
        .run(db.delete_by_key_value::<Course>(live[0].id.unwrap()))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    let left = db.get_raw_scalars::<i64>("SELECT COUNT(*) FROM t_course", params![]).await.unwrap();
    assert_eq!(left, vec![1]);
}

#[tokio::test]
async fn delete_batch_by_keys() {
    let (db, _conn) = setup().await;
    let mut rows = vec![student("a", 1), student("b", 2), student("c", 3)];
    db.insert_batch(&mut rows).await.unwrap();

    assert_eq!(db.delete_batch(&rows[..2]).await.unwrap(), 2);
    let names = db.get_raw_scalars::<String>("SELECT name FROM t_student", params![]).await.unwrap();
    assert_eq!(names, vec!["c".to_string()]);
}

#[tokio::test]
async fn pages_ignore_caller_limit() {
    let (db, _conn) = setup().await;
    for n in 0..25 {
        // five minors that the filter leaves out
        let age = if n < 5 { 10 } else { 18 + n };
        db.insert(&mut student(&format!("s{n}"), age)).await.unwrap();
    }

    let first = db.get_page::<Student>(1, 10, "WHERE age >= ? LIMIT 3", params![18]).await.unwrap();
    assert_eq!(first.total, 20);
    assert_eq!(first.data.len(), 10);
    assert_eq!(first.total_pages(), Some(2));

    let second = db.get_page::<Student>(2, 10, "WHERE age >= ? LIMIT 3", params![18]).await.unwrap();
    assert_eq!(second.total, 20);
    assert_eq!(second.data.len(), 10);
    let first_ids: Vec<_> = first.data.iter().map(|s| s.id).collect();
    assert!(second.data.iter().all(|s| !first_ids.contains(&s.id)));

    let past_end = db.get_page::<Student>(3, 10, "WHERE age >= ?", params![18]).await.unwrap();
    assert!(past_end.data.is_empty());
    assert_eq!(past_end.total, 20);

    let uncounted = db.get_page_without_count::<Student>(1, 10, "", params![]).await.unwrap();
    assert_eq!(uncounted.total, -1);
    assert_eq!(uncounted.data.len(), 10);

    assert!(matches!(db.get_page::<Student>(0, 10, "", params![]).await, Err(Error::InvalidParameter(_))));
    assert!(matches!(db.get_page::<Student>(1, 0, "", params![]).await, Err(Error::InvalidParameter(_))));
}

#[tokio::test]
async fn empty_table_page_has_zero_total() {
    let (db, _conn) = setup().await;
    let page = db.get_page::<Student>(1, 10, "", params![]).await.unwrap();
    assert_eq!(page.total, 0);
    assert!(page.data.is_empty());
}

#[tokio::test]
async fn dialect_follows_connection() {
    let db = Db::new(connection().await);
    assert_eq!(db.dialect(), Dialect::Sqlite);

    for n in 0..3 {
        db.insert(&mut student(&format!("s{n}"), 20 + n)).await.unwrap();
    }
    let page = db.get_page::<Student>(1, 10, "", params![]).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.data.len(), 3);
}

#[tokio::test]
async fn grouped_page_counts_groups() {
    let (db, _conn) = setup().await;
    for (n, age) in [20, 20, 21, 22, 22, 22, 23].into_iter().enumerate() {
        db.insert(&mut student(&format!("s{n}"), age)).await.unwrap();
    }

    let page = db.get_page::<Student>(1, 3, "GROUP BY age", params![]).await.unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.data.len(), 3);

    let rest = db.get_page::<Student>(2, 3, "GROUP BY age", params![]).await.unwrap();
    assert_eq!(rest.total, 4);
    assert_eq!(rest.data.len(), 1);
}

#[tokio::test]
async fn page_size_is_clamped() {
    let conn = connection().await;
    let db = Db::builder(conn)
        .options(Options {
            max_page_size: Some(5),
            ..sqlite_options()
        })
        .build();
    for n in 0..8 {
        db.insert(&mut student(&format!("s{n}"), n)).await.unwrap();
    }

    let page = db.get_page::<Student>(1, 100, "", params![]).await.unwrap();
    assert_eq!(page.page_size, 5);
    assert_eq!(page.data.len(), 5);
    assert_eq!(page.total, 8);
}

#[tokio::test]
async fn left_join_resolves_side_relations() {
    let (db, _conn) = setup().await;
    school(&db, 1, "north").await;
    let mut amy = student("amy", 20);
    amy.school_id = Some(1);
    db.insert(&mut amy).await.unwrap();
    db.insert(&mut student("bob", 21)).await.unwrap();
    course(&db, amy.id.unwrap(), "math", 70).await;

    let rows: Vec<StudentSchool> = db.get_all("ORDER BY t1.id", params![]).await.unwrap();
    assert_eq!(rows.len(), 2);

    let amy = rows[0].student.as_ref().unwrap();
    assert_eq!(amy.name.as_deref(), Some("amy"));
    assert_eq!(amy.courses.as_ref().map(Vec::len), Some(1));
    assert_eq!(rows[0].school.as_ref().and_then(|s| s.name.as_deref()), Some("north"));

    assert_eq!(rows[1].student.as_ref().and_then(|s| s.name.as_deref()), Some("bob"));
    assert!(rows[1].school.is_none());

    let count = db.get_count::<StudentSchool>().await.unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn lookups_by_key() {
    let (db, _conn) = setup().await;
    let mut rows = vec![student("a", 1), student("b", 2), student("c", 3)];
    db.insert_batch(&mut rows).await.unwrap();

    let found = db.get_by_key_batch::<Student, i64>(&[3, 99, 1]).await.unwrap();
    let keys: Vec<i64> = found.keys().copied().collect();
    assert_eq!(keys, vec![3, 1]);
    assert_eq!(found[&3].name.as_deref(), Some("c"));

    let example = Student {
        age: Some(2),
        ..Student::default()
    };
    let matched = db.get_by_example(&example).await.unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].name.as_deref(), Some("b"));

    assert!(matches!(
        db.get_by_key::<Student>(Option::<i64>::None).await,
        Err(Error::NullKeyValue { .. })
    ));
}

#[tokio::test]
async fn existence_checks() {
    let (db, _conn) = setup().await;
    let mut rows = vec![student("a", 30), student("b", 30), student("c", 10)];
    db.insert_batch(&mut rows).await.unwrap();

    assert!(db.exists::<Student>("WHERE age = ?", params![30]).await.unwrap());
    assert!(!db.exists::<Student>("WHERE age > ?", params![100]).await.unwrap());
    assert!(db.exists_at_least::<Student>(1, "WHERE age = ?", params![30]).await.unwrap());
    assert!(db.exists_at_least::<Student>(2, "WHERE age = ?", params![30]).await.unwrap());
    assert!(!db.exists_at_least::<Student>(3, "WHERE age = ?", params![30]).await.unwrap());
}

#[tokio::test]
async fn custom_and_bulk_updates() {
    let (db, _conn) = setup().await;
    let mut rows = vec![student("amy", 20), student("bob", 30)];
    db.insert_batch(&mut rows).await.unwrap();

    let bumped = db.update_all::<Student>("age = age + ?", "WHERE name = ?", params![1, "amy"]).await.unwrap();
    assert_eq!(bumped, 1);

    let mut bob = rows[1].clone();
    assert_eq!(db.update_custom(&mut bob, "SET name = ?", params!["robert"]).await.unwrap(), 1);
    assert_eq!(bob.version, Some(2));

    let stored: Vec<Student> = db.get_all("ORDER BY id", params![]).await.unwrap();
    assert_eq!(stored[0].age, Some(21));
    assert_eq!(stored[0].version, Some(2));
    assert_eq!(stored[1].name.as_deref(), Some("robert"));
    assert_eq!(stored[1].version, Some(2));

    let everyone = db.update_all::<Student>("age = 0", "", params![]).await.unwrap();
    assert_eq!(everyone, 2);
}

#[tokio::test]
async fn multi_row_insert_without_ids() {
    let (db, _conn) = setup().await;
    let unaged = Student {
        name: Some("b".to_string()),
        ..Student::default()
    };
    let mut rows = vec![student("a", 1), unaged];
    assert_eq!(db.insert_batch_without_return_id(&mut rows).await.unwrap(), 2);
    assert!(rows.iter().all(|row| row.id.is_none()));

    let stored: Vec<Student> = db.get_all("ORDER BY id", params![]).await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].age, None);
    assert!(stored.iter().all(|s| s.version == Some(1) && s.deleted == Some(false)));
}

#[tokio::test]
async fn raw_queries() {
    let (db, _conn) = setup().await;
    let mut rows = vec![student("amy", 20), student("bob", 30)];
    db.insert_batch(&mut rows).await.unwrap();
    course(&db, rows[0].id.unwrap(), "math", 70).await;

    let ages = db.get_raw_scalars::<i64>("SELECT age FROM t_student ORDER BY age", params![]).await.unwrap();
    assert_eq!(ages, vec![20, 30]);

    let maps = db
        .get_raw_maps("SELECT name, age FROM t_student WHERE age IN (?)", params![strata_orm::Arg::list([30])])
        .await
        .unwrap();
    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0]["name"], serde_json::json!("bob"));

    let students: Vec<Student> =
        db.get_raw("SELECT * FROM t_student WHERE name = ?", params!["amy"]).await.unwrap();
    assert_eq!(students[0].courses.as_ref().map(Vec::len), Some(1));
}

#[tokio::test]
async fn interceptor_vetoes_operation() {
    let conn = connection().await;
    let recorder = Recorder {
        veto: Some(Operation::Delete),
        ..Recorder::default()
    };
    let db = Db::builder(conn).options(sqlite_options()).interceptor(recorder).build();

    let mut amy = student("amy", 20);
    db.insert(&mut amy).await.unwrap();
    let err = db.delete_by_key(&amy).await.unwrap_err();
    assert!(matches!(err, Error::InterceptorRejected { operation: "delete", entity: "Student" }));
    assert!(db.get_by_key::<Student>(amy.id.unwrap()).await.unwrap().is_some());
}

#[tokio::test]
async fn slow_statements_reach_callback() {
    let conn = connection().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let db = Db::builder(conn)
        .options(Options {
            slow_sql_threshold: Duration::ZERO,
            global_comment: Some("svc".to_string()),
            ..sqlite_options()
        })
        .slow_sql_callback(move |slow| {
            sink.lock().push(slow.sql.to_string());
            anyhow::bail!("reporting is down")
        })
        .build();

    // a failing callback never fails the statement
    let rows: Vec<Student> =
        db.scope().comment("report").run(db.get_all("WHERE age > ?", params![1])).await.unwrap();
    assert!(rows.is_empty());

    let seen = seen.lock();
    assert!(!seen.is_empty());
    assert!(seen[0].starts_with("/*svc*//*report*/SELECT"));
}

#[tokio::test]
async fn after_commit_and_rollback() {
    let (db, conn) = setup().await;

    let noop: AfterCommit = Box::new(|| Ok(()));
    assert!(!db.execute_after_commit(Some(noop)).unwrap());
    assert!(matches!(db.execute_after_commit(None), Err(Error::InvalidParameter(_))));
    assert!(!db.rollback().unwrap());

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    conn.begin().unwrap();
    db.insert(&mut student("amy", 20)).await.unwrap();
    let callback: AfterCommit = Box::new(move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    assert!(db.execute_after_commit(Some(callback)).unwrap());
    assert!(!ran.load(Ordering::SeqCst));
    assert!(conn.commit().unwrap());
    assert!(ran.load(Ordering::SeqCst));

    let tx = conn.begin().unwrap();
    db.insert(&mut student("bob", 21)).await.unwrap();
    assert!(db.rollback().unwrap());
    assert!(tx.is_rollback_only());
    assert!(!conn.commit().unwrap());
    assert_eq!(db.get_count::<Student>().await.unwrap(), 1);
}
