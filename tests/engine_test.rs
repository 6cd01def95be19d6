//! End-to-end tests of the storage engine facade: CRUD, transactions,
//! crash recovery, vacuum, and catalog persistence.

use stratadb::catalog::{Column, DataType};
use stratadb::engine::{Assignment, ComparisonOp, Condition, Predicate, QueryResult, Statement};
use stratadb::{Config, DbError, Row, StorageEngine, Value};
use tempfile::TempDir;

fn open_engine(dir: &TempDir) -> StorageEngine {
    StorageEngine::open(Config::new(dir.path())).unwrap()
}

fn users_columns() -> Vec<Column> {
    vec![
        Column::new("id", DataType::Integer).primary_key(),
        Column::new("name", DataType::Varchar(255)),
    ]
}

fn user_row(id: i64, name: &str) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), Value::Integer(id));
    row.insert("name".to_string(), Value::String(name.to_string()));
    row
}

fn setup_users(engine: &StorageEngine) {
    engine.create_database("db1").unwrap();
    engine.create_table("users", users_columns()).unwrap();
}

fn id_eq(id: i64) -> Predicate {
    Predicate::with(Condition::new("id", ComparisonOp::Eq, Value::Integer(id)))
}

#[test]
fn test_basic_crud() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);

    engine.insert_row("users", user_row(1, "Alice")).unwrap();
    engine.insert_row("users", user_row(2, "Bob")).unwrap();

    let rows = engine
        .select_rows(
            "users",
            &Predicate::with(Condition::new("id", ComparisonOp::GtEq, Value::Integer(1))),
        )
        .unwrap();
    assert_eq!(rows.len(), 2);

    let updated = engine
        .update_rows(
            "users",
            &[Assignment::new("name", Value::String("Carol".into()))],
            &id_eq(1),
        )
        .unwrap();
    assert_eq!(updated, 1);
    let rows = engine.select_rows("users", &id_eq(1)).unwrap();
    assert_eq!(rows[0].get("name"), Some(&Value::String("Carol".into())));

    let deleted = engine.delete_rows("users", &id_eq(2)).unwrap();
    assert_eq!(deleted, 1);
    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&Value::Integer(1)));
}

#[test]
fn test_crash_recovery_replays_committed_inserts() {
    let dir = TempDir::new().unwrap();
    let last_txn;
    {
        let engine = open_engine(&dir);
        setup_users(&engine);
        for i in 0..5 {
            engine
                .insert_row("users", user_row(i, &format!("user{}", i)))
                .unwrap();
        }
        last_txn = engine.begin().unwrap();
        engine.rollback().unwrap();
        // Simulate a kill: the engine never flushes heaps or closes.
        std::mem::forget(engine);
    }

    let engine = open_engine(&dir);
    engine.use_database("db1").unwrap();
    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 5);

    // New transaction IDs land past everything the log observed.
    assert!(engine.begin().unwrap() > last_txn);
    engine.rollback().unwrap();
}

#[test]
fn test_crash_mid_transaction_discards_losers() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        setup_users(&engine);
        engine.insert_row("users", user_row(1, "durable")).unwrap();

        engine.begin().unwrap();
        engine.insert_row("users", user_row(2, "doomed")).unwrap();
        // Crash with the transaction still open: no Commit record.
        std::mem::forget(engine);
    }

    let engine = open_engine(&dir);
    engine.use_database("db1").unwrap();
    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::String("durable".into())));
}

#[test]
fn test_checkpoint_then_crash_recovers() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        setup_users(&engine);
        for i in 0..3 {
            engine.insert_row("users", user_row(i, "pre")).unwrap();
        }
        engine.checkpoint().unwrap();
        for i in 3..6 {
            engine.insert_row("users", user_row(i, "post")).unwrap();
        }
        std::mem::forget(engine);
    }

    let engine = open_engine(&dir);
    engine.use_database("db1").unwrap();
    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 6);
    assert!(engine.buffer_stats("users").unwrap().hits > 0);
}

#[test]
fn test_explicit_transaction_commit_and_rollback() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);

    engine.begin().unwrap();
    engine.insert_row("users", user_row(1, "kept")).unwrap();
    // The writer reads its own uncommitted row.
    assert_eq!(engine.select_rows("users", &Predicate::all()).unwrap().len(), 1);
    engine.commit().unwrap();
    assert_eq!(engine.select_rows("users", &Predicate::all()).unwrap().len(), 1);

    engine.begin().unwrap();
    engine.insert_row("users", user_row(2, "discarded")).unwrap();
    engine
        .update_rows(
            "users",
            &[Assignment::new("name", Value::String("mutated".into()))],
            &id_eq(1),
        )
        .unwrap();
    engine.delete_rows("users", &id_eq(1)).unwrap();
    engine.rollback().unwrap();

    // Everything from the aborted transaction is gone, the original row
    // is back untouched.
    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&Value::Integer(1)));
    assert_eq!(rows[0].get("name"), Some(&Value::String("kept".into())));
}

#[test]
fn test_transaction_state_machine() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);

    assert!(matches!(engine.commit(), Err(DbError::NoTransaction)));
    assert!(matches!(engine.rollback(), Err(DbError::NoTransaction)));

    engine.begin().unwrap();
    assert!(matches!(
        engine.begin(),
        Err(DbError::TransactionInProgress(_))
    ));
    engine.commit().unwrap();
}

#[test]
fn test_vacuum_reclaims_deleted_rows() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);

    for i in 0..10 {
        engine
            .insert_row("users", user_row(i, &format!("u{}", i)))
            .unwrap();
    }
    let deleted = engine
        .delete_rows(
            "users",
            &Predicate::with(Condition::new("id", ComparisonOp::Lt, Value::Integer(5))),
        )
        .unwrap();
    assert_eq!(deleted, 5);

    let stats = engine.vacuum_table("users").unwrap();
    assert_eq!(stats.dead_tuples, 5);
    assert_eq!(stats.tuples_removed, 5);
    assert!(stats.bytes_reclaimed > 0);

    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows
        .iter()
        .all(|r| matches!(r.get("id"), Some(Value::Integer(i)) if *i >= 5)));
}

#[test]
fn test_catalog_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        engine.create_database("db1").unwrap();
        engine.create_database("db2").unwrap();
        engine.use_database("db1").unwrap();
        engine.create_table("users", users_columns()).unwrap();
        engine.insert_row("users", user_row(1, "Ada")).unwrap();
        engine
            .add_column("users", Column::new("age", DataType::Integer))
            .unwrap();
        engine.close().unwrap();
    }

    let engine = open_engine(&dir);
    assert_eq!(engine.list_databases(), vec!["db1", "db2"]);
    engine.use_database("db1").unwrap();
    assert_eq!(engine.list_tables().unwrap(), vec!["users"]);

    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::String("Ada".into())));
}

#[test]
fn test_unique_constraint_enforced_via_index() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);

    engine.insert_row("users", user_row(1, "first")).unwrap();
    let err = engine.insert_row("users", user_row(1, "second")).unwrap_err();
    assert!(matches!(err, DbError::ConstraintViolation(_)));

    // The failed insert left no trace.
    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::String("first".into())));

    // A committed delete frees the key immediately; no vacuum needed.
    engine.delete_rows("users", &id_eq(1)).unwrap();
    engine.insert_row("users", user_row(1, "third")).unwrap();

    // And the reborn key is unique again.
    assert!(matches!(
        engine.insert_row("users", user_row(1, "fourth")),
        Err(DbError::ConstraintViolation(_))
    ));
    let rows = engine.select_rows("users", &id_eq(1)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::String("third".into())));
}

#[test]
fn test_update_can_take_over_deleted_key() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);

    engine.insert_row("users", user_row(1, "goner")).unwrap();
    engine.insert_row("users", user_row(2, "mover")).unwrap();
    engine.delete_rows("users", &id_eq(1)).unwrap();

    // Row 2 takes over the key row 1 released, without a vacuum between.
    let updated = engine
        .update_rows(
            "users",
            &[Assignment::new("id", Value::Integer(1))],
            &id_eq(2),
        )
        .unwrap();
    assert_eq!(updated, 1);

    let rows = engine.select_rows("users", &id_eq(1)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::String("mover".into())));
    assert!(engine.select_rows("users", &id_eq(2)).unwrap().is_empty());
}

#[test]
fn test_reinsert_after_delete_survives_rollback_rebuild() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);

    engine.insert_row("users", user_row(1, "old")).unwrap();
    engine.delete_rows("users", &id_eq(1)).unwrap();
    engine.insert_row("users", user_row(1, "new")).unwrap();

    // A rollback rebuilds the table's indexes from the heap, where both
    // the dead and the live version of key 1 still coexist; the live one
    // must keep the entry.
    engine.begin().unwrap();
    engine.insert_row("users", user_row(9, "txn")).unwrap();
    engine.rollback().unwrap();

    assert!(matches!(
        engine.insert_row("users", user_row(1, "again")),
        Err(DbError::ConstraintViolation(_))
    ));
    let rows = engine.select_rows("users", &id_eq(1)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::String("new".into())));
}

#[test]
fn test_not_null_constraint() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    engine.create_database("db1").unwrap();
    engine
        .create_table(
            "t",
            vec![
                Column::new("id", DataType::Integer).primary_key(),
                Column::new("req", DataType::Text).not_null(),
            ],
        )
        .unwrap();

    let mut row = Row::new();
    row.insert("id".to_string(), Value::Integer(1));
    assert!(matches!(
        engine.insert_row("t", row),
        Err(DbError::ConstraintViolation(_))
    ));
}

#[test]
fn test_update_growing_row_relocates() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);

    engine.insert_row("users", user_row(1, "x")).unwrap();
    engine.insert_row("users", user_row(2, "y")).unwrap();

    let big = "n".repeat(4000);
    let updated = engine
        .update_rows(
            "users",
            &[Assignment::new("name", Value::String(big.clone()))],
            &id_eq(1),
        )
        .unwrap();
    assert_eq!(updated, 1);

    let rows = engine.select_rows("users", &id_eq(1)).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::String(big)));

    // The untouched row is still intact.
    let rows = engine.select_rows("users", &id_eq(2)).unwrap();
    assert_eq!(rows[0].get("name"), Some(&Value::String("y".into())));
}

#[test]
fn test_engine_without_wal() {
    let dir = TempDir::new().unwrap();
    let engine = StorageEngine::open(Config::new(dir.path()).without_wal()).unwrap();
    setup_users(&engine);

    engine.insert_row("users", user_row(1, "plain")).unwrap();
    engine.begin().unwrap();
    engine.insert_row("users", user_row(2, "rolled back")).unwrap();
    engine.rollback().unwrap();

    let rows = engine.select_rows("users", &Predicate::all()).unwrap();
    assert_eq!(rows.len(), 1);
    engine.close().unwrap();

    // Clean close persists without any WAL directory.
    let engine = StorageEngine::open(Config::new(dir.path()).without_wal()).unwrap();
    engine.use_database("db1").unwrap();
    assert_eq!(engine.select_rows("users", &Predicate::all()).unwrap().len(), 1);
}

#[test]
fn test_statement_dispatch() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    engine
        .execute(Statement::CreateDatabase { name: "db1".into() })
        .unwrap();
    engine
        .execute(Statement::CreateTable {
            name: "users".into(),
            columns: users_columns(),
        })
        .unwrap();
    let result = engine
        .execute(Statement::Insert {
            table: "users".into(),
            row: user_row(7, "stmt"),
        })
        .unwrap();
    assert!(matches!(result, QueryResult::Affected(1)));

    let result = engine
        .execute(Statement::Select {
            table: "users".into(),
            predicate: id_eq(7),
        })
        .unwrap();
    match result {
        QueryResult::Rows(rows) => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get("name"), Some(&Value::String("stmt".into())));
        }
        other => panic!("expected rows, got {:?}", other),
    }

    let result = engine.execute(Statement::Vacuum { table: None }).unwrap();
    assert!(matches!(result, QueryResult::Vacuum(_)));

    engine
        .execute(Statement::DropTable { name: "users".into() })
        .unwrap();
    assert!(engine.list_tables().unwrap().is_empty());
}

#[test]
fn test_closed_engine_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);
    setup_users(&engine);
    engine.close().unwrap();

    assert!(matches!(
        engine.select_rows("users", &Predicate::all()),
        Err(DbError::Closed)
    ));
    assert!(matches!(engine.begin(), Err(DbError::Closed)));
}

#[test]
fn test_ddl_errors() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(&dir);

    assert!(matches!(
        engine.use_database("nope"),
        Err(DbError::NotFound { .. })
    ));

    engine.create_database("db1").unwrap();
    assert!(matches!(
        engine.create_database("db1"),
        Err(DbError::AlreadyExists { .. })
    ));

    engine.create_table("users", users_columns()).unwrap();
    assert!(matches!(
        engine.create_table("users", users_columns()),
        Err(DbError::AlreadyExists { .. })
    ));
    assert!(matches!(
        engine.select_rows("ghosts", &Predicate::all()),
        Err(DbError::NotFound { .. })
    ));
}

#[test]
fn test_indexes_survive_clean_close() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_engine(&dir);
        setup_users(&engine);
        for i in 0..50 {
            engine
                .insert_row("users", user_row(i, &format!("u{}", i)))
                .unwrap();
        }
        engine.close().unwrap();
    }

    // The index file exists on disk and enforces uniqueness after reopen.
    assert!(dir.path().join("db1/indexes/users_id.idx").exists());
    let engine = open_engine(&dir);
    engine.use_database("db1").unwrap();
    assert!(matches!(
        engine.insert_row("users", user_row(25, "dup")),
        Err(DbError::ConstraintViolation(_))
    ));
    engine.insert_row("users", user_row(50, "new")).unwrap();
}
