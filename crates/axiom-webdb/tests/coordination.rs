mod common;

use std::sync::Arc;
use std::time::Duration;

use axiom_webdb::{SqlValue, StatementCallbacks, TransactionCallbacks};
use common::{count, execute, open, query, Harness, Recorder, Slot};

#[test]
fn test_handles_on_same_database_serialize() {
    let harness = Harness::new(5 * 1024 * 1024);
    let context_a = harness.context("script-a");
    let context_b = harness.context("script-b");

    let a = open(&context_a, "cache", "");
    let b = open(&context_b, "cache", "");
    assert_eq!(a.string_identifier(), b.string_identifier());
    execute(&a, &["CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)"]).unwrap();

    let recorder = Recorder::new();
    let a_done = Slot::new();
    {
        let (started, inserted, done) = (
            Arc::clone(&recorder),
            Arc::clone(&recorder),
            Arc::clone(&a_done),
        );
        a.transaction(
            TransactionCallbacks::new(move |tx| {
                started.push("A:transaction");
                tx.execute_sql(
                    "INSERT INTO items (label) VALUES (?)",
                    vec![SqlValue::from("from A")],
                    StatementCallbacks::new().on_success(move |_, _| {
                        // Hold the lock for a while
                        std::thread::sleep(Duration::from_millis(200));
                        inserted.push("A:statement");
                    }),
                )
                .unwrap();
            })
            .on_success(move || done.fill(())),
        );
    }
    recorder.wait_for("A:transaction");

    let b_rows = Slot::new();
    {
        let (started, rows) = (Arc::clone(&recorder), Arc::clone(&b_rows));
        b.transaction(TransactionCallbacks::new(move |tx| {
            started.push("B:transaction");
            tx.execute_sql(
                "SELECT COUNT(*) AS n FROM items",
                vec![],
                StatementCallbacks::new().on_success(move |_, results| {
                    rows.fill(results.value(0, "n").and_then(SqlValue::as_number))
                }),
            )
            .unwrap();
        }));
    }

    a_done.wait();
    // B only started once A had committed its row
    assert_eq!(b_rows.wait(), Some(1.0));
    let a_statement = recorder.position("A:statement").unwrap();
    let b_transaction = recorder.position("B:transaction").unwrap();
    assert!(a_statement < b_transaction, "{:?}", recorder.events());
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    let harness = Harness::new(5 * 1024 * 1024);
    let contexts: Vec<_> = (0..3)
        .map(|i| harness.context(&format!("script-{i}")))
        .collect();
    let handles: Vec<_> = contexts
        .iter()
        .map(|context| open(context, "counter", ""))
        .collect();

    execute(
        &handles[0],
        &[
            "CREATE TABLE counter (n INTEGER NOT NULL)",
            "INSERT INTO counter VALUES (0)",
        ],
    )
    .unwrap();
    let grants_before = harness.manager.coordinator().grant_count();

    let recorder = Recorder::new();
    for round in 0..5 {
        for (i, db) in handles.iter().enumerate() {
            let (ok, failed) = (Arc::clone(&recorder), Arc::clone(&recorder));
            db.transaction(
                TransactionCallbacks::new(|tx| {
                    tx.execute_sql(
                        "UPDATE counter SET n = n + 1",
                        vec![],
                        StatementCallbacks::new(),
                    )
                    .unwrap();
                })
                .on_success(move || ok.push(format!("{round}-{i}:ok")))
                .on_error(move |err| failed.push(format!("{round}-{i}:{err}"))),
            );
        }
    }

    let events = recorder.wait_for_count(15);
    assert!(events.iter().all(|e| e.ends_with(":ok")), "{events:?}");

    let results = query(&handles[1], "SELECT n FROM counter", vec![]).unwrap();
    assert_eq!(results.value(0, "n"), Some(&SqlValue::Number(15.0)));
    // 15 writers plus the read above
    assert_eq!(harness.manager.coordinator().grant_count() - grants_before, 16);
}

#[test]
fn test_transactions_on_one_handle_run_in_order() {
    let harness = Harness::new(5 * 1024 * 1024);
    let context = harness.context("script-fifo");
    let db = open(&context, "fifo", "");
    execute(&db, &["CREATE TABLE log (entry INTEGER)"]).unwrap();

    let recorder = Recorder::new();
    for i in 0..10 {
        let done = Arc::clone(&recorder);
        db.transaction(
            TransactionCallbacks::new(move |tx| {
                tx.execute_sql(
                    "INSERT INTO log VALUES (?)",
                    vec![SqlValue::from(i)],
                    StatementCallbacks::new(),
                )
                .unwrap();
            })
            .on_success(move || done.push(i.to_string())),
        );
    }

    let events = recorder.wait_for_count(10);
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(events, expected);
    assert_eq!(count(&db, "log"), 10.0);
}
