mod common;

use std::sync::Arc;

use axiom_webdb::{DatabaseError, SqlErrorCode, TransactionCallbacks};
use common::{execute, open, Harness, Recorder, Slot};

#[test]
fn test_change_version_then_reopen() {
    let harness = Harness::new(5 * 1024 * 1024);
    let context = harness.context("script-version");

    let db = open(&context, "versions", "");
    assert_eq!(db.version(), "");

    let outcome = Slot::new();
    let (failed, succeeded) = (Arc::clone(&outcome), Arc::clone(&outcome));
    db.change_version(
        "",
        "1.0",
        TransactionCallbacks::default()
            .on_error(move |err| failed.fill(Err(err)))
            .on_success(move || succeeded.fill(Ok(()))),
    );
    outcome.wait().unwrap();
    assert_eq!(db.version(), "1.0");
    assert_eq!(db.expected_version(), "1.0");

    let reopened = open(&context, "versions", "1.0");
    assert_eq!(reopened.version(), "1.0");

    let err = context
        .open_database("versions", "2.0", "", 1024, None)
        .unwrap_err();
    assert!(matches!(err, DatabaseError::VersionMismatch { .. }));
    assert_eq!(err.code(), SqlErrorCode::Version);
}

#[test]
fn test_change_version_checks_old_version_at_execution() {
    let harness = Harness::new(5 * 1024 * 1024);
    let context = harness.context("script-version-race");
    let db = open(&context, "versions", "");

    let recorder = Recorder::new();
    // Both are queued before either runs; only the first sees ""
    for (label, new_version) in [("first", "1.0"), ("second", "2.0")] {
        let (ok, failed) = (Arc::clone(&recorder), Arc::clone(&recorder));
        db.change_version(
            "",
            new_version,
            TransactionCallbacks::default()
                .on_success(move || ok.push(format!("{label}:ok")))
                .on_error(move |err| failed.push(format!("{label}:{}", err.code))),
        );
    }

    let events = recorder.wait_for_count(2);
    assert_eq!(events, vec!["first:ok", "second:VERSION_ERR"]);
    assert_eq!(db.version(), "1.0");
}

#[test]
fn test_stale_expected_version_fails_transactions() {
    let harness = Harness::new(5 * 1024 * 1024);
    let first = harness.context("script-a");
    let second = harness.context("script-b");

    let a = open(&first, "shared", "1.0");
    let b = open(&second, "shared", "1.0");

    let outcome = Slot::new();
    let done = Arc::clone(&outcome);
    a.change_version(
        "1.0",
        "2.0",
        TransactionCallbacks::default().on_success(move || done.fill(())),
    );
    outcome.wait();

    // b still expects 1.0 and may no longer run transactions
    let err = execute(&b, &["SELECT 1"]).unwrap_err();
    assert_eq!(err.code, SqlErrorCode::Version);
    execute(&a, &["SELECT 1"]).unwrap();
}

#[test]
fn test_creation_callback_runs_for_new_files_only() {
    let harness = Harness::new(5 * 1024 * 1024);
    let context = harness.context("script-create");

    let created = Slot::new();
    let seen = Arc::clone(&created);
    let db = context
        .open_database(
            "fresh",
            "1.0",
            "",
            1024,
            Some(Box::new(move |db| seen.fill(db.version()))),
        )
        .unwrap();
    // Version is left for the callback to set
    assert_eq!(created.wait(), "");
    assert_eq!(db.expected_version(), "");

    let recorder = Recorder::new();
    let again = Arc::clone(&recorder);
    let _reopened = context
        .open_database(
            "fresh",
            "",
            "",
            1024,
            Some(Box::new(move |_| again.push("created again"))),
        )
        .unwrap();
    // A transaction round trip on the same script thread flushes the queue
    execute(&db, &["SELECT 1"]).unwrap();
    assert!(recorder.events().is_empty());
}
