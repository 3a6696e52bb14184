#![cfg(feature = "test-utils")]

use std::time::Duration;

use contention::coordinator::{Coordinator, CoordinatorConfig, ExitReason};
use contention::error::{ContentionError, ErrorKind};
use contention::store::{LockPolicy, Record, RecordConnection, RecordStore, UpdateOutcome};
use contention::test_utils::database::{TEST_RECORD_TABLE, TestDatabase};
use contention_telemetry::tracing::init_test_tracing;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread")]
async fn read_modify_write_increments_the_version() {
    init_test_tracing();

    let database = TestDatabase::new().await;
    let mut connection = database.record_store().connect().await.unwrap();

    let first = connection
        .read_modify_write(LockPolicy::Optimistic, "first")
        .await
        .unwrap();
    let second = connection
        .read_modify_write(LockPolicy::Pessimistic, "second")
        .await
        .unwrap();

    assert_eq!(
        first,
        UpdateOutcome::Committed {
            previous: Record::new(0, "initial"),
            version: 1
        }
    );
    assert_eq!(
        second,
        UpdateOutcome::Committed {
            previous: Record::new(1, "first"),
            version: 2
        }
    );
    assert_eq!(database.record().await, (2, Some("second".to_string())));

    drop(connection);
    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unlocked_update_blocked_behind_a_concurrent_writer_matches_no_row() {
    init_test_tracing();

    let database = TestDatabase::new().await;
    let mut connection = database.record_store().connect().await.unwrap();

    // Another session locks the row, so the worker's update waits for it after reading version 0.
    database
        .client
        .batch_execute(&format!(
            "begin; select version from {TEST_RECORD_TABLE} for update;"
        ))
        .await
        .unwrap();

    let cycle = tokio::spawn(async move {
        let outcome = connection
            .read_modify_write(LockPolicy::Optimistic, "lost")
            .await;
        (connection, outcome)
    });
    sleep(Duration::from_millis(500)).await;

    database
        .client
        .batch_execute(&format!(
            "update {TEST_RECORD_TABLE} set version = version + 1, content = 'concurrent'; commit;"
        ))
        .await
        .unwrap();

    let (connection, outcome) = cycle.await.unwrap();

    assert_eq!(
        outcome.unwrap(),
        UpdateOutcome::Conflict {
            read: Record::new(0, "initial")
        }
    );
    assert_eq!(database.record().await, (1, Some("concurrent".to_string())));

    drop(connection);
    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn update_targets_only_the_row_that_was_read() {
    init_test_tracing();

    let database = TestDatabase::new().await;
    database.insert_record(0, "second row").await;
    let mut connection = database.record_store().connect().await.unwrap();

    for (policy, content) in [
        (LockPolicy::Optimistic, "first"),
        (LockPolicy::Pessimistic, "second"),
    ] {
        let outcome = connection.read_modify_write(policy, content).await.unwrap();

        match outcome {
            UpdateOutcome::Committed { previous, version } => {
                assert_eq!(version, previous.version + 1, "policy {policy}");
            }
            other => panic!("expected a committed update under {policy}, got {other:?}"),
        }
    }

    // Each cycle bumped exactly one row by one.
    let versions = database.versions().await;
    assert_eq!(versions.len(), 2);
    assert_eq!(versions.iter().sum::<i64>(), 2);

    drop(connection);
    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn client_side_errors_are_not_connection_failures() {
    init_test_tracing();

    let database = TestDatabase::new().await;

    let err: ContentionError = database
        .client
        .query_one("select 1 where false", &[])
        .await
        .unwrap_err()
        .into();

    assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);

    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_record_is_reported() {
    init_test_tracing();

    let database = TestDatabase::new().await;
    database.clear_records().await;
    let mut connection = database.record_store().connect().await.unwrap();

    let err = connection
        .read_modify_write(LockPolicy::Pessimistic, "content")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RecordMissing);

    drop(connection);
    database.drop_database().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pessimistic_workers_serialize_every_update() {
    init_test_tracing();

    let database = TestDatabase::new().await;
    let coordinator = Coordinator::new(
        CoordinatorConfig {
            spawn_stagger: Duration::ZERO,
            pacing: Duration::from_millis(1),
            max_iterations: Some(5),
            ..CoordinatorConfig::new(LockPolicy::Pessimistic, 3)
        },
        database.record_store(),
    );

    let report = coordinator.run().await;

    assert_eq!(report.exit_reason, ExitReason::WorkersFinished);
    assert!(report.failures.is_empty());
    assert_eq!(report.total_anomalies(), 0);
    assert_eq!(report.total_committed(), 15);
    assert_eq!(database.record().await.0, 15);

    database.drop_database().await;
}
