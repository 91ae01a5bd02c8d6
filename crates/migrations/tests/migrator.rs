use std::sync::Arc;
use std::time::Duration;

use elif_migrations::{
    EmbeddedSource, LedgerStore, MemoryExecutor, MemoryLedgerStore, MigrationConfig,
    MigrationDirection, MigrationError, MigrationLoader, Migrator, DirectorySource,
};

const EVENTS: &str = "-- Migration: create events\n\
    -- UP\n\
    CREATE TABLE events (id SERIAL PRIMARY KEY, title TEXT NOT NULL);\n\
    -- DOWN\n\
    DROP TABLE events;\n";

const ATTENDEES: &str = "-- UP\n\
    CREATE TABLE attendees (id SERIAL PRIMARY KEY, event_id INTEGER REFERENCES events (id));\n\
    CREATE INDEX idx_attendees_event ON attendees (event_id);\n\
    -- DOWN\n\
    DROP TABLE attendees;\n";

const SESSIONS: &str = "-- UP\n\
    CREATE TABLE sessions (id SERIAL PRIMARY KEY, event_id INTEGER NOT NULL);\n\
    -- DOWN\n\
    DROP TABLE sessions;\n";

struct Harness {
    migrator: Migrator,
    ledger: Arc<MemoryLedgerStore>,
    executor: Arc<MemoryExecutor>,
}

fn source() -> EmbeddedSource {
    EmbeddedSource::new()
        .with("003_create_sessions.sql", SESSIONS)
        .with("001_create_events.sql", EVENTS)
        .with("002_create_attendees.sql", ATTENDEES)
}

fn harness_with(source: EmbeddedSource, config: MigrationConfig) -> Harness {
    let ledger = Arc::new(MemoryLedgerStore::new());
    let executor = Arc::new(MemoryExecutor::new());
    let migrator = Migrator::new(MigrationLoader::new(source), ledger.clone(), executor.clone())
        .with_config(config);

    Harness {
        migrator,
        ledger,
        executor,
    }
}

fn harness() -> Harness {
    harness_with(source(), MigrationConfig::default())
}

#[tokio::test]
async fn test_fresh_migrate_applies_in_ascending_order() {
    let h = harness();

    let result = h.migrator.migrate(None).await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.direction, MigrationDirection::Up);
    assert_eq!(result.applied_versions, vec!["001", "002", "003"]);
    assert_eq!(result.message, "Applied 3 migration(s)");
    assert!(result.error.is_none());
    assert_eq!(h.ledger.versions().await, vec!["001", "002", "003"]);

    let executed = h.executor.executed().await;
    assert_eq!(executed.len(), 3);
    assert!(executed[0].starts_with("CREATE TABLE events"));
    // Multi-statement bodies reach the executor as one string
    assert!(executed[1].contains("CREATE TABLE attendees"));
    assert!(executed[1].contains("CREATE INDEX idx_attendees_event"));
    assert!(executed[2].starts_with("CREATE TABLE sessions"));

    let entries = h.ledger.list_applied().await.unwrap();
    assert_eq!(entries[0].description, "create events");
    assert_eq!(entries[0].down_sql, "DROP TABLE events;");
    assert_eq!(entries[0].checksum.len(), 64);
}

#[tokio::test]
async fn test_migrate_when_up_to_date_is_noop() {
    let h = harness();
    assert!(h.migrator.migrate(None).await.success);

    let status = h.migrator.get_status().await.unwrap();
    assert!(status.is_up_to_date);

    let result = h.migrator.migrate(None).await;
    assert!(result.success);
    assert!(result.applied_versions.is_empty());
    assert_eq!(result.message, "No migrations to apply");
    assert_eq!(h.executor.executed().await.len(), 3);
}

#[tokio::test]
async fn test_rollback_runs_in_descending_order() {
    let h = harness();
    assert!(h.migrator.migrate(None).await.success);

    let result = h.migrator.rollback(None).await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.direction, MigrationDirection::Down);
    assert_eq!(result.rolled_back_versions, vec!["003", "002", "001"]);
    assert_eq!(result.message, "Rolled back 3 migration(s)");

    let executed = h.executor.executed().await;
    assert_eq!(
        &executed[3..],
        &["DROP TABLE sessions;", "DROP TABLE attendees;", "DROP TABLE events;"]
    );
}

#[tokio::test]
async fn test_partial_failure_stops_and_resumes() {
    let h = harness();
    h.executor.fail_on("CREATE TABLE attendees").await;

    let result = h.migrator.migrate(None).await;

    assert!(!result.success);
    assert_eq!(result.applied_versions, vec!["001"]);
    assert_eq!(result.failed_version.as_deref(), Some("002"));
    assert!(result.message.contains("002"));
    match result.error {
        Some(MigrationError::SqlExecutionFailed { ref version, ref cause }) => {
            assert_eq!(version, "002");
            assert!(cause.contains("CREATE TABLE attendees"));
        }
        ref other => panic!("expected SqlExecutionFailed, got {:?}", other),
    }
    assert_eq!(h.ledger.versions().await, vec!["001"]);
    // 003 was never attempted
    assert_eq!(h.executor.executed().await.len(), 1);

    h.executor.clear_failures().await;
    let resumed = h.migrator.migrate(None).await;

    assert!(resumed.success);
    assert_eq!(resumed.applied_versions, vec!["002", "003"]);
    assert_eq!(h.ledger.versions().await, vec!["001", "002", "003"]);
}

#[tokio::test]
async fn test_migrate_to_target_version() {
    let h = harness();

    let result = h.migrator.migrate(Some("002")).await;

    assert!(result.success);
    assert_eq!(result.applied_versions, vec!["001", "002"]);

    let status = h.migrator.get_status().await.unwrap();
    assert_eq!(status.current_version.as_deref(), Some("002"));
    assert_eq!(status.pending_versions, vec!["003"]);
    assert!(!status.is_up_to_date);
}

#[tokio::test]
async fn test_rollback_to_target_version() {
    let h = harness();
    assert!(h.migrator.migrate(None).await.success);

    let result = h.migrator.rollback(Some("001")).await;

    assert!(result.success);
    assert_eq!(result.rolled_back_versions, vec!["003", "002"]);
    assert_eq!(h.ledger.versions().await, vec!["001"]);

    let again = h.migrator.rollback(Some("001")).await;
    assert!(again.success);
    assert_eq!(again.message, "No migrations to rollback");
}

#[tokio::test]
async fn test_round_trip_leaves_empty_ledger() {
    let h = harness();
    assert!(h.migrator.migrate(None).await.success);
    assert!(h.migrator.rollback(None).await.success);

    let status = h.migrator.get_status().await.unwrap();
    assert!(status.applied_versions.is_empty());
    assert_eq!(status.current_version_label(), "none");
    assert_eq!(status.pending_versions, vec!["001", "002", "003"]);
}

#[tokio::test]
async fn test_rollback_failure_keeps_ledger_row() {
    let h = harness();
    assert!(h.migrator.migrate(None).await.success);
    h.executor.fail_on("DROP TABLE attendees").await;

    let result = h.migrator.rollback(None).await;

    assert!(!result.success);
    assert_eq!(result.rolled_back_versions, vec!["003"]);
    assert_eq!(result.failed_version.as_deref(), Some("002"));
    assert_eq!(h.ledger.versions().await, vec!["001", "002"]);
}

#[tokio::test]
async fn test_ledger_write_failure_is_reported() {
    let h = harness();
    h.ledger.ensure_initialized().await.unwrap();
    h.ledger.fail_writes(true).await;

    let result = h.migrator.migrate(None).await;

    assert!(!result.success);
    assert!(result.applied_versions.is_empty());
    assert_eq!(result.failed_version.as_deref(), Some("001"));
    assert!(matches!(result.error, Some(MigrationError::LedgerWriteFailed(_))));
}

#[tokio::test]
async fn test_held_lock_fails_fast() {
    let h = harness();
    h.ledger.try_acquire_lock("other-run", None).await.unwrap();

    let result = h.migrator.migrate(None).await;

    assert!(!result.success);
    assert!(result.failed_version.is_none());
    assert_eq!(
        result.error,
        Some(MigrationError::LockHeld {
            owner: "other-run".to_string()
        })
    );
    assert!(h.executor.executed().await.is_empty());
    assert_eq!(h.ledger.lock_owner().await.as_deref(), Some("other-run"));
}

#[tokio::test]
async fn test_lock_released_after_failed_run() {
    let h = harness();
    h.executor.fail_on("CREATE TABLE events").await;

    assert!(!h.migrator.migrate(None).await.success);
    assert_eq!(h.ledger.lock_owner().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_does_not_block_the_next() {
    let h = harness();
    h.executor.set_delay(Some(Duration::from_secs(10))).await;

    let cancelled = tokio::time::timeout(Duration::from_secs(1), h.migrator.migrate(None)).await;
    assert!(cancelled.is_err());

    // The lock is released on a spawned task
    for _ in 0..10 {
        if h.ledger.lock_owner().await.is_none() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.ledger.lock_owner().await, None);

    h.executor.set_delay(None).await;
    let result = h.migrator.migrate(None).await;

    assert!(result.success, "{}", result.message);
    assert_eq!(result.applied_versions, vec!["001", "002", "003"]);
}

#[tokio::test]
async fn test_force_unlock_clears_abandoned_lock() {
    let h = harness();
    h.ledger.try_acquire_lock("crashed-run", None).await.unwrap();
    assert!(!h.migrator.migrate(None).await.success);

    let previous = h.migrator.force_unlock().await.unwrap();

    assert_eq!(previous.as_deref(), Some("crashed-run"));
    assert!(h.migrator.migrate(None).await.success);
    assert_eq!(h.migrator.force_unlock().await.unwrap(), None);
}

#[tokio::test]
async fn test_status_propagates_ledger_read_failure() {
    let h = harness();
    h.ledger.fail_reads(true).await;

    assert!(matches!(
        h.migrator.get_status().await,
        Err(MigrationError::LedgerQueryFailed(_))
    ));
}

#[tokio::test]
async fn test_ledger_read_failure_aborts_run() {
    let h = harness();
    h.ledger.fail_reads(true).await;

    let result = h.migrator.migrate(None).await;

    assert!(!result.success);
    assert!(result.failed_version.is_none());
    assert!(matches!(result.error, Some(MigrationError::LedgerQueryFailed(_))));
    assert!(result.message.starts_with("Migration run aborted"));
    assert!(h.executor.executed().await.is_empty());
    assert_eq!(h.ledger.lock_owner().await, None);
}

#[tokio::test]
async fn test_ledger_init_failure_aborts_run() {
    let h = harness();
    h.ledger.fail_init(true).await;

    let result = h.migrator.migrate(None).await;

    assert!(!result.success);
    assert!(matches!(result.error, Some(MigrationError::LedgerInitFailed(_))));
    assert!(h.executor.executed().await.is_empty());
    assert!(h.migrator.get_status().await.is_err());
}

#[tokio::test]
async fn test_ledger_remove_failure_keeps_row() {
    let h = harness();
    assert!(h.migrator.migrate(None).await.success);
    h.ledger.fail_writes(true).await;

    let result = h.migrator.rollback(None).await;

    assert!(!result.success);
    assert!(result.rolled_back_versions.is_empty());
    assert_eq!(result.failed_version.as_deref(), Some("003"));
    assert!(matches!(result.error, Some(MigrationError::LedgerWriteFailed(_))));
    assert_eq!(h.ledger.versions().await, vec!["001", "002", "003"]);
}

#[tokio::test]
async fn test_lock_can_be_disabled() {
    let h = harness_with(source(), MigrationConfig::default().with_lock(false));
    h.ledger.try_acquire_lock("other-run", None).await.unwrap();

    assert!(h.migrator.migrate(None).await.success);
}

#[tokio::test]
async fn test_invalid_target_applies_nothing() {
    let h = harness();

    let result = h.migrator.migrate(Some("2")).await;

    assert!(!result.success);
    assert!(matches!(
        result.error,
        Some(MigrationError::InvalidVersion { ref version, .. }) if version == "2"
    ));
    assert!(h.executor.executed().await.is_empty());
}

#[tokio::test]
async fn test_irreversible_migration_stops_rollback() {
    let source = source().with(
        "004_backfill_titles.sql",
        "-- UP\nUPDATE events SET title = 'untitled' WHERE title = '';\n-- DOWN\n",
    );
    let h = harness_with(source, MigrationConfig::default());
    assert!(h.migrator.migrate(None).await.success);

    let result = h.migrator.rollback(None).await;

    assert!(!result.success);
    assert!(result.rolled_back_versions.is_empty());
    assert_eq!(
        result.error,
        Some(MigrationError::IrreversibleMigration("004".to_string()))
    );
    assert_eq!(h.ledger.versions().await.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_statement_timeout() {
    let h = harness_with(
        source(),
        MigrationConfig::default().with_statement_timeout(Duration::from_secs(1)),
    );
    h.executor.set_delay(Some(Duration::from_secs(5))).await;

    let result = h.migrator.migrate(None).await;

    assert!(!result.success);
    assert_eq!(result.failed_version.as_deref(), Some("001"));
    match result.error {
        Some(MigrationError::SqlExecutionFailed { ref cause, .. }) => {
            assert!(cause.contains("timed out after 1s"))
        }
        ref other => panic!("expected timeout, got {:?}", other),
    }
    assert!(h.ledger.versions().await.is_empty());
}

#[tokio::test]
async fn test_unavailable_source() {
    let ledger = Arc::new(MemoryLedgerStore::new());
    let migrator = Migrator::new(
        MigrationLoader::new(DirectorySource::new("/nonexistent/elif/migrations")),
        ledger,
        Arc::new(MemoryExecutor::new()),
    );

    assert!(matches!(
        migrator.get_status().await,
        Err(MigrationError::SourceUnavailable(_))
    ));

    let result = migrator.migrate(None).await;
    assert!(!result.success);
    assert!(matches!(
        result.error,
        Some(MigrationError::SourceUnavailable(_))
    ));
}

#[tokio::test]
async fn test_validate_reports_problems() {
    let source = source().with("004_empty.sql", "-- UP\nSELECT 1;\n");
    let h = harness_with(source, MigrationConfig::default());

    let report = h.migrator.validate().unwrap();

    assert!(!report.is_valid);
    assert_eq!(report.errors, vec!["migration 004: no DOWN SQL"]);
}
