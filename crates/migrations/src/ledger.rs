//! Ledger Store - durable record of applied migrations
//!
//! The ledger is the only shared mutable state of the engine. The orchestrator
//! is its only writer; status tooling may read it.

use std::time::Duration;

use async_trait::async_trait;

use crate::definitions::LedgerEntry;
use crate::error::{MigrationError, MigrationResult};

/// Storage for applied-migration rows and the migration lock
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the ledger (and lock) table if it does not exist yet
    async fn ensure_initialized(&self) -> MigrationResult<()>;

    /// All applied migrations, ordered by ascending version
    async fn list_applied(&self) -> MigrationResult<Vec<LedgerEntry>>;

    /// Insert a row for a migration whose forward bodies just succeeded.
    /// A duplicate version is a write failure.
    async fn record_applied(&self, entry: &LedgerEntry) -> MigrationResult<()>;

    /// Delete the row for a migration whose reverse bodies just succeeded
    async fn remove_applied(&self, version: &str) -> MigrationResult<()>;

    /// Take the single migration lock for `owner`, failing with
    /// `LockHeld` when another run holds it. A lock older than
    /// `stale_after` is taken over.
    async fn try_acquire_lock(
        &self,
        owner: &str,
        stale_after: Option<Duration>,
    ) -> MigrationResult<()>;

    /// Release the lock if `owner` holds it
    async fn release_lock(&self, owner: &str) -> MigrationResult<()>;

    /// Release the lock whoever holds it, returning the previous owner
    async fn force_release_lock(&self) -> MigrationResult<Option<String>>;

    /// Whether [`apply_and_record`](Self::apply_and_record) and
    /// [`revert_and_remove`](Self::revert_and_remove) are available. When they
    /// are, a migration's bodies and its ledger write commit together.
    fn records_atomically(&self) -> bool {
        false
    }

    /// Run forward bodies and insert `entry` in one transaction
    async fn apply_and_record(
        &self,
        entry: &LedgerEntry,
        _statements: &[String],
    ) -> MigrationResult<()> {
        Err(MigrationError::Configuration(format!(
            "ledger cannot apply migration {} atomically",
            entry.version
        )))
    }

    /// Run reverse bodies and delete the row for `version` in one transaction
    async fn revert_and_remove(&self, version: &str, _statements: &[String]) -> MigrationResult<()> {
        Err(MigrationError::Configuration(format!(
            "ledger cannot roll back migration {} atomically",
            version
        )))
    }
}
