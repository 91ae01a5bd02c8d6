//! In-memory backend
//!
//! [`MemoryLedgerStore`] and [`MemoryExecutor`] keep everything in process.
//! They drive the engine without a database server, chiefly in tests, and
//! carry switches for injecting failures. An in-memory ledger starts empty,
//! so it says nothing about what is pending on a real database.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::definitions::LedgerEntry;
use crate::error::{MigrationError, MigrationResult};
use crate::executor::SqlExecutor;
use crate::ledger::LedgerStore;

#[derive(Debug)]
struct HeldLock {
    owner: String,
    locked_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    initialized: bool,
    entries: BTreeMap<String, LedgerEntry>,
    lock: Option<HeldLock>,
    fail_init: bool,
    fail_reads: bool,
    fail_writes: bool,
}

/// Ledger kept in a sorted map
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    state: Mutex<LedgerState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert/delete fail
    pub async fn fail_writes(&self, fail: bool) {
        self.state.lock().await.fail_writes = fail;
    }

    /// Make every subsequent table creation fail
    pub async fn fail_init(&self, fail: bool) {
        self.state.lock().await.fail_init = fail;
    }

    /// Make every subsequent listing fail
    pub async fn fail_reads(&self, fail: bool) {
        self.state.lock().await.fail_reads = fail;
    }

    /// Current lock holder, if any
    pub async fn lock_owner(&self) -> Option<String> {
        self.state.lock().await.lock.as_ref().map(|l| l.owner.clone())
    }

    /// Versions currently recorded, ascending
    pub async fn versions(&self) -> Vec<String> {
        self.state.lock().await.entries.keys().cloned().collect()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_initialized(&self) -> MigrationResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_init {
            return Err(MigrationError::LedgerInitFailed(
                "ledger table could not be created".to_string(),
            ));
        }
        state.initialized = true;
        Ok(())
    }

    async fn list_applied(&self) -> MigrationResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        if state.fail_reads {
            return Err(MigrationError::LedgerQueryFailed(
                "ledger read rejected".to_string(),
            ));
        }
        if !state.initialized {
            return Err(MigrationError::LedgerQueryFailed(
                "ledger has not been initialized".to_string(),
            ));
        }
        Ok(state.entries.values().cloned().collect())
    }

    async fn record_applied(&self, entry: &LedgerEntry) -> MigrationResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_writes {
            return Err(MigrationError::LedgerWriteFailed(format!(
                "insert of version {} rejected",
                entry.version
            )));
        }
        if state.entries.contains_key(&entry.version) {
            return Err(MigrationError::LedgerWriteFailed(format!(
                "version {} is already recorded",
                entry.version
            )));
        }
        state.entries.insert(entry.version.clone(), entry.clone());
        Ok(())
    }

    async fn remove_applied(&self, version: &str) -> MigrationResult<()> {
        let mut state = self.state.lock().await;
        if state.fail_writes {
            return Err(MigrationError::LedgerWriteFailed(format!(
                "delete of version {} rejected",
                version
            )));
        }
        state.entries.remove(version).map(|_| ()).ok_or_else(|| {
            MigrationError::LedgerWriteFailed(format!("version {} is not recorded", version))
        })
    }

    async fn try_acquire_lock(
        &self,
        owner: &str,
        stale_after: Option<Duration>,
    ) -> MigrationResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(held) = &state.lock {
            if held.owner != owner {
                let stale = stale_after
                    .and_then(|age| chrono::Duration::from_std(age).ok())
                    .map_or(false, |age| now - held.locked_at >= age);
                if !stale {
                    return Err(MigrationError::LockHeld {
                        owner: held.owner.clone(),
                    });
                }
                tracing::warn!(
                    "Taking over stale migration lock held by {} since {}",
                    held.owner,
                    held.locked_at
                );
            }
        }

        state.lock = Some(HeldLock {
            owner: owner.to_string(),
            locked_at: now,
        });
        Ok(())
    }

    async fn release_lock(&self, owner: &str) -> MigrationResult<()> {
        let mut state = self.state.lock().await;
        if state.lock.as_ref().map_or(false, |l| l.owner == owner) {
            state.lock = None;
        }
        Ok(())
    }

    async fn force_release_lock(&self) -> MigrationResult<Option<String>> {
        Ok(self.state.lock().await.lock.take().map(|l| l.owner))
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    executed: Vec<String>,
    fail_patterns: Vec<String>,
    delay: Option<Duration>,
}

/// Executor that records SQL instead of running it
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    state: Mutex<ExecutorState>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any body containing `pattern`
    pub async fn fail_on(&self, pattern: impl Into<String>) {
        self.state.lock().await.fail_patterns.push(pattern.into());
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.fail_patterns.clear();
    }

    /// Sleep before each body, to simulate a slow database
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.delay = delay;
    }

    /// Every body executed successfully so far, in order
    pub async fn executed(&self) -> Vec<String> {
        self.state.lock().await.executed.clone()
    }
}

#[async_trait]
impl SqlExecutor for MemoryExecutor {
    async fn execute(&self, sql: &str) -> MigrationResult<()> {
        let delay = self.state.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if let Some(pattern) = state.fail_patterns.iter().find(|p| sql.contains(p.as_str())) {
            return Err(MigrationError::Database(format!(
                "statement rejected (matched '{}')",
                pattern
            )));
        }
        state.executed.push(sql.to_string());
        Ok(())
    }
}
