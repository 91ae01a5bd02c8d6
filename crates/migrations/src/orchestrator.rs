//! Migration Orchestrator - applies and rolls back migrations against the ledger
//!
//! Runs are strictly sequential: forward runs go in ascending version order,
//! rollbacks in descending order, and both stop at the first failure. Every
//! migration that completed before the failure stays recorded, so a fixed
//! run resumes where the failed one stopped.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::config::{ChecksumPolicy, MigrationConfig};
use crate::definitions::{
    LedgerEntry, MigrationDefinition, MigrationDirection, MigrationRunResult, MigrationStatus,
};
use crate::error::{MigrationError, MigrationResult};
use crate::executor::SqlExecutor;
use crate::ledger::LedgerStore;
use crate::loader::MigrationLoader;
use crate::scaffold::ScaffoldGenerator;
use crate::validator::{validate, ValidationReport};

/// Ledger and source state read at the start of a run
struct Snapshot {
    definitions: Vec<MigrationDefinition>,
    applied: Vec<LedgerEntry>,
    status: MigrationStatus,
}

/// Why a run stopped, and at which version if a migration was in flight
struct StepFailure {
    version: Option<String>,
    error: MigrationError,
}

impl StepFailure {
    fn at(version: &str, error: MigrationError) -> Self {
        Self {
            version: Some(version.to_string()),
            error,
        }
    }
}

impl From<MigrationError> for StepFailure {
    fn from(error: MigrationError) -> Self {
        Self {
            version: None,
            error,
        }
    }
}

/// Holds the migration lock for one run. Dropping it without calling
/// [`LockGuard::release`] (the run was cancelled) releases the lock on a
/// spawned task.
struct LockGuard {
    ledger: Arc<dyn LedgerStore>,
    owner: Option<String>,
}

impl LockGuard {
    fn unlocked(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            ledger,
            owner: None,
        }
    }

    async fn release(mut self) {
        if let Some(owner) = self.owner.clone() {
            release_lock(self.ledger.as_ref(), &owner).await;
            self.owner = None;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(owner) = self.owner.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("Migration run {} was cancelled, releasing its lock", owner);
                let ledger = self.ledger.clone();
                handle.spawn(async move {
                    release_lock(ledger.as_ref(), &owner).await;
                });
            }
            Err(_) => tracing::warn!(
                "Migration lock {} left held: no runtime to release it on",
                owner
            ),
        }
    }
}

async fn release_lock(ledger: &dyn LedgerStore, owner: &str) {
    match ledger.release_lock(owner).await {
        Ok(()) => tracing::debug!("Released migration lock {}", owner),
        Err(e) => tracing::warn!("Failed to release migration lock {}: {}", owner, e),
    }
}

/// Applies and rolls back migrations from a loader against a ledger
pub struct Migrator {
    loader: MigrationLoader,
    ledger: Arc<dyn LedgerStore>,
    executor: Arc<dyn SqlExecutor>,
    config: MigrationConfig,
}

impl Migrator {
    /// Create a migrator with default configuration
    pub fn new(
        loader: MigrationLoader,
        ledger: Arc<dyn LedgerStore>,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        Self {
            loader,
            ledger,
            executor,
            config: MigrationConfig::default(),
        }
    }

    /// Create a migrator reading the configured migrations directory
    pub fn from_config(
        config: MigrationConfig,
        ledger: Arc<dyn LedgerStore>,
        executor: Arc<dyn SqlExecutor>,
    ) -> MigrationResult<Self> {
        config.validate()?;
        Ok(Self::new(MigrationLoader::from_config(&config), ledger, executor).with_config(config))
    }

    /// Replace the run configuration (lock, checksum policy, timeout)
    pub fn with_config(mut self, config: MigrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn loader(&self) -> &MigrationLoader {
        &self.loader
    }

    /// Load every migration definition, ascending by version
    pub fn load_all(&self) -> MigrationResult<Vec<MigrationDefinition>> {
        self.loader.load_all()
    }

    /// Load and validate every migration definition
    pub fn validate(&self) -> MigrationResult<ValidationReport> {
        Ok(validate(&self.loader.load_all()?))
    }

    /// Write a new empty migration into the configured directory
    pub fn create_new(&self, description: &str) -> MigrationResult<PathBuf> {
        ScaffoldGenerator::from_config(&self.config).create_new(description)
    }

    /// Current state of the ledger against the loaded definitions.
    /// The ledger is re-read on every call.
    pub async fn get_status(&self) -> MigrationResult<MigrationStatus> {
        Ok(self.snapshot().await?.status)
    }

    /// Clear a lock left behind by a run that died without releasing it.
    /// Returns the owner that held it.
    pub async fn force_unlock(&self) -> MigrationResult<Option<String>> {
        self.ledger.ensure_initialized().await?;

        let previous = self.ledger.force_release_lock().await?;
        if let Some(owner) = &previous {
            tracing::warn!("Forcibly released migration lock held by {}", owner);
        }
        Ok(previous)
    }

    /// Apply pending migrations in ascending order, up to and including
    /// `target` when given
    pub async fn migrate(&self, target: Option<&str>) -> MigrationRunResult {
        self.run(MigrationDirection::Up, target).await
    }

    /// Roll back applied migrations in descending order, down to but not
    /// including `target` when given
    pub async fn rollback(&self, target: Option<&str>) -> MigrationRunResult {
        self.run(MigrationDirection::Down, target).await
    }

    async fn run(&self, direction: MigrationDirection, target: Option<&str>) -> MigrationRunResult {
        let started = Instant::now();
        let mut result = MigrationRunResult::new(direction);

        let outcome = match self.acquire_lock().await {
            Ok(guard) => {
                let outcome = match direction {
                    MigrationDirection::Up => self.apply_pending(target, &mut result).await,
                    MigrationDirection::Down => self.revert_applied(target, &mut result).await,
                };
                guard.release().await;
                outcome
            }
            Err(e) => Err(StepFailure::from(e)),
        };

        match outcome {
            Ok(message) => result.succeed(message),
            Err(failure) => result.fail(failure.version, failure.error),
        }
        result.elapsed = started.elapsed();

        if result.success {
            tracing::info!("{} in {:?}", result.message, result.elapsed);
        } else {
            tracing::error!("{}", result.message);
        }

        result
    }

    async fn apply_pending(
        &self,
        target: Option<&str>,
        result: &mut MigrationRunResult,
    ) -> Result<String, StepFailure> {
        let snapshot = self.snapshot().await?;
        if let Some(target) = target {
            check_target(target, &snapshot)?;
        }
        self.check_drift(&snapshot.status)?;

        let pending: HashSet<&str> = snapshot
            .status
            .pending_versions
            .iter()
            .map(String::as_str)
            .collect();

        let candidates: Vec<&MigrationDefinition> = snapshot
            .definitions
            .iter()
            .filter(|d| pending.contains(d.version.as_str()))
            .filter(|d| target.map_or(true, |t| d.version.as_str() <= t))
            .collect();

        if candidates.is_empty() {
            return Ok("No migrations to apply".to_string());
        }

        for definition in candidates {
            tracing::info!(
                "Applying migration: {} - {}",
                definition.version,
                definition.description
            );

            self.apply_one(definition).await?;

            result.applied_versions.push(definition.version.clone());
        }

        Ok(format!(
            "Applied {} migration(s)",
            result.applied_versions.len()
        ))
    }

    async fn revert_applied(
        &self,
        target: Option<&str>,
        result: &mut MigrationRunResult,
    ) -> Result<String, StepFailure> {
        let snapshot = self.snapshot().await?;
        if let Some(target) = target {
            check_target(target, &snapshot)?;
        }
        self.check_drift(&snapshot.status)?;

        let definitions: HashMap<&str, &MigrationDefinition> = snapshot
            .definitions
            .iter()
            .map(|d| (d.version.as_str(), d))
            .collect();

        let candidates: Vec<&LedgerEntry> = snapshot
            .applied
            .iter()
            .rev()
            .filter(|e| target.map_or(true, |t| e.version.as_str() > t))
            .collect();

        if candidates.is_empty() {
            return Ok("No migrations to rollback".to_string());
        }

        for entry in candidates {
            let statements = match definitions.get(entry.version.as_str()) {
                Some(definition) => {
                    tracing::info!(
                        "Rolling back migration: {} - {}",
                        definition.version,
                        definition.description
                    );
                    definition.down_statements.clone()
                }
                None => {
                    tracing::warn!(
                        "Migration file for {} not found, rolling back with the SQL stored in the ledger",
                        entry.version
                    );
                    if entry.down_sql.trim().is_empty() {
                        Vec::new()
                    } else {
                        vec![entry.down_sql.clone()]
                    }
                }
            };

            // A ledger row is only removed after DOWN SQL actually ran
            if statements.iter().all(|s| s.trim().is_empty()) {
                return Err(StepFailure::at(
                    &entry.version,
                    MigrationError::IrreversibleMigration(entry.version.clone()),
                ));
            }

            self.revert_one(&entry.version, &statements).await?;

            result.rolled_back_versions.push(entry.version.clone());
        }

        Ok(format!(
            "Rolled back {} migration(s)",
            result.rolled_back_versions.len()
        ))
    }

    async fn snapshot(&self) -> MigrationResult<Snapshot> {
        self.ledger.ensure_initialized().await?;

        let mut applied = self.ledger.list_applied().await?;
        applied.sort_by(|a, b| a.version.cmp(&b.version));

        let definitions = self.loader.load_all()?;
        let status = build_status(&definitions, &applied);

        Ok(Snapshot {
            definitions,
            applied,
            status,
        })
    }

    /// Run forward bodies, then record the entry. Both happen in one
    /// transaction when the ledger supports it.
    async fn apply_one(&self, definition: &MigrationDefinition) -> Result<(), StepFailure> {
        let version = definition.version.as_str();
        let entry = LedgerEntry::from_definition(definition, Utc::now());

        if self.ledger.records_atomically() {
            return self
                .bounded(self.ledger.apply_and_record(&entry, &definition.up_statements))
                .await
                .map_err(|e| step_failure(version, e));
        }

        self.bounded(self.executor.execute_script(&definition.up_statements))
            .await
            .map_err(|e| sql_failure(version, e))?;

        self.ledger
            .record_applied(&entry)
            .await
            .map_err(|e| StepFailure::at(version, e))
    }

    async fn revert_one(&self, version: &str, statements: &[String]) -> Result<(), StepFailure> {
        if self.ledger.records_atomically() {
            return self
                .bounded(self.ledger.revert_and_remove(version, statements))
                .await
                .map_err(|e| step_failure(version, e));
        }

        self.bounded(self.executor.execute_script(statements))
            .await
            .map_err(|e| sql_failure(version, e))?;

        self.ledger
            .remove_applied(version)
            .await
            .map_err(|e| StepFailure::at(version, e))
    }

    /// Apply the configured statement timeout to one migration's work
    async fn bounded<F>(&self, work: F) -> MigrationResult<()>
    where
        F: Future<Output = MigrationResult<()>>,
    {
        match self.config.statement_timeout() {
            Some(limit) => tokio::time::timeout(limit, work).await.unwrap_or_else(|_| {
                Err(MigrationError::Database(format!("timed out after {:?}", limit)))
            }),
            None => work.await,
        }
    }

    fn check_drift(&self, status: &MigrationStatus) -> MigrationResult<()> {
        if status.drifted_versions.is_empty() {
            return Ok(());
        }

        match self.config.checksum_policy {
            ChecksumPolicy::Ignore => Ok(()),
            ChecksumPolicy::Warn => {
                tracing::warn!(
                    "Applied migrations changed since they were applied: {}",
                    status.drifted_versions.join(", ")
                );
                Ok(())
            }
            ChecksumPolicy::Error => Err(MigrationError::ChecksumDrift(
                status.drifted_versions.clone(),
            )),
        }
    }

    async fn acquire_lock(&self) -> MigrationResult<LockGuard> {
        if !self.config.use_lock {
            return Ok(LockGuard::unlocked(self.ledger.clone()));
        }

        // The lock table is created alongside the ledger
        self.ledger.ensure_initialized().await?;

        let owner = Uuid::new_v4().to_string();
        self.ledger
            .try_acquire_lock(&owner, self.config.stale_lock_after())
            .await?;
        tracing::debug!("Acquired migration lock {}", owner);

        Ok(LockGuard {
            ledger: self.ledger.clone(),
            owner: Some(owner),
        })
    }
}

/// Errors from the ledger write keep their kind; anything else failed in SQL
fn step_failure(version: &str, error: MigrationError) -> StepFailure {
    match error {
        MigrationError::LedgerWriteFailed(_) => StepFailure::at(version, error),
        other => sql_failure(version, other),
    }
}

fn sql_failure(version: &str, error: MigrationError) -> StepFailure {
    StepFailure::at(
        version,
        MigrationError::SqlExecutionFailed {
            version: version.to_string(),
            cause: error.to_string(),
        },
    )
}

/// Diff loaded definitions against ledger rows sorted by version
fn build_status(definitions: &[MigrationDefinition], applied: &[LedgerEntry]) -> MigrationStatus {
    let applied_checksums: HashMap<&str, &str> = applied
        .iter()
        .map(|e| (e.version.as_str(), e.checksum.as_str()))
        .collect();

    let pending_versions: Vec<String> = definitions
        .iter()
        .filter(|d| !applied_checksums.contains_key(d.version.as_str()))
        .map(|d| d.version.clone())
        .collect();

    let drifted_versions = definitions
        .iter()
        .filter(|d| {
            applied_checksums
                .get(d.version.as_str())
                .map_or(false, |checksum| *checksum != d.checksum)
        })
        .map(|d| d.version.clone())
        .collect();

    let applied_versions: Vec<String> = applied.iter().map(|e| e.version.clone()).collect();

    MigrationStatus {
        current_version: applied_versions.iter().max().cloned(),
        is_up_to_date: pending_versions.is_empty(),
        pending_versions,
        applied_versions,
        drifted_versions,
    }
}

/// Targets are compared as strings, so they must share the versions' width
fn check_target(target: &str, snapshot: &Snapshot) -> MigrationResult<()> {
    if target.is_empty() || !target.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MigrationError::InvalidVersion {
            version: target.to_string(),
            reason: "target must be a numeric version".to_string(),
        });
    }

    let width = snapshot
        .definitions
        .first()
        .map(|d| d.version.len())
        .or_else(|| snapshot.applied.first().map(|e| e.version.len()));

    match width {
        Some(width) if width != target.len() => Err(MigrationError::InvalidVersion {
            version: target.to_string(),
            reason: format!("target must have {} digits like the known versions", width),
        }),
        _ => Ok(()),
    }
}
