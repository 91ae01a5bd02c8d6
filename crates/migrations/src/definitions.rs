//! Migration Definitions - Core types shared across the migration engine
//!
//! Defines the loaded migration unit, the persisted ledger row and the derived
//! status/run reports.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

/// Sentinel reported as the current version when nothing has been applied
pub const NO_VERSION: &str = "none";

/// A versioned schema change loaded from a migration artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationDefinition {
    /// Sort and uniqueness key, taken from the artifact name
    pub version: String,
    /// Human-readable label, the remainder of the artifact name
    pub description: String,
    /// SQL bodies applied in order when migrating forward
    pub up_statements: Vec<String>,
    /// SQL bodies applied in order when rolling back
    pub down_statements: Vec<String>,
    /// Hex-encoded SHA-256 of the raw artifact bytes
    pub checksum: String,
}

impl MigrationDefinition {
    /// Forward bodies as they are stored in the ledger
    pub fn up_sql(&self) -> String {
        join_statements(&self.up_statements)
    }

    /// Reverse bodies as they are stored in the ledger
    pub fn down_sql(&self) -> String {
        join_statements(&self.down_statements)
    }
}

fn join_statements(statements: &[String]) -> String {
    statements.join("\n\n")
}

/// A ledger row recording that a migration version has been applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub version: String,
    pub description: String,
    /// Checksum of the definition at apply time
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    /// Exact forward SQL that was executed
    pub up_sql: String,
    /// Reverse SQL kept for audit and for rollback when the artifact is gone
    pub down_sql: String,
}

impl LedgerEntry {
    /// Snapshot a definition at the moment it was applied
    pub fn from_definition(definition: &MigrationDefinition, applied_at: DateTime<Utc>) -> Self {
        Self {
            version: definition.version.clone(),
            description: definition.description.clone(),
            checksum: definition.checksum.clone(),
            applied_at,
            up_sql: definition.up_sql(),
            down_sql: definition.down_sql(),
        }
    }
}

/// Migration state derived from the loaded definitions and the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Highest applied version, `None` when the ledger is empty
    pub current_version: Option<String>,
    /// Loaded versions that are not in the ledger, ascending
    pub pending_versions: Vec<String>,
    /// Versions recorded in the ledger, ascending
    pub applied_versions: Vec<String>,
    pub is_up_to_date: bool,
    /// Applied versions whose artifact no longer matches the stored checksum
    pub drifted_versions: Vec<String>,
}

impl MigrationStatus {
    /// Current version, or [`NO_VERSION`] when nothing is applied
    pub fn current_version_label(&self) -> &str {
        self.current_version.as_deref().unwrap_or(NO_VERSION)
    }
}

/// Direction of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationDirection {
    /// Apply the migration (run UP statements)
    Up,
    /// Rollback the migration (run DOWN statements)
    Down,
}

/// Outcome of a single `migrate` or `rollback` invocation
#[derive(Debug, Clone)]
pub struct MigrationRunResult {
    pub direction: MigrationDirection,
    pub success: bool,
    pub message: String,
    /// Versions committed during a forward run, in apply order
    pub applied_versions: Vec<String>,
    /// Versions reversed during a rollback run, in rollback order
    pub rolled_back_versions: Vec<String>,
    /// Version that stopped the run, if a specific migration failed
    pub failed_version: Option<String>,
    pub error: Option<MigrationError>,
    pub elapsed: Duration,
}

impl MigrationRunResult {
    pub(crate) fn new(direction: MigrationDirection) -> Self {
        Self {
            direction,
            success: false,
            message: String::new(),
            applied_versions: Vec::new(),
            rolled_back_versions: Vec::new(),
            failed_version: None,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Number of migrations this run committed in its direction
    pub fn completed_count(&self) -> usize {
        match self.direction {
            MigrationDirection::Up => self.applied_versions.len(),
            MigrationDirection::Down => self.rolled_back_versions.len(),
        }
    }

    pub(crate) fn succeed(&mut self, message: impl Into<String>) {
        self.success = true;
        self.message = message.into();
        self.failed_version = None;
        self.error = None;
    }

    pub(crate) fn fail(&mut self, failed_version: Option<String>, error: MigrationError) {
        self.success = false;
        self.message = match &failed_version {
            Some(version) => format!(
                "Migration {} failed after {} completed: {}",
                version,
                self.completed_count(),
                error
            ),
            None => format!("Migration run aborted: {}", error),
        };
        self.failed_version = failed_version;
        self.error = Some(error);
    }
}
