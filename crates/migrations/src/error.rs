//! Error types for the migration engine
//!
//! Loader, ledger and scaffold failures are returned as `Err`. Failures that
//! happen while a run is in progress are captured into
//! [`MigrationRunResult`](crate::definitions::MigrationRunResult) instead, so
//! callers always learn how far the run got.

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Error types for migration operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("Migration source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Invalid migration version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("Inconsistent migration version width: '{first}' has {expected} digits but '{version}' has {found}")]
    InconsistentVersionWidth {
        first: String,
        version: String,
        expected: usize,
        found: usize,
    },

    #[error("Duplicate migration version '{0}'")]
    DuplicateVersion(String),

    #[error("Failed to initialize migration ledger: {0}")]
    LedgerInitFailed(String),

    #[error("Failed to query migration ledger: {0}")]
    LedgerQueryFailed(String),

    #[error("Failed to write migration ledger: {0}")]
    LedgerWriteFailed(String),

    #[error("Failed to execute migration {version}: {cause}")]
    SqlExecutionFailed { version: String, cause: String },

    #[error("Migration {0} has no DOWN SQL and cannot be rolled back")]
    IrreversibleMigration(String),

    #[error("Migration lock is held by {owner}")]
    LockHeld { owner: String },

    #[error("Applied migrations were modified after being applied: {}", .0.join(", "))]
    ChecksumDrift(Vec<String>),

    #[error("Failed to write migration file: {0}")]
    ScaffoldWriteFailed(String),

    #[error("Invalid migration description '{0}'")]
    InvalidDescription(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MigrationError {
    /// Version the error is attributed to, when there is one
    pub fn version(&self) -> Option<&str> {
        match self {
            MigrationError::SqlExecutionFailed { version, .. }
            | MigrationError::InvalidVersion { version, .. }
            | MigrationError::InconsistentVersionWidth { version, .. } => Some(version.as_str()),
            MigrationError::DuplicateVersion(version)
            | MigrationError::IrreversibleMigration(version) => Some(version.as_str()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database(err.to_string())
    }
}
