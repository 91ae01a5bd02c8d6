//! Migration configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MigrationError, MigrationResult};

/// What to do when an applied migration's artifact no longer matches the
/// checksum stored in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Do not compare checksums
    Ignore,
    /// Log a warning and continue
    #[default]
    Warn,
    /// Refuse to run while any applied migration has drifted
    Error,
}

/// Configuration for the migration system
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory where migration files are stored
    pub migrations_dir: PathBuf,
    /// File extension recognized as a migration artifact
    pub extension: String,
    /// Table name for tracking applied migrations
    pub ledger_table: String,
    /// Single-row table used as the cross-process migration lock
    pub lock_table: String,
    /// Acquire the migration lock around every run
    pub use_lock: bool,
    pub checksum_policy: ChecksumPolicy,
    /// Upper bound for executing one migration's bodies, in milliseconds
    pub statement_timeout_ms: Option<u64>,
    /// Age after which a lock left behind by a crashed run may be taken over.
    /// `None` keeps a lock until it is released or force-unlocked.
    pub stale_lock_after_secs: Option<u64>,
    /// Wrap each migration's bodies in one transaction when the backend can
    pub transactional: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            extension: "sql".to_string(),
            ledger_table: "schema_migrations".to_string(),
            lock_table: "schema_migrations_lock".to_string(),
            use_lock: true,
            checksum_policy: ChecksumPolicy::default(),
            statement_timeout_ms: None,
            stale_lock_after_secs: Some(3600),
            transactional: true,
        }
    }
}

impl MigrationConfig {
    pub fn with_migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }

    pub fn with_lock_table(mut self, table: impl Into<String>) -> Self {
        self.lock_table = table.into();
        self
    }

    pub fn with_lock(mut self, use_lock: bool) -> Self {
        self.use_lock = use_lock;
        self
    }

    pub fn with_checksum_policy(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum_policy = policy;
        self
    }

    /// Millisecond precision; anything finer is truncated
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.statement_timeout_ms = Some(millis);
        self
    }

    pub fn with_stale_lock_after_secs(mut self, secs: Option<u64>) -> Self {
        self.stale_lock_after_secs = secs;
        self
    }

    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }

    pub fn stale_lock_after(&self) -> Option<Duration> {
        self.stale_lock_after_secs.map(Duration::from_secs)
    }

    /// Check the configuration before it is used to build SQL
    pub fn validate(&self) -> MigrationResult<()> {
        validate_identifier("ledger_table", &self.ledger_table)?;
        validate_identifier("lock_table", &self.lock_table)?;

        if self.ledger_table == self.lock_table {
            return Err(MigrationError::Configuration(
                "ledger_table and lock_table must differ".to_string(),
            ));
        }

        if self.extension.is_empty() || self.extension.contains('.') {
            return Err(MigrationError::Configuration(format!(
                "extension must be a bare extension like 'sql', got '{}'",
                self.extension
            )));
        }

        if self.statement_timeout_ms == Some(0) {
            return Err(MigrationError::Configuration(
                "statement_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.stale_lock_after_secs == Some(0) {
            return Err(MigrationError::Configuration(
                "stale_lock_after_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass
fn validate_identifier(field: &str, name: &str) -> MigrationResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');

    if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') || name.len() > 63 {
        return Err(MigrationError::Configuration(format!(
            "{} '{}' is not a valid SQL identifier",
            field, name
        )));
    }

    Ok(())
}
