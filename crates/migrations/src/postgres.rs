//! PostgreSQL backend
//!
//! Implements [`SqlExecutor`] and [`LedgerStore`] on top of a sqlx `PgPool`.
//! Migration bodies are sent over the simple query protocol, so a body may
//! contain several statements.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{Executor, PgPool, Postgres, Row, Transaction};

use crate::config::MigrationConfig;
use crate::definitions::LedgerEntry;
use crate::error::{MigrationError, MigrationResult};
use crate::executor::SqlExecutor;
use crate::ledger::LedgerStore;
use crate::orchestrator::Migrator;

/// Executes migration bodies against a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgExecutor {
    pool: PgPool,
    transactional: bool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            transactional: true,
        }
    }

    /// Run each migration's bodies inside one transaction
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn execute(&self, sql: &str) -> MigrationResult<()> {
        (&self.pool)
            .execute(sql)
            .await
            .map_err(|e| MigrationError::Database(e.to_string()))?;
        Ok(())
    }

    async fn execute_script(&self, statements: &[String]) -> MigrationResult<()> {
        if !self.transactional {
            for statement in statements {
                self.execute(statement).await?;
            }
            return Ok(());
        }

        let mut transaction = begin(&self.pool).await?;
        run_bodies(&mut transaction, statements).await?;
        commit(transaction).await
    }
}

async fn begin(pool: &PgPool) -> MigrationResult<Transaction<'static, Postgres>> {
    pool.begin()
        .await
        .map_err(|e| MigrationError::Database(format!("Failed to start transaction: {}", e)))
}

async fn run_bodies(
    transaction: &mut Transaction<'static, Postgres>,
    statements: &[String],
) -> MigrationResult<()> {
    for statement in statements {
        (&mut **transaction)
            .execute(statement.as_str())
            .await
            .map_err(|e| MigrationError::Database(e.to_string()))?;
    }
    Ok(())
}

async fn commit(transaction: Transaction<'static, Postgres>) -> MigrationResult<()> {
    transaction
        .commit()
        .await
        .map_err(|e| MigrationError::Database(format!("Failed to commit migration: {}", e)))
}

/// Ledger and lock tables stored in PostgreSQL
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    ledger_table: String,
    lock_table: String,
    atomic: bool,
}

impl PgLedgerStore {
    /// Table names come from a validated [`MigrationConfig`]
    pub fn new(pool: PgPool, config: &MigrationConfig) -> Self {
        Self {
            pool,
            ledger_table: config.ledger_table.clone(),
            lock_table: config.lock_table.clone(),
            atomic: false,
        }
    }

    /// Run each migration's bodies in the same transaction as its ledger
    /// write, so a crash can never leave one without the other
    pub fn with_atomic_apply(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Serializes concurrent table creation; keyed on the ledger table name
    pub fn init_lock_sql(&self) -> &'static str {
        "SELECT pg_advisory_xact_lock(hashtext($1))"
    }

    /// SQL to create the migrations ledger table
    pub fn create_ledger_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version VARCHAR(255) PRIMARY KEY,\n    \
                description TEXT NOT NULL,\n    \
                applied_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,\n    \
                checksum CHAR(64) NOT NULL,\n    \
                up_sql TEXT NOT NULL,\n    \
                down_sql TEXT NOT NULL\n\
            );",
            self.ledger_table
        )
    }

    /// SQL to create the single-row lock table
    pub fn create_lock_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id INTEGER PRIMARY KEY CHECK (id = 1),\n    \
                owner VARCHAR(64) NOT NULL,\n    \
                locked_at TIMESTAMPTZ NOT NULL\n\
            );",
            self.lock_table
        )
    }

    /// SQL to get applied migrations
    pub fn list_applied_sql(&self) -> String {
        format!(
            "SELECT version, description, applied_at, checksum, up_sql, down_sql FROM {} ORDER BY version ASC",
            self.ledger_table
        )
    }

    /// SQL to record a migration as applied
    pub fn record_applied_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, description, applied_at, checksum, up_sql, down_sql) VALUES ($1, $2, $3, $4, $5, $6)",
            self.ledger_table
        )
    }

    /// SQL to remove a migration record (for rollback)
    pub fn remove_applied_sql(&self) -> String {
        format!("DELETE FROM {} WHERE version = $1", self.ledger_table)
    }

    /// SQL to take the lock. A row held by another owner is only replaced
    /// once it is older than `$2` seconds; a NULL `$2` never replaces it.
    pub fn acquire_lock_sql(&self) -> String {
        format!(
            "INSERT INTO {table} (id, owner, locked_at) VALUES (1, $1, NOW()) \
             ON CONFLICT (id) DO UPDATE SET owner = EXCLUDED.owner, locked_at = EXCLUDED.locked_at \
             WHERE {table}.owner = EXCLUDED.owner \
             OR {table}.locked_at <= NOW() - make_interval(secs => $2)",
            table = self.lock_table
        )
    }

    pub fn lock_owner_sql(&self) -> String {
        format!("SELECT owner FROM {} WHERE id = 1", self.lock_table)
    }

    pub fn release_lock_sql(&self) -> String {
        format!("DELETE FROM {} WHERE id = 1 AND owner = $1", self.lock_table)
    }

    pub fn force_release_lock_sql(&self) -> String {
        format!("DELETE FROM {} WHERE id = 1 RETURNING owner", self.lock_table)
    }

    fn record_query<'q>(&self, sql: &'q str, entry: &'q LedgerEntry) -> Query<'q, Postgres, PgArguments> {
        sqlx::query(sql)
            .bind(&entry.version)
            .bind(&entry.description)
            .bind(entry.applied_at)
            .bind(&entry.checksum)
            .bind(&entry.up_sql)
            .bind(&entry.down_sql)
    }
}

fn record_failed(version: &str, e: sqlx::Error) -> MigrationError {
    MigrationError::LedgerWriteFailed(format!("Failed to record migration {}: {}", version, e))
}

fn remove_failed(version: &str, e: sqlx::Error) -> MigrationError {
    MigrationError::LedgerWriteFailed(format!(
        "Failed to remove migration record {}: {}",
        version, e
    ))
}

fn not_recorded(version: &str) -> MigrationError {
    MigrationError::LedgerWriteFailed(format!("Migration {} is not recorded", version))
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_initialized(&self) -> MigrationResult<()> {
        let init_failed = |e: sqlx::Error| MigrationError::LedgerInitFailed(e.to_string());

        // Concurrent CREATE TABLE IF NOT EXISTS can still collide in the catalog
        let mut transaction = self.pool.begin().await.map_err(init_failed)?;
        sqlx::query(self.init_lock_sql())
            .bind(&self.ledger_table)
            .execute(&mut *transaction)
            .await
            .map_err(init_failed)?;

        for sql in [self.create_ledger_table_sql(), self.create_lock_table_sql()] {
            sqlx::query(&sql)
                .execute(&mut *transaction)
                .await
                .map_err(init_failed)?;
        }

        transaction.commit().await.map_err(init_failed)
    }

    async fn list_applied(&self) -> MigrationResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&self.list_applied_sql())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrationError::LedgerQueryFailed(e.to_string()))?;

        let column = |e: sqlx::Error| MigrationError::LedgerQueryFailed(e.to_string());

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let applied_at: DateTime<Utc> = row.try_get("applied_at").map_err(column)?;
            entries.push(LedgerEntry {
                version: row.try_get("version").map_err(column)?,
                description: row.try_get("description").map_err(column)?,
                checksum: row.try_get("checksum").map_err(column)?,
                applied_at,
                up_sql: row.try_get("up_sql").map_err(column)?,
                down_sql: row.try_get("down_sql").map_err(column)?,
            });
        }

        Ok(entries)
    }

    async fn record_applied(&self, entry: &LedgerEntry) -> MigrationResult<()> {
        let sql = self.record_applied_sql();
        self.record_query(&sql, entry)
            .execute(&self.pool)
            .await
            .map_err(|e| record_failed(&entry.version, e))?;
        Ok(())
    }

    async fn remove_applied(&self, version: &str) -> MigrationResult<()> {
        let result = sqlx::query(&self.remove_applied_sql())
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(|e| remove_failed(version, e))?;

        if result.rows_affected() == 0 {
            return Err(not_recorded(version));
        }
        Ok(())
    }

    fn records_atomically(&self) -> bool {
        self.atomic
    }

    async fn apply_and_record(&self, entry: &LedgerEntry, statements: &[String]) -> MigrationResult<()> {
        let mut transaction = begin(&self.pool).await?;
        run_bodies(&mut transaction, statements).await?;

        let sql = self.record_applied_sql();
        self.record_query(&sql, entry)
            .execute(&mut *transaction)
            .await
            .map_err(|e| record_failed(&entry.version, e))?;

        commit(transaction).await
    }

    async fn revert_and_remove(&self, version: &str, statements: &[String]) -> MigrationResult<()> {
        let mut transaction = begin(&self.pool).await?;
        run_bodies(&mut transaction, statements).await?;

        let result = sqlx::query(&self.remove_applied_sql())
            .bind(version)
            .execute(&mut *transaction)
            .await
            .map_err(|e| remove_failed(version, e))?;

        // Dropping the transaction rolls the reverse bodies back
        if result.rows_affected() == 0 {
            return Err(not_recorded(version));
        }

        commit(transaction).await
    }

    async fn try_acquire_lock(
        &self,
        owner: &str,
        stale_after: Option<Duration>,
    ) -> MigrationResult<()> {
        let inserted = sqlx::query(&self.acquire_lock_sql())
            .bind(owner)
            .bind(stale_after.map(|age| age.as_secs_f64()))
            .execute(&self.pool)
            .await?
            .rows_affected();

        if inserted == 1 {
            return Ok(());
        }

        let holder: Option<String> = sqlx::query(&self.lock_owner_sql())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("owner"))
            .transpose()?;

        match holder {
            Some(holder) if holder == owner => Ok(()),
            Some(holder) => Err(MigrationError::LockHeld { owner: holder }),
            // Released between the insert and the lookup
            None => Err(MigrationError::LockHeld {
                owner: "another migration run".to_string(),
            }),
        }
    }

    async fn release_lock(&self, owner: &str) -> MigrationResult<()> {
        sqlx::query(&self.release_lock_sql())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn force_release_lock(&self) -> MigrationResult<Option<String>> {
        let owner: Option<String> = sqlx::query(&self.force_release_lock_sql())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("owner"))
            .transpose()?;
        Ok(owner)
    }
}

impl Migrator {
    /// Build a migrator backed by an existing pool. With `transactional`
    /// set, each migration's bodies commit together with its ledger row.
    pub fn for_pool(pool: PgPool, config: MigrationConfig) -> MigrationResult<Self> {
        config.validate()?;

        let ledger =
            PgLedgerStore::new(pool.clone(), &config).with_atomic_apply(config.transactional);
        let executor = PgExecutor::new(pool).with_transactional(config.transactional);

        Migrator::from_config(
            config,
            std::sync::Arc::new(ledger),
            std::sync::Arc::new(executor),
        )
    }

    /// Connect to PostgreSQL and build a migrator
    pub async fn connect(database_url: &str, config: MigrationConfig) -> MigrationResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to connect to database: {}", e)))?;

        Self::for_pool(pool, config)
    }
}
