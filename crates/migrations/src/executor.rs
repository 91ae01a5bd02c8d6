//! SQL execution seam
//!
//! The engine never talks to a driver directly; migration bodies go through
//! [`SqlExecutor`], which a backend implements on top of its connection pool.

use async_trait::async_trait;

use crate::error::MigrationResult;

/// Runs raw SQL against the target database
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Execute one SQL body. A body may hold several statements and is passed
    /// through untouched.
    async fn execute(&self, sql: &str) -> MigrationResult<()>;

    /// Execute the bodies of one migration in order, stopping at the first
    /// failure. Backends that support it override this to run the bodies in
    /// a single transaction.
    async fn execute_script(&self, statements: &[String]) -> MigrationResult<()> {
        for statement in statements {
            self.execute(statement).await?;
        }
        Ok(())
    }
}
