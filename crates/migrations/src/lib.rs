//! # elif-migrations: versioned SQL schema migrations for elif.rs
//!
//! Loads hand-written migration files, records applied versions in a ledger
//! table and applies or rolls them back one at a time in version order.
//!
//! Migration files are named `<version>_<description>.sql` and split into
//! sections by `-- UP` and `-- DOWN` marker lines:
//!
//! ```sql
//! -- UP
//! CREATE TABLE events (id SERIAL PRIMARY KEY, title TEXT NOT NULL);
//!
//! -- DOWN
//! DROP TABLE events;
//! ```
//!
//! [`Migrator`] ties a [`MigrationLoader`], a [`LedgerStore`] and a
//! [`SqlExecutor`] together. The `postgres` module provides sqlx-backed
//! implementations; the `memory` module keeps everything in process.

pub mod config;
pub mod definitions;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod loader;
pub mod memory;
pub mod orchestrator;
pub mod postgres;
pub mod scaffold;
pub mod validator;

pub use config::*;
pub use definitions::*;
pub use error::*;
pub use executor::SqlExecutor;
pub use ledger::LedgerStore;
pub use loader::{DirectorySource, EmbeddedSource, MigrationArtifact, MigrationLoader, MigrationSource};
pub use memory::{MemoryExecutor, MemoryLedgerStore};
pub use orchestrator::Migrator;
pub use postgres::{PgExecutor, PgLedgerStore};
pub use scaffold::ScaffoldGenerator;
pub use validator::{validate, ValidationReport};
