//! Scaffold Generator - creates new, empty migration files

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, MigrationResult};
use crate::loader::parse_artifact_name;

/// Timestamp layout used for new versions, 14 digits
const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Writes migration templates into the migrations directory
#[derive(Debug, Clone)]
pub struct ScaffoldGenerator {
    dir: PathBuf,
    extension: String,
}

impl ScaffoldGenerator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: "sql".to_string(),
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self {
            dir: config.migrations_dir.clone(),
            extension: config.extension.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a new migration file and return its path
    pub fn create_new(&self, description: &str) -> MigrationResult<PathBuf> {
        self.create_at(description, Utc::now())
    }

    fn create_at(&self, description: &str, now: DateTime<Utc>) -> MigrationResult<PathBuf> {
        let slug = sanitize_description(description);
        if slug.is_empty() {
            return Err(MigrationError::InvalidDescription(description.to_string()));
        }

        fs::create_dir_all(&self.dir).map_err(|e| {
            MigrationError::ScaffoldWriteFailed(format!(
                "Failed to create migrations directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let version = self.next_version(now)?;
        let path = self
            .dir
            .join(format!("{}_{}.{}", version, slug, self.extension));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                MigrationError::ScaffoldWriteFailed(format!("{}: {}", path.display(), e))
            })?;

        file.write_all(migration_template(description.trim(), &version, now).as_bytes())
            .map_err(|e| {
                MigrationError::ScaffoldWriteFailed(format!("{}: {}", path.display(), e))
            })?;

        tracing::info!("Created migration {}", path.display());
        Ok(path)
    }

    /// Timestamp version, bumped past anything already in the directory.
    /// Directories that use another fixed width keep counting in that width.
    fn next_version(&self, now: DateTime<Utc>) -> MigrationResult<String> {
        let timestamp = now.format(VERSION_FORMAT).to_string();

        match self.latest_version()? {
            None => Ok(timestamp),
            Some(latest) if latest.len() == timestamp.len() && latest < timestamp => Ok(timestamp),
            Some(latest) => increment_version(&latest),
        }
    }

    fn latest_version(&self) -> MigrationResult<Option<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            MigrationError::SourceUnavailable(format!(
                "Failed to read migrations directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let latest = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter_map(|name| parse_artifact_name(&name, &self.extension).map(|(v, _)| v))
            .filter(|version| version.bytes().all(|b| b.is_ascii_digit()))
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

        Ok(latest)
    }
}

fn increment_version(version: &str) -> MigrationResult<String> {
    let value: u128 = version.parse().map_err(|_| MigrationError::InvalidVersion {
        version: version.to_string(),
        reason: "cannot compute the next version".to_string(),
    })?;

    Ok(format!("{:0width$}", value + 1, width = version.len()))
}

/// Lower-case the description and replace anything non-alphanumeric with `_`
pub fn sanitize_description(description: &str) -> String {
    let mut slug = String::with_capacity(description.len());

    for c in description.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }

    slug.trim_matches('_').to_string()
}

fn migration_template(description: &str, version: &str, now: DateTime<Utc>) -> String {
    format!(
        "-- Migration: {}\n\
         -- Version: {}\n\
         -- Created: {}\n\
         --\n\
         -- Everything under a marker runs as one body. Repeat a marker to\n\
         -- split the work into bodies executed one after another.\n\n\
         -- UP\n\
         -- Add your schema changes here\n\n\n\
         -- DOWN\n\
         -- Add statements that undo the UP section here\n\n",
        description,
        version,
        now.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{DirectorySource, MigrationLoader};
    use crate::validator::validate;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 30, secs).unwrap()
    }

    #[test]
    fn test_sanitize_description() {
        assert_eq!(sanitize_description("Create Users table"), "create_users_table");
        assert_eq!(sanitize_description("  add-index: users.email!  "), "add_index_users_email");
        assert_eq!(sanitize_description("???"), "");
    }

    #[test]
    fn test_create_migration_file() {
        let temp_dir = TempDir::new().unwrap();
        let generator = ScaffoldGenerator::new(temp_dir.path());

        let path = generator.create_at("Create users table", at(5)).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "20240309143005_create_users_table.sql"
        );

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("-- Migration: Create users table"));
        assert!(content.contains("\n-- UP\n"));
        assert!(content.contains("\n-- DOWN\n"));
    }

    #[test]
    fn test_template_loads_as_empty_migration() {
        let temp_dir = TempDir::new().unwrap();
        ScaffoldGenerator::new(temp_dir.path())
            .create_at("add posts", at(0))
            .unwrap();

        let migrations = MigrationLoader::new(DirectorySource::new(temp_dir.path()))
            .load_all()
            .unwrap();

        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].version, "20240309143000");
        assert_eq!(migrations[0].description, "add posts");

        let report = validate(&migrations);
        assert!(!report.is_valid);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_versions_increase_within_same_second() {
        let temp_dir = TempDir::new().unwrap();
        let generator = ScaffoldGenerator::new(temp_dir.path());

        let first = generator.create_at("first", at(10)).unwrap();
        let second = generator.create_at("second", at(10)).unwrap();
        let earlier_clock = generator.create_at("third", at(2)).unwrap();

        let name = |p: &PathBuf| p.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name(&first), "20240309143010_first.sql");
        assert_eq!(name(&second), "20240309143011_second.sql");
        assert_eq!(name(&earlier_clock), "20240309143012_third.sql");
    }

    #[test]
    fn test_keeps_existing_version_width() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("001_init.sql"), "-- UP\nSELECT 1;").unwrap();
        fs::write(temp_dir.path().join("009_more.sql"), "-- UP\nSELECT 1;").unwrap();

        let path = ScaffoldGenerator::new(temp_dir.path())
            .create_at("next one", at(0))
            .unwrap();

        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "010_next_one.sql");
    }

    #[test]
    fn test_rejects_empty_description() {
        let temp_dir = TempDir::new().unwrap();
        let result = ScaffoldGenerator::new(temp_dir.path()).create_new("  --  ");

        assert!(matches!(result, Err(MigrationError::InvalidDescription(_))));
    }

    #[test]
    fn test_write_failure() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not_a_dir");
        fs::write(&blocker, "").unwrap();

        let result = ScaffoldGenerator::new(blocker.join("migrations")).create_new("add users");
        assert!(matches!(result, Err(MigrationError::ScaffoldWriteFailed(_))));
    }
}
