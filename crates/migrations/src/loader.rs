//! Migration Loader - Reads migration artifacts and parses them into definitions
//!
//! Artifacts are named `<version>_<description>.<ext>` and carry `-- UP` and
//! `-- DOWN` marker lines separating the forward and reverse SQL.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::MigrationConfig;
use crate::definitions::MigrationDefinition;
use crate::error::{MigrationError, MigrationResult};

const UP_MARKER: &str = "-- UP";
const DOWN_MARKER: &str = "-- DOWN";

/// Raw migration artifact as produced by a [`MigrationSource`]
#[derive(Debug, Clone)]
pub struct MigrationArtifact {
    /// Artifact name including its extension, e.g. `001_create_users.sql`
    pub name: String,
    pub content: Vec<u8>,
}

/// Somewhere migration artifacts can be enumerated from
pub trait MigrationSource: Send + Sync {
    /// List every artifact the source holds, in no particular order
    fn artifacts(&self) -> MigrationResult<Vec<MigrationArtifact>>;

    /// Human-readable location used in logs
    fn describe(&self) -> String;
}

/// Migrations stored as files in a directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl MigrationSource for DirectorySource {
    fn artifacts(&self) -> MigrationResult<Vec<MigrationArtifact>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            MigrationError::SourceUnavailable(format!(
                "Failed to read migrations directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                MigrationError::SourceUnavailable(format!("Failed to read directory entry: {}", e))
            })?;

            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!("Skipping migration file with non UTF-8 name: {}", path.display());
                continue;
            };

            let content = fs::read(&path).map_err(|e| {
                MigrationError::SourceUnavailable(format!(
                    "Failed to read migration file {}: {}",
                    path.display(),
                    e
                ))
            })?;

            artifacts.push(MigrationArtifact {
                name: name.to_string(),
                content,
            });
        }

        Ok(artifacts)
    }

    fn describe(&self) -> String {
        self.dir.display().to_string()
    }
}

/// Migrations compiled into the binary, typically with `include_str!`
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSource {
    artifacts: Vec<(String, String)>,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an artifact by file name and contents
    pub fn with(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.artifacts.push((name.into(), content.into()));
        self
    }
}

impl MigrationSource for EmbeddedSource {
    fn artifacts(&self) -> MigrationResult<Vec<MigrationArtifact>> {
        Ok(self
            .artifacts
            .iter()
            .map(|(name, content)| MigrationArtifact {
                name: name.clone(),
                content: content.clone().into_bytes(),
            })
            .collect())
    }

    fn describe(&self) -> String {
        format!("embedded ({} artifacts)", self.artifacts.len())
    }
}

/// Loads and parses migration definitions from a source
pub struct MigrationLoader {
    source: Box<dyn MigrationSource>,
    extension: String,
}

impl MigrationLoader {
    /// Create a loader reading `.sql` artifacts from the given source
    pub fn new(source: impl MigrationSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            extension: "sql".to_string(),
        }
    }

    /// Create a loader for the configured migrations directory
    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(DirectorySource::new(&config.migrations_dir)).with_extension(&config.extension)
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn source(&self) -> &dyn MigrationSource {
        self.source.as_ref()
    }

    /// Load every well-named artifact, ordered by ascending version
    pub fn load_all(&self) -> MigrationResult<Vec<MigrationDefinition>> {
        let mut migrations = Vec::new();

        for artifact in self.source.artifacts()? {
            let Some((version, description)) = parse_artifact_name(&artifact.name, &self.extension)
            else {
                if artifact.name.ends_with(&format!(".{}", self.extension)) {
                    tracing::warn!(
                        "Skipping migration file {} (expected <version>_<description>.{})",
                        artifact.name,
                        self.extension
                    );
                } else {
                    tracing::debug!("Ignoring non-migration file {}", artifact.name);
                }
                continue;
            };

            if !version.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MigrationError::InvalidVersion {
                    version,
                    reason: format!("{} must start with a numeric version", artifact.name),
                });
            }

            let content = std::str::from_utf8(&artifact.content).map_err(|e| {
                MigrationError::SourceUnavailable(format!(
                    "Migration file {} is not valid UTF-8: {}",
                    artifact.name, e
                ))
            })?;

            let (up_statements, down_statements) = parse_migration_content(content);

            migrations.push(MigrationDefinition {
                version,
                description,
                up_statements,
                down_statements,
                checksum: checksum(&artifact.content),
            });
        }

        // Sort by version; fixed width makes this numeric order as well
        migrations.sort_by(|a, b| a.version.cmp(&b.version));
        check_versions(&migrations)?;

        tracing::debug!(
            "Loaded {} migrations from {}",
            migrations.len(),
            self.source.describe()
        );
        Ok(migrations)
    }
}

/// Split `<version>_<description>.<ext>` into its version and description
pub fn parse_artifact_name(name: &str, extension: &str) -> Option<(String, String)> {
    let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
    let (version, rest) = stem.split_once('_')?;
    if version.is_empty() {
        return None;
    }

    Some((version.to_string(), rest.replace('_', " ").trim().to_string()))
}

/// Parse migration content into UP and DOWN bodies.
///
/// Each marker line opens a new body. Comment lines are dropped, the rest is
/// kept verbatim so multi-statement SQL reaches the executor as one string.
pub fn parse_migration_content(content: &str) -> (Vec<String>, Vec<String>) {
    let mut up = Vec::new();
    let mut down = Vec::new();
    let mut current: Option<(bool, Vec<&str>)> = None;

    for line in content.lines() {
        let trimmed = line.trim();

        let opens_up = trimmed == UP_MARKER;
        if opens_up || trimmed == DOWN_MARKER {
            if let Some((is_up, lines)) = current.take() {
                push_body(if is_up { &mut up } else { &mut down }, &lines);
            }
            current = Some((opens_up, Vec::new()));
            continue;
        }

        if trimmed.starts_with("--") {
            continue;
        }

        // Text before the first marker belongs to no section
        if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }

    if let Some((is_up, lines)) = current {
        push_body(if is_up { &mut up } else { &mut down }, &lines);
    }

    (up, down)
}

fn push_body(target: &mut Vec<String>, lines: &[&str]) {
    let start = lines.iter().position(|l| !l.trim().is_empty());
    let end = lines.iter().rposition(|l| !l.trim().is_empty());

    if let (Some(start), Some(end)) = (start, end) {
        target.push(lines[start..=end].join("\n"));
    }
}

/// Hex-encoded SHA-256 of the raw artifact bytes
pub fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

fn check_versions(migrations: &[MigrationDefinition]) -> MigrationResult<()> {
    let Some(first) = migrations.first() else {
        return Ok(());
    };

    for pair in migrations.windows(2) {
        if pair[0].version == pair[1].version {
            return Err(MigrationError::DuplicateVersion(pair[1].version.clone()));
        }
    }

    let width = first.version.len();
    if let Some(odd) = migrations.iter().find(|m| m.version.len() != width) {
        return Err(MigrationError::InconsistentVersionWidth {
            first: first.version.clone(),
            version: odd.version.clone(),
            expected: width,
            found: odd.version.len(),
        });
    }

    Ok(())
}
