//! Static checks over loaded migrations
//!
//! Validation never fails; callers look at the report and decide whether to
//! stop before running anything.

use std::collections::HashSet;

use serde::Serialize;

use crate::definitions::MigrationDefinition;

/// Outcome of [`validate`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    /// One message per problem, in definition order
    pub errors: Vec<String>,
}

/// Check every definition for a version, a description and both SQL sections
pub fn validate(definitions: &[MigrationDefinition]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for definition in definitions {
        let version = definition.version.trim();

        if version.is_empty() {
            errors.push("migration missing version".to_string());
        } else if !seen.insert(version) {
            errors.push(format!("duplicate migration version {}", version));
        }

        let label = if version.is_empty() { "<unversioned>" } else { version };

        if definition.description.trim().is_empty() {
            errors.push(format!("migration {} missing description", label));
        }
        if definition.up_statements.iter().all(|s| s.trim().is_empty()) {
            errors.push(format!("migration {}: no UP SQL", label));
        }
        if definition.down_statements.iter().all(|s| s.trim().is_empty()) {
            errors.push(format!("migration {}: no DOWN SQL", label));
        }
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
    }
}
