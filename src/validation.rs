//! Instance naming policy and derived-value computation.

use crate::config::InstancePolicy;
use crate::error::{AppError, Result};

const NAME_MIN_LEN: usize = 3;
const NAME_MAX_LEN: usize = 50;

/// Validate an instance name against the configured policy.
///
/// The name doubles as a directory name, a database name, and a URL path
/// segment, so the accepted charset is the intersection of all three.
pub fn validate_instance_name(name: &str, policy: &InstancePolicy) -> Result<()> {
    if name.len() < NAME_MIN_LEN {
        return Err(AppError::config(format!(
            "instance name must be at least {} characters: {:?}",
            NAME_MIN_LEN, name
        )));
    }
    if name.len() > NAME_MAX_LEN {
        return Err(AppError::config(format!(
            "instance name must be at most {} characters: {:?}",
            NAME_MAX_LEN, name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(AppError::config(format!(
            "instance name may only contain letters, digits, underscores, and hyphens: {:?}",
            name
        )));
    }
    let starts_ok = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    if !starts_ok {
        return Err(AppError::config(format!(
            "instance name must start with a letter or digit: {:?}",
            name
        )));
    }
    if !name.starts_with(&policy.prefix) {
        return Err(AppError::config(format!(
            "instance name must start with the configured prefix {:?}: {:?}",
            policy.prefix, name
        )));
    }
    Ok(())
}

/// Derive the database name for an instance.
///
/// Hyphens are valid in directory and URL names but not in unquoted MySQL
/// identifiers, so they map to underscores.
pub fn derive_database_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Candidate auto-assigned names in order: prefix + 01, 02, ...
pub fn numbered_names(policy: &InstancePolicy) -> impl Iterator<Item = String> + '_ {
    (1..=policy.max_instances).map(|i| format!("{}{:02}", policy.prefix, i))
}
