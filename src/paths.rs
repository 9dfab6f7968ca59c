//! Centralized path utilities for the application.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{AppError, Result};

/// Root data directory for the application (~/.wp-provisioner).
pub fn data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| AppError::config("cannot find home directory"))?;
    Ok(home.join(".wp-provisioner"))
}

/// Default location of the config file.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("config.toml"))
}

/// Default location of the persisted instance registry.
pub fn default_registry_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("registry.toml"))
}

/// Content root for an instance under the shared document root.
pub fn content_path(document_root: &Path, name: &str) -> PathBuf {
    document_root.join(name)
}

/// Total size in bytes of a directory tree. Unreadable entries are skipped.
pub fn directory_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Format a byte count for listings.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} {}", size, UNITS[UNITS.len() - 1])
}
