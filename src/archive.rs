//! WordPress archive extraction.
//!
//! Release zips nest everything under a single `wordpress/` directory; that
//! common top directory is stripped so the site lands directly in the
//! instance content root. Entry paths are validated before any write:
//! traversal components, absolute paths, and Windows drive prefixes are
//! rejected, and entries claiming to be symlinks are refused outright
//! (release archives contain none).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Extract `archive_path` into `dest_dir`, stripping the archive's common
/// top-level directory if it has one.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = fs::File::open(archive_path).map_err(|e| {
        AppError::filesystem(format!(
            "failed to open archive {}: {}",
            archive_path.display(),
            e
        ))
    })?;
    let mut archive = zip::ZipArchive::new(file)?;

    let top_dir = common_top_dir(archive.file_names());

    fs::create_dir_all(dest_dir)
        .map_err(|e| AppError::filesystem(format!("failed to create content root: {}", e)))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw_name = entry.name().to_string();

        let relative = entry_rel_path(&raw_name).ok_or_else(|| {
            AppError::filesystem(format!("archive contains unsafe path: {:?}", raw_name))
        })?;
        let Some(stripped) = strip_top_dir(&relative, top_dir.as_deref()) else {
            // The top directory entry itself.
            continue;
        };

        if entry.is_symlink() {
            return Err(AppError::filesystem(format!(
                "archive contains symlink entry: {:?}",
                raw_name
            )));
        }

        let out_path = dest_dir.join(&stripped);
        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| {
                AppError::filesystem(format!("failed to create {}: {}", out_path.display(), e))
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::filesystem(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let declared = entry.size();
        let mut out = fs::File::create(&out_path).map_err(|e| {
            AppError::filesystem(format!("failed to create {}: {}", out_path.display(), e))
        })?;
        let written = io::copy(&mut entry, &mut out)
            .map_err(|e| AppError::filesystem(format!("failed to extract {:?}: {}", raw_name, e)))?;
        if written != declared {
            return Err(AppError::filesystem(format!(
                "archive entry {:?} size mismatch: expected {} bytes, wrote {}",
                raw_name, declared, written
            )));
        }
    }

    Ok(())
}

/// Convert an archive entry name to a safe relative path, or `None` if the
/// entry escapes the destination.
fn entry_rel_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return None;
    }

    let mut relative = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            _ => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// The single directory every entry lives under, if the archive has one and
/// at least one entry is nested inside it.
fn common_top_dir<'a, I>(names: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut candidate: Option<String> = None;
    let mut saw_nested = false;

    for name in names {
        let relative = entry_rel_path(name)?;
        let mut components = relative.iter();
        let first = components.next()?.to_str()?;
        if components.next().is_some() {
            saw_nested = true;
        }
        match candidate.as_deref() {
            None => candidate = Some(first.to_string()),
            Some(existing) if existing == first => {}
            Some(_) => return None,
        }
    }

    if saw_nested {
        candidate
    } else {
        None
    }
}

fn strip_top_dir(relative: &Path, top_dir: Option<&str>) -> Option<PathBuf> {
    let Some(top) = top_dir else {
        return Some(relative.to_path_buf());
    };
    let stripped = relative.strip_prefix(top).ok()?;
    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped.to_path_buf())
    }
}
