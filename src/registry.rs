//! Durable instance registry.
//!
//! Source of truth for instance existence, naming uniqueness, and the
//! instance cap. Every mutating call persists to disk before returning, so a
//! crash between registry commit and the next provisioning step leaves a
//! consistent, re-readable record. All checks and mutations happen under one
//! mutex; `reserve` is therefore linearizable with respect to concurrent
//! reservations racing on the same name, derived values, or the cap.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Active,
    Resetting,
    Deleting,
    Failed,
}

/// One provisioned (or partially provisioned) site installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    /// Derived from `name`; never independently mutated.
    pub database_name: String,
    /// Derived from `name` and the document root; never independently mutated.
    pub content_path: PathBuf,
    pub site_url: String,
    pub site_title: String,
    pub admin_user: String,
    pub admin_password: String,
    pub admin_email: String,
    /// Step that failed, for `Failed` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Captured external diagnostic output for `Failed` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Caller-supplied fields for a new reservation; the registry adds state and
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub database_name: String,
    pub content_path: PathBuf,
    pub site_url: String,
    pub site_title: String,
    pub admin_user: String,
    pub admin_password: String,
    pub admin_email: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    instances: BTreeMap<String, Instance>,
}

pub struct Registry {
    path: PathBuf,
    cap: usize,
    entries: Mutex<BTreeMap<String, Instance>>,
}

impl Registry {
    /// Load the registry from disk, creating an empty one if the file is
    /// absent. `cap` is the configured instance limit enforced by `reserve`.
    pub fn load(path: &Path, cap: usize) -> Result<Self> {
        let entries = if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| {
                AppError::filesystem(format!("failed to read registry {}: {}", path.display(), e))
            })?;
            let file: RegistryFile = toml::from_str(&content)
                .map_err(|e| AppError::config(format!("registry file is malformed: {}", e)))?;
            file.instances
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            cap,
            entries: Mutex::new(entries),
        })
    }

    /// Atomically check uniqueness and the cap, insert a `Provisioning`
    /// entry, persist it, and return it.
    pub fn reserve(&self, new: NewInstance) -> Result<Instance> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        for existing in entries.values() {
            if existing.name == new.name {
                return Err(AppError::name_taken(&new.name, "name"));
            }
            if existing.database_name == new.database_name {
                return Err(AppError::name_taken(&new.name, "database_name"));
            }
            if existing.content_path == new.content_path {
                return Err(AppError::name_taken(&new.name, "content_path"));
            }
        }
        if entries.len() >= self.cap {
            return Err(AppError::cap_reached(self.cap));
        }

        let now = Utc::now();
        let instance = Instance {
            name: new.name.clone(),
            state: InstanceState::Provisioning,
            created_at: now,
            last_modified_at: now,
            database_name: new.database_name,
            content_path: new.content_path,
            site_url: new.site_url,
            site_title: new.site_title,
            admin_user: new.admin_user,
            admin_password: new.admin_password,
            admin_email: new.admin_email,
            failed_step: None,
            diagnostic: None,
        };
        entries.insert(new.name, instance.clone());
        self.persist(&entries)?;
        Ok(instance)
    }

    /// Update state (and any dependent fields via `mutate`), stamping
    /// `last_modified_at`. Persists before returning.
    pub fn commit<F>(&self, name: &str, state: InstanceState, mutate: F) -> Result<Instance>
    where
        F: FnOnce(&mut Instance),
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let instance = entries
            .get_mut(name)
            .ok_or_else(|| AppError::unknown_instance(name))?;
        instance.state = state;
        instance.last_modified_at = Utc::now();
        mutate(instance);
        let snapshot = instance.clone();
        self.persist(&entries)?;
        Ok(snapshot)
    }

    /// Delete the entry. Persists before returning.
    pub fn remove(&self, name: &str) -> Result<Instance> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let removed = entries
            .remove(name)
            .ok_or_else(|| AppError::unknown_instance(name))?;
        self.persist(&entries)?;
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Result<Instance> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::unknown_instance(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(name)
    }

    /// Snapshot of all entries, ordered by creation time (ties by name).
    pub fn list(&self) -> Vec<Instance> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut instances: Vec<Instance> = entries.values().cloned().collect();
        instances.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        instances
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the full record set to a temp file, then rename over the real
    /// one, so a crash mid-write never truncates the registry.
    fn persist(&self, entries: &BTreeMap<String, Instance>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::filesystem(format!("failed to create registry dir: {}", e))
            })?;
        }

        let file = RegistryFile {
            instances: entries.clone(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| AppError::filesystem(format!("failed to serialize registry: {}", e)))?;

        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, content).map_err(|e| {
            AppError::filesystem(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            AppError::filesystem(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{InstanceState, NewInstance, Registry};
    use crate::error::ErrorKind;
    use std::path::Path;
    use std::sync::Arc;

    fn seed(name: &str) -> NewInstance {
        NewInstance {
            name: name.to_string(),
            database_name: name.replace('-', "_"),
            content_path: Path::new("/srv/htdocs").join(name),
            site_url: format!("http://localhost/{}", name),
            site_title: format!("WP Test Site {}", name),
            admin_user: "admin".to_string(),
            admin_password: "admin123".to_string(),
            admin_email: "admin@localhost.com".to_string(),
        }
    }

    fn registry(dir: &Path, cap: usize) -> Registry {
        Registry::load(&dir.join("registry.toml"), cap).unwrap()
    }

    #[test]
    fn reserve_then_reserve_again_yields_name_taken() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 10);

        let first = registry.reserve(seed("wp_test_01")).unwrap();
        assert_eq!(first.state, InstanceState::Provisioning);

        let second = registry.reserve(seed("wp_test_01")).unwrap_err();
        assert_eq!(second.kind(), ErrorKind::NameTaken);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reserve_rejects_derived_value_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 10);

        registry.reserve(seed("wp_test_a-b")).unwrap();
        // Different name, same derived database name.
        let clash = registry.reserve(seed("wp_test_a_b")).unwrap_err();
        assert_eq!(clash.kind(), ErrorKind::NameTaken);
    }

    #[test]
    fn concurrent_reservations_respect_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(registry(dir.path(), 4));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.reserve(seed(&format!("wp_test_{:02}", i))))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let capped = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::CapReached))
            .count();

        assert_eq!(succeeded, 4);
        assert_eq!(capped, 1);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn commit_updates_state_and_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 10);
        let reserved = registry.reserve(seed("wp_test_01")).unwrap();

        let committed = registry
            .commit("wp_test_01", InstanceState::Failed, |inst| {
                inst.failed_step = Some("install".to_string());
                inst.diagnostic = Some("exit 1".to_string());
            })
            .unwrap();

        assert_eq!(committed.state, InstanceState::Failed);
        assert_eq!(committed.failed_step.as_deref(), Some("install"));
        assert!(committed.last_modified_at >= reserved.last_modified_at);
    }

    #[test]
    fn commit_and_remove_on_unknown_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 10);

        let err = registry
            .commit("wp_test_99", InstanceState::Active, |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownInstance);
        assert_eq!(
            registry.remove("wp_test_99").unwrap_err().kind(),
            ErrorKind::UnknownInstance
        );
    }

    #[test]
    fn registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = registry(dir.path(), 10);
            registry.reserve(seed("wp_test_01")).unwrap();
            registry
                .commit("wp_test_01", InstanceState::Active, |_| {})
                .unwrap();
            registry.reserve(seed("wp_test_02")).unwrap();
        }

        let reloaded = registry(dir.path(), 10);
        assert_eq!(reloaded.len(), 2);
        let first = reloaded.get("wp_test_01").unwrap();
        assert_eq!(first.state, InstanceState::Active);
        assert_eq!(first.database_name, "wp_test_01");
    }

    #[test]
    fn list_orders_by_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 10);
        registry.reserve(seed("wp_test_02")).unwrap();
        registry.reserve(seed("wp_test_01")).unwrap();

        let names: Vec<String> = registry.list().into_iter().map(|i| i.name).collect();
        // wp_test_02 was created first; creation order wins over name order.
        assert_eq!(names, vec!["wp_test_02", "wp_test_01"]);
    }
}
