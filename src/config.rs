//! Validated application configuration.
//!
//! Loaded once at startup from a TOML file; every required field is checked
//! before any orchestration runs. A missing file is created with defaults on
//! first run so operators have something to edit.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::paths::default_config_path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub instances: InstancePolicy,
    #[serde(default)]
    pub operations: OperationLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Shared web-server document root; each instance gets a subdirectory.
    pub document_root: PathBuf,
    /// Pre-fetched WordPress release zip.
    pub archive_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            document_root: PathBuf::from("/opt/lampp/htdocs"),
            archive_path: PathBuf::from("assets/wordpress-6.8.2.zip"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub admin_user: String,
    /// May be empty (stock XAMPP root account).
    #[serde(default)]
    pub admin_password: String,
    /// Admin CLI executable; a bare name resolves through PATH.
    #[serde(default = "default_mysql_bin")]
    pub mysql_bin: PathBuf,
}

fn default_mysql_bin() -> PathBuf {
    PathBuf::from("mysql")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            admin_user: "root".to_string(),
            admin_password: String::new(),
            mysql_bin: default_mysql_bin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub admin_user: String,
    pub admin_password: String,
    pub admin_email: String,
    pub title_prefix: String,
    pub base_url: String,
    #[serde(default = "default_wp_cli_bin")]
    pub wp_cli_bin: PathBuf,
    /// Theme slug to install after core install; empty keeps the bundled default.
    #[serde(default)]
    pub default_theme: String,
    /// Plugin slugs to install after core install.
    #[serde(default)]
    pub default_plugins: Vec<String>,
}

fn default_wp_cli_bin() -> PathBuf {
    PathBuf::from("wp")
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            admin_user: "admin".to_string(),
            admin_password: "admin123".to_string(),
            admin_email: "admin@localhost.com".to_string(),
            title_prefix: "WP Test Site".to_string(),
            base_url: "http://localhost".to_string(),
            wp_cli_bin: default_wp_cli_bin(),
            default_theme: String::new(),
            default_plugins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancePolicy {
    pub prefix: String,
    pub max_instances: usize,
}

impl Default for InstancePolicy {
    fn default() -> Self {
        Self {
            prefix: "wp_test_".to_string(),
            max_instances: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLimits {
    /// Worker pool size for concurrent instance operations.
    pub max_concurrent: usize,
    /// Extra attempts per failed step before the operation aborts.
    pub step_retries: u32,
    /// Bound on every external call (mysql, WP-CLI).
    pub command_timeout_secs: u64,
}

impl Default for OperationLimits {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            step_retries: 1,
            command_timeout_secs: 300,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            site: SiteConfig::default(),
            instances: InstancePolicy::default(),
            operations: OperationLimits::default(),
        }
    }
}

impl AppConfig {
    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// A missing file is written out with defaults first, then validated like
    /// any other config, so a fresh machine fails with the same diagnostics
    /// an operator would get after editing a bad value in.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        if !path.exists() {
            let config = Self::default();
            config.save(&path)?;
            log::info!("Created default config at {}", path.display());
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| AppError::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::config(format!("failed to create config dir: {}", e)))?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .map_err(|e| AppError::config(format!("failed to write {}: {}", path.display(), e)))
    }

    /// Fail fast on anything orchestration would trip over later.
    pub fn validate(&self) -> Result<()> {
        if !self.server.document_root.is_dir() {
            return Err(AppError::config(format!(
                "document_root does not exist: {}",
                self.server.document_root.display()
            )));
        }
        if !self.server.archive_path.is_file() {
            return Err(AppError::config(format!(
                "archive_path does not exist: {}",
                self.server.archive_path.display()
            )));
        }
        if self.database.host.is_empty() {
            return Err(AppError::config("database.host must not be empty"));
        }
        if self.database.admin_user.is_empty() {
            return Err(AppError::config("database.admin_user must not be empty"));
        }
        if self.site.admin_user.is_empty() || self.site.admin_password.is_empty() {
            return Err(AppError::config("site admin credentials must not be empty"));
        }
        if !self.site.admin_email.contains('@') {
            return Err(AppError::config(format!(
                "site.admin_email is not an email address: {}",
                self.site.admin_email
            )));
        }
        if self.site.base_url.is_empty() {
            return Err(AppError::config("site.base_url must not be empty"));
        }
        if self.instances.prefix.is_empty() {
            return Err(AppError::config("instances.prefix must not be empty"));
        }
        if self.instances.max_instances == 0 {
            return Err(AppError::config("instances.max_instances must be positive"));
        }
        if self.operations.max_concurrent == 0 {
            return Err(AppError::config("operations.max_concurrent must be positive"));
        }
        if self.operations.command_timeout_secs == 0 {
            return Err(AppError::config(
                "operations.command_timeout_secs must be positive",
            ));
        }
        Ok(())
    }

    /// Base URL without a trailing slash, ready for `{base}/{name}` joins.
    pub fn base_url_trimmed(&self) -> &str {
        self.site.base_url.trim_end_matches('/')
    }
}
