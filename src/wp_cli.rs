//! WP-CLI invocation for site configuration.
//!
//! The external tool is opaque: one invocation per concern, run with the
//! instance content root as working directory, exit status and captured
//! output preserved for diagnostics. None of these calls are atomic or
//! idempotent from our side, which is why engine failure policy is
//! fail-forward rather than rollback.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;

use crate::config::{OperationLimits, SiteConfig};
use crate::error::{AppError, Result};
use crate::registry::Instance;

pub struct SiteTool {
    wp_bin: PathBuf,
    timeout: Duration,
}

impl SiteTool {
    pub fn new(site: &SiteConfig, limits: &OperationLimits) -> Self {
        Self {
            wp_bin: site.wp_cli_bin.clone(),
            timeout: Duration::from_secs(limits.command_timeout_secs),
        }
    }

    async fn run(&self, cwd: Option<&Path>, args: &[String]) -> Result<Output> {
        let mut cmd = Command::new(&self.wp_bin);
        cmd.args(args);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let result = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                AppError::external_tool_spawn(format!(
                    "{} timed out after {}s",
                    self.wp_bin.display(),
                    self.timeout.as_secs()
                ))
            })?;
        let output = result.map_err(|e| {
            AppError::external_tool_spawn(format!(
                "failed to run {}: {}",
                self.wp_bin.display(),
                e
            ))
        })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(AppError::external_tool(
                output.status.code(),
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    /// Write wp-config.php with the instance's database credentials.
    pub async fn config_create(
        &self,
        instance: &Instance,
        db_host: &str,
        db_user: &str,
        db_password: &str,
    ) -> Result<()> {
        let args = vec![
            "config".to_string(),
            "create".to_string(),
            format!("--dbname={}", instance.database_name),
            format!("--dbuser={}", db_user),
            format!("--dbpass={}", db_password),
            format!("--dbhost={}", db_host),
            "--force".to_string(),
            "--skip-check".to_string(),
        ];
        self.run(Some(&instance.content_path), &args).await?;
        log::info!("Wrote wp-config.php for {}", instance.name);
        Ok(())
    }

    /// Run the WordPress installer with the instance's site identity.
    pub async fn core_install(&self, instance: &Instance) -> Result<()> {
        let args = vec![
            "core".to_string(),
            "install".to_string(),
            format!("--url={}", instance.site_url),
            format!("--title={}", instance.site_title),
            format!("--admin_user={}", instance.admin_user),
            format!("--admin_password={}", instance.admin_password),
            format!("--admin_email={}", instance.admin_email),
            "--skip-email".to_string(),
        ];
        self.run(Some(&instance.content_path), &args).await?;
        log::info!("Installed WordPress for {}", instance.name);
        Ok(())
    }

    /// Install and activate a theme.
    pub async fn install_theme(&self, content_path: &Path, theme: &str) -> Result<()> {
        let args = vec![
            "theme".to_string(),
            "install".to_string(),
            theme.to_string(),
            "--activate".to_string(),
        ];
        self.run(Some(content_path), &args).await?;
        Ok(())
    }

    /// Install and activate a plugin.
    pub async fn install_plugin(&self, content_path: &Path, plugin: &str) -> Result<()> {
        let args = vec![
            "plugin".to_string(),
            "install".to_string(),
            plugin.to_string(),
            "--activate".to_string(),
        ];
        self.run(Some(content_path), &args).await?;
        Ok(())
    }

    /// Availability probe; returns the tool's version line.
    pub async fn version(&self) -> Result<String> {
        let output = self.run(None, &["--version".to_string()]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
