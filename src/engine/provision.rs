//! Provisioning: the ordered step sequence that turns "no instance" into a
//! running site.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use super::{OperationKind, ProgressEvent, StepPhase, StepRunner};
use crate::config::AppConfig;
use crate::database::DatabaseAdmin;
use crate::error::{AppError, Result};
use crate::paths;
use crate::registry::{Instance, NewInstance};
use crate::validation::{derive_database_name, validate_instance_name};
use crate::wp_cli::SiteTool;

/// Validate `name` and compute every derived field for a reservation.
/// No external call is made here; this is the cheap front half of create.
pub fn prepare_instance(name: &str, config: &AppConfig) -> Result<NewInstance> {
    validate_instance_name(name, &config.instances)?;
    Ok(NewInstance {
        name: name.to_string(),
        database_name: derive_database_name(name),
        content_path: paths::content_path(&config.server.document_root, name),
        site_url: format!("{}/{}", config.base_url_trimmed(), name),
        site_title: format!("{} {}", config.site.title_prefix, name),
        admin_user: config.site.admin_user.clone(),
        admin_password: config.site.admin_password.clone(),
        admin_email: config.site.admin_email.clone(),
    })
}

pub struct ProvisionEngine<'a> {
    config: &'a AppConfig,
    db: &'a DatabaseAdmin,
    site: &'a SiteTool,
    events: broadcast::Sender<ProgressEvent>,
}

impl<'a> ProvisionEngine<'a> {
    pub fn new(
        config: &'a AppConfig,
        db: &'a DatabaseAdmin,
        site: &'a SiteTool,
        events: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            config,
            db,
            site,
            events,
        }
    }

    /// Run the full provisioning sequence for a reserved instance.
    /// Returns non-fatal warnings (theme/plugin extras that failed).
    pub async fn run(&self, instance: &Instance) -> Result<Vec<String>> {
        let runner = StepRunner::new(
            self.events.clone(),
            &instance.name,
            OperationKind::Create,
            self.config.operations.step_retries,
        );
        self.run_steps(&runner, instance).await
    }

    /// The shared back half of create and reset: database → extract →
    /// configure → install → extras. Side effects are strictly ordered; each
    /// step's external call is verified before the next begins.
    pub(super) async fn run_steps(
        &self,
        runner: &StepRunner,
        instance: &Instance,
    ) -> Result<Vec<String>> {
        runner
            .run_step("database", || self.db.create_database(&instance.database_name))
            .await?;

        let extracted_once = AtomicBool::new(false);
        runner
            .run_step("extract", || {
                let retrying = extracted_once.swap(true, Ordering::SeqCst);
                async move {
                    if retrying {
                        // Wipe the partial tree from the previous attempt.
                        if instance.content_path.exists() {
                            fs::remove_dir_all(&instance.content_path).map_err(|e| {
                                AppError::filesystem(format!(
                                    "failed to clear partial content tree: {}",
                                    e
                                ))
                            })?;
                        }
                    } else if instance.content_path.exists() {
                        // The registry said this path was free; disk disagrees.
                        return Err(AppError::filesystem(format!(
                            "content path already exists: {}",
                            instance.content_path.display()
                        )));
                    }

                    crate::archive::extract_archive(
                        &self.config.server.archive_path,
                        &instance.content_path,
                    )?;

                    let marker = instance.content_path.join("wp-settings.php");
                    if marker.is_file() {
                        Ok(())
                    } else {
                        Err(AppError::filesystem(format!(
                            "extraction produced no wp-settings.php under {}",
                            instance.content_path.display()
                        )))
                    }
                }
            })
            .await?;

        runner
            .run_step("configure", || {
                self.site.config_create(
                    instance,
                    &self.config.database.host,
                    &self.config.database.admin_user,
                    &self.config.database.admin_password,
                )
            })
            .await?;

        runner
            .run_step("install", || self.site.core_install(instance))
            .await?;

        Ok(self.install_extras(runner, instance).await)
    }

    /// Theme and plugin extras. Failures are reported, never fatal: the site
    /// itself is already installed and usable.
    async fn install_extras(&self, runner: &StepRunner, instance: &Instance) -> Vec<String> {
        let mut warnings = Vec::new();

        let theme = self.config.site.default_theme.trim();
        if !theme.is_empty() {
            runner.emit("theme", StepPhase::Started, format!("installing theme {}", theme));
            match self.site.install_theme(&instance.content_path, theme).await {
                Ok(()) => {
                    runner.emit("theme", StepPhase::Succeeded, format!("theme {} active", theme));
                }
                Err(err) => {
                    log::warn!("Theme {} failed for {}: {}", theme, instance.name, err);
                    runner.emit("theme", StepPhase::Failed, err.to_string());
                    warnings.push(format!("theme {}: {}", theme, err));
                }
            }
        }

        for plugin in &self.config.site.default_plugins {
            runner.emit(
                "plugins",
                StepPhase::Started,
                format!("installing plugin {}", plugin),
            );
            match self.site.install_plugin(&instance.content_path, plugin).await {
                Ok(()) => {
                    runner.emit(
                        "plugins",
                        StepPhase::Succeeded,
                        format!("plugin {} active", plugin),
                    );
                }
                Err(err) => {
                    log::warn!("Plugin {} failed for {}: {}", plugin, instance.name, err);
                    runner.emit("plugins", StepPhase::Failed, err.to_string());
                    warnings.push(format!("plugin {}: {}", plugin, err));
                }
            }
        }

        warnings
    }
}
