//! Reset: tear down an existing instance's database and content tree, then
//! re-run the provisioning steps against the same name and derived values.

use std::fs;

use tokio::sync::broadcast;

use super::provision::ProvisionEngine;
use super::{OperationKind, ProgressEvent, StepRunner};
use crate::config::AppConfig;
use crate::database::DatabaseAdmin;
use crate::error::{AppError, Result};
use crate::registry::Instance;
use crate::wp_cli::SiteTool;

pub struct ResetEngine<'a> {
    config: &'a AppConfig,
    db: &'a DatabaseAdmin,
    site: &'a SiteTool,
    events: broadcast::Sender<ProgressEvent>,
}

impl<'a> ResetEngine<'a> {
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

    /// Tear down and rebuild. A reset that fails midway leaves the instance
    /// in the same shape as a failed provisioning, so the one cleanup path
    /// (delete) applies to both.
    pub async fn run(&self, instance: &Instance) -> Result<Vec<String>> {
        let runner = StepRunner::new(
            self.events.clone(),
            &instance.name,
            OperationKind::Reset,
            self.config.operations.step_retries,
        );

        runner
            .run_step("teardown_database", || {
                self.db.drop_database(&instance.database_name)
            })
            .await?;

        runner
            .run_step("teardown_content", || async move {
                if instance.content_path.exists() {
                    fs::remove_dir_all(&instance.content_path).map_err(|e| {
                        AppError::filesystem(format!(
                            "failed to remove {}: {}",
                            instance.content_path.display(),
                            e
                        ))
                    })?;
                }
                Ok(())
            })
            .await?;

        let provision = ProvisionEngine::new(self.config, self.db, self.site, self.events.clone());
        provision.run_steps(&runner, instance).await
    }
}
