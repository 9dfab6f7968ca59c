//! Deletion: best-effort, converging teardown.
//!
//! Derived artifacts are computed from the name alone, so deletion also
//! repairs orphaned state: a database the registry forgot, a content tree
//! from a crashed provisioning. Already-absent artifacts count as removed;
//! only an artifact that exists and resists removal fails the operation.

use std::fs;
use std::path::Path;

use tokio::sync::broadcast;

use super::{OperationKind, ProgressEvent, StepRunner};
use crate::database::DatabaseAdmin;
use crate::error::{AppError, Result};

// No SiteTool here: a site broken enough that WP-CLI cannot run must still
// be removable.
pub struct DeletionEngine<'a> {
    db: &'a DatabaseAdmin,
    events: broadcast::Sender<ProgressEvent>,
}

impl<'a> DeletionEngine<'a> {
    pub fn new(db: &'a DatabaseAdmin, events: broadcast::Sender<ProgressEvent>) -> Self {
        Self { db, events }
    }

    /// Drop the database, then remove the content tree. The registry entry
    /// is the coordinator's to remove, and only after both succeed here.
    pub async fn run(&self, name: &str, database_name: &str, content_path: &Path) -> Result<()> {
        let runner = StepRunner::new(self.events.clone(), name, OperationKind::Delete, 0);

        runner
            .run_step("drop_database", || async move {
                self.db
                    .drop_database(database_name)
                    .await
                    .map_err(|e| AppError::delete_partial(name, "drop_database", e.to_string()))
            })
            .await?;

        runner
            .run_step("remove_content", || async move {
                if content_path.exists() {
                    fs::remove_dir_all(content_path).map_err(|e| {
                        AppError::delete_partial(
                            name,
                            "remove_content",
                            format!("failed to remove {}: {}", content_path.display(), e),
                        )
                    })?;
                } else {
                    log::info!(
                        "Content path already absent for {}: {}",
                        name,
                        content_path.display()
                    );
                }
                Ok(())
            })
            .await?;

        Ok(())
    }
}
