//! Structured results for the presentation layer.
//!
//! Every operation returns a serializable report; renderers decide how to
//! show it. Nothing here depends on a particular UI.

use serde::Serialize;

use crate::coordinator::Coordinator;
use crate::error::{AppError, Result};
use crate::paths::{directory_size, format_size};
use crate::registry::{Instance, InstanceState};

/// Outcome of a single create/reset/delete.
#[derive(Debug, Serialize)]
pub struct OperationReport {
    pub name: String,
    pub outcome: Outcome,
    /// Non-fatal issues (theme/plugin extras that failed).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl OperationReport {
    pub fn success(name: &str, warnings: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            outcome: Outcome::Succeeded,
            warnings,
            error: None,
        }
    }

    pub fn failure(name: &str, error: AppError) -> Self {
        Self {
            name: name.to_string(),
            outcome: Outcome::Failed,
            warnings: Vec::new(),
            error: Some(error),
        }
    }

    /// Process exit code for this report.
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, |e| e.kind().exit_code())
    }
}

/// One row of `list` output.
#[derive(Debug, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub state: InstanceState,
    pub site_url: String,
    pub database_name: String,
    pub content_path: String,
    pub created_at: String,
    pub size_on_disk: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Set by the verified listing when an active entry's artifacts are gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<String>,
}

impl InstanceSummary {
    fn from_instance(instance: Instance) -> Self {
        let size = if instance.content_path.is_dir() {
            format_size(directory_size(&instance.content_path))
        } else {
            "-".to_string()
        };
        Self {
            name: instance.name,
            state: instance.state,
            site_url: instance.site_url,
            database_name: instance.database_name,
            content_path: instance.content_path.display().to_string(),
            created_at: instance.created_at.to_rfc3339(),
            size_on_disk: size,
            failed_step: instance.failed_step,
            drift: None,
        }
    }
}

/// Registry snapshot enriched with on-disk sizes.
pub fn list_instances(coordinator: &Coordinator) -> Vec<InstanceSummary> {
    coordinator
        .list()
        .into_iter()
        .map(InstanceSummary::from_instance)
        .collect()
}

/// Like [`list_instances`], but probes the database server for each active
/// entry so drift between the registry and server truth shows up in the
/// listing. A flagged entry is repaired by `reset` or `delete`.
pub async fn list_instances_verified(coordinator: &Coordinator) -> Result<Vec<InstanceSummary>> {
    let db = coordinator.database_admin();
    let instances = coordinator.list();
    let mut summaries = Vec::with_capacity(instances.len());
    for instance in instances {
        let mut missing = Vec::new();
        if instance.state == InstanceState::Active {
            if !db.database_exists(&instance.database_name).await? {
                missing.push("database missing");
            }
            if !instance.content_path.is_dir() {
                missing.push("content missing");
            }
        }
        let mut summary = InstanceSummary::from_instance(instance);
        summary.drift = (!missing.is_empty()).then(|| missing.join(", "));
        summaries.push(summary);
    }
    Ok(summaries)
}

/// Result of the environment probes.
#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub database: ProbeResult,
    pub site_tool: ProbeResult,
    pub archive: ProbeResult,
}

#[derive(Debug, Serialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub detail: String,
}

impl DoctorReport {
    pub fn all_ok(&self) -> bool {
        self.database.ok && self.site_tool.ok && self.archive.ok
    }
}

/// Probe the external collaborators: database connectivity, WP-CLI
/// availability, and the bundled archive.
pub async fn doctor(coordinator: &Coordinator) -> DoctorReport {
    let database = match coordinator.database_admin().probe().await {
        Ok(version) => ProbeResult {
            ok: true,
            detail: version,
        },
        Err(err) => ProbeResult {
            ok: false,
            detail: err.to_string(),
        },
    };

    let site_tool = match coordinator.site_tool().version().await {
        Ok(version) => ProbeResult {
            ok: true,
            detail: version,
        },
        Err(err) => ProbeResult {
            ok: false,
            detail: err.to_string(),
        },
    };

    let archive_path = &coordinator.config().server.archive_path;
    let archive = if archive_path.is_file() {
        ProbeResult {
            ok: true,
            detail: archive_path.display().to_string(),
        }
    } else {
        ProbeResult {
            ok: false,
            detail: format!("archive not found: {}", archive_path.display()),
        }
    };

    DoctorReport {
        database,
        site_tool,
        archive,
    }
}
