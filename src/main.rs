use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use wp_provisioner::commands::{self, OperationReport, ProbeResult};
use wp_provisioner::coordinator::Coordinator;
use wp_provisioner::engine::StepPhase;
use wp_provisioner::error::Result;
use wp_provisioner::paths::default_registry_path;
use wp_provisioner::AppConfig;

#[derive(Parser)]
#[command(
    name = "wp-provisioner",
    version,
    about = "Provision isolated local WordPress instances"
)]
struct Cli {
    /// Config file (default: ~/.wp-provisioner/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Provision a new instance (auto-named when NAME is omitted)
    Create { name: Option<String> },
    /// Provision COUNT instances through the worker pool
    Bulk { count: usize },
    /// Tear down and rebuild an existing instance
    Reset { name: String },
    /// Remove an instance's database, files, and registry entry
    Delete { name: String },
    /// Show registered instances
    List {
        #[arg(long)]
        json: bool,
        /// Probe the database server and flag entries whose artifacts are gone
        #[arg(long)]
        verify: bool,
    },
    /// Probe MySQL, WP-CLI, and the bundled archive
    Doctor,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => exit_code_from(code),
        Err(err) => {
            log::error!("{}", err);
            exit_code_from(err.kind().exit_code())
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let registry_path = default_registry_path()?;
    let coordinator = Arc::new(Coordinator::new(config, &registry_path)?);

    spawn_event_renderer(&coordinator);

    let code = match cli.command {
        CliCommand::Create { name } => run_create(&coordinator, name).await,
        CliCommand::Bulk { count } => run_bulk(&coordinator, count).await,
        CliCommand::Reset { name } => run_reset(&coordinator, &name).await,
        CliCommand::Delete { name } => run_delete(&coordinator, &name).await,
        CliCommand::List { json, verify } => run_list(&coordinator, json, verify).await?,
        CliCommand::Doctor => run_doctor(&coordinator).await,
    };
    Ok(code)
}

async fn run_create(coordinator: &Coordinator, name: Option<String>) -> i32 {
    let report = match coordinator.create(name.clone()).await {
        Ok((instance, warnings)) => OperationReport::success(&instance.name, warnings),
        Err(err) => OperationReport::failure(name.as_deref().unwrap_or("(auto)"), err),
    };
    render_report(&report);
    report.exit_code()
}

async fn run_bulk(coordinator: &Arc<Coordinator>, count: usize) -> i32 {
    let report = Arc::clone(coordinator).create_bulk(count).await;
    log::info!(
        "Bulk create finished: {} requested, {} succeeded, {} failed",
        report.requested,
        report.succeeded,
        report.failed
    );
    for entry in &report.results {
        match (&entry.name, &entry.error) {
            (Some(name), None) => log::info!("  {}: ok", name),
            (Some(name), Some(err)) => log::error!("  {}: {}", name, err),
            (None, Some(err)) => log::error!("  (unassigned): {}", err),
            (None, None) => {}
        }
    }
    report
        .results
        .iter()
        .find_map(|entry| entry.error.as_ref())
        .map_or(0, |err| err.kind().exit_code())
}

async fn run_reset(coordinator: &Coordinator, name: &str) -> i32 {
    let report = match coordinator.reset(name).await {
        Ok((instance, warnings)) => OperationReport::success(&instance.name, warnings),
        Err(err) => OperationReport::failure(name, err),
    };
    render_report(&report);
    report.exit_code()
}

async fn run_delete(coordinator: &Coordinator, name: &str) -> i32 {
    let report = match coordinator.delete(name).await {
        Ok(()) => OperationReport::success(name, Vec::new()),
        Err(err) => OperationReport::failure(name, err),
    };
    render_report(&report);
    report.exit_code()
}

async fn run_list(coordinator: &Coordinator, json: bool, verify: bool) -> Result<i32> {
    let summaries = if verify {
        commands::list_instances_verified(coordinator).await?
    } else {
        commands::list_instances(coordinator)
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(0);
    }
    if summaries.is_empty() {
        log::info!("No instances registered");
        return Ok(0);
    }
    for summary in &summaries {
        let mut note = summary
            .failed_step
            .as_ref()
            .map(|s| format!(" [{}]", s))
            .unwrap_or_default();
        if let Some(drift) = &summary.drift {
            note.push_str(&format!(" [{}]", drift));
        }
        log::info!(
            "{:<20} {:?}{} {} ({})",
            summary.name,
            summary.state,
            note,
            summary.site_url,
            summary.size_on_disk
        );
    }
    Ok(0)
}

async fn run_doctor(coordinator: &Coordinator) -> i32 {
    let report = commands::doctor(coordinator).await;
    render_probe("database", &report.database);
    render_probe("wp-cli", &report.site_tool);
    render_probe("archive", &report.archive);
    if report.all_ok() {
        0
    } else {
        1
    }
}

/// Render progress events as they arrive, independent of the operation
/// awaiting its result.
fn spawn_event_renderer(coordinator: &Arc<Coordinator>) {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.phase {
                    StepPhase::Started => {
                        log::info!("[{}] {} ...", event.instance, event.step);
                    }
                    StepPhase::Succeeded => {
                        log::info!("[{}] {} done", event.instance, event.step);
                    }
                    StepPhase::Failed => {
                        log::error!(
                            "[{}] {} failed: {}",
                            event.instance,
                            event.step,
                            event.message
                        );
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event renderer lagged, skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn render_report(report: &OperationReport) {
    match &report.error {
        None => {
            log::info!("{}: ok", report.name);
            for warning in &report.warnings {
                log::warn!("{}: {}", report.name, warning);
            }
        }
        Some(err) => log::error!("{}: {}", report.name, err),
    }
}

fn render_probe(label: &str, probe: &ProbeResult) {
    if probe.ok {
        log::info!("{:<10} ok: {}", label, probe.detail);
    } else {
        log::error!("{:<10} failed: {}", label, probe.detail);
    }
}

fn exit_code_from(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
