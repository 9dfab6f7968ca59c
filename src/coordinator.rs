//! Operation coordination: per-name exclusivity, a bounded worker pool, and
//! the progress event channel.
//!
//! The coordinator owns the registry. Engines run the external steps and
//! report outcomes; every registry transition is applied here, while the
//! instance's name is held locked, so exactly one in-flight operation can
//! mutate a given entry. Distinct names run concurrently up to the
//! configured worker limit; waiters queue in arrival order.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, Semaphore, SemaphorePermit};
use tokio::task::JoinSet;

use crate::config::AppConfig;
use crate::database::DatabaseAdmin;
use crate::engine::{
    prepare_instance, DeletionEngine, ProgressEvent, ProvisionEngine, ResetEngine,
};
use crate::error::{AppError, ErrorKind, Result};
use crate::paths;
use crate::registry::{Instance, InstanceState, Registry};
use crate::validation::{derive_database_name, numbered_names};
use crate::wp_cli::SiteTool;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Aggregate result of a bulk create.
#[derive(Debug, Serialize)]
pub struct BulkReport {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<BulkEntry>,
}

#[derive(Debug, Serialize)]
pub struct BulkEntry {
    /// Assigned name, absent when the request failed before one was chosen.
    pub name: Option<String>,
    /// Error detail, absent on success.
    pub error: Option<AppError>,
}

pub struct Coordinator {
    config: AppConfig,
    registry: Registry,
    db: DatabaseAdmin,
    site: SiteTool,
    in_flight: Mutex<HashSet<String>>,
    cancel_requested: Mutex<HashSet<String>>,
    workers: Arc<Semaphore>,
    events: broadcast::Sender<ProgressEvent>,
}

/// Marks a name as in flight; dropping releases it.
struct NameGuard<'a> {
    coordinator: &'a Coordinator,
    name: String,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self
            .coordinator
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.name);
    }
}

impl Coordinator {
    /// Build a coordinator, rebuilding in-memory state from the persisted
    /// registry at `registry_path`.
    pub fn new(config: AppConfig, registry_path: &Path) -> Result<Self> {
        let registry = Registry::load(registry_path, config.instances.max_instances)?;
        let db = DatabaseAdmin::new(&config.database, &config.operations);
        let site = SiteTool::new(&config.site, &config.operations);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            workers: Arc::new(Semaphore::new(config.operations.max_concurrent)),
            config,
            registry,
            db,
            site,
            in_flight: Mutex::new(HashSet::new()),
            cancel_requested: Mutex::new(HashSet::new()),
            events,
        })
    }

    /// Subscribe to step-level progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database_admin(&self) -> &DatabaseAdmin {
        &self.db
    }

    pub fn site_tool(&self) -> &SiteTool {
        &self.site
    }

    /// Registry snapshot, ordered by creation time.
    pub fn list(&self) -> Vec<Instance> {
        self.registry.list()
    }

    /// Create an instance. `name: None` auto-assigns the first free
    /// `prefix + NN` name.
    pub async fn create(&self, name: Option<String>) -> Result<(Instance, Vec<String>)> {
        match name {
            Some(name) => self.create_named(&name).await,
            None => self.create_auto().await,
        }
    }

    async fn create_named(&self, name: &str) -> Result<(Instance, Vec<String>)> {
        let guard = self.lock_name(name)?;
        let result = self.create_locked(name).await;
        self.run_deferred_cleanup(name).await;
        drop(guard);
        result
    }

    /// Walk the numbered candidates, skipping names that are registered or
    /// mid-operation. Losing a race for a candidate just moves to the next.
    async fn create_auto(&self) -> Result<(Instance, Vec<String>)> {
        let candidates: Vec<String> = numbered_names(&self.config.instances).collect();
        for candidate in candidates {
            if self.registry.contains(&candidate) || self.is_in_flight(&candidate) {
                continue;
            }
            match self.create_named(&candidate).await {
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::NameTaken | ErrorKind::OperationInProgress
                    ) =>
                {
                    // Raced with another request; try the next slot.
                }
                other => return other,
            }
        }
        Err(AppError::cap_reached(self.config.instances.max_instances))
    }

    async fn create_locked(&self, name: &str) -> Result<(Instance, Vec<String>)> {
        // Validation and reservation happen before any external call; a
        // rejected create leaves no partial state anywhere.
        let new = prepare_instance(name, &self.config)?;
        let instance = self.registry.reserve(new)?;

        let _permit = self.acquire_worker().await?;
        let engine = ProvisionEngine::new(&self.config, &self.db, &self.site, self.events.clone());
        match engine.run(&instance).await {
            Ok(warnings) => {
                let active = self.registry.commit(name, InstanceState::Active, |inst| {
                    inst.failed_step = None;
                    inst.diagnostic = None;
                })?;
                self.log_completion(&active);
                Ok((active, warnings))
            }
            Err(err) => {
                self.record_failure(name, &err);
                Err(err.with_name(name))
            }
        }
    }

    /// Tear down and rebuild an existing instance.
    pub async fn reset(&self, name: &str) -> Result<(Instance, Vec<String>)> {
        let guard = self.lock_name(name)?;
        let result = self.reset_locked(name).await;
        self.run_deferred_cleanup(name).await;
        drop(guard);
        result
    }

    async fn reset_locked(&self, name: &str) -> Result<(Instance, Vec<String>)> {
        // Existence check first: an unknown name must not mutate anything.
        self.registry.get(name)?;
        let instance = self.registry.commit(name, InstanceState::Resetting, |inst| {
            inst.failed_step = None;
            inst.diagnostic = None;
        })?;

        let _permit = self.acquire_worker().await?;
        let engine = ResetEngine::new(&self.config, &self.db, &self.site, self.events.clone());
        match engine.run(&instance).await {
            Ok(warnings) => {
                let active = self
                    .registry
                    .commit(name, InstanceState::Active, |_| {})?;
                self.log_completion(&active);
                Ok((active, warnings))
            }
            Err(err) => {
                self.record_failure(name, &err);
                Err(err.with_name(name))
            }
        }
    }

    /// Converging best-effort deletion. Succeeds when every artifact is
    /// verified gone, including when some or all were already absent.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let guard = self.lock_name(name)?;
        let result = self.delete_locked(name).await;
        // A cancel landing during a delete needs no further cleanup.
        self.clear_cancel(name);
        drop(guard);
        result
    }

    async fn delete_locked(&self, name: &str) -> Result<()> {
        // Derived values are recomputed when the entry is gone, so deletion
        // also converges state the registry no longer knows about.
        let entry = self.registry.get(name).ok();
        let (database_name, content_path) = match &entry {
            Some(instance) => (instance.database_name.clone(), instance.content_path.clone()),
            None => (
                derive_database_name(name),
                paths::content_path(&self.config.server.document_root, name),
            ),
        };

        if entry.is_some() {
            self.registry
                .commit(name, InstanceState::Deleting, |_| {})?;
        }

        let _permit = self.acquire_worker().await?;
        let engine = DeletionEngine::new(&self.db, self.events.clone());
        match engine.run(name, &database_name, &content_path).await {
            Ok(()) => {
                if let Err(err) = self.registry.remove(name) {
                    if err.kind() != ErrorKind::UnknownInstance {
                        return Err(err);
                    }
                }
                log::info!("Instance {} deleted", name);
                Ok(())
            }
            Err(err) => {
                // Keep the entry so the operator can retry.
                if entry.is_some() {
                    self.record_failure(name, &err);
                }
                Err(err)
            }
        }
    }

    /// Submit `count` independent create requests through the worker pool
    /// and report aggregate results once every one is terminal. Failures do
    /// not abort the remaining requests.
    pub async fn create_bulk(self: Arc<Self>, count: usize) -> BulkReport {
        let mut join = JoinSet::new();
        for _ in 0..count {
            let this = Arc::clone(&self);
            join.spawn(async move { this.create(None).await });
        }

        let mut results = Vec::with_capacity(count);
        while let Some(joined) = join.join_next().await {
            let entry = match joined {
                Ok(Ok((instance, _warnings))) => BulkEntry {
                    name: Some(instance.name),
                    error: None,
                },
                Ok(Err(err)) => BulkEntry {
                    name: err.payload().get("name").cloned(),
                    error: Some(err),
                },
                Err(join_err) => BulkEntry {
                    name: None,
                    error: Some(AppError::filesystem(format!(
                        "create task aborted: {}",
                        join_err
                    ))),
                },
            };
            results.push(entry);
        }

        // Stable output: successes first, then failures, each by name.
        results.sort_by(|a, b| {
            (a.error.is_some(), a.name.as_deref()).cmp(&(b.error.is_some(), b.name.as_deref()))
        });
        let succeeded = results.iter().filter(|r| r.error.is_none()).count();
        BulkReport {
            requested: count,
            succeeded,
            failed: count - succeeded,
            results,
        }
    }

    /// Request cancellation of an in-flight operation. External steps cannot
    /// be interrupted; instead the instance is cleaned up (deleted) as soon
    /// as the running operation reaches a terminal state. Returns whether a
    /// cleanup was scheduled.
    pub fn cancel(&self, name: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.contains(name) {
            return false;
        }
        let mut requested = self
            .cancel_requested
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        requested.insert(name.to_string());
        true
    }

    fn lock_name(&self, name: &str) -> Result<NameGuard<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(name.to_string()) {
            return Err(AppError::operation_in_progress(name));
        }
        Ok(NameGuard {
            coordinator: self,
            name: name.to_string(),
        })
    }

    fn is_in_flight(&self, name: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.contains(name)
    }

    fn clear_cancel(&self, name: &str) -> bool {
        let mut requested = self
            .cancel_requested
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        requested.remove(name)
    }

    /// Run the deferred delete for a cancelled operation, still under the
    /// caller's name lock.
    async fn run_deferred_cleanup(&self, name: &str) {
        if !self.clear_cancel(name) {
            return;
        }
        log::info!("Cancellation requested for {}; running deferred delete", name);
        if let Err(err) = self.delete_locked(name).await {
            log::warn!("Deferred delete for {} failed: {}", name, err);
        }
    }

    async fn acquire_worker(&self) -> Result<SemaphorePermit<'_>> {
        self.workers
            .acquire()
            .await
            .map_err(|_| AppError::config("worker pool is closed"))
    }

    fn record_failure(&self, name: &str, err: &AppError) {
        let failed_step = err.step().map(str::to_string);
        let diagnostic = err.to_string();
        let commit = self.registry.commit(name, InstanceState::Failed, |inst| {
            inst.failed_step = failed_step;
            inst.diagnostic = Some(diagnostic);
        });
        if let Err(commit_err) = commit {
            log::warn!("Failed to record failure for {}: {}", name, commit_err);
        }
    }

    fn log_completion(&self, instance: &Instance) {
        log::info!("Site URL: {}", instance.site_url);
        log::info!("Admin URL: {}/wp-admin", instance.site_url);
        log::info!("Admin user: {}", instance.admin_user);
        log::info!("Database: {}", instance.database_name);
    }
}
