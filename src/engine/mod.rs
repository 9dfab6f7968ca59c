//! Instance lifecycle engines.
//!
//! Each engine is an ordered sequence of externally-effectful steps. Engines
//! never touch the registry: they emit progress events, run their steps, and
//! return the outcome for the coordinator to commit.

mod delete;
mod provision;
mod reset;

pub use delete::DeletionEngine;
pub use provision::{prepare_instance, ProvisionEngine};
pub use reset::ResetEngine;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::Result;

const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Reset,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Started,
    Succeeded,
    Failed,
}

/// Step-level progress, consumable by any renderer.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub instance: String,
    pub operation: OperationKind,
    pub step: String,
    pub phase: StepPhase,
    pub message: String,
}

/// Emits progress for one operation on one instance and runs its steps with
/// bounded retries.
pub(crate) struct StepRunner {
    events: broadcast::Sender<ProgressEvent>,
    instance: String,
    operation: OperationKind,
    retries: u32,
}

impl StepRunner {
    pub(crate) fn new(
        events: broadcast::Sender<ProgressEvent>,
        instance: &str,
        operation: OperationKind,
        retries: u32,
    ) -> Self {
        Self {
            events,
            instance: instance.to_string(),
            operation,
            retries,
        }
    }

    pub(crate) fn emit(&self, step: &str, phase: StepPhase, message: impl Into<String>) {
        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.events.send(ProgressEvent {
            instance: self.instance.clone(),
            operation: self.operation,
            step: step.to_string(),
            phase,
            message: message.into(),
        });
    }

    /// Run one step, retrying up to the configured number of extra attempts.
    /// The step name travels with any terminal error.
    pub(crate) async fn run_step<T, F, Fut>(&self, step: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.emit(step, StepPhase::Started, format!("{} started", step));

        let mut tries = 0;
        loop {
            match attempt().await {
                Ok(value) => {
                    self.emit(step, StepPhase::Succeeded, format!("{} succeeded", step));
                    return Ok(value);
                }
                Err(err) if tries < self.retries => {
                    tries += 1;
                    log::warn!(
                        "Step {} for {} failed (attempt {} of {}), retrying: {}",
                        step,
                        self.instance,
                        tries,
                        self.retries + 1,
                        err
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(err) => {
                    self.emit(step, StepPhase::Failed, err.to_string());
                    return Err(err.with_step(step));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OperationKind, StepPhase, StepRunner};
    use crate::error::AppError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn steps_retry_then_succeed() {
        let (tx, mut rx) = broadcast::channel(16);
        let runner = StepRunner::new(tx, "wp_test_01", OperationKind::Create, 2);
        let calls = AtomicU32::new(0);

        let result = runner
            .run_step("database", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AppError::filesystem("transient"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let started = rx.recv().await.unwrap();
        assert_eq!(started.phase, StepPhase::Started);
        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.phase, StepPhase::Succeeded);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_step_attached() {
        let (tx, mut rx) = broadcast::channel(16);
        let runner = StepRunner::new(tx, "wp_test_01", OperationKind::Create, 1);

        let result: crate::error::Result<()> = runner
            .run_step("extract", || async {
                Err(AppError::filesystem("disk full"))
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.step(), Some("extract"));

        assert_eq!(rx.recv().await.unwrap().phase, StepPhase::Started);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.phase, StepPhase::Failed);
        assert!(failed.message.contains("disk full"));
    }
}
