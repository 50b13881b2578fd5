//! Bulk operation dispatcher.
//!
//! Applies one control operation to a set of instance ids. Every id gets its
//! own engine call in its own task; outcomes are collected into a
//! [`BulkReport`] before the dispatcher returns.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{ClientHandle, is_dot_segment};
use crate::engine::{EngineResult, TaskHubEngine};
use crate::error::{GatewayError, Operation, Result, UpstreamError};

/// Control operations that can be applied in bulk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkOperation {
    /// Delete the instance and its history.
    Purge,
    Resume,
    Suspend,
    Terminate,
}

impl BulkOperation {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Purge => Operation::DeleteInstances,
            Self::Resume => Operation::ResumeInstances,
            Self::Suspend => Operation::SuspendInstances,
            Self::Terminate => Operation::TerminateInstances,
        }
    }

    async fn invoke(
        self,
        engine: &dyn TaskHubEngine,
        instance_id: &str,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        match self {
            Self::Purge => engine.purge_instance(instance_id).await,
            Self::Resume => engine.resume_instance(instance_id, reason).await,
            Self::Suspend => engine.suspend_instance(instance_id, reason).await,
            Self::Terminate => engine.terminate_instance(instance_id, reason).await,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BulkOptions {
    /// Upper bound on concurrent engine calls. `None` means one call per id at once.
    pub max_concurrency: Option<NonZeroUsize>,
    /// Forwarded to resume, suspend and terminate.
    pub reason: Option<String>,
}

/// One id that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceFailure {
    pub instance_id: String,
    #[serde(serialize_with = "serialize_display")]
    pub error: UpstreamError,
}

fn serialize_display<S: Serializer>(value: &UpstreamError, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// Per-id outcomes of a bulk operation, in input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub operation: Operation,
    pub task_hub: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<InstanceFailure>,
    pub cancelled: Vec<String>,
}

impl BulkReport {
    fn new(operation: Operation, task_hub: impl Into<String>) -> Self {
        Self {
            operation,
            task_hub: task_hub.into(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.cancelled.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    fn sort_by_position(&mut self, position: &HashMap<String, usize>) {
        let key = |id: &String| position.get(id).copied().unwrap_or(usize::MAX);
        self.succeeded.sort_by_key(key);
        self.cancelled.sort_by_key(key);
        self.failed.sort_by_key(|f| key(&f.instance_id));
    }
}

impl fmt::Display for BulkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on '{}': {} succeeded, {} failed, {} cancelled",
            self.operation,
            self.task_hub,
            self.succeeded.len(),
            self.failed.len(),
            self.cancelled.len()
        )?;
        for failure in &self.failed {
            write!(f, "; '{}': {}", failure.instance_id, failure.error)?;
        }
        Ok(())
    }
}

enum Outcome {
    Succeeded,
    Failed(UpstreamError),
    Cancelled,
}

/// Apply `op` to every id in `instance_ids` on the handle's task hub.
///
/// Duplicate ids are applied once. Returns `Ok` only if every id succeeded;
/// any failure yields [`GatewayError::PartialBatchFailure`] with the full
/// report. If the token fires, ids not yet applied are reported as cancelled
/// and operations already applied stay applied.
pub async fn apply_bulk<I, S>(
    op: BulkOperation,
    handle: &ClientHandle,
    instance_ids: I,
    cancel: &CancellationToken,
    options: &BulkOptions,
) -> Result<BulkReport>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let operation = op.operation();
    let task_hub = handle.task_hub_name().to_string();

    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for id in instance_ids {
        let id = id.into();
        if id.is_empty() {
            return Err(GatewayError::invalid_argument(
                "instanceIds",
                "instance ids must not be empty strings",
            ));
        }
        if is_dot_segment(&id) {
            return Err(GatewayError::invalid_argument(
                "instanceIds",
                format!("'{id}' is not a valid instance id"),
            ));
        }
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(GatewayError::invalid_argument(
            "instanceIds",
            "at least one instance id is required",
        ));
    }

    info!(
        "{} on '{}': dispatching {} instance(s)",
        operation,
        task_hub,
        ids.len()
    );

    let position: HashMap<String, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();
    let permits = options
        .max_concurrency
        .map(|n| Arc::new(Semaphore::new(n.get())));

    let mut tasks = JoinSet::new();
    for id in ids {
        let engine = handle.engine().clone();
        let cancel = cancel.clone();
        let permits = permits.clone();
        let reason = options.reason.clone();

        tasks.spawn(async move {
            let call = async {
                let _permit = match &permits {
                    Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
                    None => None,
                };
                op.invoke(engine.as_ref(), &id, reason.as_deref()).await
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Outcome::Cancelled,
                result = call => match result {
                    Ok(()) => Outcome::Succeeded,
                    Err(e) => Outcome::Failed(e),
                },
            };
            (id, outcome)
        });
    }

    let mut report = BulkReport::new(operation, task_hub.clone());
    let mut pending: HashSet<String> = position.keys().cloned().collect();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, outcome)) => {
                pending.remove(&id);
                match outcome {
                    Outcome::Succeeded => {
                        debug!("{} '{}' succeeded", operation, id);
                        report.succeeded.push(id);
                    }
                    Outcome::Failed(error) => {
                        warn!("{} '{}' failed: {}", operation, id, error);
                        report.failed.push(InstanceFailure {
                            instance_id: id,
                            error,
                        });
                    }
                    Outcome::Cancelled => report.cancelled.push(id),
                }
            }
            Err(e) => error!("{} task on '{}' did not complete: {}", operation, task_hub, e),
        }
    }

    // Tasks that panicked never reported their id.
    for id in pending {
        report.failed.push(InstanceFailure {
            instance_id: id,
            error: UpstreamError::Transport("task aborted before completing".to_string()),
        });
    }
    report.sort_by_position(&position);

    if !report.failed.is_empty() {
        error!("{}", report);
        return Err(GatewayError::PartialBatchFailure(report));
    }
    if !report.cancelled.is_empty() {
        info!(
            "{} on '{}' cancelled after {} of {} instance(s)",
            operation,
            task_hub,
            report.succeeded.len(),
            report.total()
        );
        return Err(GatewayError::cancelled_batch(report));
    }

    info!("{}", report);
    Ok(report)
}
