//! Operation facade.
//!
//! [`TaskHubGateway`] ties the resolver, enumerator, dispatcher and inventory
//! together into the operations exposed to callers. Each call resolves a fresh
//! client; nothing is cached between calls.

use std::num::NonZeroUsize;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bulk::{BulkOperation, BulkOptions, BulkReport, apply_bulk};
use crate::connection::{ClientHandle, ConnectionResolver, is_dot_segment};
use crate::enumerator::{DEFAULT_PAGE_SIZE, InstanceStream, ListOptions, collect_instances, list_instances};
use crate::error::{GatewayError, Operation, Result};
use crate::inventory::{SchedulerInventory, SchedulerStream, list_schedulers};
use crate::model::{CreatedInstance, OrchestrationInstance, Scheduler};

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Instances requested per page when listing.
    pub page_size: usize,
    /// Cap on concurrent engine calls per bulk operation.
    pub max_concurrency: Option<NonZeroUsize>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_concurrency: None,
        }
    }
}

#[derive(Clone)]
pub struct TaskHubGateway {
    resolver: ConnectionResolver,
    inventory: Arc<dyn SchedulerInventory>,
    options: GatewayOptions,
}

impl TaskHubGateway {
    pub fn new(
        resolver: ConnectionResolver,
        inventory: Arc<dyn SchedulerInventory>,
        options: GatewayOptions,
    ) -> Self {
        Self {
            resolver,
            inventory,
            options,
        }
    }

    pub fn resolver(&self) -> &ConnectionResolver {
        &self.resolver
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Stream the schedulers of a subscription.
    pub fn stream_schedulers(&self, subscription_id: &str, cancel: &CancellationToken) -> Result<SchedulerStream> {
        list_schedulers(self.inventory.clone(), subscription_id, cancel.clone())
    }

    /// All schedulers of a subscription with their task hubs.
    pub async fn list_schedulers(
        &self,
        subscription_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Scheduler>> {
        use futures::TryStreamExt;

        let schedulers: Vec<Scheduler> = self
            .stream_schedulers(subscription_id, cancel)?
            .try_collect()
            .await?;
        info!(
            "ListSchedulers '{}': {} scheduler(s)",
            subscription_id.trim(),
            schedulers.len()
        );
        Ok(schedulers)
    }

    /// Stream the instances of a task hub.
    pub fn stream_instances(
        &self,
        task_hub_name: &str,
        scheduler_endpoint: &str,
        fetch_payloads: bool,
        cancel: &CancellationToken,
    ) -> Result<InstanceStream> {
        let handle = self.resolver.resolve(task_hub_name, scheduler_endpoint)?;
        let options = ListOptions {
            fetch_payloads,
            page_size: self.options.page_size,
        };
        Ok(list_instances(handle, options, cancel.clone()))
    }

    /// All instances of a task hub, payloads included.
    pub async fn list_instances(
        &self,
        task_hub_name: &str,
        scheduler_endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<OrchestrationInstance>> {
        let stream = self.stream_instances(task_hub_name, scheduler_endpoint, true, cancel)?;
        let instances = collect_instances(stream).await?;
        info!(
            "ListInstances '{}': {} instance(s)",
            task_hub_name.trim(),
            instances.len()
        );
        Ok(instances)
    }

    /// Schedule a new orchestration.
    ///
    /// `input` is JSON text; it is parsed before anything is sent.
    pub async fn create_instance(
        &self,
        task_hub_name: &str,
        scheduler_endpoint: &str,
        orchestration_name: &str,
        input: Option<&str>,
        instance_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CreatedInstance> {
        let handle = self.resolver.resolve(task_hub_name, scheduler_endpoint)?;
        let name = orchestration_name.trim();
        if name.is_empty() {
            return Err(GatewayError::invalid_argument(
                "orchestrationName",
                "must not be empty",
            ));
        }
        let input = parse_json_input(input)?;
        let instance_id = instance_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        if let Some(id) = instance_id.as_deref().filter(|id| is_dot_segment(id)) {
            return Err(GatewayError::invalid_argument(
                "instanceId",
                format!("'{id}' is not a valid instance id"),
            ));
        }

        self.schedule(&handle, name, input, instance_id, cancel).await
    }

    async fn schedule(
        &self,
        handle: &ClientHandle,
        name: &str,
        input: Option<Value>,
        instance_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<CreatedInstance> {
        let task_hub = handle.task_hub_name();
        if cancel.is_cancelled() {
            return Err(GatewayError::cancelled(Operation::CreateInstance, task_hub));
        }

        let requested = instance_id.clone();
        let scheduled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GatewayError::cancelled(Operation::CreateInstance, task_hub)),
            result = handle.engine().schedule_new_orchestration(name, input, instance_id) => result,
        };

        let instance_id = scheduled.map_err(|e| {
            GatewayError::upstream(Operation::CreateInstance, task_hub, requested, e)
        })?;
        info!("CreateInstance '{}': scheduled {} as '{}'", task_hub, name, instance_id);
        Ok(CreatedInstance { instance_id })
    }

    pub async fn delete_instances(
        &self,
        task_hub_name: &str,
        scheduler_endpoint: &str,
        instance_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<BulkReport> {
        self.bulk(BulkOperation::Purge, task_hub_name, scheduler_endpoint, instance_ids, None, cancel)
            .await
    }

    pub async fn resume_instances(
        &self,
        task_hub_name: &str,
        scheduler_endpoint: &str,
        instance_ids: &[String],
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BulkReport> {
        self.bulk(BulkOperation::Resume, task_hub_name, scheduler_endpoint, instance_ids, reason, cancel)
            .await
    }

    pub async fn suspend_instances(
        &self,
        task_hub_name: &str,
        scheduler_endpoint: &str,
        instance_ids: &[String],
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BulkReport> {
        self.bulk(BulkOperation::Suspend, task_hub_name, scheduler_endpoint, instance_ids, reason, cancel)
            .await
    }

    pub async fn terminate_instances(
        &self,
        task_hub_name: &str,
        scheduler_endpoint: &str,
        instance_ids: &[String],
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BulkReport> {
        self.bulk(BulkOperation::Terminate, task_hub_name, scheduler_endpoint, instance_ids, reason, cancel)
            .await
    }

    async fn bulk(
        &self,
        op: BulkOperation,
        task_hub_name: &str,
        scheduler_endpoint: &str,
        instance_ids: &[String],
        reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<BulkReport> {
        let handle = self.resolver.resolve(task_hub_name, scheduler_endpoint)?;
        let options = BulkOptions {
            max_concurrency: self.options.max_concurrency,
            reason: reason.map(str::to_string),
        };
        apply_bulk(op, &handle, instance_ids.iter().cloned(), cancel, &options).await
    }
}

/// Parse optional JSON text into a value.
///
/// `None` means no input. `Some("null")` is an explicit JSON null.
pub fn parse_json_input(raw: Option<&str>) -> Result<Option<Value>> {
    match raw {
        None => Ok(None),
        Some(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(|e| GatewayError::invalid_argument("input", format!("not valid JSON: {e}"))),
    }
}
