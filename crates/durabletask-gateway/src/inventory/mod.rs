//! Scheduler inventory.
//!
//! Discovers the schedulers of a subscription and the task hubs of each
//! scheduler through a [`SchedulerInventory`] collaborator.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{GatewayError, Operation, Result, UpstreamError};
use crate::model::{Scheduler, TaskHub};

pub mod arm;
pub mod memory;

pub use arm::{ArmInventory, ArmOptions};
pub use memory::InMemoryInventory;

const MAX_SUBSCRIPTION_ID_LEN: usize = 128;

/// A scheduler as listed by the management API, before its task hubs are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerResource {
    /// Full resource id, used to address child resources.
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub resource_group_name: String,
    pub subscription_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerPage {
    pub schedulers: Vec<SchedulerResource>,
    pub next_link: Option<String>,
}

pub type InventoryResult<T> = std::result::Result<T, UpstreamError>;

/// Management-plane read access to schedulers and task hubs.
#[async_trait]
pub trait SchedulerInventory: Send + Sync {
    /// One page of schedulers. `next_link` is the value returned by the
    /// previous page, or `None` for the first.
    async fn list_schedulers_page(
        &self,
        subscription_id: &str,
        next_link: Option<&str>,
    ) -> InventoryResult<SchedulerPage>;

    async fn list_task_hubs(&self, scheduler: &SchedulerResource) -> InventoryResult<Vec<TaskHub>>;
}

pub type SchedulerStream = Pin<Box<dyn Stream<Item = Result<Scheduler>> + Send>>;

pub fn validate_subscription_id(raw: &str) -> Result<String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(GatewayError::invalid_argument("subscriptionId", "must not be empty"));
    }
    if id.len() > MAX_SUBSCRIPTION_ID_LEN {
        return Err(GatewayError::invalid_argument(
            "subscriptionId",
            format!("must be at most {MAX_SUBSCRIPTION_ID_LEN} characters"),
        ));
    }
    if id.chars().all(|c| c == '.') {
        return Err(GatewayError::invalid_argument(
            "subscriptionId",
            format!("'{id}' is not a valid subscription id"),
        ));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(*c, '-' | '_' | '.')))
    {
        return Err(GatewayError::invalid_argument(
            "subscriptionId",
            format!("contains invalid character {c:?}"),
        ));
    }
    Ok(id.to_string())
}

/// Stream the schedulers of a subscription, each with its task hubs.
///
/// The subscription id is validated before anything is requested. A failure
/// to list one scheduler's task hubs ends the stream with an error naming
/// that scheduler.
pub fn list_schedulers(
    inventory: Arc<dyn SchedulerInventory>,
    subscription_id: &str,
    cancel: CancellationToken,
) -> Result<SchedulerStream> {
    let subscription_id = validate_subscription_id(subscription_id)?;

    Ok(Box::pin(try_stream! {
        let mut next_link: Option<String> = None;
        let mut visited = HashSet::new();

        loop {
            let page = guarded(&cancel, &subscription_id, None, inventory.list_schedulers_page(&subscription_id, next_link.as_deref())).await?;
            debug!(
                "ListSchedulers '{}': {} scheduler(s) on page",
                subscription_id,
                page.schedulers.len()
            );

            for resource in page.schedulers {
                let task_hubs = guarded(
                    &cancel,
                    &subscription_id,
                    Some(resource.name.clone()),
                    inventory.list_task_hubs(&resource),
                )
                .await?;

                yield Scheduler {
                    endpoint: resource.endpoint,
                    name: resource.name,
                    resource_group_name: resource.resource_group_name,
                    subscription_id: resource.subscription_id,
                    task_hubs,
                };
            }

            match page.next_link {
                None => break,
                Some(next) if !visited.insert(next.clone()) => {
                    Err::<(), _>(GatewayError::upstream(
                        Operation::ListSchedulers,
                        subscription_id.clone(),
                        None,
                        UpstreamError::InvalidResponse(format!("nextLink '{next}' was already visited")),
                    ))?;
                }
                Some(next) => next_link = Some(next),
            }
        }
    }))
}

/// Race a management call against cancellation and attribute its failure.
async fn guarded<T>(
    cancel: &CancellationToken,
    subscription_id: &str,
    resource: Option<String>,
    call: impl std::future::Future<Output = InventoryResult<T>>,
) -> Result<T> {
    if cancel.is_cancelled() {
        return Err(GatewayError::cancelled(Operation::ListSchedulers, subscription_id));
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::cancelled(Operation::ListSchedulers, subscription_id)),
        result = call => result.map_err(|e| {
            GatewayError::upstream(Operation::ListSchedulers, subscription_id, resource, e)
        }),
    }
}

/// Parse the resource group out of an ARM resource id.
pub fn resource_group_from_id(id: &str) -> Option<String> {
    let mut segments = id.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment.eq_ignore_ascii_case("resourceGroups") {
            return segments.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn test_subscription_id_validation() {
        assert!(validate_subscription_id("0b4f9f7e-1c2d-4e5f-8a9b-0c1d2e3f4a5b").is_ok());
        assert!(validate_subscription_id("sub-123").is_ok());

        for bad in ["", "   ", ".", "..", "...", "sub/123", "sub 123", "sub;1", "a".repeat(129).as_str()] {
            assert!(
                validate_subscription_id(bad).unwrap_err().is_invalid_argument(),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_resource_group_from_id() {
        let id = "/subscriptions/sub-1/resourceGroups/rg-orders/providers/Microsoft.DurableTask/schedulers/s1";
        assert_eq!(resource_group_from_id(id).as_deref(), Some("rg-orders"));
        assert_eq!(
            resource_group_from_id("/subscriptions/s/resourcegroups/RG").as_deref(),
            Some("RG")
        );
        assert!(resource_group_from_id("/subscriptions/sub-1").is_none());
    }

    #[tokio::test]
    async fn test_lists_schedulers_with_task_hubs() {
        let inventory = InMemoryInventory::new()
            .with_scheduler("sub-1", "rg", "s1", &["hub-a", "hub-b"])
            .with_scheduler("sub-1", "rg", "s2", &[])
            .with_scheduler("sub-2", "rg", "other", &["x"]);

        let schedulers: Vec<Scheduler> = list_schedulers(Arc::new(inventory), "sub-1", CancellationToken::new())
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(schedulers.len(), 2);
        assert_eq!(schedulers[0].name, "s1");
        assert_eq!(schedulers[0].task_hubs.len(), 2);
        assert_eq!(schedulers[0].resource_group_name, "rg");
        assert!(schedulers[1].task_hubs.is_empty());
    }

    #[tokio::test]
    async fn test_task_hub_failure_names_scheduler() {
        let inventory = InMemoryInventory::new().with_scheduler("sub-1", "rg", "s1", &["hub"]);
        inventory.fail_task_hubs("s1", UpstreamError::Status { status: 403, message: "denied".into() });

        let err = list_schedulers(Arc::new(inventory), "sub-1", CancellationToken::new())
            .unwrap()
            .try_collect::<Vec<_>>()
            .await
            .unwrap_err();

        match err {
            GatewayError::Upstream { scope, resource, .. } => {
                assert_eq!(scope, "sub-1");
                assert_eq!(resource.as_deref(), Some("s1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_subscription_makes_no_calls() {
        let inventory = Arc::new(InMemoryInventory::new());
        let result = list_schedulers(inventory.clone(), "bad/id", CancellationToken::new());
        assert!(result.is_err());
        assert_eq!(inventory.call_count(), 0);
    }
}
