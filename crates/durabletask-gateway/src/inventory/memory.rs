//! In-memory scheduler inventory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{InventoryResult, SchedulerInventory, SchedulerPage, SchedulerResource};
use crate::error::UpstreamError;
use crate::model::TaskHub;

#[derive(Default)]
struct InventoryState {
    schedulers: Vec<(SchedulerResource, Vec<TaskHub>)>,
    task_hub_failures: HashMap<String, UpstreamError>,
    listing_failure: Option<UpstreamError>,
}

/// Fixed set of schedulers, paged like the management API.
pub struct InMemoryInventory {
    state: Mutex<InventoryState>,
    page_size: usize,
    calls: AtomicUsize,
}

impl Default for InMemoryInventory {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            page_size: 50,
            calls: AtomicUsize::new(0),
        }
    }
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_scheduler(
        self,
        subscription_id: &str,
        resource_group: &str,
        name: &str,
        task_hubs: &[&str],
    ) -> Self {
        let id = format!(
            "/subscriptions/{subscription_id}/resourceGroups/{resource_group}/providers/Microsoft.DurableTask/schedulers/{name}"
        );
        let resource = SchedulerResource {
            id,
            name: name.to_string(),
            endpoint: format!("https://{name}.durabletask.io"),
            resource_group_name: resource_group.to_string(),
            subscription_id: subscription_id.to_string(),
        };
        let hubs = task_hubs
            .iter()
            .map(|hub| TaskHub {
                name: hub.to_string(),
                dashboard_endpoint: Some(format!("https://dashboard.durabletask.io/{name}/{hub}")),
            })
            .collect();
        self.state.lock().schedulers.push((resource, hubs));
        self
    }

    /// Make task hub listing fail for the named scheduler.
    pub fn fail_task_hubs(&self, scheduler_name: &str, error: UpstreamError) {
        self.state
            .lock()
            .task_hub_failures
            .insert(scheduler_name.to_string(), error);
    }

    /// Make scheduler listing fail.
    pub fn fail_listing(&self, error: UpstreamError) {
        self.state.lock().listing_failure = Some(error);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchedulerInventory for InMemoryInventory {
    async fn list_schedulers_page(
        &self,
        subscription_id: &str,
        next_link: Option<&str>,
    ) -> InventoryResult<SchedulerPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if let Some(err) = &state.listing_failure {
            return Err(err.clone());
        }

        let offset = match next_link {
            Some(link) => link
                .parse::<usize>()
                .map_err(|_| UpstreamError::InvalidResponse(format!("unknown nextLink '{link}'")))?,
            None => 0,
        };

        let matching: Vec<SchedulerResource> = state
            .schedulers
            .iter()
            .filter(|(s, _)| s.subscription_id == subscription_id)
            .map(|(s, _)| s.clone())
            .collect();

        let end = (offset + self.page_size).min(matching.len());
        Ok(SchedulerPage {
            schedulers: matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default(),
            next_link: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn list_task_hubs(&self, scheduler: &SchedulerResource) -> InventoryResult<Vec<TaskHub>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if let Some(err) = state.task_hub_failures.get(&scheduler.name) {
            return Err(err.clone());
        }
        state
            .schedulers
            .iter()
            .find(|(s, _)| s.id == scheduler.id)
            .map(|(_, hubs)| hubs.clone())
            .ok_or_else(|| UpstreamError::NotFound(format!("scheduler '{}'", scheduler.name)))
    }
}
