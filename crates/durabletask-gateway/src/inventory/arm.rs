//! Azure Resource Manager inventory client.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::{InventoryResult, SchedulerInventory, SchedulerPage, SchedulerResource, resource_group_from_id};
use crate::credential::{CredentialProvider, MANAGEMENT_SCOPE};
use crate::engine::http::check_status;
use crate::error::UpstreamError;
use crate::model::TaskHub;

pub const DEFAULT_MANAGEMENT_URL: &str = "https://management.azure.com";
pub const DEFAULT_API_VERSION: &str = "2025-11-01";
const PROVIDER_NAMESPACE: &str = "Microsoft.DurableTask";

#[derive(Debug, Clone)]
pub struct ArmOptions {
    pub base_url: String,
    pub api_version: String,
    pub request_timeout: Duration,
}

impl Default for ArmOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MANAGEMENT_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SchedulerEntry {
    id: String,
    name: String,
    #[serde(default)]
    properties: SchedulerProperties,
}

#[derive(Debug, Default, Deserialize)]
struct SchedulerProperties {
    #[serde(default)]
    endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskHubEntry {
    name: String,
    #[serde(default)]
    properties: TaskHubProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskHubProperties {
    #[serde(default)]
    dashboard_url: Option<String>,
}

/// Lists schedulers and task hubs through the management API.
#[derive(Debug, Clone)]
pub struct ArmInventory {
    client: HttpClient,
    options: ArmOptions,
    credential: Arc<dyn CredentialProvider>,
}

impl ArmInventory {
    pub fn new(options: ArmOptions, credential: Arc<dyn CredentialProvider>) -> Result<Self, UpstreamError> {
        let client = HttpClient::builder()
            .timeout(options.request_timeout)
            .build()?;
        Ok(Self::with_client(client, options, credential))
    }

    pub fn with_client(client: HttpClient, options: ArmOptions, credential: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client,
            options,
            credential,
        }
    }

    fn base_url(&self) -> InventoryResult<Url> {
        Url::parse(&self.options.base_url).map_err(|e| {
            UpstreamError::Transport(format!("invalid management URL '{}': {e}", self.options.base_url))
        })
    }

    fn schedulers_url(&self, subscription_id: &str) -> InventoryResult<Url> {
        let mut url = self.base_url()?;
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Transport("management base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["subscriptions", subscription_id, "providers", PROVIDER_NAMESPACE, "schedulers"]);
        url.query_pairs_mut()
            .clear()
            .append_pair("api-version", &self.options.api_version);
        Ok(url)
    }

    fn task_hubs_url(&self, scheduler_id: &str) -> InventoryResult<Url> {
        let mut url = self.base_url()?;
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Transport("management base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(scheduler_id.split('/').filter(|s| !s.is_empty()))
            .push("taskHubs");
        url.query_pairs_mut()
            .clear()
            .append_pair("api-version", &self.options.api_version);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> InventoryResult<ListResponse<T>> {
        debug!("GET {}", url);
        let mut request = self.client.get(url);
        if self.credential.mechanism().requires_token() {
            let token = self.credential.get_token(MANAGEMENT_SCOPE).await?;
            request = request.bearer_auth(token.token);
        }

        let response = check_status(request.send().await?).await?;
        response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(format!("Failed to parse response: {e}")))
    }
}

#[async_trait]
impl SchedulerInventory for ArmInventory {
    async fn list_schedulers_page(
        &self,
        subscription_id: &str,
        next_link: Option<&str>,
    ) -> InventoryResult<SchedulerPage> {
        let url = match next_link {
            Some(link) => link.to_string(),
            None => self.schedulers_url(subscription_id)?.to_string(),
        };

        let page: ListResponse<SchedulerEntry> = self.get(&url).await?;
        let schedulers = page
            .value
            .into_iter()
            .map(|entry| SchedulerResource {
                resource_group_name: resource_group_from_id(&entry.id).unwrap_or_default(),
                endpoint: entry.properties.endpoint.unwrap_or_default(),
                subscription_id: subscription_id.to_string(),
                name: entry.name,
                id: entry.id,
            })
            .collect();

        Ok(SchedulerPage {
            schedulers,
            next_link: page.next_link.filter(|l| !l.is_empty()),
        })
    }

    async fn list_task_hubs(&self, scheduler: &SchedulerResource) -> InventoryResult<Vec<TaskHub>> {
        let mut url = self.task_hubs_url(&scheduler.id)?.to_string();
        let mut task_hubs = Vec::new();
        let mut visited = HashSet::new();

        loop {
            visited.insert(url.clone());
            let page: ListResponse<TaskHubEntry> = self.get(&url).await?;
            task_hubs.extend(page.value.into_iter().map(|entry| TaskHub {
                name: entry.name,
                dashboard_endpoint: entry.properties.dashboard_url,
            }));

            match page.next_link.filter(|l| !l.is_empty()) {
                Some(next) if !visited.contains(&next) => url = next,
                Some(next) => {
                    return Err(UpstreamError::InvalidResponse(format!(
                        "task hub nextLink '{next}' was already visited"
                    )));
                }
                None => break,
            }
        }

        Ok(task_hubs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::AnonymousCredential;

    fn inventory(base: &str) -> ArmInventory {
        let options = ArmOptions {
            base_url: base.to_string(),
            ..Default::default()
        };
        ArmInventory::new(options, Arc::new(AnonymousCredential)).unwrap()
    }

    #[test]
    fn test_schedulers_url() {
        let url = inventory("https://management.azure.com/").schedulers_url("sub-1").unwrap();
        assert_eq!(
            url.as_str(),
            "https://management.azure.com/subscriptions/sub-1/providers/Microsoft.DurableTask/schedulers?api-version=2025-11-01"
        );
    }

    #[test]
    fn test_task_hubs_url_appends_to_resource_id() {
        let url = inventory("http://127.0.0.1:9000")
            .task_hubs_url("/subscriptions/s/resourceGroups/rg/providers/Microsoft.DurableTask/schedulers/s1")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9000/subscriptions/s/resourceGroups/rg/providers/Microsoft.DurableTask/schedulers/s1/taskHubs?api-version=2025-11-01"
        );
    }
}
