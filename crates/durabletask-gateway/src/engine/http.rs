//! HTTP client for the scheduler's task hub API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use url::Url;

use super::{EngineResult, InstancePage, InstanceQuery, TaskHubEngine};
use crate::connection::{ConnectionDescriptor, EngineConnector, is_dot_segment};
use crate::credential::{CredentialProvider, ENGINE_SCOPE};
use crate::error::{GatewayError, Result, UpstreamError};
use crate::model::{InstanceDescriptor, MalformedInstance};

/// Header carrying the task hub name on every request.
pub const TASKHUB_HEADER: &str = "x-taskhub";

/// Settings shared by every engine built by one connector.
#[derive(Debug, Clone)]
pub struct HttpEngineOptions {
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Idle connections kept per scheduler host
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpEngineOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
        }
    }
}

/// Builds [`HttpTaskHubEngine`]s that share one connection pool.
#[derive(Debug, Clone)]
pub struct HttpEngineConnector {
    client: HttpClient,
}

impl HttpEngineConnector {
    pub fn new(options: &HttpEngineOptions) -> std::result::Result<Self, UpstreamError> {
        let client = HttpClient::builder()
            .timeout(options.request_timeout)
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: HttpClient) -> Self {
        Self { client }
    }
}

impl EngineConnector for HttpEngineConnector {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn TaskHubEngine>> {
        let engine = HttpTaskHubEngine::new(self.client.clone(), descriptor)?;
        Ok(Arc::new(engine))
    }
}

/// Engine client for one task hub over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct HttpTaskHubEngine {
    client: HttpClient,
    base_url: Url,
    task_hub: String,
    credential: Option<Arc<dyn CredentialProvider>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    page_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    continuation_token: Option<&'a str>,
    fetch_inputs_and_outputs: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    instance_id: String,
}

#[derive(Serialize)]
struct ReasonRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

impl HttpTaskHubEngine {
    pub fn new(client: HttpClient, descriptor: &ConnectionDescriptor) -> Result<Self> {
        let base_url = descriptor.task_hub.scheduler_endpoint.clone();
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::invalid_argument(
                "schedulerEndpoint",
                format!("'{base_url}' cannot be used as a base URL"),
            ));
        }

        let credential = descriptor
            .authentication
            .requires_token()
            .then(|| descriptor.credential.clone());

        Ok(Self {
            client,
            base_url,
            task_hub: descriptor.task_hub.name.clone(),
            credential,
        })
    }

    /// `{endpoint}/v1/taskhubs/{hub}/instances[/{extra}...]`, each segment escaped.
    fn instances_url(&self, extra: &[&str]) -> EngineResult<Url> {
        if let Some(segment) = extra.iter().find(|s| is_dot_segment(s)) {
            return Err(UpstreamError::Rejected(format!(
                "'{segment}' cannot be sent as a path segment"
            )));
        }
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                UpstreamError::Transport(format!("'{}' cannot be used as a base URL", self.base_url))
            })?;
            segments
                .pop_if_empty()
                .extend(["v1", "taskhubs", self.task_hub.as_str(), "instances"])
                .extend(extra);
        }
        url.set_query(None);
        Ok(url)
    }

    async fn authorize(&self, request: RequestBuilder) -> EngineResult<RequestBuilder> {
        let request = request.header(TASKHUB_HEADER, &self.task_hub);
        match &self.credential {
            Some(credential) => {
                let token = credential.get_token(ENGINE_SCOPE).await?;
                Ok(request.bearer_auth(token.token))
            }
            None => Ok(request),
        }
    }

    async fn send(&self, request: RequestBuilder) -> EngineResult<Response> {
        let response = self.authorize(request).await?.send().await?;
        check_status(response).await
    }

    async fn post_action(&self, instance_id: &str, action: &str, reason: Option<&str>) -> EngineResult<()> {
        let url = self.instances_url(&[instance_id, action])?;
        debug!("POST {}", url);
        self.send(self.client.post(url).json(&ReasonRequest { reason }))
            .await?;
        Ok(())
    }
}

/// Map non-success statuses onto [`UpstreamError`].
pub(crate) async fn check_status(response: Response) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    error!("HTTP error {}: {}", status, text);

    Err(match status {
        StatusCode::NOT_FOUND => UpstreamError::NotFound(text),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => UpstreamError::Rejected(text),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::Credential(format!("HTTP {status}: {text}")),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => UpstreamError::Unavailable(text),
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => UpstreamError::Timeout(text),
        _ => UpstreamError::Status {
            status: status.as_u16(),
            message: text,
        },
    })
}

/// Decode a query response one item at a time.
pub(crate) fn decode_page(body: Value) -> EngineResult<InstancePage> {
    let Value::Object(mut body) = body else {
        return Err(UpstreamError::InvalidResponse(
            "query response is not a JSON object".to_string(),
        ));
    };

    let items = match body.remove("instances") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(UpstreamError::InvalidResponse(
                "`instances` is not an array".to_string(),
            ));
        }
    };

    let continuation_token = match body.remove("continuationToken") {
        Some(Value::String(token)) if !token.is_empty() => Some(token),
        _ => None,
    };

    let instances = items
        .into_iter()
        .map(|item| {
            InstanceDescriptor::deserialize(&item)
                .map_err(|e| MalformedInstance::from_raw(&item, e.to_string()))
        })
        .collect();

    Ok(InstancePage {
        instances,
        continuation_token,
    })
}

#[async_trait]
impl TaskHubEngine for HttpTaskHubEngine {
    async fn query_instances(&self, query: &InstanceQuery) -> EngineResult<InstancePage> {
        let url = self.instances_url(&["query"])?;
        debug!(
            "POST {} (page_size={}, continuation={:?})",
            url, query.page_size, query.continuation_token
        );

        let body = QueryRequest {
            page_size: query.page_size,
            continuation_token: query.continuation_token.as_deref(),
            fetch_inputs_and_outputs: query.fetch_inputs_and_outputs,
        };
        let response = self.send(self.client.post(url).json(&body)).await?;
        let body: Value = response.json().await?;
        decode_page(body)
    }

    async fn schedule_new_orchestration(
        &self,
        name: &str,
        input: Option<Value>,
        instance_id: Option<String>,
    ) -> EngineResult<String> {
        let url = self.instances_url(&[])?;
        debug!("POST {} (orchestration={})", url, name);

        let body = CreateRequest {
            name,
            input,
            instance_id,
        };
        let response = self.send(self.client.post(url).json(&body)).await?;
        let created: CreateResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(format!("Failed to parse response: {e}")))?;
        Ok(created.instance_id)
    }

    async fn purge_instance(&self, instance_id: &str) -> EngineResult<()> {
        let url = self.instances_url(&[instance_id])?;
        debug!("DELETE {}", url);
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn resume_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()> {
        self.post_action(instance_id, "resume", reason).await
    }

    async fn suspend_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()> {
        self.post_action(instance_id, "suspend", reason).await
    }

    async fn terminate_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()> {
        self.post_action(instance_id, "terminate", reason).await
    }
}
