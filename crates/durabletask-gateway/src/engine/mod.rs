//! Orchestration engine client interface.
//!
//! The gateway drives task hubs through [`TaskHubEngine`]. Two implementations
//! ship with the crate: [`http::HttpTaskHubEngine`] for a real scheduler and
//! [`memory::InMemoryEngine`] for tests and local experiments.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::UpstreamError;
use crate::model::{InstanceDescriptor, MalformedInstance};

pub mod http;
pub mod memory;

pub use http::{HttpEngineConnector, HttpEngineOptions, HttpTaskHubEngine};
pub use memory::{InMemoryConnector, InMemoryEngine};

/// One page request of an instance query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceQuery {
    pub page_size: usize,
    pub continuation_token: Option<String>,
    pub fetch_inputs_and_outputs: bool,
}

/// One page of an instance query.
///
/// Items that could not be decoded are reported individually so the caller
/// can decide what to do with them.
#[derive(Debug, Clone, Default)]
pub struct InstancePage {
    pub instances: Vec<std::result::Result<InstanceDescriptor, MalformedInstance>>,
    pub continuation_token: Option<String>,
}

pub type EngineResult<T> = std::result::Result<T, UpstreamError>;

/// Client-side operations on one task hub.
#[async_trait]
pub trait TaskHubEngine: Send + Sync {
    /// Fetch one page of instance metadata.
    async fn query_instances(&self, query: &InstanceQuery) -> EngineResult<InstancePage>;

    /// Schedule a new orchestration and return its instance id.
    async fn schedule_new_orchestration(
        &self,
        name: &str,
        input: Option<Value>,
        instance_id: Option<String>,
    ) -> EngineResult<String>;

    /// Permanently delete an instance and its history.
    async fn purge_instance(&self, instance_id: &str) -> EngineResult<()>;

    async fn resume_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()>;

    async fn suspend_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()>;

    async fn terminate_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()>;
}
