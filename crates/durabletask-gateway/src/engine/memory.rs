//! In-memory task hub engine.
//!
//! Keeps instances in a map and applies the same state transitions a
//! scheduler would. Failure injection hooks let tests drive error paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{EngineResult, InstancePage, InstanceQuery, TaskHubEngine};
use crate::connection::{ConnectionDescriptor, EngineConnector};
use crate::error::{Result, UpstreamError};
use crate::model::{InstanceDescriptor, MalformedInstance};
use crate::status::OrchestrationStatus;

#[derive(Default)]
struct MemoryState {
    instances: BTreeMap<String, InstanceDescriptor>,
    malformed: Vec<MalformedInstance>,
    instance_failures: HashMap<String, UpstreamError>,
    query_failure: Option<UpstreamError>,
    repeat_continuation: bool,
    created: Vec<(String, Option<Value>)>,
    queries: Vec<InstanceQuery>,
}

/// Engine backed by a map, for tests and local runs.
#[derive(Default)]
pub struct InMemoryEngine {
    state: Mutex<MemoryState>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_id: AtomicU64,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance with the given name and status.
    pub fn with_instance(self, instance_id: &str, name: &str, status: OrchestrationStatus) -> Self {
        self.insert(instance_id, name, status);
        self
    }

    pub fn insert(&self, instance_id: &str, name: &str, status: OrchestrationStatus) {
        let now = Value::String(Utc::now().to_rfc3339());
        self.insert_descriptor(InstanceDescriptor {
            instance_id: Some(instance_id.to_string()),
            name: Some(name.to_string()),
            runtime_status: Some(status.as_str().to_string()),
            created_at: Some(now.clone()),
            last_updated_at: Some(now),
            ..Default::default()
        });
    }

    /// Add a raw descriptor. Descriptors without an id are ignored.
    pub fn insert_descriptor(&self, descriptor: InstanceDescriptor) {
        if let Some(id) = descriptor.instance_id.clone() {
            self.state.lock().instances.insert(id, descriptor);
        }
    }

    /// Report an undecodable item at the start of every query.
    pub fn push_malformed(&self, item: MalformedInstance) {
        self.state.lock().malformed.push(item);
    }

    /// Make every control call on `instance_id` fail with `error`.
    pub fn fail_instance(&self, instance_id: &str, error: UpstreamError) {
        self.state
            .lock()
            .instance_failures
            .insert(instance_id.to_string(), error);
    }

    /// Make every query fail with `error`.
    pub fn fail_queries(&self, error: UpstreamError) {
        self.state.lock().query_failure = Some(error);
    }

    /// Keep returning the first continuation token, as a broken engine would.
    pub fn repeat_continuation(&self) {
        self.state.lock().repeat_continuation = true;
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn descriptor(&self, instance_id: &str) -> Option<InstanceDescriptor> {
        self.state.lock().instances.get(instance_id).cloned()
    }

    pub fn status(&self, instance_id: &str) -> Option<OrchestrationStatus> {
        self.descriptor(instance_id)
            .map(|d| OrchestrationStatus::from_engine_opt(d.runtime_status.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.state.lock().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Orchestration names and inputs passed to `schedule_new_orchestration`.
    pub fn created(&self) -> Vec<(String, Option<Value>)> {
        self.state.lock().created.clone()
    }

    /// Query pages requested so far.
    pub fn queries(&self) -> Vec<InstanceQuery> {
        self.state.lock().queries.clone()
    }

    /// Total engine calls, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        guard
    }

    fn transition(
        &self,
        instance_id: &str,
        action: &str,
        apply: impl FnOnce(OrchestrationStatus) -> Option<OrchestrationStatus>,
        reason: Option<&str>,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.instance_failures.get(instance_id) {
            return Err(err.clone());
        }

        let descriptor = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| UpstreamError::NotFound(format!("instance '{instance_id}'")))?;
        let current = OrchestrationStatus::from_engine_opt(descriptor.runtime_status.as_deref());

        let next = apply(current).ok_or_else(|| {
            UpstreamError::Rejected(format!("cannot {action} instance '{instance_id}' in state {current}"))
        })?;

        debug!("{} {}: {} -> {}", action, instance_id, current, next);
        descriptor.runtime_status = Some(next.as_str().to_string());
        descriptor.last_updated_at = Some(Value::String(Utc::now().to_rfc3339()));
        if next == OrchestrationStatus::Terminated {
            descriptor.output = reason.map(|r| Value::String(r.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHubEngine for InMemoryEngine {
    async fn query_instances(&self, query: &InstanceQuery) -> EngineResult<InstancePage> {
        let _guard = self.enter().await;
        let mut state = self.state.lock();
        state.queries.push(query.clone());
        if let Some(err) = &state.query_failure {
            return Err(err.clone());
        }

        let offset = match query.continuation_token.as_deref() {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| UpstreamError::Rejected(format!("unknown continuation token '{token}'")))?,
            None => 0,
        };
        let page_size = query.page_size.max(1);

        let items: Vec<std::result::Result<InstanceDescriptor, MalformedInstance>> = state
            .malformed
            .iter()
            .cloned()
            .map(Err)
            .chain(state.instances.values().cloned().map(|mut d| {
                if !query.fetch_inputs_and_outputs {
                    d.input = None;
                    d.output = None;
                    d.failure_details = None;
                }
                Ok(d)
            }))
            .collect();

        let end = offset.saturating_add(page_size).min(items.len());
        let page: Vec<_> = items.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();

        let continuation_token = if state.repeat_continuation {
            Some(page_size.to_string())
        } else {
            (end < items.len()).then(|| end.to_string())
        };

        Ok(InstancePage {
            instances: page,
            continuation_token,
        })
    }

    async fn schedule_new_orchestration(
        &self,
        name: &str,
        input: Option<Value>,
        instance_id: Option<String>,
    ) -> EngineResult<String> {
        let _guard = self.enter().await;
        let instance_id = instance_id.unwrap_or_else(|| {
            format!("{:032x}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        });

        let mut state = self.state.lock();
        if let Some(existing) = state.instances.get(&instance_id) {
            let status = OrchestrationStatus::from_engine_opt(existing.runtime_status.as_deref());
            if !status.is_terminal() {
                return Err(UpstreamError::Rejected(format!(
                    "instance '{instance_id}' already exists in state {status}"
                )));
            }
        }

        let now = Value::String(Utc::now().to_rfc3339());
        state.created.push((name.to_string(), input.clone()));
        state.instances.insert(
            instance_id.clone(),
            InstanceDescriptor {
                instance_id: Some(instance_id.clone()),
                name: Some(name.to_string()),
                runtime_status: Some(OrchestrationStatus::Pending.as_str().to_string()),
                created_at: Some(now.clone()),
                last_updated_at: Some(now),
                input,
                ..Default::default()
            },
        );
        Ok(instance_id)
    }

    async fn purge_instance(&self, instance_id: &str) -> EngineResult<()> {
        let _guard = self.enter().await;
        let mut state = self.state.lock();
        if let Some(err) = state.instance_failures.get(instance_id) {
            return Err(err.clone());
        }
        state
            .instances
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| UpstreamError::NotFound(format!("instance '{instance_id}'")))
    }

    async fn resume_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()> {
        let _guard = self.enter().await;
        self.transition(
            instance_id,
            "resume",
            |s| (s == OrchestrationStatus::Suspended).then_some(OrchestrationStatus::Running),
            reason,
        )
    }

    async fn suspend_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()> {
        let _guard = self.enter().await;
        self.transition(
            instance_id,
            "suspend",
            |s| {
                matches!(s, OrchestrationStatus::Running | OrchestrationStatus::Pending)
                    .then_some(OrchestrationStatus::Suspended)
            },
            reason,
        )
    }

    async fn terminate_instance(&self, instance_id: &str, reason: Option<&str>) -> EngineResult<()> {
        let _guard = self.enter().await;
        self.transition(
            instance_id,
            "terminate",
            |s| (!s.is_terminal()).then_some(OrchestrationStatus::Terminated),
            reason,
        )
    }
}

/// Connector handing out one shared [`InMemoryEngine`] per task hub name.
#[derive(Default)]
pub struct InMemoryConnector {
    engines: Mutex<HashMap<String, Arc<InMemoryEngine>>>,
    connects: AtomicUsize,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prepared engine for `task_hub`.
    pub fn with_engine(self, task_hub: &str, engine: InMemoryEngine) -> Self {
        self.engines
            .lock()
            .insert(task_hub.to_string(), Arc::new(engine));
        self
    }

    /// The engine backing `task_hub`, created empty on first use.
    pub fn engine(&self, task_hub: &str) -> Arc<InMemoryEngine> {
        self.engines
            .lock()
            .entry(task_hub.to_string())
            .or_default()
            .clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl EngineConnector for InMemoryConnector {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn TaskHubEngine>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine(&descriptor.task_hub.name))
    }
}
