//! Tool implementations backed by [`TaskHubGateway`].
//!
//! Gateway failures become tool results with `isError` set and a JSON body:
//!
//! ```json
//! { "kind": "PartialBatchFailure", "operation": "TerminateInstances", "scope": "orders",
//!   "message": "...", "succeeded": ["a"], "failures": [{"instanceId": "b", "error": "..."}] }
//! ```

pub mod scheduler;
pub mod taskhub;

use std::sync::Arc;

use durabletask_gateway::{GatewayError, TaskHubGateway};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{error, warn};

use crate::error::ToolError;
use crate::tool::{ToolRegistry, ToolResult};

pub use scheduler::ListSchedulersTool;
pub use taskhub::{
    CreateInstanceTool, DeleteInstancesTool, ListInstancesTool, ResumeInstancesTool,
    SuspendInstancesTool, TerminateInstancesTool,
};

/// Register every gateway tool.
pub async fn register_all(registry: &ToolRegistry, gateway: Arc<TaskHubGateway>) -> Result<(), ToolError> {
    registry.register(ListSchedulersTool::new(gateway.clone())).await?;
    registry.register(ListInstancesTool::new(gateway.clone())).await?;
    registry.register(CreateInstanceTool::new(gateway.clone())).await?;
    registry.register(DeleteInstancesTool::new(gateway.clone())).await?;
    registry.register(ResumeInstancesTool::new(gateway.clone())).await?;
    registry.register(SuspendInstancesTool::new(gateway.clone())).await?;
    registry.register(TerminateInstancesTool::new(gateway)).await?;
    Ok(())
}

pub(crate) fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({"type": "object"}))
}

pub(crate) fn decode<T: DeserializeOwned>(input: Value) -> Result<T, ToolError> {
    // Clients may omit `arguments` entirely.
    let input = if input.is_null() { json!({}) } else { input };
    Ok(serde_json::from_value(input)?)
}

pub(crate) fn json_result<T: Serialize>(value: &T) -> Result<ToolResult, ToolError> {
    let value = serde_json::to_value(value).map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
    Ok(ToolResult::success_json(&value))
}

/// Structured body describing a gateway failure.
pub fn error_body(err: &GatewayError) -> Value {
    let mut body = Map::new();
    body.insert("kind".into(), json!(err.kind()));
    match err {
        GatewayError::InvalidArgument { argument, reason } => {
            body.insert("argument".into(), json!(argument));
            body.insert("reason".into(), json!(reason));
        }
        GatewayError::Upstream {
            operation,
            scope,
            resource,
            source,
        } => {
            body.insert("operation".into(), json!(operation));
            body.insert("scope".into(), json!(scope));
            if let Some(resource) = resource {
                body.insert("resource".into(), json!(resource));
            }
            if let Some(status) = source.status() {
                body.insert("status".into(), json!(status));
            }
        }
        GatewayError::PartialBatchFailure(report) => {
            body.insert("operation".into(), json!(report.operation));
            body.insert("scope".into(), json!(report.task_hub));
            body.insert("succeeded".into(), json!(report.succeeded));
            body.insert("cancelled".into(), json!(report.cancelled));
            body.insert(
                "failures".into(),
                serde_json::to_value(&report.failed).unwrap_or(Value::Null),
            );
        }
        GatewayError::Cancelled {
            operation,
            scope,
            report,
        } => {
            body.insert("operation".into(), json!(operation));
            body.insert("scope".into(), json!(scope));
            if let Some(report) = report {
                body.insert("succeeded".into(), json!(report.succeeded));
                body.insert("cancelled".into(), json!(report.cancelled));
            }
        }
    }
    body.insert("message".into(), json!(err.to_string()));
    Value::Object(body)
}

/// Convert a gateway failure into an error tool result.
///
/// Errors raised before the gateway knew its operation or scope are tagged
/// with the tool name and the task hub or subscription of the call.
pub fn error_result(tool: &str, scope: &str, err: &GatewayError) -> ToolResult {
    match err {
        GatewayError::InvalidArgument { .. } | GatewayError::Cancelled { .. } => {
            warn!("{} on '{}' rejected: {}", tool, scope, err);
        }
        _ => error!("{} on '{}' failed: {}", tool, scope, err),
    }
    let mut body = error_body(err);
    if let Value::Object(map) = &mut body {
        map.entry("operation").or_insert_with(|| json!(tool));
        map.entry("scope").or_insert_with(|| json!(scope));
    }
    ToolResult::error_json(&body)
}

/// Map a gateway result into a tool result.
pub(crate) fn respond<T: Serialize>(
    tool: &str,
    scope: &str,
    result: durabletask_gateway::Result<T>,
) -> Result<ToolResult, ToolError> {
    match result {
        Ok(value) => json_result(&value),
        Err(err) => Ok(error_result(tool, scope, &err)),
    }
}

/// Task hub or subscription named by raw call arguments.
pub(crate) fn scope_of(arguments: &Value) -> Option<&str> {
    ["taskHubName", "subscriptionId"]
        .iter()
        .find_map(|key| arguments.get(key).and_then(Value::as_str))
}
