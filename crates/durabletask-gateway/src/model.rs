//! Instance record model.
//!
//! Engine-native descriptors are mapped onto [`OrchestrationInstance`], the
//! immutable snapshot returned to callers. The mapping is total except for a
//! descriptor without an instance id, which yields [`MalformedInstance`].

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::status::OrchestrationStatus;

/// Instance metadata as reported by an orchestration engine.
///
/// Every field is optional on the wire; the record model decides what to make
/// of gaps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDescriptor {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub runtime_status: Option<String>,
    /// RFC 3339 string or epoch milliseconds.
    #[serde(default)]
    pub created_at: Option<Value>,
    #[serde(default)]
    pub last_updated_at: Option<Value>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub failure_details: Option<FailureDetailsDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetailsDescriptor {
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
}

/// Read-only snapshot of one orchestration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub name: String,
    pub status: OrchestrationStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub failure_details: Option<FailureDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetails {
    pub error_type: Option<String>,
    pub error_message: String,
    pub stack_trace: Option<String>,
}

/// A descriptor that could not be turned into an [`OrchestrationInstance`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed instance{}: {reason}", describe_id(.instance_id))]
pub struct MalformedInstance {
    pub instance_id: Option<String>,
    pub reason: String,
}

fn describe_id(instance_id: &Option<String>) -> String {
    instance_id
        .as_deref()
        .map(|id| format!(" '{id}'"))
        .unwrap_or_default()
}

impl MalformedInstance {
    pub fn new(instance_id: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            instance_id,
            reason: reason.into(),
        }
    }

    /// Build from an undecodable wire item, salvaging the id if present.
    pub fn from_raw(raw: &Value, reason: impl Into<String>) -> Self {
        let instance_id = raw
            .get("instanceId")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self::new(instance_id, reason)
    }
}

impl OrchestrationInstance {
    /// Map an engine descriptor onto the record model.
    ///
    /// With `fetch_payloads = false` input, output and failure details are left
    /// empty even when the engine sent them.
    pub fn from_descriptor(
        descriptor: InstanceDescriptor,
        fetch_payloads: bool,
    ) -> Result<Self, MalformedInstance> {
        let instance_id = match descriptor.instance_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                return Err(MalformedInstance::new(
                    None,
                    "descriptor has no instanceId",
                ));
            }
        };

        let (input, output, failure_details) = if fetch_payloads {
            (
                descriptor.input,
                descriptor.output,
                descriptor.failure_details.map(FailureDetails::from),
            )
        } else {
            (None, None, None)
        };

        Ok(Self {
            instance_id,
            name: descriptor.name.unwrap_or_default(),
            status: OrchestrationStatus::from_engine_opt(descriptor.runtime_status.as_deref()),
            created_at: descriptor.created_at.as_ref().and_then(parse_timestamp),
            last_updated_at: descriptor.last_updated_at.as_ref().and_then(parse_timestamp),
            input,
            output,
            failure_details,
        })
    }
}

impl From<FailureDetailsDescriptor> for FailureDetails {
    fn from(raw: FailureDetailsDescriptor) -> Self {
        Self {
            error_type: raw.error_type,
            error_message: raw.error_message.unwrap_or_default(),
            stack_trace: raw.stack_trace,
        }
    }
}

/// Accepts RFC 3339 strings and epoch milliseconds; anything else is `None`.
pub(crate) fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Lookup key for a task hub. Not a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHubRef {
    pub name: String,
    pub scheduler_endpoint: Url,
}

/// A scheduler resource together with its task hubs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduler {
    pub endpoint: String,
    pub name: String,
    pub resource_group_name: String,
    pub subscription_id: String,
    pub task_hubs: Vec<TaskHub>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHub {
    pub name: String,
    pub dashboard_endpoint: Option<String>,
}

/// Result of scheduling a new orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedInstance {
    pub instance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(value: Value) -> InstanceDescriptor {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_full_descriptor_maps_every_field() {
        let desc = descriptor(json!({
            "instanceId": "order-1",
            "name": "ProcessOrder",
            "runtimeStatus": "Failed",
            "createdAt": "2024-05-01T10:00:00Z",
            "lastUpdatedAt": 1714557600000i64,
            "input": {"orderId": 1},
            "output": null,
            "failureDetails": {
                "errorType": "InvalidOperationException",
                "errorMessage": "out of stock"
            }
        }));

        let instance = OrchestrationInstance::from_descriptor(desc, true).unwrap();
        assert_eq!(instance.instance_id, "order-1");
        assert_eq!(instance.name, "ProcessOrder");
        assert_eq!(instance.status, OrchestrationStatus::Failed);
        assert_eq!(
            instance.created_at.unwrap().to_rfc3339(),
            "2024-05-01T10:00:00+00:00"
        );
        assert_eq!(instance.last_updated_at.unwrap().timestamp_millis(), 1714557600000);
        assert_eq!(instance.input, Some(json!({"orderId": 1})));

        let failure = instance.failure_details.unwrap();
        assert_eq!(failure.error_message, "out of stock");
        assert_eq!(failure.error_type.as_deref(), Some("InvalidOperationException"));
        assert!(failure.stack_trace.is_none());
    }

    #[test]
    fn test_missing_failure_details_is_none() {
        let desc = descriptor(json!({"instanceId": "a", "runtimeStatus": "Completed"}));
        let instance = OrchestrationInstance::from_descriptor(desc, true).unwrap();
        assert!(instance.failure_details.is_none());
        assert_eq!(instance.name, "");
    }

    #[test]
    fn test_unknown_status_and_bad_timestamps_do_not_fail() {
        let desc = descriptor(json!({
            "instanceId": "a",
            "runtimeStatus": "Hibernating",
            "createdAt": "yesterday",
            "lastUpdatedAt": true
        }));
        let instance = OrchestrationInstance::from_descriptor(desc, true).unwrap();
        assert_eq!(instance.status, OrchestrationStatus::Unknown);
        assert!(instance.created_at.is_none());
        assert!(instance.last_updated_at.is_none());
    }

    #[test]
    fn test_payloads_dropped_when_not_fetched() {
        let desc = descriptor(json!({
            "instanceId": "a",
            "input": "x",
            "output": 1,
            "failureDetails": {"errorMessage": "boom"}
        }));
        let instance = OrchestrationInstance::from_descriptor(desc, false).unwrap();
        assert!(instance.input.is_none());
        assert!(instance.output.is_none());
        assert!(instance.failure_details.is_none());
    }

    #[test]
    fn test_missing_or_blank_instance_id_is_malformed() {
        let err = OrchestrationInstance::from_descriptor(InstanceDescriptor::default(), true)
            .unwrap_err();
        assert!(err.instance_id.is_none());

        let blank = descriptor(json!({"instanceId": "  "}));
        assert!(OrchestrationInstance::from_descriptor(blank, true).is_err());
    }

    #[test]
    fn test_malformed_from_raw_salvages_id() {
        let err = MalformedInstance::from_raw(&json!({"instanceId": "x", "name": 5}), "bad name");
        assert_eq!(err.instance_id.as_deref(), Some("x"));
        assert_eq!(err.to_string(), "Malformed instance 'x': bad name");
    }

    #[test]
    fn test_instance_serializes_camel_case() {
        let desc = descriptor(json!({"instanceId": "a", "runtimeStatus": "Running"}));
        let instance = OrchestrationInstance::from_descriptor(desc, true).unwrap();
        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["instanceId"], "a");
        assert_eq!(json["status"], "Running");
        assert!(json.get("failureDetails").is_some());
    }
}
