//! Task hub tools: listing, creating and managing orchestration instances.

use std::sync::Arc;

use async_trait::async_trait;
use durabletask_gateway::TaskHubGateway;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{decode, respond, schema_of};
use crate::error::ToolError;
use crate::tool::{Tool, ToolContext, ToolResult};

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskHubInput {
    /// Name of the task hub.
    pub task_hub_name: String,
    /// Scheduler endpoint URL, e.g. `https://my-scheduler.westus2.durabletask.io`.
    pub scheduler_endpoint: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceInput {
    pub task_hub_name: String,
    pub scheduler_endpoint: String,
    /// Registered orchestrator name.
    pub orchestration_name: String,
    /// Orchestration input as JSON text, e.g. `42` or `{"orderId": "A-1"}`.
    #[serde(default)]
    pub input: Option<String>,
    /// Instance id to use instead of a generated one.
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstancesInput {
    pub task_hub_name: String,
    pub scheduler_endpoint: String,
    /// Instance ids to act on.
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlInstancesInput {
    pub task_hub_name: String,
    pub scheduler_endpoint: String,
    /// Instance ids to act on.
    pub instance_ids: Vec<String>,
    /// Reason recorded with the state change.
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct ListInstancesTool {
    gateway: Arc<TaskHubGateway>,
}

impl ListInstancesTool {
    pub fn new(gateway: Arc<TaskHubGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Tool for ListInstancesTool {
    fn name(&self) -> &str {
        "ListInstances"
    }

    fn description(&self) -> Option<&str> {
        Some("List all orchestration instances of a task hub, including inputs and outputs")
    }

    fn input_schema(&self) -> Value {
        schema_of::<TaskHubInput>()
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let input: TaskHubInput = decode(input)?;
        let result = self
            .gateway
            .list_instances(&input.task_hub_name, &input.scheduler_endpoint, context.cancellation())
            .await;
        respond(self.name(), &input.task_hub_name, result)
    }
}

pub struct CreateInstanceTool {
    gateway: Arc<TaskHubGateway>,
}

impl CreateInstanceTool {
    pub fn new(gateway: Arc<TaskHubGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Tool for CreateInstanceTool {
    fn name(&self) -> &str {
        "CreateInstance"
    }

    fn description(&self) -> Option<&str> {
        Some("Schedule a new orchestration instance and return its instance id")
    }

    fn input_schema(&self) -> Value {
        schema_of::<CreateInstanceInput>()
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let input: CreateInstanceInput = decode(input)?;
        let result = self
            .gateway
            .create_instance(
                &input.task_hub_name,
                &input.scheduler_endpoint,
                &input.orchestration_name,
                input.input.as_deref(),
                input.instance_id.as_deref(),
                context.cancellation(),
            )
            .await;
        respond(self.name(), &input.task_hub_name, result)
    }
}

pub struct DeleteInstancesTool {
    gateway: Arc<TaskHubGateway>,
}

impl DeleteInstancesTool {
    pub fn new(gateway: Arc<TaskHubGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Tool for DeleteInstancesTool {
    fn name(&self) -> &str {
        "DeleteInstances"
    }

    fn description(&self) -> Option<&str> {
        Some("Purge orchestration instances and their history from a task hub")
    }

    fn input_schema(&self) -> Value {
        schema_of::<InstancesInput>()
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let input: InstancesInput = decode(input)?;
        let result = self
            .gateway
            .delete_instances(
                &input.task_hub_name,
                &input.scheduler_endpoint,
                &input.instance_ids,
                context.cancellation(),
            )
            .await;
        respond(self.name(), &input.task_hub_name, result)
    }
}

/// State-change tools that accept an optional reason.
macro_rules! impl_control_tool {
    ($tool:ident, $name:literal, $description:literal, $method:ident) => {
        pub struct $tool {
            gateway: Arc<TaskHubGateway>,
        }

        impl $tool {
            pub fn new(gateway: Arc<TaskHubGateway>) -> Self {
                Self { gateway }
            }
        }

        #[async_trait]
        impl Tool for $tool {
            fn name(&self) -> &str {
                $name
            }

            fn description(&self) -> Option<&str> {
                Some($description)
            }

            fn input_schema(&self) -> Value {
                schema_of::<ControlInstancesInput>()
            }

            async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
                let input: ControlInstancesInput = decode(input)?;
                let result = self
                    .gateway
                    .$method(
                        &input.task_hub_name,
                        &input.scheduler_endpoint,
                        &input.instance_ids,
                        input.reason.as_deref(),
                        context.cancellation(),
                    )
                    .await;
                respond(self.name(), &input.task_hub_name, result)
            }
        }
    };
}

impl_control_tool!(
    ResumeInstancesTool,
    "ResumeInstances",
    "Resume suspended orchestration instances",
    resume_instances
);
impl_control_tool!(
    SuspendInstancesTool,
    "SuspendInstances",
    "Suspend running orchestration instances",
    suspend_instances
);
impl_control_tool!(
    TerminateInstancesTool,
    "TerminateInstances",
    "Terminate orchestration instances",
    terminate_instances
);

#[cfg(test)]
mod tests {
    use super::*;
    use durabletask_gateway::credential::AnonymousCredential;
    use durabletask_gateway::prelude::*;
    use serde_json::json;

    const ENDPOINT: &str = "http://localhost:8080";

    fn gateway(connector: InMemoryConnector) -> Arc<TaskHubGateway> {
        let resolver = ConnectionResolver::new(Arc::new(connector), Arc::new(AnonymousCredential));
        Arc::new(TaskHubGateway::new(
            resolver,
            Arc::new(InMemoryInventory::new()),
            GatewayOptions::default(),
        ))
    }

    fn parse(result: &ToolResult) -> Value {
        serde_json::from_str(result.text().unwrap()).unwrap()
    }

    #[test]
    fn test_control_schema_marks_reason_optional() {
        let schema = TerminateInstancesTool::new(gateway(InMemoryConnector::new())).input_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(required.contains(&"instanceIds"));
        assert!(!required.contains(&"reason"));
        assert!(schema["properties"]["reason"].is_object());
    }

    #[tokio::test]
    async fn test_create_then_list() {
        let connector = InMemoryConnector::new();
        let gw = gateway(connector);
        let ctx = ToolContext::new(json!(1), "s");

        let created = CreateInstanceTool::new(gw.clone())
            .execute(
                json!({
                    "taskHubName": "orders",
                    "schedulerEndpoint": ENDPOINT,
                    "orchestrationName": "ProcessOrder",
                    "input": "{\"sku\":\"A-1\"}",
                    "instanceId": "order-1"
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(parse(&created), json!({"instanceId": "order-1"}));

        let listed = ListInstancesTool::new(gw)
            .execute(json!({"taskHubName": "orders", "schedulerEndpoint": ENDPOINT}), &ctx)
            .await
            .unwrap();
        let instances = parse(&listed);
        assert_eq!(instances[0]["instanceId"], "order-1");
        assert_eq!(instances[0]["input"], json!({"sku": "A-1"}));
        assert_eq!(instances[0]["status"], "Pending");
    }

    #[tokio::test]
    async fn test_invalid_json_input_is_error_result() {
        let ctx = ToolContext::new(json!(1), "s");
        let result = CreateInstanceTool::new(gateway(InMemoryConnector::new()))
            .execute(
                json!({
                    "taskHubName": "orders",
                    "schedulerEndpoint": ENDPOINT,
                    "orchestrationName": "ProcessOrder",
                    "input": "{bad json"
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(result.is_error());
        let body = parse(&result);
        assert_eq!(body["kind"], "InvalidArgument");
        assert_eq!(body["argument"], "input");
    }

    #[tokio::test]
    async fn test_suspend_reports_each_id() {
        let engine = InMemoryEngine::new()
            .with_instance("a", "Flow", OrchestrationStatus::Running)
            .with_instance("b", "Flow", OrchestrationStatus::Completed);
        let gw = gateway(InMemoryConnector::new().with_engine("hub", engine));
        let ctx = ToolContext::new(json!(1), "s");

        let result = SuspendInstancesTool::new(gw)
            .execute(
                json!({
                    "taskHubName": "hub",
                    "schedulerEndpoint": ENDPOINT,
                    "instanceIds": ["a", "b"],
                    "reason": "maintenance"
                }),
                &ctx,
            )
            .await
            .unwrap();

        assert!(result.is_error());
        let body = parse(&result);
        assert_eq!(body["kind"], "PartialBatchFailure");
        assert_eq!(body["operation"], "SuspendInstances");
        assert_eq!(body["succeeded"], json!(["a"]));
        assert_eq!(body["failures"][0]["instanceId"], "b");
    }

    #[tokio::test]
    async fn test_delete_success_returns_report() {
        let engine = InMemoryEngine::new().with_instance("a", "Flow", OrchestrationStatus::Completed);
        let gw = gateway(InMemoryConnector::new().with_engine("hub", engine));
        let ctx = ToolContext::new(json!(1), "s");

        let result = DeleteInstancesTool::new(gw)
            .execute(
                json!({"taskHubName": "hub", "schedulerEndpoint": ENDPOINT, "instanceIds": ["a"]}),
                &ctx,
            )
            .await
            .unwrap();

        assert!(!result.is_error());
        let report = parse(&result);
        assert_eq!(report["succeeded"], json!(["a"]));
        assert_eq!(report["taskHub"], "hub");
        assert_eq!(report["failed"], json!([]));
    }
}
