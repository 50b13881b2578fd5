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
pub struct ListSchedulersInput {
    /// Azure subscription id to search.
    pub subscription_id: String,
}

/// Lists the schedulers of a subscription together with their task hubs.
pub struct ListSchedulersTool {
    gateway: Arc<TaskHubGateway>,
}

impl ListSchedulersTool {
    pub fn new(gateway: Arc<TaskHubGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Tool for ListSchedulersTool {
    fn name(&self) -> &str {
        "ListSchedulers"
    }

    fn description(&self) -> Option<&str> {
        Some("List Durable Task schedulers in a subscription, including the task hubs of each scheduler")
    }

    fn input_schema(&self) -> Value {
        schema_of::<ListSchedulersInput>()
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let input: ListSchedulersInput = decode(input)?;
        let result = self
            .gateway
            .list_schedulers(&input.subscription_id, context.cancellation())
            .await;
        respond(self.name(), &input.subscription_id, result)
    }
}
