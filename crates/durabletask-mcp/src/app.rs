//! Wiring from configuration to a running server.

use std::sync::Arc;
use std::time::Duration;

use durabletask_gateway::credential::{self, AuthMechanism};
use durabletask_gateway::engine::HttpEngineConnector;
use durabletask_gateway::inventory::ArmInventory;
use durabletask_gateway::prelude::ConnectionResolver;
use durabletask_gateway::{TaskHubGateway, UpstreamError};

use crate::config::ServerConfig;
use crate::error::ToolError;
use crate::server::McpServer;
use crate::tool::ToolRegistry;
use crate::tools;

const INSTRUCTIONS: &str = "Manage Durable Task Scheduler orchestrations. Use ListSchedulers to discover \
schedulers and task hubs, then pass taskHubName and schedulerEndpoint to the instance tools.";

/// Gateway backed by the HTTP engine and the management API, authenticated
/// with the configured mechanism.
pub fn build_gateway(config: &ServerConfig) -> Result<TaskHubGateway, UpstreamError> {
    build_gateway_with(config, config.engine.authentication)
}

/// Same as [`build_gateway`] with an explicit authentication mechanism.
pub fn build_gateway_with(config: &ServerConfig, mechanism: AuthMechanism) -> Result<TaskHubGateway, UpstreamError> {
    let identity_http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.engine.request_timeout_secs))
        .build()?;
    let credential = credential::from_mechanism(mechanism, identity_http);

    let connector = HttpEngineConnector::new(&config.engine_options())?;
    let inventory = ArmInventory::new(config.arm_options(), credential.clone())?;
    let resolver = ConnectionResolver::new(Arc::new(connector), credential);

    Ok(TaskHubGateway::new(resolver, Arc::new(inventory), config.gateway_options()))
}

/// Tool server exposing every gateway operation.
pub async fn build_server(config: &ServerConfig, gateway: TaskHubGateway) -> Result<McpServer, ToolError> {
    let registry = ToolRegistry::new();
    tools::register_all(&registry, Arc::new(gateway)).await?;

    Ok(McpServer::new(&config.server.name, env!("CARGO_PKG_VERSION"), registry)
        .with_instructions(INSTRUCTIONS)
        .with_tool_timeout(config.tool_timeout()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_server_registers_every_tool() {
        let config = ServerConfig::default();
        let gateway = build_gateway_with(&config, AuthMechanism::None).unwrap();
        assert_eq!(gateway.resolver().authentication(), AuthMechanism::None);

        let server = build_server(&config, gateway).await.unwrap();
        assert_eq!(
            server.registry().names().await,
            vec![
                "CreateInstance",
                "DeleteInstances",
                "ListInstances",
                "ListSchedulers",
                "ResumeInstances",
                "SuspendInstances",
                "TerminateInstances",
            ]
        );
    }
}
