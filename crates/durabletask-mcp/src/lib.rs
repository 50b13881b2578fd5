//! # durabletask-mcp
//!
//! Model Context Protocol server for Durable Task Scheduler task hubs.
//!
//! Exposes the operations of [`durabletask_gateway::TaskHubGateway`] as MCP
//! tools over line-delimited JSON-RPC on stdio:
//!
//! - `ListSchedulers`
//! - `ListInstances`, `CreateInstance`
//! - `DeleteInstances`, `ResumeInstances`, `SuspendInstances`, `TerminateInstances`
//!
//! ```no_run
//! use durabletask_mcp::{ServerConfig, StdioTransport, app};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ServerConfig::load_with_env(None)?;
//! let gateway = app::build_gateway(&config)?;
//! let server = app::build_server(&config, gateway).await?;
//! server.serve(StdioTransport::stdio()).await?;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tool;
pub mod tools;
pub mod transport;

pub use config::{ConfigError, LogFormat, ServerConfig};
pub use error::{ToolError, TransportError};
pub use server::McpServer;
pub use tool::{Tool, ToolContext, ToolContent, ToolRegistry, ToolResult};
pub use transport::{LineTransport, MockTransport, StdioTransport, Transport};
