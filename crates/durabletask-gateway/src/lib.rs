//! # durabletask-gateway
//!
//! Control-plane client for Durable Task Scheduler task hubs.
//!
//! The crate does not run orchestrations. It lists, creates and manages
//! instances of a task hub through an engine client, and discovers schedulers
//! through the management API.
//!
//! ## Components
//!
//! - [`model`]: instance record model and the mapping from engine descriptors
//! - [`status`]: closed orchestration status taxonomy
//! - [`connection`]: task hub connection resolver and connection strings
//! - [`credential`]: credential providers (environment, Azure CLI, managed identity)
//! - [`engine`]: engine client trait with HTTP and in-memory implementations
//! - [`bulk`]: concurrent bulk dispatcher with per-id reporting
//! - [`enumerator`]: lazy paginated instance listing
//! - [`inventory`]: scheduler and task hub discovery
//! - [`gateway`]: the operation facade used by the tool server
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use durabletask_gateway::prelude::*;
//!
//! # async fn run() -> durabletask_gateway::Result<()> {
//! let http = reqwest::Client::new();
//! let credential = credential::from_mechanism(AuthMechanism::DefaultAzure, http.clone());
//! let resolver = ConnectionResolver::new(
//!     Arc::new(HttpEngineConnector::with_client(http.clone())),
//!     credential.clone(),
//! );
//! let inventory = Arc::new(ArmInventory::with_client(http, ArmOptions::default(), credential));
//! let gateway = TaskHubGateway::new(resolver, inventory, GatewayOptions::default());
//!
//! let cancel = CancellationToken::new();
//! for instance in gateway.list_instances("orders", "https://my-scheduler.durabletask.io", &cancel).await? {
//!     println!("{} {}", instance.instance_id, instance.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod connection;
pub mod credential;
pub mod engine;
pub mod enumerator;
pub mod error;
pub mod gateway;
pub mod inventory;
pub mod model;
pub mod status;

pub use error::{GatewayError, Operation, Result, UpstreamError};
pub use gateway::{GatewayOptions, TaskHubGateway, parse_json_input};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bulk::{BulkOperation, BulkOptions, BulkReport, InstanceFailure, apply_bulk};
    pub use crate::connection::{ClientHandle, ConnectionResolver, ConnectionString, EngineConnector};
    pub use crate::credential::{self, AuthMechanism, CredentialProvider};
    pub use crate::engine::{HttpEngineConnector, InMemoryConnector, InMemoryEngine, TaskHubEngine};
    pub use crate::enumerator::{InstanceStream, ListOptions, list_instances};
    pub use crate::error::{GatewayError, Operation, Result, UpstreamError};
    pub use crate::gateway::{GatewayOptions, TaskHubGateway};
    pub use crate::inventory::{ArmInventory, ArmOptions, InMemoryInventory, SchedulerInventory};
    pub use crate::model::{OrchestrationInstance, Scheduler, TaskHub};
    pub use crate::status::OrchestrationStatus;
    pub use tokio_util::sync::CancellationToken;
}
