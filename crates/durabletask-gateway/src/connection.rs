//! Task hub connection resolution.
//!
//! A caller names a task hub and a scheduler endpoint; the resolver validates
//! both, renders the connection string, and asks an [`EngineConnector`] for a
//! fresh client. No network call happens here.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;
use url::Url;

use crate::credential::{AuthMechanism, CredentialProvider};
use crate::engine::TaskHubEngine;
use crate::error::{GatewayError, Result};
use crate::model::TaskHubRef;

/// `Endpoint=<url>;TaskHub=<name>;Authentication=<mechanism>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub endpoint: Url,
    pub task_hub: String,
    pub authentication: AuthMechanism,
}

impl ConnectionString {
    pub fn new(endpoint: Url, task_hub: impl Into<String>, authentication: AuthMechanism) -> Self {
        Self {
            endpoint,
            task_hub: task_hub.into(),
            authentication,
        }
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Endpoint={};TaskHub={};Authentication={}",
            self.endpoint.as_str().trim_end_matches('/'),
            self.task_hub,
            self.authentication
        )
    }
}

impl FromStr for ConnectionString {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut task_hub = None;
        let mut authentication = AuthMechanism::default();

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                GatewayError::invalid_argument(
                    "connectionString",
                    format!("segment '{part}' is not a key=value pair"),
                )
            })?;

            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(validate_endpoint(value.trim())?),
                "taskhub" => task_hub = Some(validate_task_hub_name(value)?),
                "authentication" => {
                    authentication = value
                        .parse()
                        .map_err(|e| GatewayError::invalid_argument("connectionString", e))?
                }
                other => debug!("Ignoring connection string key '{}'", other),
            }
        }

        Ok(Self {
            endpoint: endpoint.ok_or_else(|| {
                GatewayError::invalid_argument("connectionString", "missing Endpoint")
            })?,
            task_hub: task_hub.ok_or_else(|| {
                GatewayError::invalid_argument("connectionString", "missing TaskHub")
            })?,
            authentication,
        })
    }
}

/// Everything a connector needs to build a client for one task hub.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub task_hub: TaskHubRef,
    pub authentication: AuthMechanism,
    pub credential: Arc<dyn CredentialProvider>,
}

impl ConnectionDescriptor {
    pub fn connection_string(&self) -> ConnectionString {
        ConnectionString::new(
            self.task_hub.scheduler_endpoint.clone(),
            self.task_hub.name.clone(),
            self.authentication,
        )
    }
}

/// Factory for engine clients.
///
/// Implementations must not perform I/O in `connect`; connections are opened
/// lazily by the first engine call.
pub trait EngineConnector: Send + Sync {
    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn TaskHubEngine>>;
}

/// A client bound to one task hub. Cheap to clone.
#[derive(Clone)]
pub struct ClientHandle {
    task_hub: TaskHubRef,
    connection_string: ConnectionString,
    engine: Arc<dyn TaskHubEngine>,
}

impl ClientHandle {
    pub fn new(
        task_hub: TaskHubRef,
        connection_string: ConnectionString,
        engine: Arc<dyn TaskHubEngine>,
    ) -> Self {
        Self {
            task_hub,
            connection_string,
            engine,
        }
    }

    pub fn task_hub(&self) -> &TaskHubRef {
        &self.task_hub
    }

    pub fn task_hub_name(&self) -> &str {
        &self.task_hub.name
    }

    pub fn connection_string(&self) -> &ConnectionString {
        &self.connection_string
    }

    pub fn engine(&self) -> &Arc<dyn TaskHubEngine> {
        &self.engine
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("connection_string", &self.connection_string.to_string())
            .finish_non_exhaustive()
    }
}

/// Builds [`ClientHandle`]s from a task hub name and scheduler endpoint.
#[derive(Clone)]
pub struct ConnectionResolver {
    connector: Arc<dyn EngineConnector>,
    credential: Arc<dyn CredentialProvider>,
}

impl ConnectionResolver {
    pub fn new(connector: Arc<dyn EngineConnector>, credential: Arc<dyn CredentialProvider>) -> Self {
        Self {
            connector,
            credential,
        }
    }

    pub fn authentication(&self) -> AuthMechanism {
        self.credential.mechanism()
    }

    /// Validate the inputs and build an independent client handle.
    pub fn resolve(&self, task_hub_name: &str, scheduler_endpoint: &str) -> Result<ClientHandle> {
        let name = validate_task_hub_name(task_hub_name)?;
        let endpoint = validate_endpoint(scheduler_endpoint)?;
        self.resolve_ref(TaskHubRef {
            name,
            scheduler_endpoint: endpoint,
        })
    }

    /// Build a handle from a parsed connection string.
    ///
    /// The resolver's credential is used regardless of the string's
    /// `Authentication` value, which is informational.
    pub fn resolve_connection_string(&self, connection_string: &ConnectionString) -> Result<ClientHandle> {
        self.resolve_ref(TaskHubRef {
            name: connection_string.task_hub.clone(),
            scheduler_endpoint: connection_string.endpoint.clone(),
        })
    }

    fn resolve_ref(&self, task_hub: TaskHubRef) -> Result<ClientHandle> {
        let descriptor = ConnectionDescriptor {
            task_hub,
            authentication: self.credential.mechanism(),
            credential: self.credential.clone(),
        };
        let connection_string = descriptor.connection_string();
        debug!("Resolving task hub client: {}", connection_string);

        let engine = self.connector.connect(&descriptor)?;
        Ok(ClientHandle::new(descriptor.task_hub, connection_string, engine))
    }
}

impl fmt::Debug for ConnectionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionResolver")
            .field("authentication", &self.authentication())
            .finish_non_exhaustive()
    }
}

/// Task hub names are embedded in the connection string, so the separators
/// of that format are not allowed.
pub fn validate_task_hub_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(GatewayError::invalid_argument("taskHubName", "must not be empty"));
    }
    if name.contains(';') || name.contains('=') {
        return Err(GatewayError::invalid_argument(
            "taskHubName",
            format!("'{name}' must not contain ';' or '='"),
        ));
    }
    if is_dot_segment(name) {
        return Err(GatewayError::invalid_argument(
            "taskHubName",
            format!("'{name}' is not a valid task hub name"),
        ));
    }
    Ok(name.to_string())
}

/// `.` and `..` are removed by URL path normalization, so they can never
/// address a resource of their own.
pub fn is_dot_segment(segment: &str) -> bool {
    matches!(segment, "." | "..")
}

pub fn validate_endpoint(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::invalid_argument("schedulerEndpoint", "must not be empty"));
    }

    let url = Url::parse(trimmed).map_err(|e| {
        GatewayError::invalid_argument("schedulerEndpoint", format!("'{trimmed}' is not a valid URL: {e}"))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(GatewayError::invalid_argument(
            "schedulerEndpoint",
            format!("scheme '{}' is not http or https", url.scheme()),
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(GatewayError::invalid_argument("schedulerEndpoint", "URL has no host"));
    }
    if trimmed.contains(';') {
        return Err(GatewayError::invalid_argument(
            "schedulerEndpoint",
            "must not contain ';'",
        ));
    }

    Ok(url)
}
