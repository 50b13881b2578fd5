//! MCP server loop.
//!
//! Requests are read one at a time from the transport. `tools/call` runs on a
//! [`JoinSet`] so a slow call never blocks `ping`, `tools/list` or a
//! `notifications/cancelled` aimed at it. Every call gets its own
//! [`CancellationToken`]; the token fires on client cancellation or when the
//! per-call timeout elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ToolError, TransportError};
use crate::protocol::{
    CallToolParams, CancelledParams, Implementation, InitializeParams, InitializeResult, JSONRPC_VERSION,
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListToolsResult, PROTOCOL_VERSION, ServerCapabilities,
    ToolsCapability, methods, request_key,
};
use crate::tool::{Tool, ToolContext, ToolRegistry, ToolResult};
use crate::tools::scope_of;
use crate::transport::Transport;

#[derive(Default)]
struct Session {
    client: Option<Implementation>,
    in_flight: HashMap<String, CancellationToken>,
}

pub struct McpServer {
    info: Implementation,
    instructions: Option<String>,
    registry: ToolRegistry,
    tool_timeout: Option<Duration>,
    session_id: String,
    session: Arc<Mutex<Session>>,
}

enum CallOutcome {
    Finished(Result<ToolResult, ToolError>),
    TimedOut(Duration),
    CancelledByClient,
}

impl McpServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>, registry: ToolRegistry) -> Self {
        Self {
            info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            instructions: None,
            registry,
            tool_timeout: None,
            session_id: uuid::Uuid::new_v4().to_string(),
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Bound each tool call; `None` disables the limit.
    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Number of tool calls currently running.
    pub fn in_flight(&self) -> usize {
        self.session.lock().in_flight.len()
    }

    /// Serve until the transport reports end of input, then wait for running
    /// calls to deliver their responses.
    pub async fn serve<T: Transport>(&self, mut transport: T) -> Result<(), TransportError> {
        info!(
            "{} {} serving (session {})",
            self.info.name, self.info.version, self.session_id
        );
        let mut calls: JoinSet<Option<JsonRpcResponse>> = JoinSet::new();

        loop {
            tokio::select! {
                incoming = transport.recv() => {
                    let Some(incoming) = incoming else { break };
                    let response = match incoming {
                        Ok(request) => self.dispatch(request, &mut calls).await,
                        Err(err) => reject_message(err),
                    };
                    if let Some(response) = response {
                        transport.send(response).await?;
                    }
                }
                Some(joined) = calls.join_next(), if !calls.is_empty() => {
                    deliver(&mut transport, joined).await?;
                }
            }
        }

        debug!("Input closed with {} call(s) still running", calls.len());
        while let Some(joined) = calls.join_next().await {
            deliver(&mut transport, joined).await?;
        }
        transport.close().await?;
        info!("Session {} closed", self.session_id);
        Ok(())
    }

    async fn dispatch(
        &self,
        request: JsonRpcRequest,
        calls: &mut JoinSet<Option<JsonRpcResponse>>,
    ) -> Option<JsonRpcResponse> {
        let JsonRpcRequest {
            jsonrpc,
            id,
            method,
            params,
        } = request;

        if jsonrpc != JSONRPC_VERSION {
            return id.map(|id| {
                JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_request(format!("unsupported jsonrpc version '{jsonrpc}'")),
                )
            });
        }

        let Some(id) = id else {
            self.notify(&method, params);
            return None;
        };

        let response = match method.as_str() {
            methods::INITIALIZE => self.initialize(id, params),
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::TOOLS_LIST => {
                let result = ListToolsResult {
                    tools: self.registry.list().await,
                };
                success(id, &result)
            }
            methods::TOOLS_CALL => return self.start_call(id, params, calls).await,
            other => {
                debug!("Unknown method {}", other);
                JsonRpcResponse::error(id, JsonRpcError::method_not_found(other))
            }
        };
        Some(response)
    }

    fn notify(&self, method: &str, params: Option<Value>) {
        match method {
            methods::INITIALIZED => debug!("Client initialized"),
            methods::CANCELLED => self.cancel(params),
            other => debug!("Ignoring notification {}", other),
        }
    }

    fn initialize(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let params = match params.map(serde_json::from_value::<InitializeParams>).transpose() {
            Ok(params) => params.unwrap_or_default(),
            Err(e) => return JsonRpcResponse::error(id, JsonRpcError::invalid_params(e.to_string())),
        };
        if let Some(client) = &params.client_info {
            info!("Client connected: {} {}", client.name, client.version);
        }
        self.session.lock().client = params.client_info;

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability { list_changed: false },
            },
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        };
        success(id, &result)
    }

    fn cancel(&self, params: Option<Value>) {
        let params = match params.map(serde_json::from_value::<CancelledParams>) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                warn!("Malformed cancellation: {}", e);
                return;
            }
            None => {
                warn!("Cancellation without params");
                return;
            }
        };

        let key = request_key(&params.request_id);
        let token = self.session.lock().in_flight.remove(&key);
        match token {
            Some(token) => {
                info!(
                    "Cancelling request {} ({})",
                    key,
                    params.reason.as_deref().unwrap_or("no reason given")
                );
                token.cancel();
            }
            None => debug!("Cancellation for unknown or finished request {}", key),
        }
    }

    async fn start_call(
        &self,
        id: Value,
        params: Option<Value>,
        calls: &mut JoinSet<Option<JsonRpcResponse>>,
    ) -> Option<JsonRpcResponse> {
        let params = match params.map(serde_json::from_value::<CallToolParams>) {
            Some(Ok(params)) => params,
            Some(Err(e)) => return Some(JsonRpcResponse::error(id, JsonRpcError::invalid_params(e.to_string()))),
            None => return Some(JsonRpcResponse::error(id, JsonRpcError::invalid_params("missing params"))),
        };
        let Some(tool) = self.registry.get(&params.name).await else {
            warn!("Unknown tool {}", params.name);
            return Some(JsonRpcResponse::error(id, JsonRpcError::tool_not_found(&params.name)));
        };

        let key = request_key(&id);
        let token = CancellationToken::new();
        let client = {
            let mut session = self.session.lock();
            if session.in_flight.contains_key(&key) {
                drop(session);
                return Some(JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_request(format!("request id {key} is already in flight")),
                ));
            }
            session.in_flight.insert(key.clone(), token.clone());
            session.client.clone()
        };

        info!("tools/call {} (request {})", params.name, key);
        let context = ToolContext::new(id.clone(), self.session_id.clone())
            .with_client(client)
            .with_cancellation(token);
        let session = self.session.clone();
        let timeout = self.tool_timeout;
        let arguments = params.arguments.unwrap_or(Value::Null);
        let scope = scope_of(&arguments).map(str::to_string);

        calls.spawn(async move {
            let started = Instant::now();
            let outcome = run_tool(tool.as_ref(), arguments, &context, timeout).await;
            session.lock().in_flight.remove(&key);

            match outcome {
                CallOutcome::Finished(Ok(result)) => {
                    info!(
                        "{} finished in {:?}{}",
                        tool.name(),
                        started.elapsed(),
                        if result.is_error() { " with an error result" } else { "" }
                    );
                    Some(success(id, &result))
                }
                CallOutcome::Finished(Err(err)) => {
                    warn!("{} failed: {}", tool.name(), err);
                    Some(JsonRpcResponse::error(id, tool_error(&err)))
                }
                CallOutcome::TimedOut(limit) => {
                    warn!("{} timed out after {:?}", tool.name(), limit);
                    let mut body = json!({
                        "kind": "Timeout",
                        "operation": tool.name(),
                        "message": ToolError::Timeout(limit).to_string(),
                    });
                    if let Some(scope) = scope {
                        body["scope"] = json!(scope);
                    }
                    Some(success(id, &ToolResult::error_json(&body)))
                }
                CallOutcome::CancelledByClient => {
                    info!("{} cancelled by client after {:?}", tool.name(), started.elapsed());
                    None
                }
            }
        });
        None
    }
}

async fn run_tool(
    tool: &dyn Tool,
    arguments: Value,
    context: &ToolContext,
    timeout: Option<Duration>,
) -> CallOutcome {
    let call = tool.execute(arguments, context);
    tokio::pin!(call);

    let result = match timeout {
        None => call.await,
        Some(limit) => tokio::select! {
            result = &mut call => result,
            _ = tokio::time::sleep(limit) => {
                context.cancellation().cancel();
                // Tools return promptly once their token fires.
                let _ = call.await;
                return CallOutcome::TimedOut(limit);
            }
        },
    };

    if context.cancellation().is_cancelled() {
        CallOutcome::CancelledByClient
    } else {
        CallOutcome::Finished(result)
    }
}

async fn deliver<T: Transport>(
    transport: &mut T,
    joined: Result<Option<JsonRpcResponse>, JoinError>,
) -> Result<(), TransportError> {
    match joined {
        Ok(Some(response)) => transport.send(response).await,
        Ok(None) => Ok(()),
        Err(e) => {
            error!("Tool call task failed: {}", e);
            Ok(())
        }
    }
}

fn success<T: Serialize>(id: Value, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, JsonRpcError::internal_error(e.to_string())),
    }
}

fn tool_error(err: &ToolError) -> JsonRpcError {
    match err {
        ToolError::InvalidInput(e) => JsonRpcError::invalid_params(e.to_string()),
        ToolError::NotFound(name) => JsonRpcError::tool_not_found(name),
        other => JsonRpcError::internal_error(other.to_string()),
    }
}

fn reject_message(err: TransportError) -> Option<JsonRpcResponse> {
    match err {
        TransportError::InvalidMessage(details) => {
            warn!("Unparseable message: {}", details);
            Some(JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error(details)))
        }
        TransportError::InvalidRequest(details) => {
            warn!("Invalid request: {}", details);
            Some(JsonRpcResponse::error(Value::Null, JsonRpcError::invalid_request(details)))
        }
        other => {
            error!("Transport error: {}", other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes;
    use crate::transport::MockTransport;
    use async_trait::async_trait;

    /// Sleeps for the requested number of milliseconds unless cancelled.
    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "Sleepy"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
            let ms = input["ms"].as_u64().unwrap_or(0);
            tokio::select! {
                _ = context.cancellation().cancelled() => Ok(ToolResult::success_text("cancelled")),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ToolResult::success_text("slept")),
            }
        }
    }

    async fn server() -> McpServer {
        let registry = ToolRegistry::new();
        registry.register(Sleepy).await.unwrap();
        McpServer::new("test", "0.0.0", registry)
    }

    fn call(id: i64, ms: u64) -> JsonRpcRequest {
        JsonRpcRequest::new(
            Some(json!(id)),
            methods::TOOLS_CALL,
            Some(json!({"name": "Sleepy", "arguments": {"ms": ms}})),
        )
    }

    fn by_id(responses: &[JsonRpcResponse], id: i64) -> Option<&JsonRpcResponse> {
        responses.iter().find(|r| r.id == json!(id))
    }

    #[tokio::test]
    async fn test_initialize_and_ping() {
        let transport = MockTransport::new();
        transport.push_request(JsonRpcRequest::new(
            Some(json!(1)),
            methods::INITIALIZE,
            Some(json!({"protocolVersion": "2024-11-05", "clientInfo": {"name": "cli", "version": "1"}})),
        ));
        transport.push_request(JsonRpcRequest::notification(methods::INITIALIZED, None));
        transport.push_request(JsonRpcRequest::new(Some(json!(2)), methods::PING, None));

        server().await.serve(transport.clone()).await.unwrap();

        let responses = transport.responses();
        assert_eq!(responses.len(), 2);
        let init = responses[0].result.as_ref().unwrap();
        assert_eq!(init["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["serverInfo"]["name"], "test");
        assert_eq!(init["capabilities"]["tools"]["listChanged"], false);
        assert_eq!(responses[1].result, Some(json!({})));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let transport = MockTransport::new();
        transport.push_line("{not json");
        transport.push_request(JsonRpcRequest::new(Some(json!(1)), "resources/list", None));
        transport.push_request(JsonRpcRequest::new(
            Some(json!(2)),
            methods::TOOLS_CALL,
            Some(json!({"name": "Missing"})),
        ));
        transport.push_request(JsonRpcRequest::new(Some(json!(3)), methods::TOOLS_CALL, None));

        server().await.serve(transport.clone()).await.unwrap();

        let responses = transport.responses();
        let code = |i: usize| responses[i].error.as_ref().unwrap().code;
        assert_eq!(responses[0].id, Value::Null);
        assert_eq!(code(0), codes::PARSE_ERROR);
        assert_eq!(code(1), codes::METHOD_NOT_FOUND);
        assert_eq!(code(2), codes::TOOL_NOT_FOUND);
        assert_eq!(code(3), codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_running_calls_finish_after_input_closes() {
        let transport = MockTransport::new();
        transport.push_request(call(1, 20));
        transport.push_request(call(2, 0));

        let server = server().await;
        server.serve(transport.clone()).await.unwrap();

        let responses = transport.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(
            by_id(&responses, 1).unwrap().result.as_ref().unwrap()["content"][0]["text"],
            "slept"
        );
        assert_eq!(server.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_call_sends_no_response() {
        let transport = MockTransport::new();
        transport.push_request(call(7, 60_000));
        transport.push_request(JsonRpcRequest::notification(
            methods::CANCELLED,
            Some(json!({"requestId": 7, "reason": "user abort"})),
        ));
        transport.push_request(JsonRpcRequest::new(Some(json!(8)), methods::PING, None));

        let started = Instant::now();
        server().await.serve(transport.clone()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        let responses = transport.responses();
        assert!(by_id(&responses, 7).is_none());
        assert!(by_id(&responses, 8).is_some());
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_reports() {
        let transport = MockTransport::new();
        transport.push_request(call(1, 60_000));

        let server = server().await.with_tool_timeout(Some(Duration::from_millis(20)));
        server.serve(transport.clone()).await.unwrap();

        let responses = transport.responses();
        let result = responses[0].result.as_ref().unwrap();
        assert_eq!(result["isError"], true);
        let body: Value = serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(body["kind"], "Timeout");
    }

    #[tokio::test]
    async fn test_notification_with_wrong_version_is_ignored() {
        let transport = MockTransport::new();
        transport.push_line(r#"{"jsonrpc":"1.0","method":"ping"}"#);
        transport.push_line(r#"{"jsonrpc":"1.0","id":4,"method":"ping"}"#);

        server().await.serve(transport.clone()).await.unwrap();

        let responses = transport.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].error.as_ref().unwrap().code, codes::INVALID_REQUEST);
    }
}
