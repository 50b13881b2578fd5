//! Error types for the tool server.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while dispatching a tool call.
///
/// These surface as JSON-RPC errors. Failures of the underlying operation are
/// reported as tool results with `isError` set instead.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool already registered: {0}")]
    AlreadyRegistered(String),

    /// Arguments did not decode into the tool's input type.
    #[error("Invalid tool input: {0}")]
    InvalidInput(#[from] serde_json::Error),

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool execution timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised by a message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An incoming line was not valid JSON.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// An incoming line was JSON but not a JSON-RPC request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_display() {
        assert_eq!(ToolError::NotFound("Nope".into()).to_string(), "Tool not found: Nope");
        let decode = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        assert!(ToolError::from(decode).to_string().starts_with("Invalid tool input"));
        assert_eq!(
            ToolError::Timeout(Duration::from_secs(2)).to_string(),
            "Tool execution timed out after 2s"
        );
    }
}
