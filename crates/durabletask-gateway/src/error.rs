//! Error types for the task hub gateway.
//!
//! # Error Hierarchy
//!
//! ```text
//! GatewayError (returned by every public operation)
//! ├── InvalidArgument      rejected before any network call
//! ├── Upstream             an engine / management / credential call failed
//! │   └── UpstreamError    what the collaborator reported
//! ├── PartialBatchFailure  some ids of a bulk operation failed (BulkReport)
//! └── Cancelled            the caller's cancellation token fired
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::bulk::BulkReport;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// The logical operation a failure belongs to.
///
/// Displayed with the same names the tool surface uses, so an error read from a
/// log line can be matched to the call that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operation {
    ListSchedulers,
    ListInstances,
    CreateInstance,
    DeleteInstances,
    ResumeInstances,
    SuspendInstances,
    TerminateInstances,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ListSchedulers => "ListSchedulers",
            Self::ListInstances => "ListInstances",
            Self::CreateInstance => "CreateInstance",
            Self::DeleteInstances => "DeleteInstances",
            Self::ResumeInstances => "ResumeInstances",
            Self::SuspendInstances => "SuspendInstances",
            Self::TerminateInstances => "TerminateInstances",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A caller-supplied argument was rejected. No network call was made.
    #[error("Invalid argument `{argument}`: {reason}")]
    InvalidArgument {
        argument: &'static str,
        reason: String,
    },

    /// A collaborator call failed.
    ///
    /// `scope` is the task hub name or subscription id the operation ran against;
    /// `resource` is the instance id or scheduler name, when the failure is
    /// attributable to one.
    #[error("{operation} failed on '{scope}'{}: {source}", describe_resource(.resource))]
    Upstream {
        operation: Operation,
        scope: String,
        resource: Option<String>,
        #[source]
        source: UpstreamError,
    },

    /// At least one id of a bulk operation failed.
    #[error("{0}")]
    PartialBatchFailure(BulkReport),

    /// The cancellation token fired before the operation finished.
    ///
    /// A bulk operation cancelled partway carries its report, so the ids
    /// already applied are known.
    #[error("{operation} on '{scope}' was cancelled{}", describe_progress(.report))]
    Cancelled {
        operation: Operation,
        scope: String,
        report: Option<BulkReport>,
    },
}

fn describe_progress(report: &Option<BulkReport>) -> String {
    report
        .as_ref()
        .map(|r| format!(" after {} of {} instance(s)", r.succeeded.len(), r.total()))
        .unwrap_or_default()
}

fn describe_resource(resource: &Option<String>) -> String {
    resource
        .as_deref()
        .map(|r| format!(" for '{r}'"))
        .unwrap_or_default()
}

impl GatewayError {
    /// Create a new invalid argument error
    pub fn invalid_argument(argument: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument,
            reason: reason.into(),
        }
    }

    /// Create a new upstream error
    pub fn upstream(
        operation: Operation,
        scope: impl Into<String>,
        resource: Option<String>,
        source: UpstreamError,
    ) -> Self {
        Self::Upstream {
            operation,
            scope: scope.into(),
            resource,
            source,
        }
    }

    /// Create a new cancellation error
    pub fn cancelled(operation: Operation, scope: impl Into<String>) -> Self {
        Self::Cancelled {
            operation,
            scope: scope.into(),
            report: None,
        }
    }

    /// Cancellation of a bulk operation that had already dispatched some ids.
    pub fn cancelled_batch(report: BulkReport) -> Self {
        Self::Cancelled {
            operation: report.operation,
            scope: report.task_hub.clone(),
            report: Some(report),
        }
    }

    /// Stable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::Upstream { .. } => "UpstreamFailure",
            Self::PartialBatchFailure(_) => "PartialBatchFailure",
            Self::Cancelled { .. } => "Cancelled",
        }
    }

    /// Check if this is an invalid argument error
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    /// Check if this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The bulk report carried by a partial batch failure or a cancelled batch.
    pub fn batch_report(&self) -> Option<&BulkReport> {
        match self {
            Self::PartialBatchFailure(report) => Some(report),
            Self::Cancelled { report, .. } => report.as_ref(),
            _ => None,
        }
    }
}

/// Failure reported by an external collaborator (orchestration engine,
/// management API, or credential provider).
///
/// Collaborators return this without any notion of which gateway operation is
/// running; the gateway attaches that context when wrapping it in
/// [`GatewayError::Upstream`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// Network communication error
    #[error("Network error: {0}")]
    Transport(String),

    /// Request timeout
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Service could not be reached
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The addressed instance or resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Response body could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Authentication material could not be obtained
    #[error("Credential unavailable: {0}")]
    Credential(String),

    /// The engine refused the request (e.g. invalid state transition)
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl UpstreamError {
    /// HTTP status code, when the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err.to_string())
        } else if err.is_connect() {
            UpstreamError::Unavailable(err.to_string())
        } else if err.is_decode() {
            UpstreamError::InvalidResponse(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_display_includes_operation_scope_and_resource() {
        let err = GatewayError::upstream(
            Operation::TerminateInstances,
            "orders",
            Some("order-7".to_string()),
            UpstreamError::Status {
                status: 500,
                message: "boom".to_string(),
            },
        );

        let text = err.to_string();
        assert!(text.contains("TerminateInstances"));
        assert!(text.contains("'orders'"));
        assert!(text.contains("'order-7'"));
        assert!(text.contains("HTTP 500: boom"));
        assert_eq!(err.kind(), "UpstreamFailure");
    }

    #[test]
    fn test_upstream_display_without_resource() {
        let err = GatewayError::upstream(
            Operation::ListInstances,
            "orders",
            None,
            UpstreamError::Timeout("30s".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "ListInstances failed on 'orders': Request timeout: 30s"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            GatewayError::invalid_argument("taskHubName", "empty").kind(),
            "InvalidArgument"
        );
        let cancelled = GatewayError::cancelled(Operation::ListSchedulers, "sub-1");
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.kind(), "Cancelled");
        assert!(cancelled.batch_report().is_none());
    }

    #[test]
    fn test_upstream_status_code() {
        assert_eq!(UpstreamError::NotFound("x".into()).status(), Some(404));
        assert_eq!(
            UpstreamError::Status {
                status: 409,
                message: String::new()
            }
            .status(),
            Some(409)
        );
        assert_eq!(UpstreamError::Rejected("x".into()).status(), None);
    }
}
