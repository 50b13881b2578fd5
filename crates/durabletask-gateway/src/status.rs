//! Orchestration runtime status taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Runtime status of an orchestration instance.
///
/// This is a closed set. Engines may report values this crate does not know
/// about (newer service versions, custom backends); those map to
/// [`OrchestrationStatus::Unknown`] instead of failing the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Suspended,
    ContinuedAsNew,
    Canceled,
    Unknown,
}

impl OrchestrationStatus {
    /// Every status, in declaration order.
    pub const ALL: [OrchestrationStatus; 9] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Terminated,
        Self::Suspended,
        Self::ContinuedAsNew,
        Self::Canceled,
        Self::Unknown,
    ];

    /// Map an engine-reported status string onto the closed taxonomy.
    ///
    /// Accepts the PascalCase names (`Running`), any casing of them, the
    /// protobuf enum names used on the wire by the scheduler
    /// (`ORCHESTRATION_STATUS_RUNNING`), and snake/kebab variants
    /// (`continued_as_new`). Anything else is `Unknown`.
    pub fn from_engine(raw: &str) -> Self {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix("ORCHESTRATION_STATUS_")
            .or_else(|| trimmed.strip_prefix("orchestration_status_"))
            .unwrap_or(trimmed);

        let normalized: String = trimmed
            .chars()
            .filter(|c| *c != '_' && *c != '-' && *c != ' ')
            .flat_map(char::to_lowercase)
            .collect();

        match normalized.as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "terminated" => Self::Terminated,
            "suspended" => Self::Suspended,
            "continuedasnew" => Self::ContinuedAsNew,
            "canceled" | "cancelled" => Self::Canceled,
            _ => Self::Unknown,
        }
    }

    /// Map an optional engine status; an absent status is `Unknown`.
    pub fn from_engine_opt(raw: Option<&str>) -> Self {
        raw.map(Self::from_engine).unwrap_or(Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Terminated => "Terminated",
            Self::Suspended => "Suspended",
            Self::ContinuedAsNew => "ContinuedAsNew",
            Self::Canceled => "Canceled",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the instance has stopped and will not make further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Terminated | Self::Canceled
        )
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
