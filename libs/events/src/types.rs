//! Event types, blueprint status and the outcome schema returned to callers.

use std::str::FromStr;

use lcm_id::BlueprintId;
use serde::{Deserialize, Serialize};

use crate::EventError;

/// All event type names as constants.
pub mod event_types {
    pub const STARTED_DAY0: &str = "blueprint.started_day0";
    pub const CREATED: &str = "blueprint.created";
    pub const STARTED_DAY2: &str = "blueprint.started_day2";
    pub const END_DAY2: &str = "blueprint.end_day2";
    pub const ERROR: &str = "blueprint.error";
    pub const START_TEARDOWN: &str = "blueprint.start_teardown";
    pub const DELETED: &str = "blueprint.deleted";
}

/// Lifecycle event published on every phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlueprintEventType {
    StartedDay0,
    Created,
    StartedDay2,
    EndDay2,
    Error,
    StartTeardown,
    Deleted,
}

impl BlueprintEventType {
    /// Dotted wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartedDay0 => event_types::STARTED_DAY0,
            Self::Created => event_types::CREATED,
            Self::StartedDay2 => event_types::STARTED_DAY2,
            Self::EndDay2 => event_types::END_DAY2,
            Self::Error => event_types::ERROR,
            Self::StartTeardown => event_types::START_TEARDOWN,
            Self::Deleted => event_types::DELETED,
        }
    }
}

impl std::fmt::Display for BlueprintEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlueprintEventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            event_types::STARTED_DAY0 => Ok(Self::StartedDay0),
            event_types::CREATED => Ok(Self::Created),
            event_types::STARTED_DAY2 => Ok(Self::StartedDay2),
            event_types::END_DAY2 => Ok(Self::EndDay2),
            event_types::ERROR => Ok(Self::Error),
            event_types::START_TEARDOWN => Ok(Self::StartTeardown),
            event_types::DELETED => Ok(Self::Deleted),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// What a blueprint worker is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CurrentOperation {
    Deploying,
    RunningDay2,
    Destroying,
    #[default]
    Idle,
    Error,
}

impl std::fmt::Display for CurrentOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deploying => "DEPLOYING",
            Self::RunningDay2 => "RUNNING_DAY2",
            Self::Destroying => "DESTROYING",
            Self::Idle => "IDLE",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Blueprint status: the current operation plus optional detail text.
///
/// `error` stays set until the next successful transition replaces the
/// status, so a failed DAY2 is still visible after the queue drained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BlueprintStatus {
    pub current_operation: CurrentOperation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default)]
    pub error: bool,
}

impl BlueprintStatus {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn deploying(id: &BlueprintId) -> Self {
        Self {
            current_operation: CurrentOperation::Deploying,
            detail: Some(format!("Deploying blueprint {id}")),
            error: false,
        }
    }

    pub fn running_day2(id: &BlueprintId, path: &str) -> Self {
        Self {
            current_operation: CurrentOperation::RunningDay2,
            detail: Some(format!("Calling DAY2 function {path} on blueprint {id}")),
            error: false,
        }
    }

    pub fn destroying(id: &BlueprintId) -> Self {
        Self {
            current_operation: CurrentOperation::Destroying,
            detail: Some(format!("Destroying blueprint {id}")),
            error: false,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            current_operation: CurrentOperation::Error,
            detail: Some(detail.into()),
            error: true,
        }
    }

    /// Marks the current operation as failed without changing it.
    ///
    /// Used on the teardown path, where the status must stay `DESTROYING`.
    pub fn mark_error(&mut self, detail: impl Into<String>) {
        self.error = true;
        self.detail = Some(detail.into());
    }

    pub fn is_idle(&self) -> bool {
        self.current_operation == CurrentOperation::Idle
    }
}

// =============================================================================
// Operation outcome
// =============================================================================

/// Outcome of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationStatus {
    Ok,
    Error,
}

/// Result handed to the caller of an operation, and published alongside
/// the terminal event of that operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub instance_id: BlueprintId,

    /// Operation that finished (`DAY0`, the DAY2 path, the named operation
    /// or `STOP`).
    pub operation: String,

    pub status: OperationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl OperationOutcome {
    pub fn ok(
        instance_id: BlueprintId,
        operation: impl Into<String>,
        result: Option<serde_json::Value>,
    ) -> Self {
        Self {
            instance_id,
            operation: operation.into(),
            status: OperationStatus::Ok,
            detail: None,
            result,
        }
    }

    pub fn error(
        instance_id: BlueprintId,
        operation: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            operation: operation.into(),
            status: OperationStatus::Error,
            detail: Some(detail.into()),
            result: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OperationStatus::Ok
    }
}
