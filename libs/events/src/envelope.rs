//! Event envelope - the wrapper every published event travels in.

use chrono::{DateTime, Utc};
use lcm_id::{BlueprintId, Ulid};
use serde::{Deserialize, Serialize};

use crate::{BlueprintEventType, BlueprintStatus, EventError, OperationOutcome};

/// A lifecycle event for one blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueprintEvent {
    /// Unique, time-ordered event identifier.
    pub event_id: String,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The blueprint the event belongs to.
    pub blueprint_id: BlueprintId,

    /// Registered type of the blueprint (e.g. `vm_topology`).
    pub blueprint_type: String,

    /// The event type.
    pub event_type: BlueprintEventType,

    /// Status of the blueprint when the event was emitted.
    pub status: BlueprintStatus,

    /// Outcome of the operation, for terminal events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OperationOutcome>,
}

impl BlueprintEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        blueprint_id: BlueprintId,
        blueprint_type: impl Into<String>,
        event_type: BlueprintEventType,
        status: BlueprintStatus,
    ) -> Self {
        Self {
            event_id: format!("evt_{}", Ulid::new()),
            occurred_at: Utc::now(),
            blueprint_id,
            blueprint_type: blueprint_type.into(),
            event_type,
            status,
            outcome: None,
        }
    }

    /// Attaches the outcome of the finished operation.
    pub fn with_outcome(mut self, outcome: OperationOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Serializes the event for an external bus.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}
