//! The persisted blueprint document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lcm_events::{BlueprintStatus, OperationStatus};
use lcm_id::{BlueprintId, ResourceId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::registry::ResourceRegistry;
use crate::actors::worker::WorkerMessageType;

/// One entry of the operation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub kind: WorkerMessageType,
    pub path: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OperationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything the engine persists about one blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintInstance {
    pub id: BlueprintId,
    pub blueprint_type: String,
    #[serde(default)]
    pub status: BlueprintStatus,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub resources: ResourceRegistry,

    /// Resource id to backend object id, for every backend object that may
    /// still exist.
    #[serde(default)]
    pub backend_ids: BTreeMap<ResourceId, String>,

    /// Payload of the DAY0 request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_snapshot: Option<Value>,

    #[serde(default)]
    pub operation_history: Vec<OperationRecord>,

    /// Path and payload of every DAY2 request that carried a payload.
    #[serde(default)]
    pub day2_call_history: Vec<Value>,

    /// Type-specific state of the blueprint.
    #[serde(default)]
    pub state: Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BlueprintInstance {
    pub fn new(id: BlueprintId, blueprint_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            blueprint_type: blueprint_type.into(),
            status: BlueprintStatus::idle(),
            protected: false,
            resources: ResourceRegistry::new(),
            backend_ids: BTreeMap::new(),
            config_snapshot: None,
            operation_history: Vec::new(),
            day2_call_history: Vec::new(),
            state: Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn begin_operation(&mut self, kind: WorkerMessageType, path: &str) {
        self.operation_history.push(OperationRecord {
            kind,
            path: path.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            detail: None,
        });
    }

    /// Close the most recent open history entry.
    pub fn end_operation(&mut self, outcome: OperationStatus, detail: Option<String>) {
        if let Some(record) = self
            .operation_history
            .iter_mut()
            .rev()
            .find(|r| r.ended_at.is_none())
        {
            record.ended_at = Some(Utc::now());
            record.outcome = Some(outcome);
            record.detail = detail;
        }
    }

    /// Compact or detailed view for listings.
    pub fn summary(&self, detailed: bool) -> Value {
        let mut summary = json!({
            "id": self.id,
            "type": self.blueprint_type,
            "status": self.status,
            "protected": self.protected,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
            "resource_count": self.resources.len(),
        });
        if detailed {
            summary["resources"] = json!(self.resources);
            summary["config"] = self.config_snapshot.clone().unwrap_or(Value::Null);
            summary["operations"] = json!(self.operation_history);
            summary["day2_calls"] = json!(self.day2_call_history);
            summary["state"] = self.state.clone();
        }
        summary
    }
}
