//! Task envelopes delivered over a node's dispatch connection.

use chrono::{DateTime, Utc};
use fleet_id::TaskId;
use serde::{Deserialize, Serialize};

use crate::{EventError, ResourceKind, ResourceStatus};

/// The command a node is asked to carry out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Deploy,
    Start,
    Stop,
    Restart,
    Scale,
    Delete,
    Backup,
    Restore,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Scale => "scale",
            Self::Delete => "delete",
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }

    /// Priority a task of this type is issued with unless overridden.
    pub fn default_priority(&self) -> TaskPriority {
        match self {
            Self::Stop | Self::Delete => TaskPriority::High,
            Self::Backup => TaskPriority::Low,
            _ => TaskPriority::Normal,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "deploy" => Self::Deploy,
            "start" => Self::Start,
            "stop" => Self::Stop,
            "restart" => Self::Restart,
            "scale" => Self::Scale,
            "delete" => Self::Delete,
            "backup" => Self::Backup,
            "restore" => Self::Restore,
            other => {
                return Err(EventError::UnknownVariant {
                    kind: "task type",
                    value: other.to_string(),
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

/// A command frame for exactly one node.
///
/// Type-specific fields are flattened next to the envelope fields, so a
/// deploy frame reads `{"task_id": ..., "type": "deploy", ..., "image": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,

    #[serde(rename = "type")]
    pub task_type: TaskType,

    pub resource_kind: ResourceKind,

    /// Target application or database id, in its string form.
    pub resource_id: String,

    pub priority: TaskPriority,

    pub issued_at: DateTime<Utc>,

    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl TaskEnvelope {
    /// Creates an envelope with a fresh task id and no extra fields.
    pub fn new(task_type: TaskType, resource_kind: ResourceKind, resource_id: impl ToString) -> Self {
        Self {
            task_id: TaskId::new(),
            task_type,
            resource_kind,
            resource_id: resource_id.to_string(),
            priority: task_type.default_priority(),
            issued_at: Utc::now(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Merges a serializable struct into the type-specific fields.
    ///
    /// The payload must serialize to a JSON object and must not shadow an
    /// envelope field.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EventError> {
        let serde_json::Value::Object(map) = serde_json::to_value(payload)? else {
            return Err(EventError::InvalidPayload(
                "task payload must be a JSON object".to_string(),
            ));
        };

        for (key, value) in map {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                return Err(EventError::InvalidPayload(format!(
                    "task payload field '{key}' collides with the envelope"
                )));
            }
            self.fields.insert(key, value);
        }
        Ok(self)
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }
}

const RESERVED_FIELDS: &[&str] = &[
    "task_id",
    "type",
    "resource_kind",
    "resource_id",
    "priority",
    "issued_at",
];

/// Outcome a node reports for a task it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Running,
    Failed,
    Stopped,
}

impl ReportedStatus {
    pub fn resource_status(&self) -> ResourceStatus {
        match self {
            Self::Running => ResourceStatus::Running,
            Self::Failed => ResourceStatus::Failed,
            Self::Stopped => ResourceStatus::Stopped,
        }
    }
}

/// A frame a node writes back on its dispatch connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub status: ReportedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
