use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node identifiers are plain strings so operators can name nodes after
/// their placement ("supervisor", "office", "kitchen"). Ordering is the
/// lexical string order, which several tie-breaks rely on.
pub type NodeId = String;
pub type Term = u64;
pub type TaskId = Uuid;

/// Static description of a fleet member, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub url: String,
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Worker,
}

/// Observed liveness of a peer. Every node keeps its own classification;
/// there is no shared view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    Alive,
    Suspected,
    Dead,
}

/// Smoothed CPU load of a node, 0-100. `Unknown` means the reporter has
/// not produced a fresh sample recently enough to trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadEstimate {
    Known(u8),
    Unknown,
}

impl LoadEstimate {
    /// Sort key for placement decisions. Unknown ranks just past the
    /// worst known load so it is chosen only when nothing better exists.
    pub fn rank(&self) -> u16 {
        match self {
            LoadEstimate::Known(v) => *v as u16,
            LoadEstimate::Unknown => 101,
        }
    }

    pub fn as_percent(&self) -> Option<u8> {
        match self {
            LoadEstimate::Known(v) => Some(*v),
            LoadEstimate::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SensorManagement,
    Reasoning,
    UserInteraction,
    DigitalTwin,
    DeveloperOps,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::SensorManagement,
        TaskType::Reasoning,
        TaskType::UserInteraction,
        TaskType::DigitalTwin,
        TaskType::DeveloperOps,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::SensorManagement => "sensor_management",
            TaskType::Reasoning => "reasoning",
            TaskType::UserInteraction => "user_interaction",
            TaskType::DigitalTwin => "digital_twin",
            TaskType::DeveloperOps => "developer_ops",
        }
    }

    /// Model routed to when the operator has not overridden it.
    pub fn default_model(&self) -> &'static str {
        match self {
            TaskType::SensorManagement => "gpt-4o-mini",
            TaskType::Reasoning => "gpt-4-o1",
            TaskType::UserInteraction => "gpt-4o",
            TaskType::DigitalTwin => "gpt-4-dt",
            TaskType::DeveloperOps => "gpt-4-dev",
        }
    }

    /// Goal preamble prepended to the task payload when building the
    /// inference prompt.
    pub fn goal(&self) -> &'static str {
        match self {
            TaskType::SensorManagement => {
                "Clean, validate and summarize raw environmental sensor readings."
            }
            TaskType::Reasoning => {
                "Reason over home state and produce actionable recommendations."
            }
            TaskType::UserInteraction => {
                "Answer the resident's request in clear, concise language."
            }
            TaskType::DigitalTwin => {
                "Update the digital twin model of the home from the observed changes."
            }
            TaskType::DeveloperOps => {
                "Diagnose the reported operational issue and propose a fix."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Normal,
    High,
}

impl Default for Urgency {
    fn default() -> Self {
        Urgency::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub urgency: Urgency,
    /// Location tag a task is affine to, if any. Matching nodes are
    /// preferred during placement.
    pub location: Option<String>,
    pub status: TaskStatus,
    pub assigned_to: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub failure: Option<String>,
}

impl Task {
    pub fn new(
        task_type: TaskType,
        payload: serde_json::Value,
        urgency: Urgency,
        location: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            payload,
            urgency,
            location,
            status: TaskStatus::Pending,
            assigned_to: None,
            created_at: Utc::now(),
            completed_at: None,
            output: None,
            failure: None,
        }
    }
}

/// Terminal result of running one task, produced by the executor and
/// carried back to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(task_id: TaskId, output: String) -> Self {
        Self {
            task_id,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One environmental reading, either from the local sensor source or
/// ingested over the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
    pub air_quality: i32,
    pub timestamp: DateTime<Utc>,
}
