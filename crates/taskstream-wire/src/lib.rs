use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use taskstream_types::{Task, TaskStatus, Update, UpdateKind, WorkflowExecutionStatus};

pub const CHANNEL_TASKS: &str = "tasks";
pub const CHANNEL_SYSTEM: &str = "system";
pub const TOPIC_STATUS: &str = "status";
pub const TOPIC_UPDATE: &str = "update";

/// One push event. Serialized as a single JSON object per SSE `data:` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub channel: String,
    pub topic: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<bool>,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, topic: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            topic: topic.into(),
            data,
            sequence: None,
            timestamp: None,
            recovery: None,
        }
    }

    pub fn topic_for(kind: UpdateKind) -> &'static str {
        match kind {
            UpdateKind::Status => TOPIC_STATUS,
            UpdateKind::Message => TOPIC_UPDATE,
        }
    }

    /// Live envelope for a freshly appended log entry.
    pub fn from_update(update: &Update) -> Self {
        Self {
            channel: CHANNEL_TASKS.to_string(),
            topic: Self::topic_for(update.kind).to_string(),
            data: update.data.clone(),
            sequence: Some(update.sequence),
            timestamp: Some(update.timestamp),
            recovery: None,
        }
    }

    /// Backfilled envelope replayed from the durable log.
    pub fn replay_of(update: &Update) -> Self {
        Self {
            recovery: Some(true),
            ..Self::from_update(update)
        }
    }

    pub fn connected(connection_id: &str, timestamp: u64) -> Self {
        Self::new(
            CHANNEL_SYSTEM,
            "connected",
            json!({
                "type": "connected",
                "connectionId": connection_id,
                "timestamp": timestamp,
            }),
        )
    }

    pub fn is_task_event(&self) -> bool {
        self.channel == CHANNEL_TASKS
    }

    pub fn is_recovery(&self) -> bool {
        self.recovery.unwrap_or(false)
    }

    pub fn task_id(&self) -> Option<&str> {
        self.data.get("taskId").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub task: Task,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowResponse {
    pub workflow_id: String,
    pub message: String,
}

/// Workflow status as reported by the engine; `NOT_FOUND` when no instance exists.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowRunState {
    Running,
    Completed,
    Failed,
    Cancelled,
    Terminated,
    TimedOut,
    NotFound,
}

impl From<WorkflowExecutionStatus> for WorkflowRunState {
    fn from(status: WorkflowExecutionStatus) -> Self {
        match status {
            WorkflowExecutionStatus::Running => WorkflowRunState::Running,
            WorkflowExecutionStatus::Completed => WorkflowRunState::Completed,
            WorkflowExecutionStatus::Failed => WorkflowRunState::Failed,
            WorkflowExecutionStatus::Cancelled => WorkflowRunState::Cancelled,
            WorkflowExecutionStatus::Terminated => WorkflowRunState::Terminated,
            WorkflowExecutionStatus::TimedOut => WorkflowRunState::TimedOut,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatusResponse {
    pub status: WorkflowRunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryQuery {
    #[serde(default)]
    pub since_sequence: Option<u64>,
    #[serde(default)]
    pub since_timestamp: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesSinceResponse {
    pub success: bool,
    pub task_id: String,
    pub workflow_status: WorkflowExecutionStatus,
    pub updates: Vec<Update>,
    pub total_updates: usize,
    pub last_sequence: u64,
    pub current_status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecoveryRequest {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub last_sequence: u64,
    #[serde(default)]
    pub last_timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecoveryResponse {
    pub success: bool,
    pub task_id: String,
    pub recovered_updates: usize,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestSnapshotResponse {
    pub success: bool,
    pub task_id: String,
    pub workflow_status: WorkflowExecutionStatus,
    pub current_status: TaskStatus,
    pub all_updates: Vec<Update>,
    pub total_updates: usize,
    pub last_sequence: u64,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskstream_types::WorkflowState;

    #[test]
    fn live_envelope_omits_recovery_flag() {
        let mut state = WorkflowState::new("t1");
        let update = state.append(UpdateKind::Status, json!({"taskId": "t1", "status": "IN_PROGRESS"}));
        let value = serde_json::to_value(Envelope::from_update(&update)).expect("encode");
        assert_eq!(value["channel"], json!("tasks"));
        assert_eq!(value["topic"], json!("status"));
        assert_eq!(value["sequence"], json!(1));
        assert!(value.get("recovery").is_none());
    }

    #[test]
    fn replay_envelope_is_tagged() {
        let mut state = WorkflowState::new("t1");
        let update = state.append(UpdateKind::Message, json!({"taskId": "t1"}));
        let envelope = Envelope::replay_of(&update);
        assert!(envelope.is_recovery());
        assert_eq!(envelope.topic, TOPIC_UPDATE);
        assert_eq!(envelope.task_id(), Some("t1"));
    }

    #[test]
    fn trigger_request_defaults_missing_watermark_to_zero() {
        let req: TriggerRecoveryRequest =
            serde_json::from_value(json!({"connectionId": "c1"})).expect("decode");
        assert_eq!(req.last_sequence, 0);
        assert_eq!(req.last_timestamp, 0);
        assert_eq!(req.connection_id.as_deref(), Some("c1"));
    }

    #[test]
    fn run_state_serializes_not_found() {
        let value = serde_json::to_value(WorkflowRunState::NotFound).expect("encode");
        assert_eq!(value, json!("NOT_FOUND"));
    }
}
