use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::TaskStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Status,
    Message,
}

/// One immutable, sequenced fact in a task's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Update {
    pub id: String,
    pub sequence: u64,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub data: Value,
}

/// Engine-level execution status of an orchestrator instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Terminated,
    TimedOut,
}

impl WorkflowExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowExecutionStatus::Running => "RUNNING",
            WorkflowExecutionStatus::Completed => "COMPLETED",
            WorkflowExecutionStatus::Failed => "FAILED",
            WorkflowExecutionStatus::Cancelled => "CANCELLED",
            WorkflowExecutionStatus::Terminated => "TERMINATED",
            WorkflowExecutionStatus::TimedOut => "TIMED_OUT",
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, WorkflowExecutionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub task_id: String,
    pub status: TaskStatus,
    pub updates: Vec<Update>,
    pub last_sequence: u64,
    pub start_time: u64,
}

impl WorkflowState {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::InProgress,
            updates: Vec::new(),
            last_sequence: 0,
            start_time: crate::now_ms(),
        }
    }

    /// Starts a new run that continues the log of a closed one.
    pub fn continued_from(previous: &WorkflowState) -> Self {
        Self {
            task_id: previous.task_id.clone(),
            status: TaskStatus::InProgress,
            updates: previous.updates.clone(),
            last_sequence: previous.last_sequence,
            start_time: crate::now_ms(),
        }
    }

    pub fn append(&mut self, kind: UpdateKind, data: Value) -> Update {
        self.last_sequence += 1;
        let update = Update {
            id: uuid::Uuid::new_v4().to_string(),
            sequence: self.last_sequence,
            timestamp: crate::now_ms(),
            kind,
            data,
        };
        self.updates.push(update.clone());
        update
    }

    pub fn update_at(&self, sequence: u64) -> Option<&Update> {
        self.updates.iter().find(|u| u.sequence == sequence)
    }

    /// Tail of the log after a client watermark. Sequence wins over timestamp;
    /// both zero returns the whole log.
    pub fn updates_since(&self, since_sequence: u64, since_timestamp: u64) -> Vec<Update> {
        self.updates
            .iter()
            .filter(|update| {
                if since_sequence > 0 {
                    return update.sequence > since_sequence;
                }
                if since_timestamp > 0 {
                    return update.timestamp > since_timestamp;
                }
                true
            })
            .cloned()
            .collect()
    }
}

/// Highest position a client has applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub last_sequence: u64,
    pub last_timestamp: u64,
}

impl Watermark {
    pub fn advance(&mut self, sequence: Option<u64>, timestamp: Option<u64>) {
        if let Some(sequence) = sequence {
            self.last_sequence = self.last_sequence.max(sequence);
        }
        if let Some(timestamp) = timestamp {
            self.last_timestamp = self.last_timestamp.max(timestamp);
        }
    }

    pub fn is_zero(&self) -> bool {
        self.last_sequence == 0 && self.last_timestamp == 0
    }
}
