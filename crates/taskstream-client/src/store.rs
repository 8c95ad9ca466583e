use std::collections::HashMap;

use serde_json::{json, Value};
use taskstream_types::{now_ms, ChatMessage, MessageRole, Task, TaskStatus, Watermark};
use taskstream_wire::{Envelope, WorkflowRunState, TOPIC_STATUS, TOPIC_UPDATE};

/// Partial task mutation. `status_message: Some(None)` clears the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub status_message: Option<Option<String>>,
    pub session_id: Option<String>,
    pub has_changes: Option<bool>,
    pub messages: Vec<ChatMessage>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn status_message(message: impl Into<String>) -> Self {
        Self {
            status_message: Some(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn message(message: ChatMessage) -> Self {
        Self {
            messages: vec![message],
            ..Self::default()
        }
    }
}

/// Client-side task state and the sequence gate in front of it.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: HashMap<String, Task>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Task> {
        self.tasks.remove(task_id)
    }

    pub fn watermark(&self, task_id: &str) -> Watermark {
        self.tasks
            .get(task_id)
            .map(|task| Watermark {
                last_sequence: task.last_sequence.unwrap_or(0),
                last_timestamp: task.last_timestamp.unwrap_or(0),
            })
            .unwrap_or_default()
    }

    /// Applies a sequenced patch unless it is at or below the task's watermark.
    pub fn apply_with_sequence(
        &mut self,
        task_id: &str,
        patch: TaskPatch,
        sequence: Option<u64>,
        timestamp: Option<u64>,
    ) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if let (Some(sequence), Some(watermark)) = (sequence, task.last_sequence) {
            if sequence <= watermark {
                return false;
            }
        }
        merge(task, patch);
        if let Some(sequence) = sequence {
            task.last_sequence = Some(sequence);
        }
        if let Some(timestamp) = timestamp {
            task.last_timestamp = Some(task.last_timestamp.unwrap_or(0).max(timestamp));
        }
        true
    }

    /// Ungated path for local and structural changes. Messages are keyed, so
    /// duplicates and reordering converge.
    pub fn apply(&mut self, task_id: &str, patch: TaskPatch) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        merge(task, patch);
        true
    }

    /// Routes one push envelope into the store. Returns whether anything changed.
    pub fn apply_envelope(&mut self, envelope: &Envelope) -> bool {
        if !envelope.is_task_event() {
            return false;
        }
        let Some(task_id) = envelope.task_id().map(str::to_string) else {
            return false;
        };
        if !self.tasks.contains_key(&task_id) {
            return false;
        }
        let (sequence, timestamp) = (envelope.sequence, envelope.timestamp);

        match envelope.topic.as_str() {
            TOPIC_STATUS => {
                let data = &envelope.data;
                let patch = TaskPatch {
                    status: data
                        .get("status")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok()),
                    status_message: Some(None),
                    session_id: data
                        .get("sessionId")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    has_changes: Some(true),
                    messages: Vec::new(),
                };
                self.apply_with_sequence(&task_id, patch, sequence, timestamp)
            }
            TOPIC_UPDATE => {
                let Some(message) = envelope.data.get("message") else {
                    return false;
                };
                let kind = message.get("type").and_then(|v| v.as_str()).unwrap_or("text");
                match kind {
                    "local_shell_call" => {
                        let command = message
                            .pointer("/action/command")
                            .and_then(|v| v.as_array())
                            .map(|parts| {
                                parts
                                    .iter()
                                    .filter_map(|p| p.as_str())
                                    .collect::<Vec<_>>()
                                    .join(" ")
                            })
                            .unwrap_or_default();
                        let gated = self.apply_with_sequence(
                            &task_id,
                            TaskPatch::status_message(format!("Running command {command}")),
                            sequence,
                            timestamp,
                        );
                        let appended =
                            self.apply(&task_id, TaskPatch::message(chat_entry(message, sequence)));
                        gated || appended
                    }
                    "git" => {
                        let output = message
                            .get("output")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        self.apply_with_sequence(
                            &task_id,
                            TaskPatch::status_message(output),
                            sequence,
                            timestamp,
                        )
                    }
                    _ => self.apply(&task_id, TaskPatch::message(chat_entry(message, sequence))),
                }
            }
            _ => false,
        }
    }

    /// Authoritative engine status from the poll path.
    pub fn reconcile_workflow_status(&mut self, task_id: &str, state: WorkflowRunState) -> bool {
        let patch = match state {
            WorkflowRunState::Completed | WorkflowRunState::NotFound => {
                TaskPatch::status(TaskStatus::Done)
            }
            WorkflowRunState::Failed
            | WorkflowRunState::Cancelled
            | WorkflowRunState::Terminated
            | WorkflowRunState::TimedOut => TaskPatch {
                status: Some(TaskStatus::Done),
                status_message: Some(Some(format!("Workflow {}", state_name(state)))),
                ..TaskPatch::default()
            },
            WorkflowRunState::Running => TaskPatch {
                status: Some(TaskStatus::InProgress),
                status_message: Some(Some("Working on task...".to_string())),
                ..TaskPatch::default()
            },
        };
        self.apply(task_id, patch)
    }
}

fn state_name(state: WorkflowRunState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn merge(task: &mut Task, patch: TaskPatch) {
    if let Some(status) = patch.status {
        task.status = status;
    }
    if let Some(status_message) = patch.status_message {
        task.status_message = status_message;
    }
    if let Some(session_id) = patch.session_id {
        task.session_id = Some(session_id);
    }
    if let Some(has_changes) = patch.has_changes {
        task.has_changes = has_changes;
    }
    for message in patch.messages {
        insert_message(&mut task.messages, message);
    }
    task.updated_at_ms = now_ms();
}

/// Keyed insert: a message already present by sequence or id is skipped,
/// sequenced messages land in sequence order.
fn insert_message(messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    let duplicate = messages.iter().any(|existing| {
        existing.id == message.id
            || (message.sequence.is_some() && existing.sequence == message.sequence)
    });
    if duplicate {
        return;
    }
    let position = match message.sequence {
        Some(sequence) => messages
            .iter()
            .position(|m| m.sequence.is_some_and(|s| s > sequence))
            .unwrap_or(messages.len()),
        None => messages.len(),
    };
    messages.insert(position, message);
}

fn chat_entry(message: &Value, sequence: Option<u64>) -> ChatMessage {
    let kind = message
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("text")
        .to_string();
    let role = match kind.as_str() {
        "message" => message
            .get("role")
            .and_then(|v| v.as_str())
            .and_then(MessageRole::parse)
            .unwrap_or(MessageRole::Assistant),
        _ => MessageRole::Assistant,
    };
    let data = match kind.as_str() {
        "message" => message.get("data").cloned().unwrap_or_else(|| json!({})),
        "text" | "error" => json!({
            "text": message.get("content").cloned().unwrap_or(Value::Null),
        }),
        _ => message.clone(),
    };
    let id = match sequence {
        Some(sequence) => format!("seq-{sequence}"),
        None => message
            .get("call_id")
            .or_else(|| message.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
    };
    ChatMessage {
        id,
        role,
        kind,
        data,
        sequence,
    }
}
