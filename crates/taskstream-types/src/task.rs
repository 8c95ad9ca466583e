use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    InProgress,
    Done,
    Merged,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
            TaskStatus::Merged => "MERGED",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Code,
    Ask,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

/// One entry in a task's chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl ChatMessage {
    pub fn text(&self) -> Option<&str> {
        self.data.get("text").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub has_changes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<u64>,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
}

impl Task {
    pub fn new(title: impl Into<String>, mode: TaskMode) -> Self {
        let now = crate::now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            mode,
            status: TaskStatus::InProgress,
            messages: Vec::new(),
            repository: None,
            branch: None,
            model: None,
            session_id: None,
            status_message: None,
            has_changes: false,
            last_sequence: None,
            last_timestamp: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// User and assistant `message` entries, oldest first, as agent history.
    pub fn conversation(&self) -> Vec<(MessageRole, String)> {
        self.messages
            .iter()
            .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
            .filter(|m| m.kind == "message")
            .map(|m| (m.role, m.text().unwrap_or_default().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_status_uses_screaming_case_on_the_wire() {
        let encoded = serde_json::to_value(TaskStatus::InProgress).expect("encode");
        assert_eq!(encoded, json!("IN_PROGRESS"));
        let decoded: TaskStatus = serde_json::from_value(json!("MERGED")).expect("decode");
        assert_eq!(decoded, TaskStatus::Merged);
    }

    #[test]
    fn conversation_keeps_only_chat_messages() {
        let mut task = Task::new("Fix the build", TaskMode::Code);
        task.messages = vec![
            ChatMessage {
                id: "1".to_string(),
                role: MessageRole::User,
                kind: "message".to_string(),
                data: json!({"text": "please fix"}),
                sequence: None,
            },
            ChatMessage {
                id: "2".to_string(),
                role: MessageRole::Assistant,
                kind: "local_shell_call".to_string(),
                data: json!({"action": {}}),
                sequence: Some(2),
            },
            ChatMessage {
                id: "3".to_string(),
                role: MessageRole::Assistant,
                kind: "message".to_string(),
                data: json!({"text": "done"}),
                sequence: Some(3),
            },
        ];
        let history = task.conversation();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], (MessageRole::User, "please fix".to_string()));
        assert_eq!(history[1], (MessageRole::Assistant, "done".to_string()));
    }

    #[test]
    fn task_accepts_minimal_client_payload() {
        let task: Task =
            serde_json::from_value(json!({"id": "t1", "title": "Add tests", "mode": "ask"}))
                .expect("decode");
        assert_eq!(task.mode, TaskMode::Ask);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.messages.is_empty());
    }
}
