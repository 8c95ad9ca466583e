use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use taskstream_types::{MessageRole, Task, TaskMode};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Raw agent output, in emission order.
pub type UpdateSink = mpsc::UnboundedSender<String>;

/// Opaque source-control credential handed through to the agent.
#[derive(Clone, Default)]
pub struct Credentials(String);

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials({})", taskstream_observability::redact_text(&self.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub task: Task,
    pub prompt: String,
    pub mode: TaskMode,
    pub history: Vec<HistoryEntry>,
    pub session_id: Option<String>,
    pub credentials: Credentials,
}

impl AgentRequest {
    /// Builds the request the way the workflow hands it to the agent: prompt
    /// defaults to the task title and is appended to non-empty history.
    pub fn for_task(
        task: &Task,
        prompt: Option<&str>,
        session_id: Option<&str>,
        credentials: Credentials,
    ) -> Self {
        let prompt = prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(task.title.as_str())
            .to_string();
        let mut history = task
            .conversation()
            .into_iter()
            .map(|(role, content)| HistoryEntry { role, content })
            .collect::<Vec<_>>();
        if !history.is_empty() {
            history.push(HistoryEntry {
                role: MessageRole::User,
                content: prompt.clone(),
            });
        }
        Self {
            task: task.clone(),
            prompt,
            mode: task.mode,
            history,
            session_id: session_id.map(str::to_string),
            credentials,
        }
    }

    fn stdin_payload(&self) -> Value {
        json!({
            "taskId": self.task.id,
            "prompt": self.prompt,
            "mode": self.mode,
            "history": self.history,
            "sessionId": self.session_id,
            "repository": self.task.repository,
            "branch": self.task.branch,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    pub messages: Vec<Value>,
}

impl AgentOutput {
    /// Text of the first assistant transcript entry carrying `input_text` content.
    pub fn final_assistant_text(&self) -> Option<String> {
        self.messages.iter().find_map(|msg| {
            if msg.get("role").and_then(|v| v.as_str()) != Some("assistant") {
                return None;
            }
            msg.get("content")?
                .as_array()?
                .iter()
                .find(|c| c.get("type").and_then(|v| v.as_str()) == Some("input_text"))
                .map(|c| {
                    c.get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Task completed")
                        .to_string()
                })
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Failed to generate code: agent connection timeout. Please try again.")]
    Timeout,
    #[error("Failed to generate code: Network error. Please check your connection and try again.")]
    Network,
    #[error("Failed to generate code: API quota exceeded or billing issue. Please check your API credits.")]
    Quota,
    #[error("Failed to generate code: Invalid API key or authentication failed.")]
    Authentication,
    #[error("Failed to generate code: {0}")]
    Other(String),
}

impl AgentError {
    pub fn classify(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        if lower.contains("connect timeout error") || lower.contains("timed out") {
            return AgentError::Timeout;
        }
        if lower.contains("fetch failed") || lower.contains("connection refused") {
            return AgentError::Network;
        }
        if ["insufficient_quota", "quota_exceeded", "billing", "credits"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            return AgentError::Quota;
        }
        if ["unauthorized", "invalid_api_key", "authentication"]
            .iter()
            .any(|needle| lower.contains(needle))
        {
            return AgentError::Authentication;
        }
        AgentError::Other(raw.trim().to_string())
    }

    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Timeout => "AGENT_TIMEOUT",
            AgentError::Network => "AGENT_NETWORK",
            AgentError::Quota => "AGENT_QUOTA",
            AgentError::Authentication => "AGENT_AUTH",
            AgentError::Other(_) => "AGENT_FAILED",
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn generate_code(
        &self,
        request: AgentRequest,
        updates: UpdateSink,
    ) -> Result<AgentOutput, AgentError>;
}

/// Runs an external agent process. The request is written to stdin as JSON,
/// each stdout line is forwarded as one raw message.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn generate_code(
        &self,
        request: AgentRequest,
        updates: UpdateSink,
    ) -> Result<AgentOutput, AgentError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TASKSTREAM_AGENT_TOKEN", request.credentials.expose())
            .env("TASKSTREAM_TASK_MODE", match request.mode {
                TaskMode::Code => "code",
                TaskMode::Ask => "ask",
            })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::classify(&format!("spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = request.stdin_payload().to_string();
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| AgentError::classify(&e.to_string()))?;
        }

        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut messages = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| AgentError::classify(&e.to_string()))?
            {
                if let Ok(value) = serde_json::from_str::<Value>(&line) {
                    messages.push(value);
                }
                let _ = updates.send(line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::classify(&e.to_string()))?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                format!("agent exited with {}", status)
            } else {
                taskstream_observability::mask_secrets(stderr.trim())
            };
            return Err(AgentError::classify(&detail));
        }
        Ok(AgentOutput { messages })
    }
}

/// Replays a fixed list of raw messages, optionally failing at the end.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    messages: Vec<String>,
    transcript: Vec<Value>,
    failure: Option<String>,
    delay: Duration,
}

impl ScriptedAgent {
    pub fn new(messages: Vec<String>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// One raw message per non-empty line.
    pub fn from_ndjson_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::new(
            raw.lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    pub fn with_transcript(mut self, transcript: Vec<Value>) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn failing_with(mut self, error: impl Into<String>) -> Self {
        self.failure = Some(error.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn generate_code(
        &self,
        _request: AgentRequest,
        updates: UpdateSink,
    ) -> Result<AgentOutput, AgentError> {
        for message in &self.messages {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let _ = updates.send(message.clone());
        }
        if let Some(failure) = &self.failure {
            return Err(AgentError::classify(failure));
        }
        Ok(AgentOutput {
            messages: self.transcript.clone(),
        })
    }
}
