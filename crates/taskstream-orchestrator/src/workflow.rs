use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use taskstream_core::{AgentError, AgentRequest, Credentials, NormalizedUpdate};
use taskstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskstream_types::{ChatMessage, MessageRole, Task, TaskStatus, Update, UpdateKind, WorkflowState};
use tokio::sync::mpsc;
use tracing::Level;

use crate::activities::Activities;

pub type SharedState = Arc<RwLock<WorkflowState>>;

#[derive(Debug, Clone)]
pub struct WorkflowInput {
    pub task: Task,
    pub credentials: Credentials,
    pub session_id: Option<String>,
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowSignal {
    /// Run another agent turn with this prompt once the current one finishes.
    Continue {
        prompt: String,
        session_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    Completed,
    Failed(AgentError),
}

/// Sender half of an instance's signal channel. Closed exactly once, when the
/// instance commits to finishing.
#[derive(Default)]
pub struct SignalGate {
    tx: Option<mpsc::UnboundedSender<WorkflowSignal>>,
}

impl SignalGate {
    pub fn deliver(&self, signal: WorkflowSignal) -> bool {
        match &self.tx {
            Some(tx) => tx.send(signal).is_ok(),
            None => false,
        }
    }

    pub fn close(&mut self) {
        self.tx = None;
    }
}

pub struct SignalInbox {
    rx: mpsc::UnboundedReceiver<WorkflowSignal>,
    gate: Arc<Mutex<SignalGate>>,
}

impl SignalInbox {
    pub fn channel() -> (Arc<Mutex<SignalGate>>, SignalInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Mutex::new(SignalGate { tx: Some(tx) }));
        (gate.clone(), SignalInbox { rx, gate })
    }

    /// Next pending signal, or `None` after atomically refusing further ones.
    /// A signal either lands here or its sender sees the gate closed.
    pub fn next_or_close(&mut self) -> Option<WorkflowSignal> {
        let mut gate = self.gate.lock();
        match self.rx.try_recv() {
            Ok(signal) => Some(signal),
            Err(_) => {
                gate.close();
                None
            }
        }
    }
}

/// Body of one task's orchestrator instance.
pub struct TaskWorkflow {
    workflow_id: String,
    state: SharedState,
    activities: Arc<Activities>,
    // activity key -> sequence assigned on first append
    journal: HashMap<String, u64>,
    turn: u32,
    step: u32,
}

impl TaskWorkflow {
    pub fn new(workflow_id: impl Into<String>, state: SharedState, activities: Arc<Activities>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            state,
            activities,
            journal: HashMap::new(),
            turn: 0,
            step: 0,
        }
    }

    pub async fn run(mut self, input: WorkflowInput, mut inbox: SignalInbox) -> WorkflowOutcome {
        let WorkflowInput {
            mut task,
            credentials,
            mut session_id,
            mut prompt,
        } = input;
        loop {
            self.turn += 1;
            self.step = 0;
            let outcome = self
                .run_turn(&mut task, prompt.as_deref(), session_id.as_deref(), &credentials)
                .await;
            match inbox.next_or_close() {
                Some(WorkflowSignal::Continue {
                    prompt: next,
                    session_id: next_session,
                }) => {
                    prompt = Some(next);
                    if next_session.is_some() {
                        session_id = next_session;
                    }
                }
                None => return outcome,
            }
        }
    }

    async fn run_turn(
        &mut self,
        task: &mut Task,
        prompt: Option<&str>,
        session_id: Option<&str>,
        credentials: &Credentials,
    ) -> WorkflowOutcome {
        let task_id = task.id.clone();
        self.state.write().status = TaskStatus::InProgress;
        let started = self
            .record(
                "status-start",
                UpdateKind::Status,
                status_payload(&task_id, TaskStatus::InProgress, session_id),
            )
            .await;
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "workflow.turn.started",
                component: "workflow",
                task_id: Some(&task_id),
                workflow_id: Some(&self.workflow_id),
                sequence: Some(started.sequence),
                status: Some("IN_PROGRESS"),
                ..Default::default()
            },
        );

        let request = AgentRequest::for_task(task, prompt, session_id, credentials.clone());
        let prompt_text = request.prompt.clone();
        let (call, mut rx) = self.activities.generate_code(request);
        tokio::pin!(call);
        let result = loop {
            tokio::select! {
                biased;
                Some(raw) = rx.recv() => self.record_raw(&task_id, &raw).await,
                result = &mut call => break result,
            }
        };
        while let Ok(raw) = rx.try_recv() {
            self.record_raw(&task_id, &raw).await;
        }
        task.messages.push(self.chat_entry(MessageRole::User, "user", prompt_text));

        let outcome = match result {
            Ok(output) => {
                if let Some(text) = output.final_assistant_text() {
                    self.record(
                        "final-message",
                        UpdateKind::Message,
                        NormalizedUpdate::assistant_message(text.clone()).into_payload(&task_id),
                    )
                    .await;
                    task.messages
                        .push(self.chat_entry(MessageRole::Assistant, "assistant", text));
                }
                WorkflowOutcome::Completed
            }
            Err(err) => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Server,
                    ObservabilityEvent {
                        event: "workflow.agent.failed",
                        component: "workflow",
                        task_id: Some(&task_id),
                        workflow_id: Some(&self.workflow_id),
                        error_code: Some(err.code()),
                        detail: Some(&err.to_string()),
                        ..Default::default()
                    },
                );
                self.record(
                    "agent-error",
                    UpdateKind::Message,
                    NormalizedUpdate::error(err.to_string()).into_payload(&task_id),
                )
                .await;
                WorkflowOutcome::Failed(err)
            }
        };

        self.state.write().status = TaskStatus::Done;
        let done = self
            .record(
                "status-done",
                UpdateKind::Status,
                status_payload(&task_id, TaskStatus::Done, session_id),
            )
            .await;
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "workflow.turn.finished",
                component: "workflow",
                task_id: Some(&task_id),
                workflow_id: Some(&self.workflow_id),
                sequence: Some(done.sequence),
                status: Some(match outcome {
                    WorkflowOutcome::Completed => "COMPLETED",
                    WorkflowOutcome::Failed(_) => "FAILED",
                }),
                ..Default::default()
            },
        );
        outcome
    }

    async fn record_raw(&mut self, task_id: &str, raw: &str) {
        for normalized in self.activities.normalize(raw) {
            self.step += 1;
            let step = format!("message-{}", self.step);
            self.record(&step, UpdateKind::Message, normalized.into_payload(task_id))
                .await;
        }
    }

    /// Appends under a stable activity key and publishes, retrying delivery.
    /// Every attempt republishes the update first assigned to the key.
    async fn record(&mut self, step: &str, kind: UpdateKind, data: Value) -> Update {
        let key = format!("turn-{}/{}", self.turn, step);
        let retry = self.activities.retry();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let update = self.append_once(&key, kind, data.clone());
            match self.activities.publish(&update).await {
                Ok(report) => {
                    tracing::debug!(
                        workflow_id = %self.workflow_id,
                        sequence = update.sequence,
                        delivered = report.delivered,
                        "published update"
                    );
                    return update;
                }
                Err(err) if attempt < retry.max_attempts => {
                    tracing::warn!(
                        workflow_id = %self.workflow_id,
                        sequence = update.sequence,
                        attempt,
                        error = %err,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(retry.backoff).await;
                }
                Err(err) => {
                    tracing::warn!(
                        workflow_id = %self.workflow_id,
                        sequence = update.sequence,
                        attempt,
                        error = %err,
                        "giving up live delivery; update stays recoverable from the log"
                    );
                    return update;
                }
            }
        }
    }

    fn append_once(&mut self, key: &str, kind: UpdateKind, data: Value) -> Update {
        if let Some(sequence) = self.journal.get(key) {
            if let Some(existing) = self.state.read().update_at(*sequence) {
                return existing.clone();
            }
        }
        let update = self.state.write().append(kind, data);
        self.journal.insert(key.to_string(), update.sequence);
        update
    }

    fn chat_entry(&self, role: MessageRole, tag: &str, text: String) -> ChatMessage {
        ChatMessage {
            id: format!("{}-turn{}-{}", self.workflow_id, self.turn, tag),
            role,
            kind: "message".to_string(),
            data: json!({"text": text}),
            sequence: None,
        }
    }
}

fn status_payload(task_id: &str, status: TaskStatus, session_id: Option<&str>) -> Value {
    json!({
        "taskId": task_id,
        "status": status.as_str(),
        "sessionId": session_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;
    use taskstream_core::{
        Agent, AgentOutput, BroadcastReport, PublishError, ScriptedAgent, UpdatePublisher,
        UpdateSink,
    };
    use taskstream_types::{workflow_id_for, TaskMode};
    use taskstream_wire::Envelope;

    use crate::activities::RetryPolicy;

    #[derive(Default)]
    struct RecordingPublisher {
        attempts: Mutex<Vec<u64>>,
        fail_first_attempt: bool,
    }

    #[async_trait]
    impl UpdatePublisher for RecordingPublisher {
        async fn publish(&self, envelope: &Envelope) -> Result<BroadcastReport, PublishError> {
            let sequence = envelope.sequence.unwrap_or_default();
            let mut attempts = self.attempts.lock();
            let first = !attempts.contains(&sequence);
            attempts.push(sequence);
            if self.fail_first_attempt && first {
                return Err(PublishError::Unavailable("flaky".to_string()));
            }
            Ok(BroadcastReport::default())
        }
    }

    #[derive(Default)]
    struct HistoryAgent {
        requests: Mutex<Vec<AgentRequest>>,
    }

    #[async_trait]
    impl Agent for HistoryAgent {
        async fn generate_code(
            &self,
            request: AgentRequest,
            updates: UpdateSink,
        ) -> Result<AgentOutput, AgentError> {
            let _ = updates.send(format!("working on {}", request.prompt));
            self.requests.lock().push(request);
            Ok(AgentOutput {
                messages: vec![json!({
                    "role": "assistant",
                    "content": [{"type": "input_text", "text": "turn done"}]
                })],
            })
        }
    }

    fn input(task: &Task) -> WorkflowInput {
        WorkflowInput {
            task: task.clone(),
            credentials: Credentials::new("token"),
            session_id: Some("s1".to_string()),
            prompt: None,
        }
    }

    fn workflow(task: &Task, activities: Activities) -> (TaskWorkflow, SharedState) {
        let state = Arc::new(RwLock::new(WorkflowState::new(task.id.clone())));
        (
            TaskWorkflow::new(workflow_id_for(&task.id), state.clone(), Arc::new(activities)),
            state,
        )
    }

    fn kinds(state: &WorkflowState) -> Vec<(u64, UpdateKind)> {
        state.updates.iter().map(|u| (u.sequence, u.kind)).collect()
    }

    #[tokio::test]
    async fn successful_run_brackets_messages_with_statuses() {
        let task = Task::new("Add tests", TaskMode::Code);
        let agent = ScriptedAgent::new(vec![
            r#"{"type":"local_shell_call","id":"c1","action":{"command":["ls"]}}"#.to_string(),
            r#"{"type":"git","message":"pushed"}"#.to_string(),
        ])
        .with_transcript(vec![json!({
            "role": "assistant",
            "content": [{"type": "input_text", "text": "All done"}]
        })]);
        let publisher = Arc::new(RecordingPublisher::default());
        let (workflow, state) = workflow(&task, Activities::new(publisher.clone(), Arc::new(agent)));
        let (_gate, inbox) = SignalInbox::channel();

        let outcome = workflow.run(input(&task), inbox).await;

        assert_eq!(outcome, WorkflowOutcome::Completed);
        let state = state.read().clone();
        assert_eq!(
            kinds(&state),
            vec![
                (1, UpdateKind::Status),
                (2, UpdateKind::Message),
                (3, UpdateKind::Message),
                (4, UpdateKind::Message),
                (5, UpdateKind::Status),
            ]
        );
        assert_eq!(state.updates[0].data["status"], json!("IN_PROGRESS"));
        assert_eq!(state.updates[0].data["sessionId"], json!("s1"));
        assert_eq!(state.updates[3].data["message"]["data"]["text"], json!("All done"));
        assert_eq!(state.updates[4].data["status"], json!("DONE"));
        assert_eq!(state.status, TaskStatus::Done);
        assert_eq!(*publisher.attempts.lock(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_retry_reuses_assigned_sequence() {
        let task = Task::new("Flaky network", TaskMode::Code);
        let publisher = Arc::new(RecordingPublisher {
            fail_first_attempt: true,
            ..Default::default()
        });
        let activities = Activities::new(
            publisher.clone(),
            Arc::new(ScriptedAgent::new(vec!["hello".to_string()])),
        )
        .with_retry(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(10),
        });
        let (workflow, state) = workflow(&task, activities);
        let (_gate, inbox) = SignalInbox::channel();

        workflow.run(input(&task), inbox).await;

        assert_eq!(*publisher.attempts.lock(), vec![1, 1, 2, 2, 3, 3]);
        let sequences = state.read().updates.iter().map(|u| u.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn agent_failure_appends_error_then_done() {
        let task = Task::new("Broken key", TaskMode::Code);
        let agent = ScriptedAgent::new(vec!["partial output".to_string()])
            .failing_with("401 invalid_api_key");
        let (workflow, state) = workflow(
            &task,
            Activities::new(Arc::new(RecordingPublisher::default()), Arc::new(agent)),
        );
        let (_gate, inbox) = SignalInbox::channel();

        let outcome = workflow.run(input(&task), inbox).await;

        assert_eq!(outcome, WorkflowOutcome::Failed(AgentError::Authentication));
        let state = state.read().clone();
        let error = &state.updates[2].data["message"];
        assert_eq!(error["type"], json!("error"));
        assert!(error["content"]
            .as_str()
            .unwrap_or_default()
            .contains("authentication failed"));
        assert_eq!(state.updates[3].data["status"], json!("DONE"));
        assert_eq!(state.last_sequence, 4);
    }

    #[tokio::test]
    async fn pending_signal_runs_another_turn_with_history() {
        let task = Task::new("Build parser", TaskMode::Code);
        let agent = Arc::new(HistoryAgent::default());
        let (workflow, state) = workflow(
            &task,
            Activities::new(Arc::new(RecordingPublisher::default()), agent.clone()),
        );
        let (gate, inbox) = SignalInbox::channel();
        assert!(gate.lock().deliver(WorkflowSignal::Continue {
            prompt: "also handle comments".to_string(),
            session_id: None,
        }));

        workflow.run(input(&task), inbox).await;

        let requests = agent.requests.lock();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].history.is_empty());
        let second = &requests[1];
        assert_eq!(second.prompt, "also handle comments");
        assert_eq!(
            second
                .history
                .iter()
                .map(|h| h.content.as_str())
                .collect::<Vec<_>>(),
            vec!["Build parser", "turn done", "also handle comments"]
        );
        let statuses = state
            .read()
            .updates
            .iter()
            .filter(|u| u.kind == UpdateKind::Status)
            .map(|u| u.data["status"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(statuses, vec!["IN_PROGRESS", "DONE", "IN_PROGRESS", "DONE"]);
        assert!(!gate.lock().deliver(WorkflowSignal::Continue {
            prompt: "too late".to_string(),
            session_id: None,
        }));
    }
}
