use async_trait::async_trait;
use serde::Serialize;
use taskstream_types::{WorkflowExecutionStatus, WorkflowState};
use thiserror::Error;

use crate::workflow::{WorkflowInput, WorkflowSignal};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("workflow `{0}` is already running")]
    AlreadyStarted(String),
    #[error("workflow `{0}` not found")]
    NotFound(String),
    #[error("workflow `{0}` is not running")]
    NotRunning(String),
    #[error("workflow `{0}` has not closed yet")]
    StillRunning(String),
    #[error("workflow engine failure: {0}")]
    Internal(String),
}

/// Orchestrator-side lifecycle of an instance, finer than the engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPhase {
    Starting,
    Running,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDescription {
    pub workflow_id: String,
    pub status: WorkflowExecutionStatus,
    pub phase: WorkflowPhase,
    pub started_at_ms: u64,
    pub closed_at_ms: Option<u64>,
}

impl WorkflowDescription {
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// Durable-execution backend that hosts one workflow instance per id.
///
/// `query` answers only while an instance is open and `result` only after it
/// closed; callers branch on [`WorkflowEngine::describe`].
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn start(&self, workflow_id: &str, input: WorkflowInput) -> Result<(), EngineError>;
    async fn describe(&self, workflow_id: &str) -> Result<WorkflowDescription, EngineError>;
    async fn query(&self, workflow_id: &str) -> Result<WorkflowState, EngineError>;
    async fn result(&self, workflow_id: &str) -> Result<WorkflowState, EngineError>;
    async fn terminate(&self, workflow_id: &str, reason: &str) -> Result<(), EngineError>;
    async fn signal(&self, workflow_id: &str, signal: WorkflowSignal) -> Result<(), EngineError>;
}
