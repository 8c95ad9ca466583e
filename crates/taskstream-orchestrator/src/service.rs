use std::sync::Arc;
use std::time::Duration;

use taskstream_core::{ConflictPolicy, ServerConfig};
use taskstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskstream_types::workflow_id_for;
use taskstream_wire::{WorkflowRunState, WorkflowStatusResponse};
use tracing::Level;

use crate::engine::{EngineError, WorkflowEngine};
use crate::workflow::{WorkflowInput, WorkflowSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDisposition {
    Started,
    Restarted,
    Continued,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedWorkflow {
    pub workflow_id: String,
    pub disposition: StartDisposition,
}

impl StartedWorkflow {
    pub fn message(&self) -> &'static str {
        match self.disposition {
            StartDisposition::Started => "Task workflow started",
            StartDisposition::Restarted => "Task workflow restarted with the new prompt",
            StartDisposition::Continued => "Prompt delivered to the running task workflow",
        }
    }
}

/// Entry point for starting task workflows and probing their status.
#[derive(Clone)]
pub struct TaskService {
    engine: Arc<dyn WorkflowEngine>,
    policy: ConflictPolicy,
    restart_grace: Duration,
    close_wait: Duration,
}

impl TaskService {
    pub fn new(engine: Arc<dyn WorkflowEngine>, policy: ConflictPolicy) -> Self {
        Self {
            engine,
            policy,
            restart_grace: Duration::from_millis(1000),
            close_wait: Duration::from_secs(5),
        }
    }

    pub fn from_config(engine: Arc<dyn WorkflowEngine>, config: &ServerConfig) -> Self {
        Self::new(engine, config.conflict_policy).with_restart_grace(config.restart_grace())
    }

    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    pub fn engine(&self) -> &Arc<dyn WorkflowEngine> {
        &self.engine
    }

    pub async fn start_task(&self, input: WorkflowInput) -> Result<StartedWorkflow, EngineError> {
        let workflow_id = workflow_id_for(&input.task.id);
        match self.engine.start(&workflow_id, input.clone()).await {
            Ok(()) => {
                return Ok(StartedWorkflow {
                    workflow_id,
                    disposition: StartDisposition::Started,
                })
            }
            Err(EngineError::AlreadyStarted(_)) => {}
            Err(err) => return Err(err),
        }

        let disposition = match self.policy {
            ConflictPolicy::Restart => self.restart(&workflow_id, input).await?,
            ConflictPolicy::Continue => self.continue_running(&workflow_id, input).await?,
        };
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "task.start.conflict",
                component: "service",
                workflow_id: Some(&workflow_id),
                status: Some(match disposition {
                    StartDisposition::Started => "started",
                    StartDisposition::Restarted => "restarted",
                    StartDisposition::Continued => "continued",
                }),
                ..Default::default()
            },
        );
        Ok(StartedWorkflow {
            workflow_id,
            disposition,
        })
    }

    async fn restart(
        &self,
        workflow_id: &str,
        input: WorkflowInput,
    ) -> Result<StartDisposition, EngineError> {
        if let Err(err) = self
            .engine
            .terminate(workflow_id, "restarted with a new prompt")
            .await
        {
            tracing::warn!(workflow_id, error = %err, "terminate before restart failed");
        }
        tokio::time::sleep(self.restart_grace).await;
        self.engine.start(workflow_id, input).await?;
        Ok(StartDisposition::Restarted)
    }

    async fn continue_running(
        &self,
        workflow_id: &str,
        input: WorkflowInput,
    ) -> Result<StartDisposition, EngineError> {
        let signal = WorkflowSignal::Continue {
            prompt: input
                .prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| input.task.title.clone()),
            session_id: input.session_id.clone(),
        };
        match self.engine.signal(workflow_id, signal).await {
            Ok(()) => Ok(StartDisposition::Continued),
            Err(EngineError::NotRunning(_)) | Err(EngineError::NotFound(_)) => {
                // instance is closing; start fresh once it has
                self.wait_until_closed(workflow_id).await;
                self.engine.start(workflow_id, input).await?;
                Ok(StartDisposition::Started)
            }
            Err(err) => Err(err),
        }
    }

    async fn wait_until_closed(&self, workflow_id: &str) {
        let deadline = tokio::time::Instant::now() + self.close_wait;
        while tokio::time::Instant::now() < deadline {
            match self.engine.describe(workflow_id).await {
                Ok(description) if description.is_open() => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                _ => return,
            }
        }
    }

    /// Engine status of the task's instance, with the final state once closed.
    pub async fn status(&self, task_id: &str) -> Result<WorkflowStatusResponse, EngineError> {
        let workflow_id = workflow_id_for(task_id);
        let description = match self.engine.describe(&workflow_id).await {
            Ok(description) => description,
            Err(EngineError::NotFound(_)) => {
                return Ok(WorkflowStatusResponse {
                    status: WorkflowRunState::NotFound,
                    result: None,
                })
            }
            Err(err) => return Err(err),
        };
        let result = if description.is_open() {
            None
        } else {
            self.engine
                .result(&workflow_id)
                .await
                .ok()
                .and_then(|state| serde_json::to_value(state).ok())
        };
        Ok(WorkflowStatusResponse {
            status: description.status.into(),
            result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::Activities;
    use crate::memory::InMemoryEngine;
    use taskstream_core::{BroadcastHub, Credentials, ScriptedAgent};
    use taskstream_types::{Task, TaskMode, UpdateKind, WorkflowExecutionStatus};

    fn service(policy: ConflictPolicy, agent: ScriptedAgent) -> (TaskService, InMemoryEngine) {
        let activities = Activities::new(Arc::new(BroadcastHub::new()), Arc::new(agent));
        let engine = InMemoryEngine::new(Arc::new(activities));
        let service = TaskService::new(Arc::new(engine.clone()), policy)
            .with_restart_grace(Duration::from_millis(10));
        (service, engine)
    }

    fn input(task: &Task, prompt: &str) -> WorkflowInput {
        WorkflowInput {
            task: task.clone(),
            credentials: Credentials::default(),
            session_id: None,
            prompt: Some(prompt.to_string()),
        }
    }

    async fn settle(service: &TaskService, task: &Task) -> WorkflowStatusResponse {
        for _ in 0..400 {
            let status = service.status(&task.id).await.expect("status");
            if status.status != WorkflowRunState::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {} never settled", task.id);
    }

    #[tokio::test]
    async fn restart_policy_keeps_a_single_active_instance() {
        let (service, engine) = service(
            ConflictPolicy::Restart,
            ScriptedAgent::new(vec!["step".to_string()]).with_delay(Duration::from_millis(200)),
        );
        let task = Task::new("t", TaskMode::Code);

        let first = service.start_task(input(&task, "first")).await.expect("start");
        assert_eq!(first.disposition, StartDisposition::Started);
        let second = service.start_task(input(&task, "second")).await.expect("restart");
        assert_eq!(second.disposition, StartDisposition::Restarted);
        assert_eq!(first.workflow_id, second.workflow_id);
        assert_eq!(engine.open_count().await, 1);

        let status = settle(&service, &task).await;
        assert_eq!(status.status, WorkflowRunState::Completed);
    }

    #[tokio::test]
    async fn continue_policy_signals_running_instance() {
        let (service, engine) = service(
            ConflictPolicy::Continue,
            ScriptedAgent::new(vec!["step".to_string()]).with_delay(Duration::from_millis(100)),
        );
        let task = Task::new("t", TaskMode::Code);

        service.start_task(input(&task, "first")).await.expect("start");
        let second = service.start_task(input(&task, "second")).await.expect("continue");
        assert_eq!(second.disposition, StartDisposition::Continued);
        assert_eq!(engine.open_count().await, 1);

        settle(&service, &task).await;
        let result = engine
            .result(&second.workflow_id)
            .await
            .expect("result");
        let statuses = result
            .updates
            .iter()
            .filter(|u| u.kind == UpdateKind::Status)
            .count();
        assert_eq!(statuses, 4);
    }

    #[tokio::test]
    async fn status_reports_not_found_then_final_state() {
        let (service, _engine) = service(ConflictPolicy::Continue, ScriptedAgent::default());
        let task = Task::new("t", TaskMode::Ask);
        assert_eq!(
            service.status(&task.id).await.expect("status").status,
            WorkflowRunState::NotFound
        );
        service.start_task(input(&task, "go")).await.expect("start");
        let status = settle(&service, &task).await;
        assert_eq!(
            status.status,
            WorkflowRunState::from(WorkflowExecutionStatus::Completed)
        );
        let result = status.result.expect("final state");
        assert_eq!(result["status"], serde_json::json!("DONE"));
    }
}
