use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock as StateLock};
use taskstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskstream_types::{now_ms, WorkflowExecutionStatus, WorkflowState};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::Level;

use crate::activities::Activities;
use crate::engine::{EngineError, WorkflowDescription, WorkflowEngine, WorkflowPhase};
use crate::workflow::{
    SharedState, SignalGate, SignalInbox, TaskWorkflow, WorkflowInput, WorkflowOutcome,
    WorkflowSignal,
};

struct InstanceRecord {
    run_id: u64,
    status: WorkflowExecutionStatus,
    phase: WorkflowPhase,
    state: SharedState,
    gate: Arc<Mutex<SignalGate>>,
    handle: Option<JoinHandle<()>>,
    started_at_ms: u64,
    closed_at_ms: Option<u64>,
}

impl InstanceRecord {
    fn describe(&self, workflow_id: &str) -> WorkflowDescription {
        WorkflowDescription {
            workflow_id: workflow_id.to_string(),
            status: self.status,
            phase: self.phase,
            started_at_ms: self.started_at_ms,
            closed_at_ms: self.closed_at_ms,
        }
    }
}

/// Single-process engine: one tokio task per open instance, records kept
/// for the lifetime of the process.
#[derive(Clone)]
pub struct InMemoryEngine {
    activities: Arc<Activities>,
    records: Arc<RwLock<HashMap<String, InstanceRecord>>>,
    next_run: Arc<AtomicU64>,
}

impl InMemoryEngine {
    pub fn new(activities: Arc<Activities>) -> Self {
        Self {
            activities,
            records: Arc::new(RwLock::new(HashMap::new())),
            next_run: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn open_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.status.is_open())
            .count()
    }

    /// Terminates every open instance; used on shutdown.
    pub async fn terminate_all(&self, reason: &str) {
        let open = self
            .records
            .read()
            .await
            .iter()
            .filter(|(_, r)| r.status.is_open())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        for workflow_id in open {
            let _ = self.terminate(&workflow_id, reason).await;
        }
    }

    async fn finish(
        records: &RwLock<HashMap<String, InstanceRecord>>,
        workflow_id: &str,
        run_id: u64,
        outcome: &WorkflowOutcome,
    ) {
        let mut guard = records.write().await;
        let Some(record) = guard.get_mut(workflow_id) else {
            return;
        };
        if record.run_id != run_id || !record.status.is_open() {
            return;
        }
        record.status = match outcome {
            WorkflowOutcome::Completed => WorkflowExecutionStatus::Completed,
            WorkflowOutcome::Failed(_) => WorkflowExecutionStatus::Failed,
        };
        record.phase = WorkflowPhase::Closed;
        record.closed_at_ms = Some(now_ms());
        record.handle = None;
        record.gate.lock().close();
    }
}

#[async_trait]
impl WorkflowEngine for InMemoryEngine {
    async fn start(&self, workflow_id: &str, input: WorkflowInput) -> Result<(), EngineError> {
        let mut guard = self.records.write().await;
        let initial = match guard.get(workflow_id) {
            Some(existing) if existing.status.is_open() => {
                return Err(EngineError::AlreadyStarted(workflow_id.to_string()));
            }
            Some(closed) => WorkflowState::continued_from(&closed.state.read()),
            None => WorkflowState::new(input.task.id.clone()),
        };
        let continued_from = initial.last_sequence;

        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        let state: SharedState = Arc::new(StateLock::new(initial));
        let (gate, inbox) = SignalInbox::channel();
        let workflow = TaskWorkflow::new(workflow_id, state.clone(), self.activities.clone());

        let records = self.records.clone();
        let id = workflow_id.to_string();
        let handle = tokio::spawn(async move {
            if let Some(record) = records.write().await.get_mut(&id) {
                if record.run_id == run_id && record.phase == WorkflowPhase::Starting {
                    record.phase = WorkflowPhase::Running;
                }
            }
            let outcome = workflow.run(input, inbox).await;
            Self::finish(&records, &id, run_id, &outcome).await;
        });

        guard.insert(
            workflow_id.to_string(),
            InstanceRecord {
                run_id,
                status: WorkflowExecutionStatus::Running,
                phase: WorkflowPhase::Starting,
                state,
                gate,
                handle: Some(handle),
                started_at_ms: now_ms(),
                closed_at_ms: None,
            },
        );
        drop(guard);

        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "engine.workflow.started",
                component: "engine",
                workflow_id: Some(workflow_id),
                sequence: Some(continued_from),
                status: Some("RUNNING"),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn describe(&self, workflow_id: &str) -> Result<WorkflowDescription, EngineError> {
        self.records
            .read()
            .await
            .get(workflow_id)
            .map(|record| record.describe(workflow_id))
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))
    }

    async fn query(&self, workflow_id: &str) -> Result<WorkflowState, EngineError> {
        let guard = self.records.read().await;
        let record = guard
            .get(workflow_id)
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        if !record.status.is_open() {
            return Err(EngineError::NotRunning(workflow_id.to_string()));
        }
        let snapshot = record.state.read().clone();
        Ok(snapshot)
    }

    async fn result(&self, workflow_id: &str) -> Result<WorkflowState, EngineError> {
        let guard = self.records.read().await;
        let record = guard
            .get(workflow_id)
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        if record.status.is_open() {
            return Err(EngineError::StillRunning(workflow_id.to_string()));
        }
        let snapshot = record.state.read().clone();
        Ok(snapshot)
    }

    async fn terminate(&self, workflow_id: &str, reason: &str) -> Result<(), EngineError> {
        let mut guard = self.records.write().await;
        let record = guard
            .get_mut(workflow_id)
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        if !record.status.is_open() {
            return Err(EngineError::NotRunning(workflow_id.to_string()));
        }
        if let Some(handle) = record.handle.take() {
            handle.abort();
        }
        record.gate.lock().close();
        record.status = WorkflowExecutionStatus::Terminated;
        record.phase = WorkflowPhase::Closed;
        record.closed_at_ms = Some(now_ms());
        drop(guard);

        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "engine.workflow.terminated",
                component: "engine",
                workflow_id: Some(workflow_id),
                status: Some("TERMINATED"),
                detail: Some(reason),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn signal(&self, workflow_id: &str, signal: WorkflowSignal) -> Result<(), EngineError> {
        let gate = {
            let guard = self.records.read().await;
            let record = guard
                .get(workflow_id)
                .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
            if !record.status.is_open() {
                return Err(EngineError::NotRunning(workflow_id.to_string()));
            }
            record.gate.clone()
        };
        let delivered = gate.lock().deliver(signal);
        if delivered {
            Ok(())
        } else {
            Err(EngineError::NotRunning(workflow_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use taskstream_core::{BroadcastHub, Credentials, ScriptedAgent};
    use taskstream_types::{workflow_id_for, Task, TaskMode, TaskStatus};

    fn engine_with(agent: ScriptedAgent) -> InMemoryEngine {
        let activities = Activities::new(Arc::new(BroadcastHub::new()), Arc::new(agent));
        InMemoryEngine::new(Arc::new(activities))
    }

    fn input(task: &Task) -> WorkflowInput {
        WorkflowInput {
            task: task.clone(),
            credentials: Credentials::default(),
            session_id: None,
            prompt: None,
        }
    }

    async fn wait_closed(engine: &InMemoryEngine, id: &str) -> WorkflowDescription {
        for _ in 0..200 {
            let description = engine.describe(id).await.expect("describe");
            if !description.is_open() {
                return description;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workflow {id} never closed");
    }

    #[tokio::test]
    async fn closed_instance_answers_result_but_not_query() {
        let engine = engine_with(ScriptedAgent::new(vec!["one".to_string()]));
        let task = Task::new("t", TaskMode::Code);
        let id = workflow_id_for(&task.id);
        engine.start(&id, input(&task)).await.expect("start");

        let description = wait_closed(&engine, &id).await;
        assert_eq!(description.status, WorkflowExecutionStatus::Completed);
        assert_eq!(description.phase, WorkflowPhase::Closed);
        assert!(description.closed_at_ms.is_some());
        assert_eq!(
            engine.query(&id).await,
            Err(EngineError::NotRunning(id.clone()))
        );
        let result = engine.result(&id).await.expect("result");
        assert_eq!(result.status, TaskStatus::Done);
        assert_eq!(result.last_sequence, 3);
    }

    #[tokio::test]
    async fn second_start_while_open_is_rejected() {
        let engine = engine_with(
            ScriptedAgent::new(vec!["slow".to_string()]).with_delay(Duration::from_secs(60)),
        );
        let task = Task::new("t", TaskMode::Code);
        let id = workflow_id_for(&task.id);
        engine.start(&id, input(&task)).await.expect("start");
        assert_eq!(
            engine.start(&id, input(&task)).await,
            Err(EngineError::AlreadyStarted(id.clone()))
        );
        assert_eq!(engine.open_count().await, 1);
        assert!(engine.query(&id).await.is_ok());
        assert_eq!(
            engine.result(&id).await,
            Err(EngineError::StillRunning(id.clone()))
        );
        engine.terminate_all("test teardown").await;
        assert_eq!(engine.open_count().await, 0);
    }

    #[tokio::test]
    async fn terminate_keeps_partial_log_and_rejects_signals() {
        let engine = engine_with(
            ScriptedAgent::new(vec!["slow".to_string()]).with_delay(Duration::from_secs(60)),
        );
        let task = Task::new("t", TaskMode::Code);
        let id = workflow_id_for(&task.id);
        engine.start(&id, input(&task)).await.expect("start");
        tokio::time::sleep(Duration::from_millis(20)).await;

        engine.terminate(&id, "restart").await.expect("terminate");
        let description = engine.describe(&id).await.expect("describe");
        assert_eq!(description.status, WorkflowExecutionStatus::Terminated);
        let partial = engine.result(&id).await.expect("result");
        assert_eq!(partial.last_sequence, 1);

        let signal = WorkflowSignal::Continue {
            prompt: "more".to_string(),
            session_id: None,
        };
        assert_eq!(
            engine.signal(&id, signal).await,
            Err(EngineError::NotRunning(id.clone()))
        );
        assert_eq!(
            engine.terminate(&id, "again").await,
            Err(EngineError::NotRunning(id.clone()))
        );
    }

    #[tokio::test]
    async fn new_run_continues_sequence_numbering() {
        let engine = engine_with(ScriptedAgent::new(vec!["one".to_string()]));
        let task = Task::new("t", TaskMode::Code);
        let id = workflow_id_for(&task.id);
        engine.start(&id, input(&task)).await.expect("first start");
        wait_closed(&engine, &id).await;
        engine.start(&id, input(&task)).await.expect("second start");
        wait_closed(&engine, &id).await;

        let result = engine.result(&id).await.expect("result");
        let sequences = result.updates.iter().map(|u| u.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, (1..=6).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let engine = engine_with(ScriptedAgent::default());
        assert_eq!(
            engine.describe("task-missing").await,
            Err(EngineError::NotFound("task-missing".to_string()))
        );
    }
}
