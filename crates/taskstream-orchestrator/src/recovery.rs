use std::sync::Arc;
use std::time::Duration;

use taskstream_core::UpdatePublisher;
use taskstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskstream_types::{workflow_id_for, TaskStatus, Update, WorkflowExecutionStatus, WorkflowState};
use taskstream_wire::Envelope;
use tracing::Level;

use crate::engine::{EngineError, WorkflowDescription, WorkflowEngine};

const STATE_UNAVAILABLE: &str = "Workflow state not available for query.";

/// A missing workflow is an answer, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome<T> {
    Found(T),
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatesSince {
    pub workflow_status: WorkflowExecutionStatus,
    pub current_status: TaskStatus,
    pub updates: Vec<Update>,
    pub total_updates: usize,
    pub last_sequence: u64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered_updates: usize,
    pub failed_publishes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatestSnapshot {
    pub workflow_status: WorkflowExecutionStatus,
    pub current_status: TaskStatus,
    pub all_updates: Vec<Update>,
    pub total_updates: usize,
    pub last_sequence: u64,
    pub start_time: u64,
    pub completed_at: Option<u64>,
    pub message: Option<String>,
}

/// Stateless gap-filling over the durable per-task log.
#[derive(Clone)]
pub struct RecoveryService {
    engine: Arc<dyn WorkflowEngine>,
    publisher: Arc<dyn UpdatePublisher>,
    pacing: Duration,
}

impl RecoveryService {
    pub fn new(
        engine: Arc<dyn WorkflowEngine>,
        publisher: Arc<dyn UpdatePublisher>,
        pacing: Duration,
    ) -> Self {
        Self {
            engine,
            publisher,
            pacing,
        }
    }

    async fn load(
        &self,
        task_id: &str,
    ) -> Result<Option<(WorkflowDescription, Option<WorkflowState>)>, EngineError> {
        let workflow_id = workflow_id_for(task_id);
        let description = match self.engine.describe(&workflow_id).await {
            Ok(description) => description,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let state = if description.is_open() {
            match self.engine.query(&workflow_id).await {
                Ok(state) => Some(state),
                // closed between describe and query
                Err(EngineError::NotRunning(_)) => self.engine.result(&workflow_id).await.ok(),
                Err(err) => {
                    tracing::warn!(task_id, error = %err, "workflow query failed");
                    None
                }
            }
        } else {
            match self.engine.result(&workflow_id).await {
                Ok(state) => Some(state),
                Err(err) => {
                    tracing::warn!(task_id, error = %err, "workflow result unavailable");
                    None
                }
            }
        };
        Ok(Some((description, state)))
    }

    pub async fn updates_since(
        &self,
        task_id: &str,
        since_sequence: u64,
        since_timestamp: u64,
    ) -> Result<RecoveryOutcome<UpdatesSince>, EngineError> {
        let Some((description, state)) = self.load(task_id).await? else {
            return Ok(RecoveryOutcome::NotFound);
        };
        let result = match state {
            Some(state) => UpdatesSince {
                workflow_status: description.status,
                current_status: state.status,
                updates: state.updates_since(since_sequence, since_timestamp),
                total_updates: state.updates.len(),
                last_sequence: state.last_sequence,
                message: None,
            },
            None => UpdatesSince {
                workflow_status: description.status,
                current_status: TaskStatus::InProgress,
                updates: Vec::new(),
                total_updates: 0,
                last_sequence: 0,
                message: Some(STATE_UNAVAILABLE.to_string()),
            },
        };
        Ok(RecoveryOutcome::Found(result))
    }

    /// Re-publishes everything after the watermark as `recovery` envelopes.
    pub async fn trigger_recovery(
        &self,
        task_id: &str,
        connection_id: Option<&str>,
        last_sequence: u64,
        last_timestamp: u64,
    ) -> Result<RecoveryOutcome<RecoveryReport>, EngineError> {
        let since = match self
            .updates_since(task_id, last_sequence, last_timestamp)
            .await?
        {
            RecoveryOutcome::Found(since) => since,
            RecoveryOutcome::NotFound => return Ok(RecoveryOutcome::NotFound),
        };

        let mut failed_publishes = 0;
        for (index, update) in since.updates.iter().enumerate() {
            if index > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            if let Err(err) = self.publisher.publish(&Envelope::replay_of(update)).await {
                failed_publishes += 1;
                tracing::warn!(
                    task_id,
                    sequence = update.sequence,
                    error = %err,
                    "recovery replay publish failed"
                );
            }
        }

        let recovered = since.updates.len();
        let detail = format!("replayed {recovered} updates after sequence {last_sequence}");
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "recovery.replayed",
                component: "recovery",
                task_id: Some(task_id),
                connection_id,
                sequence: Some(since.last_sequence),
                status: Some(since.current_status.as_str()),
                detail: Some(&detail),
                ..Default::default()
            },
        );
        Ok(RecoveryOutcome::Found(RecoveryReport {
            recovered_updates: recovered,
            failed_publishes,
        }))
    }

    pub async fn latest(&self, task_id: &str) -> Result<RecoveryOutcome<LatestSnapshot>, EngineError> {
        let Some((description, state)) = self.load(task_id).await? else {
            return Ok(RecoveryOutcome::NotFound);
        };
        let snapshot = match state {
            Some(state) => LatestSnapshot {
                workflow_status: description.status,
                current_status: state.status,
                total_updates: state.updates.len(),
                last_sequence: state.last_sequence,
                start_time: state.start_time,
                all_updates: state.updates,
                completed_at: description.closed_at_ms,
                message: None,
            },
            None => LatestSnapshot {
                workflow_status: description.status,
                current_status: TaskStatus::InProgress,
                all_updates: Vec::new(),
                total_updates: 0,
                last_sequence: 0,
                start_time: description.started_at_ms,
                completed_at: description.closed_at_ms,
                message: Some(STATE_UNAVAILABLE.to_string()),
            },
        };
        Ok(RecoveryOutcome::Found(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activities::Activities;
    use crate::memory::InMemoryEngine;
    use crate::workflow::WorkflowInput;
    use taskstream_core::{BroadcastHub, Credentials, ScriptedAgent};
    use taskstream_types::{Task, TaskMode, UpdateKind};
    use tokio::sync::mpsc;

    fn collect_envelopes(rx: &mut mpsc::Receiver<String>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Ok(envelope) = serde_json::from_str(&frame) {
                out.push(envelope);
            }
        }
        out
    }

    struct Fixture {
        hub: BroadcastHub,
        engine: InMemoryEngine,
        recovery: RecoveryService,
    }

    fn fixture(agent: ScriptedAgent) -> Fixture {
        let hub = BroadcastHub::new();
        let activities = Activities::new(Arc::new(hub.clone()), Arc::new(agent));
        let engine = InMemoryEngine::new(Arc::new(activities));
        let recovery = RecoveryService::new(
            Arc::new(engine.clone()),
            Arc::new(hub.clone()),
            Duration::from_millis(100),
        );
        Fixture {
            hub,
            engine,
            recovery,
        }
    }

    async fn run_to_close(fx: &Fixture, task: &Task) {
        let id = workflow_id_for(&task.id);
        fx.engine
            .start(
                &id,
                WorkflowInput {
                    task: task.clone(),
                    credentials: Credentials::default(),
                    session_id: None,
                    prompt: None,
                },
            )
            .await
            .expect("start");
        for _ in 0..400 {
            if !fx.engine.describe(&id).await.expect("describe").is_open() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workflow never closed");
    }

    fn three_messages() -> ScriptedAgent {
        ScriptedAgent::new(vec![
            "first".to_string(),
            "second".to_string(),
            "third".to_string(),
        ])
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let fx = fixture(ScriptedAgent::default());
        assert_eq!(
            fx.recovery.updates_since("nope", 0, 0).await,
            Ok(RecoveryOutcome::NotFound)
        );
        assert_eq!(
            fx.recovery.trigger_recovery("nope", None, 0, 0).await,
            Ok(RecoveryOutcome::NotFound)
        );
        assert_eq!(fx.recovery.latest("nope").await, Ok(RecoveryOutcome::NotFound));
    }

    #[tokio::test]
    async fn updates_since_returns_exact_tail_of_closed_log() {
        let fx = fixture(three_messages());
        let task = Task::new("t", TaskMode::Code);
        run_to_close(&fx, &task).await;

        for watermark in 0..=5u64 {
            let RecoveryOutcome::Found(since) =
                fx.recovery.updates_since(&task.id, watermark, 0).await.expect("since")
            else {
                panic!("expected workflow");
            };
            assert_eq!(since.total_updates, 5);
            assert_eq!(since.last_sequence, 5);
            assert_eq!(since.current_status, TaskStatus::Done);
            assert_eq!(since.workflow_status, WorkflowExecutionStatus::Completed);
            let returned = since.updates.iter().map(|u| u.sequence).collect::<Vec<_>>();
            assert_eq!(returned, ((watermark + 1)..=5).collect::<Vec<_>>());
            assert_eq!(since.total_updates - watermark as usize, returned.len());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_recovery_replays_tagged_envelopes_with_pacing() {
        let fx = fixture(three_messages());
        let task = Task::new("t", TaskMode::Code);
        run_to_close(&fx, &task).await;

        let (tx, mut rx) = mpsc::channel(16);
        fx.hub.add("c1", Box::new(tx));
        let started = tokio::time::Instant::now();
        let outcome = fx
            .recovery
            .trigger_recovery(&task.id, Some("c1"), 2, 0)
            .await
            .expect("trigger");

        assert_eq!(
            outcome,
            RecoveryOutcome::Found(RecoveryReport {
                recovered_updates: 3,
                failed_publishes: 0,
            })
        );
        assert!(started.elapsed() >= Duration::from_millis(200));
        let replayed = collect_envelopes(&mut rx);
        assert_eq!(
            replayed.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![Some(3), Some(4), Some(5)]
        );
        assert!(replayed.iter().all(Envelope::is_recovery));
        assert_eq!(replayed[2].topic, "status");
        assert_eq!(replayed[0].topic, "update");
    }

    #[tokio::test]
    async fn latest_returns_full_snapshot_with_completion_time() {
        let fx = fixture(three_messages());
        let task = Task::new("t", TaskMode::Code);
        run_to_close(&fx, &task).await;

        let RecoveryOutcome::Found(latest) = fx.recovery.latest(&task.id).await.expect("latest")
        else {
            panic!("expected workflow");
        };
        assert_eq!(latest.all_updates.len(), 5);
        assert_eq!(latest.all_updates[0].kind, UpdateKind::Status);
        assert!(latest.completed_at.is_some());
        assert!(latest.start_time > 0);
    }

    #[tokio::test]
    async fn open_workflow_is_served_from_live_query() {
        let fx = fixture(
            ScriptedAgent::new(vec!["slow".to_string()]).with_delay(Duration::from_secs(60)),
        );
        let task = Task::new("t", TaskMode::Code);
        fx.engine
            .start(
                &workflow_id_for(&task.id),
                WorkflowInput {
                    task: task.clone(),
                    credentials: Credentials::default(),
                    session_id: None,
                    prompt: None,
                },
            )
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let RecoveryOutcome::Found(since) =
            fx.recovery.updates_since(&task.id, 0, 0).await.expect("since")
        else {
            panic!("expected workflow");
        };
        assert_eq!(since.workflow_status, WorkflowExecutionStatus::Running);
        assert_eq!(since.current_status, TaskStatus::InProgress);
        assert_eq!(since.updates.len(), 1);
        fx.engine.terminate_all("teardown").await;
    }
}
