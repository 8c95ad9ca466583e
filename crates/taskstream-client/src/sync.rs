use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use taskstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskstream_types::{Task, Watermark};
use taskstream_wire::{
    Envelope, StartWorkflowRequest, StartWorkflowResponse, TriggerRecoveryRequest,
    TriggerRecoveryResponse, UpdatesSinceResponse, WorkflowStatusResponse,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Level;

use crate::sse::{frames, SseFrame};
use crate::store::TaskStore;
use crate::SyncError;

/// What the synchronizer observed since the last call to `next_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected { connection_id: String },
    Envelope(Envelope),
    Recovered { recovered_updates: usize },
    RecoveryFailed { error: String },
    Disconnected,
}

/// Follows one task over the push stream, keeps its watermark and asks the
/// server to backfill whatever was missed while disconnected.
pub struct ClientSynchronizer {
    http: reqwest::Client,
    base_url: String,
    settle_delay: Duration,
    task_id: String,
    store: TaskStore,
    watermark: Watermark,
    connection_id: Option<String>,
    inbox: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    reader: Option<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
}

impl ClientSynchronizer {
    pub fn new(base_url: impl Into<String>, task: Task) -> Self {
        let task_id = task.id.clone();
        let watermark = Watermark {
            last_sequence: task.last_sequence.unwrap_or(0),
            last_timestamp: task.last_timestamp.unwrap_or(0),
        };
        let mut store = TaskStore::new();
        store.insert(task);
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            settle_delay: Duration::from_millis(1000),
            task_id,
            store,
            watermark,
            connection_id: None,
            inbox: None,
            reader: None,
            recovery: None,
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Seeds the watermark, e.g. from a persisted task snapshot.
    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.watermark = watermark;
        self.store.apply_with_sequence(
            &self.task_id,
            Default::default(),
            Some(watermark.last_sequence).filter(|s| *s > 0),
            Some(watermark.last_timestamp).filter(|t| *t > 0),
        );
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task(&self) -> Option<&Task> {
        self.store.get(&self.task_id)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.reader.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Opens a fresh push connection under a new connection id. When the
    /// watermark is non-zero, a recovery request follows after the settle
    /// delay so the server can register the connection first.
    pub async fn open(&mut self) -> Result<(), SyncError> {
        self.close();

        let connection_id = uuid::Uuid::new_v4().to_string();
        let response = self
            .http
            .get(format!("{}/stream", self.base_url))
            .query(&[("connectionId", connection_id.as_str())])
            .send()
            .await?;
        let response = check_status(response).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SyncEvent::Connected {
            connection_id: connection_id.clone(),
        });

        let reader_tx = tx.clone();
        self.reader = Some(tokio::spawn(async move {
            let stream = frames(response);
            futures::pin_mut!(stream);
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(SseFrame::Data(payload)) => match serde_json::from_str::<Envelope>(&payload) {
                        Ok(envelope) => {
                            if reader_tx.send(SyncEvent::Envelope(envelope)).is_err() {
                                return;
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "undecodable push frame"),
                    },
                    Ok(SseFrame::Comment(_)) => {}
                    Err(_) => break,
                }
            }
            let _ = reader_tx.send(SyncEvent::Disconnected);
        }));

        if !self.watermark.is_zero() {
            let http = self.http.clone();
            let url = format!("{}/recovery/{}", self.base_url, self.task_id);
            let request = TriggerRecoveryRequest {
                connection_id: Some(connection_id.clone()),
                last_sequence: self.watermark.last_sequence,
                last_timestamp: self.watermark.last_timestamp,
            };
            let settle_delay = self.settle_delay;
            let task_id = self.task_id.clone();
            self.recovery = Some(tokio::spawn(async move {
                tokio::time::sleep(settle_delay).await;
                let event = match post_json::<_, TriggerRecoveryResponse>(&http, &url, &request).await
                {
                    Ok(response) => SyncEvent::Recovered {
                        recovered_updates: response.recovered_updates,
                    },
                    Err(err) => {
                        tracing::warn!(task_id = %task_id, error = %err, "recovery request failed");
                        SyncEvent::RecoveryFailed {
                            error: err.to_string(),
                        }
                    }
                };
                let _ = tx.send(event);
            }));
        }

        emit_event(
            Level::INFO,
            ProcessKind::Client,
            ObservabilityEvent {
                event: "sync.open",
                component: "sync",
                task_id: Some(&self.task_id),
                connection_id: Some(&connection_id),
                ..Default::default()
            },
        );
        self.connection_id = Some(connection_id);
        self.inbox = Some(rx);
        Ok(())
    }

    /// Next observed event. Task envelopes are applied to the store and
    /// advance the watermark before they are returned. `None` once closed.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        let event = self.inbox.as_mut()?.recv().await?;
        if let SyncEvent::Envelope(envelope) = &event {
            if envelope.is_task_event() && envelope.task_id() == Some(self.task_id.as_str()) {
                self.store.apply_envelope(envelope);
                self.watermark.advance(envelope.sequence, envelope.timestamp);
            }
        }
        Some(event)
    }

    /// Drops the push connection and any pending recovery request.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(recovery) = self.recovery.take() {
            recovery.abort();
        }
        self.inbox = None;
        self.connection_id = None;
    }

    /// Pull-based catch-up: fetches updates past the watermark and applies
    /// them locally. Returns the number of updates applied.
    pub async fn backfill(&mut self) -> Result<usize, SyncError> {
        let url = format!("{}/recovery/{}", self.base_url, self.task_id);
        let response = self
            .http
            .get(url)
            .query(&[
                ("sinceSequence", self.watermark.last_sequence),
                ("sinceTimestamp", self.watermark.last_timestamp),
            ])
            .send()
            .await?;
        let since: UpdatesSinceResponse = decode(check_status(response).await?).await?;
        let mut applied = 0;
        for update in &since.updates {
            let envelope = Envelope::replay_of(update);
            if self.store.apply_envelope(&envelope) {
                applied += 1;
            }
            self.watermark.advance(envelope.sequence, envelope.timestamp);
        }
        Ok(applied)
    }

    /// Polls the engine status and folds it into the local task.
    pub async fn reconcile_status(&mut self) -> Result<WorkflowStatusResponse, SyncError> {
        let url = format!("{}/workflow/{}", self.base_url, self.task_id);
        let response = self.http.get(url).send().await?;
        let status: WorkflowStatusResponse = decode(check_status(response).await?).await?;
        self.store
            .reconcile_workflow_status(&self.task_id, status.status);
        Ok(status)
    }

    /// Starts (or continues) the followed task's workflow with `prompt`.
    pub async fn start_workflow(
        &self,
        prompt: Option<&str>,
        token: &str,
        session_id: Option<&str>,
    ) -> Result<StartWorkflowResponse, SyncError> {
        let task = self
            .store
            .get(&self.task_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownTask(self.task_id.clone()))?;
        let request = StartWorkflowRequest {
            task,
            token: token.to_string(),
            session_id: session_id.map(str::to_string),
            prompt: prompt.map(str::to_string),
        };
        post_json(&self.http, &format!("{}/workflow", self.base_url), &request).await
    }
}

impl Drop for ClientSynchronizer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, SyncError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    body: &B,
) -> Result<T, SyncError> {
    let response = http.post(url).json(body).send().await?;
    decode(check_status(response).await?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use taskstream_core::{ScriptedAgent, ServerConfig};
    use taskstream_server::{serve_listener, AppState};
    use taskstream_types::{TaskMode, TaskStatus};
    use taskstream_wire::WorkflowRunState;
    use tokio::sync::oneshot;

    async fn spawn_server(agent: ScriptedAgent) -> (String, oneshot::Sender<()>) {
        let config = ServerConfig {
            replay_pacing_ms: 0,
            ..ServerConfig::default()
        };
        let state = AppState::new(config, Arc::new(agent));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(serve_listener(listener, state, async {
            let _ = stop_rx.await;
        }));
        (format!("http://{addr}"), stop_tx)
    }

    async fn settle(sync: &mut ClientSynchronizer) {
        for _ in 0..400 {
            let status = sync.reconcile_status().await.expect("status");
            if status.status != WorkflowRunState::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("workflow never settled");
    }

    #[tokio::test]
    async fn reconnect_with_watermark_recovers_missed_updates() {
        let (base_url, _stop) = spawn_server(ScriptedAgent::new(vec![
            "one".to_string(),
            "two".to_string(),
            "three".to_string(),
        ]))
        .await;
        let task = Task::new("Recover over the wire", TaskMode::Code);

        // run the whole task while no client is connected
        let mut runner = ClientSynchronizer::new(base_url.clone(), task.clone());
        runner.start_workflow(Some("go"), "ghp_x", None).await.expect("start");
        settle(&mut runner).await;

        let mut sync = ClientSynchronizer::new(base_url, task)
            .with_settle_delay(Duration::from_millis(50))
            .with_watermark(Watermark {
                last_sequence: 2,
                last_timestamp: 0,
            });
        sync.open().await.expect("open");

        let mut replayed = Vec::new();
        let mut recovered = None;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while recovered.is_none() || sync.watermark().last_sequence < 5 {
            let event = tokio::time::timeout_at(deadline, sync.next_event())
                .await
                .expect("events before deadline")
                .expect("open inbox");
            match event {
                SyncEvent::Envelope(envelope) if envelope.is_task_event() => {
                    assert!(envelope.is_recovery());
                    replayed.push(envelope.sequence);
                }
                SyncEvent::Recovered { recovered_updates } => recovered = Some(recovered_updates),
                SyncEvent::RecoveryFailed { error } => panic!("recovery failed: {error}"),
                _ => {}
            }
        }

        assert_eq!(recovered, Some(3));
        assert_eq!(replayed, vec![Some(3), Some(4), Some(5)]);
        assert_eq!(sync.watermark().last_sequence, 5);
        let local = sync.task().expect("task");
        assert_eq!(local.status, TaskStatus::Done);
        assert_eq!(local.last_sequence, Some(5));
    }

    #[tokio::test]
    async fn zero_watermark_skips_recovery_and_backfill_catches_up() {
        let (base_url, _stop) = spawn_server(ScriptedAgent::new(vec!["one".to_string()])).await;
        let task = Task::new("Pull me", TaskMode::Ask);
        let mut sync = ClientSynchronizer::new(base_url, task)
            .with_settle_delay(Duration::from_millis(10));

        sync.start_workflow(None, "", None).await.expect("start");
        settle(&mut sync).await;

        sync.open().await.expect("open");
        assert!(matches!(
            sync.next_event().await,
            Some(SyncEvent::Connected { .. })
        ));
        assert!(sync.recovery.is_none());

        let applied = sync.backfill().await.expect("backfill");
        assert!(applied >= 1);
        assert_eq!(sync.watermark().last_sequence, 3);
        assert_eq!(sync.task().map(|t| t.status), Some(TaskStatus::Done));
    }

    #[tokio::test]
    async fn unknown_task_surfaces_http_status() {
        let (base_url, _stop) = spawn_server(ScriptedAgent::default()).await;
        let mut sync = ClientSynchronizer::new(base_url, Task::new("ghost", TaskMode::Code));
        let err = sync.backfill().await.expect_err("404");
        assert!(matches!(err, SyncError::Status { status: 404, .. }));

        let status = sync.reconcile_status().await.expect("status");
        assert_eq!(status.status, WorkflowRunState::NotFound);
        assert_eq!(sync.task().map(|t| t.status), Some(TaskStatus::Done));
    }
}
