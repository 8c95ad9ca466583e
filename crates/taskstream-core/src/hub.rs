use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use taskstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskstream_wire::Envelope;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::Level;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink buffer full")]
    Full,
    #[error("sink closed")]
    Closed,
}

/// Write side of one live connection. Writes must not block.
pub trait OutputSink: Send + Sync {
    fn write(&self, frame: &str) -> Result<(), SinkError>;
}

impl OutputSink for mpsc::Sender<String> {
    fn write(&self, frame: &str) -> Result<(), SinkError> {
        self.try_send(frame.to_string()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// Where the orchestrator sends envelopes for live delivery.
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<BroadcastReport, PublishError>;
}

struct Registration {
    token: u64,
    sink: Box<dyn OutputSink>,
}

/// Fan-out registry of live connections. Delivery is best effort: a sink
/// that rejects a write is dropped from the registry and never retried.
#[derive(Clone, Default)]
pub struct BroadcastHub {
    connections: Arc<RwLock<HashMap<String, Registration>>>,
    next_token: Arc<AtomicU64>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sink, replacing any sink already held under the same id.
    /// The returned token identifies this registration for [`Self::remove_if`].
    pub fn add(&self, connection_id: &str, sink: Box<dyn OutputSink>) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let replaced = self
            .connections
            .write()
            .insert(connection_id.to_string(), Registration { token, sink })
            .is_some();
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "hub.connection.added",
                component: "hub",
                connection_id: Some(connection_id),
                detail: replaced.then_some("replaced existing sink"),
                ..Default::default()
            },
        );
        token
    }

    pub fn remove(&self, connection_id: &str) -> bool {
        self.connections.write().remove(connection_id).is_some()
    }

    /// Removes the sink only if it is still the registration identified by `token`.
    pub fn remove_if(&self, connection_id: &str, token: u64) -> bool {
        let mut guard = self.connections.write();
        if guard.get(connection_id).map(|r| r.token) != Some(token) {
            return false;
        }
        guard.remove(connection_id);
        true
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.read().contains_key(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn clear(&self) {
        self.connections.write().clear();
    }

    pub fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let frame = match serde_json::to_string(envelope) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(topic = %envelope.topic, error = %err, "dropping unencodable envelope");
                return BroadcastReport::default();
            }
        };
        self.broadcast_frame(&frame)
    }

    fn broadcast_frame(&self, frame: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut guard = self.connections.write();
        guard.retain(|connection_id, registration| match registration.sink.write(frame) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(err) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %err,
                    "evicting connection after failed write"
                );
                report.evicted.push(connection_id.clone());
                false
            }
        });
        report
    }
}

#[async_trait]
impl UpdatePublisher for BroadcastHub {
    async fn publish(&self, envelope: &Envelope) -> Result<BroadcastReport, PublishError> {
        let frame =
            serde_json::to_string(envelope).map_err(|e| PublishError::Encode(e.to_string()))?;
        Ok(self.broadcast_frame(&frame))
    }
}
