use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use taskstream_observability::{emit_event, ObservabilityEvent, ProcessKind};
use taskstream_types::now_ms;
use taskstream_wire::Envelope;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::Level;

use crate::hub::BroadcastHub;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// Serialized envelope, one per SSE `data:` frame.
    Event(String),
    Heartbeat,
}

/// Opens push subscriptions backed by hub sinks.
#[derive(Clone)]
pub struct Transport {
    hub: BroadcastHub,
    heartbeat: Duration,
    capacity: usize,
}

impl Transport {
    pub fn new(hub: BroadcastHub, heartbeat: Duration, capacity: usize) -> Self {
        Self {
            hub,
            heartbeat: heartbeat.max(Duration::from_secs(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn open(&self, connection_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let connected = Envelope::connected(connection_id, now_ms());
        if let Ok(frame) = serde_json::to_string(&connected) {
            let _ = tx.try_send(frame);
        }
        let token = self.hub.add(connection_id, Box::new(tx));
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "transport.opened",
                component: "transport",
                connection_id: Some(connection_id),
                ..Default::default()
            },
        );
        Subscription {
            hub: self.hub.clone(),
            connection_id: connection_id.to_string(),
            token,
            rx,
            heartbeat,
        }
    }
}

/// One live push channel. Dropping it deregisters the connection.
pub struct Subscription {
    hub: BroadcastHub,
    connection_id: String,
    token: u64,
    rx: mpsc::Receiver<String>,
    heartbeat: Interval,
}

impl Subscription {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl Stream for Subscription {
    type Item = TransportFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => return Poll::Ready(Some(TransportFrame::Event(frame))),
            // sender dropped: evicted or replaced
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }
        if this.heartbeat.poll_tick(cx).is_ready() {
            if !this.hub.contains(&this.connection_id) {
                return Poll::Ready(None);
            }
            return Poll::Ready(Some(TransportFrame::Heartbeat));
        }
        Poll::Pending
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let removed = self.hub.remove_if(&self.connection_id, self.token);
        emit_event(
            Level::INFO,
            ProcessKind::Server,
            ObservabilityEvent {
                event: "transport.closed",
                component: "transport",
                connection_id: Some(&self.connection_id),
                detail: (!removed).then_some("already evicted"),
                ..Default::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn decode(frame: TransportFrame) -> Envelope {
        match frame {
            TransportFrame::Event(raw) => serde_json::from_str(&raw).expect("envelope"),
            TransportFrame::Heartbeat => panic!("expected event, got heartbeat"),
        }
    }

    #[tokio::test]
    async fn first_frame_is_connected_event() {
        let transport = Transport::new(BroadcastHub::new(), Duration::from_secs(30), 8);
        let mut sub = transport.open("c1");
        let first = decode(sub.next().await.expect("frame"));
        assert_eq!(first.channel, "system");
        assert_eq!(first.data["type"], json!("connected"));
        assert_eq!(first.data["connectionId"], json!("c1"));
    }

    #[tokio::test]
    async fn broadcasts_flow_to_open_subscription() {
        let hub = BroadcastHub::new();
        let transport = Transport::new(hub.clone(), Duration::from_secs(30), 8);
        let mut sub = transport.open("c1");
        let _ = sub.next().await;
        hub.broadcast(&Envelope::new("tasks", "update", json!({"taskId": "t1"})));
        let envelope = decode(sub.next().await.expect("frame"));
        assert_eq!(envelope.task_id(), Some("t1"));
    }

    #[tokio::test]
    async fn drop_deregisters_synchronously() {
        let hub = BroadcastHub::new();
        let transport = Transport::new(hub.clone(), Duration::from_secs(30), 8);
        let sub = transport.open("c1");
        assert_eq!(hub.connection_count(), 1);
        drop(sub);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_on_interval() {
        let transport = Transport::new(BroadcastHub::new(), Duration::from_secs(30), 8);
        let mut sub = transport.open("c1");
        let _ = sub.next().await;
        assert_eq!(sub.next().await, Some(TransportFrame::Heartbeat));
    }

    #[tokio::test]
    async fn evicted_subscription_ends_after_draining() {
        let hub = BroadcastHub::new();
        let transport = Transport::new(hub.clone(), Duration::from_secs(30), 1);
        let mut sub = transport.open("c1");
        let report = hub.broadcast(&Envelope::new("tasks", "status", json!({})));
        assert_eq!(report.evicted, vec!["c1".to_string()]);
        assert!(matches!(sub.next().await, Some(TransportFrame::Event(_))));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn reopening_same_id_keeps_newest_registration() {
        let hub = BroadcastHub::new();
        let transport = Transport::new(hub.clone(), Duration::from_secs(30), 8);
        let old = transport.open("c1");
        let _new = transport.open("c1");
        drop(old);
        assert!(hub.contains("c1"));
    }
}
