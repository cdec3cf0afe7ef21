//! Membership side-effect events
//!
//! Fire-and-forget: producers never wait and never learn whether an event
//! was handled. A full channel drops the event.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::RELAY_EVENTS_TOTAL;

/// Something worth telling an operator about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Follow { domain: String, collection: &'static str },
    Unfollow { domain: String },
    PendingRequest { domain: String },
    Accepted { domain: String },
    Rejected { domain: String, reason: String },
    Blocked { domain: String },
}

impl RelayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayEvent::Follow { .. } => "follow",
            RelayEvent::Unfollow { .. } => "unfollow",
            RelayEvent::PendingRequest { .. } => "pending_request",
            RelayEvent::Accepted { .. } => "accepted",
            RelayEvent::Rejected { .. } => "rejected",
            RelayEvent::Blocked { .. } => "blocked",
        }
    }
}

/// Cloneable submission handle
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RelayEvent>,
}

impl EventSink {
    /// Spawn the background consumer and return a handle to feed it.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RelayEvent>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                RELAY_EVENTS_TOTAL.with_label_values(&[event.kind()]).inc();
                match &event {
                    RelayEvent::Rejected { domain, reason } => {
                        tracing::info!(%domain, %reason, "Rejected follow request")
                    }
                    RelayEvent::Follow { domain, collection } => {
                        tracing::info!(%domain, %collection, "New relay member")
                    }
                    other => tracing::info!(event = ?other, "Relay event"),
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Sink whose events go straight to the returned receiver.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: RelayEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::debug!(error = %e, "Relay event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_never_blocks_when_full() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(RelayEvent::Blocked {
            domain: "a.example".to_string(),
        });
        sink.emit(RelayEvent::Blocked {
            domain: "b.example".to_string(),
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), "blocked");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn spawned_consumer_drains_events() {
        let (sink, handle) = EventSink::spawn(8);
        sink.emit(RelayEvent::Unfollow {
            domain: "a.example".to_string(),
        });
        drop(sink);
        handle.await.unwrap();
    }
}
