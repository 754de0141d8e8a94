//! Cluster-wide work queue
//!
//! An optional dispatch path: instead of (or alongside) polling the journal
//! for recoverable flights, an engine instance can publish a `READY`
//! envelope to a shared queue whenever a flight becomes eligible to run, and
//! every engine instance in the cluster runs a listener loop that pulls
//! envelopes and races to claim the named flight. Claiming always goes
//! through [`crate::journal::Journal::claim_owner`] — the queue only
//! *deflects* engines toward work, it never itself grants ownership, so a
//! message delivered twice (or to two listeners) is harmless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Cap on how many envelopes one listener pulls per loop iteration, so a
/// single engine instance cannot starve its peers of a backlog.
pub const MAX_MESSAGES_PER_PULL: usize = 2;

/// How long the listener sleeps after an empty pull before trying again.
pub const NO_PULL_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("ack failed: {0}")]
    Ack(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Versioned envelope published whenever a flight becomes eligible to run.
/// `version` lets a rolling upgrade add fields without breaking older
/// listeners, which should ignore unknown envelope shapes rather than crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    Ready {
        version: u32,
        flight_id: String,
        class_name: String,
    },
}

impl QueueMessage {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn ready(flight_id: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self::Ready {
            version: Self::CURRENT_VERSION,
            flight_id: flight_id.into(),
            class_name: class_name.into(),
        }
    }

    pub fn encode(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(|e| QueueError::Malformed(e.to_string()))
    }

    pub fn decode(payload: &str) -> Result<Self, QueueError> {
        serde_json::from_str(payload).map_err(|e| QueueError::Malformed(e.to_string()))
    }
}

/// A received message plus the token needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub payload: String,
    pub ack_token: String,
}

/// Transport abstraction for the work queue. Implementations need only
/// at-least-once delivery semantics; exactly-once is achieved above this
/// layer via `claim_owner`.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn send(&self, payload: String) -> Result<(), QueueError>;

    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn ack(&self, ack_token: &str) -> Result<(), QueueError>;

    /// Discard every pending envelope. Used by `initialize(forceClean)` to
    /// guarantee a clean cluster-wide slate alongside the journal reset;
    /// messages already in flight to a listener are unaffected.
    async fn purge(&self) -> Result<(), QueueError>;
}

/// In-process `QueueTransport` for tests and single-binary demos. Delivery
/// order is FIFO and `ack` simply drops the message; a message that is
/// received but never acked is lost, which is fine for a test double but not
/// for a production transport.
#[derive(Default)]
pub struct InMemoryQueueTransport {
    queue: Mutex<std::collections::VecDeque<(String, String)>>,
}

impl InMemoryQueueTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueueTransport {
    async fn send(&self, payload: String) -> Result<(), QueueError> {
        let token = uuid::Uuid::now_v7().to_string();
        self.queue.lock().await.push_back((token, payload));
        Ok(())
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut queue = self.queue.lock().await;
        let mut out = Vec::new();
        for _ in 0..max_messages {
            let Some((ack_token, payload)) = queue.pop_front() else {
                break;
            };
            out.push(ReceivedMessage { payload, ack_token });
        }
        Ok(out)
    }

    async fn ack(&self, _ack_token: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.queue.lock().await.clear();
        Ok(())
    }
}

/// Outcome of offering a claimed-looking flight to the caller's admission
/// gate, returned by the closure passed to [`WorkQueueManager::run_listener`].
pub type AdmitFn = Arc<dyn Fn(String, String) -> BoxFuture<'static, bool> + Send + Sync>;

/// Reports whether the engine currently has room to run another flight.
/// Consulted before every pull so a full engine leaves envelopes for its
/// peers instead of pulling them only to immediately decline via `admit`.
pub type CapacityFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Publishes `READY` envelopes and runs the listener loop that pulls them.
pub struct WorkQueueManager {
    transport: Arc<dyn QueueTransport>,
}

impl WorkQueueManager {
    pub fn new(transport: Arc<dyn QueueTransport>) -> Self {
        Self { transport }
    }

    /// Publish that a flight has become eligible to run.
    pub async fn enqueue_ready(
        &self,
        flight_id: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Result<(), QueueError> {
        let message = QueueMessage::ready(flight_id, class_name);
        self.transport.send(message.encode()?).await
    }

    /// Discard every pending envelope in the underlying transport.
    pub async fn purge(&self) -> Result<(), QueueError> {
        self.transport.purge().await
    }

    /// Pull and dispatch envelopes until `cancellation` fires. Each
    /// iteration first consults `has_capacity`; with no room to run another
    /// flight it sleeps `NO_PULL_SLEEP` without pulling, leaving envelopes
    /// for peers instead of pulling them only to decline via `admit`. `admit`
    /// is offered `(flight_id, class_name)` for every `Ready` envelope and
    /// decides whether to attempt `claim_owner`; envelopes are acked
    /// regardless of the admission outcome, since a rejected or lost claim
    /// just means the flight is picked up on the next recovery scan or by
    /// another listener.
    pub async fn run_listener(
        &self,
        cancellation: CancellationToken,
        admit: AdmitFn,
        has_capacity: CapacityFn,
    ) {
        loop {
            if cancellation.is_cancelled() {
                return;
            }

            if !has_capacity() {
                tokio::select! {
                    _ = tokio::time::sleep(NO_PULL_SLEEP) => {}
                    _ = cancellation.cancelled() => return,
                }
                continue;
            }

            let messages = match self.transport.receive(MAX_MESSAGES_PER_PULL).await {
                Ok(messages) => messages,
                Err(err) => {
                    tracing::warn!(error = %err, "queue receive failed");
                    Vec::new()
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(NO_PULL_SLEEP) => {}
                    _ = cancellation.cancelled() => return,
                }
                continue;
            }

            for message in messages {
                match QueueMessage::decode(&message.payload) {
                    Ok(QueueMessage::Ready {
                        flight_id,
                        class_name,
                        ..
                    }) => {
                        admit(flight_id, class_name).await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping malformed queue envelope");
                    }
                }
                if let Err(err) = self.transport.ack(&message.ack_token).await {
                    tracing::warn!(error = %err, "queue ack failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn enqueue_then_receive_round_trips() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let manager = WorkQueueManager::new(transport.clone());
        manager.enqueue_ready("f1", "OrderFlight").await.unwrap();

        let received = transport.receive(MAX_MESSAGES_PER_PULL).await.unwrap();
        assert_eq!(received.len(), 1);
        let decoded = QueueMessage::decode(&received[0].payload).unwrap();
        match decoded {
            QueueMessage::Ready { flight_id, class_name, version } => {
                assert_eq!(flight_id, "f1");
                assert_eq!(class_name, "OrderFlight");
                assert_eq!(version, QueueMessage::CURRENT_VERSION);
            }
        }
    }

    #[tokio::test]
    async fn receive_respects_max_messages_per_pull() {
        let transport = InMemoryQueueTransport::new();
        for i in 0..5 {
            transport
                .send(QueueMessage::ready(format!("f{i}"), "X").encode().unwrap())
                .await
                .unwrap();
        }
        let first = transport.receive(MAX_MESSAGES_PER_PULL).await.unwrap();
        assert_eq!(first.len(), MAX_MESSAGES_PER_PULL);
    }

    #[tokio::test]
    async fn purge_drops_pending_messages() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let manager = WorkQueueManager::new(transport.clone());
        manager.enqueue_ready("f1", "OrderFlight").await.unwrap();
        manager.enqueue_ready("f2", "OrderFlight").await.unwrap();

        manager.purge().await.unwrap();

        let received = transport.receive(MAX_MESSAGES_PER_PULL).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn run_listener_dispatches_then_stops_on_cancellation() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let manager = WorkQueueManager::new(transport.clone());
        manager.enqueue_ready("f1", "OrderFlight").await.unwrap();

        let admitted = Arc::new(AtomicUsize::new(0));
        let admitted_for_closure = admitted.clone();
        let admit: AdmitFn = Arc::new(move |_flight_id, _class_name| {
            let admitted = admitted_for_closure.clone();
            Box::pin(async move {
                admitted.fetch_add(1, Ordering::SeqCst);
                true
            })
        });

        let cancellation = CancellationToken::new();
        let cancellation_for_listener = cancellation.clone();
        let has_capacity: CapacityFn = Arc::new(|| true);
        let listener = tokio::spawn(async move {
            manager
                .run_listener(cancellation_for_listener, admit, has_capacity)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancellation.cancel();
        listener.await.unwrap();

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_listener_sleeps_without_pulling_when_at_capacity() {
        let transport = Arc::new(InMemoryQueueTransport::new());
        let manager = WorkQueueManager::new(transport.clone());
        manager.enqueue_ready("f1", "OrderFlight").await.unwrap();

        let admitted = Arc::new(AtomicUsize::new(0));
        let admitted_for_closure = admitted.clone();
        let admit: AdmitFn = Arc::new(move |_flight_id, _class_name| {
            let admitted = admitted_for_closure.clone();
            Box::pin(async move {
                admitted.fetch_add(1, Ordering::SeqCst);
                true
            })
        });
        let has_capacity: CapacityFn = Arc::new(|| false);

        let cancellation = CancellationToken::new();
        let cancellation_for_listener = cancellation.clone();
        let listener = tokio::spawn(async move {
            manager
                .run_listener(cancellation_for_listener, admit, has_capacity)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancellation.cancel();
        listener.await.unwrap();

        assert_eq!(admitted.load(Ordering::SeqCst), 0);
        let remaining = transport.receive(MAX_MESSAGES_PER_PULL).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
