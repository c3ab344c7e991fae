use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::JobError;
use crate::job::{RequestId, WorkerId};
use crate::protocol::Envelope;

/// Metadata attached to every dispatcher event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Event surfaced by a dispatcher to its host.
#[derive(Clone, Debug)]
pub struct DispatchEvent {
    pub meta: EventMeta,
    pub payload: DispatchEventPayload,
}

/// What happened.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DispatchEventPayload {
    /// A non-error envelope from the worker: results and progress messages.
    Response(Envelope),
    /// An error envelope for one job.
    Error(Envelope),
    /// The top-level worker itself failed. Error envelopes for each job it
    /// was holding follow this event.
    WorkerFailed { worker_id: WorkerId, error: JobError },
}

impl DispatchEvent {
    pub fn new(payload: DispatchEventPayload) -> Self {
        Self {
            meta: EventMeta::new(),
            payload,
        }
    }

    /// Classify an envelope coming out of the worker.
    pub fn from_envelope(envelope: Envelope) -> Self {
        let payload = match envelope {
            envelope @ Envelope::Error { .. } => DispatchEventPayload::Error(envelope),
            envelope => DispatchEventPayload::Response(envelope),
        };
        Self::new(payload)
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match &self.payload {
            DispatchEventPayload::Response(envelope) | DispatchEventPayload::Error(envelope) => {
                Some(envelope)
            }
            DispatchEventPayload::WorkerFailed { .. } => None,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.envelope().map(Envelope::request_id)
    }

    /// Whether this event ends the job identified by `request_id`.
    pub fn is_terminal_for(&self, request_id: &RequestId) -> bool {
        self.envelope()
            .is_some_and(|envelope| envelope.is_terminal() && envelope.request_id() == request_id)
    }

    /// The terminal outcome this event carries for `request_id`, if any.
    pub fn outcome_for(&self, request_id: &RequestId) -> Option<Result<Value, JobError>> {
        match self.envelope()? {
            Envelope::Result { request_id: id, data } if id == request_id => Some(Ok(data.clone())),
            Envelope::Error { request_id: id, error } if id == request_id => Some(Err(error.clone())),
            _ => None,
        }
    }
}

/// In-process fan-out of dispatcher events over a tokio broadcast channel.
///
/// Publishing never waits on subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Publish to all current subscribers. Dropped silently when nobody listens.
    pub fn publish(&self, event: DispatchEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
