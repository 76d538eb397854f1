//! Monitoring event types, envelope, and the in-process event bus.
//!
//! The run controller reports exactly one summary event per run
//! ([`MonitoringEvent::RunCompleted`] or [`MonitoringEvent::RunFailed`]) to its
//! monitoring sink. Finer-grained progress events (run started, attachment
//! finished) go to an optional [`EventBus`] so dashboards can follow along
//! without the sink seeing more than one message per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::{ProcessingRun, SearchIntent};

/// Events emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitoringEvent {
    /// A run began searching the mailbox.
    RunStarted {
        run_id: Uuid,
        search_intent: SearchIntent,
    },
    /// An attachment finished its pipeline with persisted invoices (possibly zero).
    AttachmentCompleted {
        run_id: Uuid,
        attachment_record_id: Uuid,
        attachment_name: String,
        invoices: usize,
    },
    /// An attachment failed; the run continues.
    AttachmentFailed {
        run_id: Uuid,
        attachment_record_id: Option<Uuid>,
        attachment_name: String,
        error_kind: ErrorKind,
        error: String,
    },
    /// Run summary, published once per run.
    RunCompleted { run: ProcessingRun },
    /// The run could not proceed (mailbox search failed).
    RunFailed {
        run_id: Uuid,
        error_kind: ErrorKind,
        error: String,
    },
}

impl MonitoringEvent {
    /// Dot-namespaced event type, e.g. `"run.completed"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            MonitoringEvent::RunStarted { .. } => "run.started",
            MonitoringEvent::AttachmentCompleted { .. } => "attachment.completed",
            MonitoringEvent::AttachmentFailed { .. } => "attachment.failed",
            MonitoringEvent::RunCompleted { .. } => "run.completed",
            MonitoringEvent::RunFailed { .. } => "run.failed",
        }
    }

    /// Run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            MonitoringEvent::RunStarted { run_id, .. }
            | MonitoringEvent::AttachmentCompleted { run_id, .. }
            | MonitoringEvent::AttachmentFailed { run_id, .. }
            | MonitoringEvent::RunFailed { run_id, .. } => *run_id,
            MonitoringEvent::RunCompleted { run } => run.run_id,
        }
    }
}

/// Versioned wrapper carrying delivery metadata around a [`MonitoringEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7).
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// Starts at 1; bumped on breaking payload changes.
    pub payload_version: u32,
    pub payload: MonitoringEvent,
}

impl EventEnvelope {
    pub fn new(payload: MonitoringEvent) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            event_type: payload.event_type().to_string(),
            occurred_at: Utc::now(),
            payload_version: 1,
            payload,
        }
    }
}

/// Broadcast bus for monitoring events.
///
/// Cloning is cheap; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Dropped silently if nobody listens.
    pub fn emit(&self, event: MonitoringEvent) {
        let envelope = EventEnvelope::new(event);
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to enveloped events.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
