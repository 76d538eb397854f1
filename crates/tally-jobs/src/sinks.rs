//! Monitoring sinks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{error, info, warn};

use tally_core::defaults::WEBHOOK_TIMEOUT_SECS;
use tally_core::{Error, EventBus, EventEnvelope, MonitoringEvent, MonitoringSink, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the event type on webhook deliveries.
pub const EVENT_HEADER: &str = "X-Tally-Event";

/// Header carrying `sha256=<hex>` over the request body.
pub const SIGNATURE_HEADER: &str = "X-Tally-Signature";

/// Writes events to the log.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

#[async_trait]
impl MonitoringSink for TracingSink {
    async fn publish(&self, event: &MonitoringEvent) -> Result<()> {
        match event {
            MonitoringEvent::RunCompleted { run } => info!(
                subsystem = "monitoring",
                component = "tracing_sink",
                event_type = event.event_type(),
                run_id = %run.run_id,
                discovered = run.attachments_discovered,
                succeeded = run.attachments_succeeded,
                failed = run.attachments_failed,
                deduplicated = run.attachments_deduplicated,
                skipped = run.attachments_skipped,
                interrupted = run.attachments_interrupted,
                invoices = run.invoices_persisted,
                deadline_exceeded = run.deadline_exceeded,
                duration_ms = run.duration_ms().unwrap_or_default(),
                "Run completed"
            ),
            MonitoringEvent::RunFailed {
                run_id,
                error_kind,
                error,
            } => error!(
                subsystem = "monitoring",
                component = "tracing_sink",
                event_type = event.event_type(),
                run_id = %run_id,
                error_kind = %error_kind,
                error = %error,
                "Run failed"
            ),
            other => info!(
                subsystem = "monitoring",
                component = "tracing_sink",
                event_type = other.event_type(),
                run_id = %other.run_id(),
                "Pipeline event"
            ),
        }
        Ok(())
    }
}

/// Forwards events onto an in-process [`EventBus`].
#[derive(Clone)]
pub struct BroadcastSink {
    bus: EventBus,
}

impl BroadcastSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl MonitoringSink for BroadcastSink {
    async fn publish(&self, event: &MonitoringEvent) -> Result<()> {
        self.bus.emit(event.clone());
        Ok(())
    }
}

/// POSTs enveloped events as JSON, optionally HMAC-signed.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl MonitoringSink for WebhookSink {
    async fn publish(&self, event: &MonitoringEvent) -> Result<()> {
        let envelope = EventEnvelope::new(event.clone());
        let body = serde_json::to_vec(&envelope)?;

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, envelope.event_type.as_str());

        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, format!("sha256={}", sign(secret, &body)?));
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let message = format!("webhook returned {}: {}", status, text.trim());
        if status.as_u16() == 429 {
            Err(Error::RateLimited(message))
        } else if status.is_server_error() {
            Err(Error::Unavailable(message))
        } else {
            Err(Error::Request(message))
        }
    }
}

/// Publishes to several sinks; every sink is attempted.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MonitoringSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl MonitoringSink for FanoutSink {
    /// Returns the first error after all sinks have been tried.
    async fn publish(&self, event: &MonitoringEvent) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event).await {
                warn!(
                    subsystem = "monitoring",
                    component = "fanout_sink",
                    event_type = event.event_type(),
                    error = %e,
                    "Monitoring sink failed"
                );
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{ErrorKind, ProcessingRun, SearchIntent};
    use uuid::Uuid;

    #[test]
    fn test_sign_is_stable_hex() {
        let a = sign("secret", b"{}").unwrap();
        let b = sign("secret", b"{}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, sign("other", b"{}").unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_sink_emits_envelope() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let sink = BroadcastSink::new(bus);

        let mut run = ProcessingRun::start(SearchIntent::default());
        run.finish();
        sink.publish(&MonitoringEvent::RunCompleted { run: run.clone() })
            .await
            .unwrap();

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, "run.completed");
        assert_eq!(envelope.payload.run_id(), run.run_id);
    }

    struct FailingSink;

    #[async_trait]
    impl MonitoringSink for FailingSink {
        async fn publish(&self, _event: &MonitoringEvent) -> Result<()> {
            Err(Error::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_fanout_tries_every_sink() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let fanout = FanoutSink::new()
            .with(Arc::new(FailingSink))
            .with(Arc::new(BroadcastSink::new(bus)));

        let event = MonitoringEvent::RunFailed {
            run_id: Uuid::nil(),
            error_kind: ErrorKind::Transient,
            error: "mailbox down".into(),
        };
        let err = fanout.publish(&event).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(rx.recv().await.unwrap().event_type, "run.failed");
    }
}
