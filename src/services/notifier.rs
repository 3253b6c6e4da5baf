use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::NotifierConfig;

/// Events pushed to connected clients after a booking commits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingEvent {
    BookingConfirmed {
        invoice_id: String,
        account_id: String,
        movie_show_id: i64,
        seat_ids: Vec<i64>,
        total_price: i64,
    },
    BookingCancelled {
        invoice_id: String,
        account_id: String,
        movie_show_id: i64,
        seat_ids: Vec<i64>,
        refund_amount: Option<i64>,
        actor: String,
    },
}

/// Fire-and-forget publisher. Implementations must not block the caller
/// and must never surface delivery failures.
pub trait Notifier: Send + Sync {
    fn publish(&self, event: BookingEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn publish(&self, event: BookingEvent) {
        debug!(?event, "notification hub not configured, event dropped");
    }
}

/// Keeps every published event; handy for asserting what a workflow emitted.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<BookingEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BookingEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, event: BookingEvent) {
        match self.events.lock() {
            Ok(mut guard) => guard.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// POSTs events as JSON to the hub on a spawned task, behind a circuit breaker.
#[derive(Clone)]
pub struct HubNotifier {
    client: reqwest::Client,
    url: String,
    breaker: Arc<CircuitBreaker>,
}

impl HubNotifier {
    pub fn new(url: impl Into<String>, config: &NotifierConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            breaker: Arc::new(CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.timeout_seconds),
            )),
        })
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn deliver(&self, event: &BookingEvent) -> Result<(), reqwest::Error> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Notifier for HubNotifier {
    fn publish(&self, event: BookingEvent) {
        if !self.breaker.can_execute() {
            warn!("notification hub circuit open, dropping event");
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            match this.deliver(&event).await {
                Ok(()) => this.breaker.record_success(),
                Err(e) => {
                    this.breaker.record_failure();
                    warn!("notification hub delivery failed: {}", e);
                }
            }
        });
    }
}
