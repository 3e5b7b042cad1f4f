//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Durable queue bridge between topic and consumer."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
//! Local stand-in for the managed queue that sits between the topic and the
//! consumer. It keeps the managed queue's contract: delivery is at least once,
//! a received message stays hidden for the visibility timeout and comes back
//! if it is not acknowledged, and redelivered messages rejoin at the back, so
//! order is not preserved.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::consumer::{BatchReport, Consumer};

/// Envelope handed to the consumer. Field names follow the queue's event
/// record shape so batches can be read straight from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub message_id: String,
    #[serde(default)]
    pub receipt_handle: String,
    pub body: String,
    #[serde(default)]
    pub attributes: MessageAttributes,
}

impl QueuedMessage {
    /// Wrap a bare body, as a first delivery.
    pub fn from_body(body: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            receipt_handle: String::new(),
            body: body.into(),
            attributes: MessageAttributes::default(),
        }
    }

    /// How many times the queue has handed this message out, 1 for the first delivery.
    pub fn receive_count(&self) -> u32 {
        self.attributes
            .approximate_receive_count
            .as_deref()
            .and_then(|count| count.parse().ok())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MessageAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_receive_count: Option<String>,
}

/// A batch as delivered to the consumer function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<QueuedMessage>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
}

/// In-memory durable queue with visibility-timeout redelivery.
#[derive(Clone, Debug)]
pub struct DurableQueue {
    name: Arc<str>,
    visibility_timeout: Duration,
    state: Arc<Mutex<QueueState>>,
}

impl DurableQueue {
    pub fn new(name: &str, visibility_timeout: Duration) -> Self {
        Self {
            name: Arc::from(name),
            visibility_timeout,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store a message body and return its queue message id.
    pub fn send(&self, body: &str) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.state.lock().visible.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.to_owned(),
            receive_count: 0,
        });
        message_id
    }

    /// Hand out up to `max` messages, hiding them until acknowledged or until
    /// the visibility timeout lapses.
    pub fn receive(&self, max: usize) -> Vec<QueuedMessage> {
        self.receive_at(max, Instant::now())
    }

    fn receive_at(&self, max: usize, now: Instant) -> Vec<QueuedMessage> {
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(entry) = state.in_flight.remove(&receipt) {
                debug!(
                    queue = %self.name,
                    message_id = %entry.message.message_id,
                    "visibility timeout lapsed; message visible again"
                );
                state.visible.push_back(entry.message);
            }
        }

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(mut message) = state.visible.pop_front() else {
                break;
            };
            message.receive_count += 1;
            let receipt = Uuid::new_v4().to_string();
            batch.push(QueuedMessage {
                message_id: message.message_id.clone(),
                receipt_handle: receipt.clone(),
                body: message.body.clone(),
                attributes: MessageAttributes {
                    approximate_receive_count: Some(message.receive_count.to_string()),
                },
            });
            state.in_flight.insert(
                receipt,
                InFlight {
                    message,
                    visible_at: now + self.visibility_timeout,
                },
            );
        }
        batch
    }

    /// Delete a received message. Returns `false` for unknown or stale receipts.
    pub fn acknowledge(&self, receipt_handle: &str) -> bool {
        self.state.lock().in_flight.remove(receipt_handle).is_some()
    }

    pub fn visible_len(&self) -> usize {
        self.state.lock().visible.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

/// Drives the consumer from a queue: receive a batch, process it, delete it.
pub struct QueuePoller {
    queue: DurableQueue,
    consumer: Arc<Consumer>,
    batch_size: usize,
    poll_interval: Duration,
}

impl QueuePoller {
    pub fn new(
        queue: DurableQueue,
        consumer: Arc<Consumer>,
        batch_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            consumer,
            batch_size: batch_size.max(1),
            poll_interval,
        }
    }

    /// Process one batch. The consumer never fails a batch, so every message
    /// handed out is acknowledged afterwards.
    pub fn poll_once(&self) -> BatchReport {
        let batch = self.queue.receive(self.batch_size);
        if batch.is_empty() {
            return BatchReport::default();
        }
        let report = self.consumer.process_batch(&batch);
        for message in &batch {
            self.queue.acknowledge(&message.receipt_handle);
        }
        report
    }

    /// Poll until `shutdown` fires, draining the queue between ticks.
    pub async fn run(self, mut shutdown: oneshot::Receiver<()>) -> BatchReport {
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut totals = BatchReport::default();
        info!(queue = self.queue.name(), batch_size = self.batch_size, "queue poller started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    loop {
                        let report = self.poll_once();
                        if report.total() == 0 {
                            break;
                        }
                        totals += report;
                    }
                }
            }
        }
        info!(
            queue = self.queue.name(),
            decoded = totals.decoded,
            malformed = totals.malformed,
            "queue poller stopped"
        );
        totals
    }
}
