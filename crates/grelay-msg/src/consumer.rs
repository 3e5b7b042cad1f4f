//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Queue consumer that decodes and logs greeting events."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::borrow::Cow;
use std::ops::AddAssign;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::event::{decode_event, DecodeError, GreetingEvent};
use crate::metrics::RelayMetrics;
use crate::queue::QueuedMessage;

/// Outcome counts for one processed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub decoded: usize,
    pub malformed: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.decoded + self.malformed
    }
}

impl AddAssign for BatchReport {
    fn add_assign(&mut self, other: Self) {
        self.decoded += other.decoded;
        self.malformed += other.malformed;
    }
}

// Topic notification wrapper, present when the subscription does not use raw
// message delivery.
#[derive(Deserialize)]
struct Notification {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Message")]
    message: String,
}

/// Decodes queued greeting events and records them in the log.
///
/// A malformed record is logged with its raw body and counted; it never
/// stops the rest of the batch, and the batch as a whole always succeeds.
#[derive(Debug, Default)]
pub struct Consumer {
    metrics: Option<RelayMetrics>,
}

impl Consumer {
    pub fn new(metrics: Option<RelayMetrics>) -> Self {
        Self { metrics }
    }

    pub fn process_batch(&self, batch: &[QueuedMessage]) -> BatchReport {
        let mut report = BatchReport::default();
        for message in batch {
            match self.process_message(message) {
                Ok(_) => report.decoded += 1,
                Err(_) => report.malformed += 1,
            }
        }
        if !batch.is_empty() {
            info!(
                records = batch.len(),
                decoded = report.decoded,
                malformed = report.malformed,
                "batch processed"
            );
        }
        report
    }

    pub fn process_message(&self, message: &QueuedMessage) -> Result<GreetingEvent, DecodeError> {
        let receive_count = message.receive_count();
        if receive_count > 1 {
            warn!(message_id = %message.message_id, receive_count, "message redelivered");
            if let Some(metrics) = &self.metrics {
                metrics.observe_redelivery();
            }
        }

        let body = unwrap_notification(&message.body);
        match decode_event(&body) {
            Ok(event) => {
                info!(
                    message_id = %message.message_id,
                    greeting = %event.text,
                    visitor_ip = event.origin().unwrap_or("unknown"),
                    receive_count,
                    "received greeting"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.observe_decoded();
                }
                Ok(event)
            }
            Err(err) => {
                error!(
                    message_id = %message.message_id,
                    raw_body = %message.body,
                    reason = %err.reason(),
                    "failed to decode message body"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.observe_malformed();
                }
                Err(err)
            }
        }
    }
}

fn unwrap_notification(body: &str) -> Cow<'_, str> {
    if body.trim_start().starts_with('{') {
        if let Ok(notification) = serde_json::from_str::<Notification>(body) {
            if notification.kind == "Notification" {
                return Cow::Owned(notification.message);
            }
        }
    }
    Cow::Borrowed(body)
}
