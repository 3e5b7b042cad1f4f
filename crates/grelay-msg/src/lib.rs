//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Greeting event relay: codec, transports, producer and consumer."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
//! Event relay between the greeting producer and the queue consumer.
//!
//! The producer encodes a [`GreetingEvent`] into a single string and publishes
//! it through a [`TopicTransport`]. The topic fans out to a [`DurableQueue`],
//! which hands batches to the [`Consumer`] with at-least-once semantics.

pub mod consumer;
pub mod event;
pub mod generator;
pub mod metrics;
pub mod producer;
pub mod publisher;
pub mod queue;
#[cfg(feature = "sns")]
pub mod sns;
pub mod transport;

use thiserror::Error;

pub use consumer::{BatchReport, Consumer};
pub use event::{
    decode_event, encode_event, escape_field, unescape_field, DecodeError, EncodingError,
    GreetingEvent, Malformation,
};
pub use generator::{FixedGenerator, GreetingGenerator, LoremGenerator};
pub use metrics::RelayMetrics;
pub use producer::{GreetingBody, InvocationContext, Producer, ProducerResponse, ProxyRequest};
pub use publisher::Publisher;
pub use queue::{DurableQueue, MessageAttributes, QueueEvent, QueuePoller, QueuedMessage};
#[cfg(feature = "sns")]
pub use sns::SnsTransport;
pub use transport::{
    connect_transport, InMemoryTopics, MessageId, PublishError, TopicHandle, TopicTransport,
};

/// Errors raised while wiring or driving the relay outside a single request.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("transport backend {0} is not compiled into this build")]
    BackendDisabled(&'static str),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("invalid queue event: {0}")]
    InvalidEvent(#[from] serde_json::Error),
}

/// Parse a queue batch from its JSON event form.
pub fn parse_queue_event(json: &str) -> Result<QueueEvent, MessagingError> {
    Ok(serde_json::from_str(json)?)
}
