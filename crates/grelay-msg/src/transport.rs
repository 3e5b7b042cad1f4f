//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Pub/sub topic transports."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use grelay_common::TransportBackend;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::queue::DurableQueue;
use crate::MessagingError;

/// Address of a pub/sub topic, e.g. an ARN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicHandle(String);

impl TopicHandle {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by the transport to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-level delivery failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("topic {topic} is not known to the {transport} transport")]
    UnknownTopic {
        topic: String,
        transport: &'static str,
    },
    #[error("{transport} transport rejected the message: {reason}")]
    Rejected {
        transport: &'static str,
        reason: String,
    },
    #[error("{transport} transport unavailable: {reason}")]
    Unavailable {
        transport: &'static str,
        reason: String,
    },
}

/// Delivers a message body to a topic. Implementations make one attempt per
/// call; retries are not their concern.
#[async_trait]
pub trait TopicTransport: Send + Sync {
    async fn send(&self, topic: &TopicHandle, body: &str) -> Result<MessageId, PublishError>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Local topics that fan every message out to their subscribed queues.
#[derive(Clone, Default)]
pub struct InMemoryTopics {
    topics: Arc<RwLock<HashMap<TopicHandle, Vec<DurableQueue>>>>,
}

impl InMemoryTopics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a topic with no subscribers. Declaring twice is a no-op.
    pub fn create(&self, topic: &TopicHandle) {
        self.topics.write().entry(topic.clone()).or_default();
    }

    /// Subscribe a queue to a topic, declaring the topic if needed.
    pub fn subscribe(&self, topic: &TopicHandle, queue: DurableQueue) {
        debug!(topic = %topic, queue = queue.name(), "queue subscribed");
        self.topics.write().entry(topic.clone()).or_default().push(queue);
    }

    pub fn subscribers(&self, topic: &TopicHandle) -> usize {
        self.topics.read().get(topic).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl TopicTransport for InMemoryTopics {
    async fn send(&self, topic: &TopicHandle, body: &str) -> Result<MessageId, PublishError> {
        let topics = self.topics.read();
        let queues = topics.get(topic).ok_or_else(|| PublishError::UnknownTopic {
            topic: topic.to_string(),
            transport: "in_memory",
        })?;
        for queue in queues {
            queue.send(body);
        }
        Ok(MessageId::random())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

impl fmt::Debug for InMemoryTopics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTopics")
            .field("topics", &self.topics.read().len())
            .finish()
    }
}

/// Build the transport selected by configuration. Called once at startup; the
/// returned handle is shared by every invocation.
pub async fn connect_transport(
    backend: TransportBackend,
    local: &InMemoryTopics,
) -> Result<Arc<dyn TopicTransport>, MessagingError> {
    match backend {
        TransportBackend::InMemory => Ok(Arc::new(local.clone())),
        #[cfg(feature = "sns")]
        TransportBackend::Sns => Ok(Arc::new(crate::sns::SnsTransport::from_env().await)),
        #[cfg(not(feature = "sns"))]
        TransportBackend::Sns => Err(MessagingError::BackendDisabled("sns")),
    }
}
