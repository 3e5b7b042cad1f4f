//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Single-attempt publisher over a topic transport."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::metrics::RelayMetrics;
use crate::transport::{MessageId, PublishError, TopicHandle, TopicTransport};

/// Publishes message bodies to a topic. One attempt per call; failures are
/// returned to the caller unchanged.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn TopicTransport>,
    metrics: Option<RelayMetrics>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn TopicTransport>) -> Self {
        Self {
            transport,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub async fn publish(
        &self,
        topic: &TopicHandle,
        message: &str,
    ) -> Result<MessageId, PublishError> {
        match self.transport.send(topic, message).await {
            Ok(message_id) => {
                debug!(
                    topic = %topic,
                    transport = self.transport.name(),
                    message_id = %message_id,
                    "message published"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.observe_published();
                }
                Ok(message_id)
            }
            Err(err) => {
                warn!(topic = %topic, transport = self.transport.name(), error = %err, "publish failed");
                if let Some(metrics) = &self.metrics {
                    metrics.observe_publish_failure();
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}
