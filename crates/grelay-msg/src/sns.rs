//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Managed pub/sub topic transport."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use async_trait::async_trait;
use aws_sdk_sns::error::DisplayErrorContext;
use aws_sdk_sns::Client;
use tracing::info;

use crate::transport::{MessageId, PublishError, TopicHandle, TopicTransport};

/// Publishes to a managed topic addressed by ARN.
#[derive(Clone, Debug)]
pub struct SnsTransport {
    client: Client,
}

impl SnsTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient credentials and region.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        info!(region = ?config.region(), "sns client configured");
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl TopicTransport for SnsTransport {
    async fn send(&self, topic: &TopicHandle, body: &str) -> Result<MessageId, PublishError> {
        let output = self
            .client
            .publish()
            .topic_arn(topic.address())
            .message(body)
            .send()
            .await
            .map_err(|err| PublishError::Unavailable {
                transport: "sns",
                reason: DisplayErrorContext(&err).to_string(),
            })?;
        Ok(output
            .message_id()
            .map(MessageId::from)
            .unwrap_or_else(MessageId::random))
    }

    fn name(&self) -> &'static str {
        "sns"
    }
}
