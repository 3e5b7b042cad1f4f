//! ---
//! grelay_section: "02-messaging-event-model"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Request handler that generates and publishes greetings."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::event::{encode_event, GreetingEvent};
use crate::generator::GreetingGenerator;
use crate::publisher::Publisher;
use crate::transport::TopicHandle;

/// Request metadata available to the producer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationContext {
    pub origin_id: Option<String>,
}

impl InvocationContext {
    pub fn with_origin(origin: impl Into<String>) -> Self {
        Self {
            origin_id: Some(origin.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Subset of an HTTP proxy integration event the producer reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    #[serde(default)]
    pub request_context: Option<RequestContext>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub identity: Option<RequestIdentity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestIdentity {
    #[serde(default)]
    pub source_ip: Option<String>,
}

impl From<ProxyRequest> for InvocationContext {
    fn from(request: ProxyRequest) -> Self {
        let origin_id = request
            .request_context
            .and_then(|context| context.identity)
            .and_then(|identity| identity.source_ip);
        Self { origin_id }
    }
}

/// Proxy-integration response returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerResponse {
    pub status_code: u16,
    /// JSON document `{"message": ..., "ip": ...}`; `ip` is omitted when unknown.
    pub body: String,
}

/// Decoded form of [`ProducerResponse::body`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetingBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl ProducerResponse {
    fn ok(event: &GreetingEvent) -> Self {
        let mut body = Map::new();
        body.insert("message".to_owned(), Value::String(event.text.clone()));
        if let Some(origin) = event.origin() {
            body.insert("ip".to_owned(), Value::String(origin.to_owned()));
        }
        Self {
            status_code: 200,
            body: Value::Object(body).to_string(),
        }
    }

    pub fn greeting(&self) -> Result<GreetingBody, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Generates a greeting per request and publishes it fire-and-forget.
///
/// The response never depends on the publish outcome: delivery failures are
/// logged and swallowed, so the caller always gets its greeting back.
#[derive(Clone)]
pub struct Producer {
    generator: Arc<dyn GreetingGenerator>,
    publisher: Publisher,
    topic: TopicHandle,
}

impl Producer {
    pub fn new(
        generator: Arc<dyn GreetingGenerator>,
        publisher: Publisher,
        topic: TopicHandle,
    ) -> Self {
        Self {
            generator,
            publisher,
            topic,
        }
    }

    pub fn topic(&self) -> &TopicHandle {
        &self.topic
    }

    pub async fn handle(&self, context: InvocationContext) -> ProducerResponse {
        let event = GreetingEvent::new(self.generator.sentence(), context.origin_id);
        info!(
            greeting = %event.text,
            visitor_ip = event.origin().unwrap_or("unknown"),
            "greeting generated"
        );

        match encode_event(&event) {
            Ok(serialized) => match self.publisher.publish(&self.topic, &serialized).await {
                Ok(message_id) => {
                    info!(topic = %self.topic, message_id = %message_id, "greeting published")
                }
                Err(err) => error!(topic = %self.topic, error = %err, "error publishing greeting"),
            },
            Err(err) => error!(error = %err, "greeting could not be encoded"),
        }

        ProducerResponse::ok(&event)
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.topic)
            .field("publisher", &self.publisher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::generator::FixedGenerator;
    use crate::queue::DurableQueue;
    use crate::transport::InMemoryTopics;

    fn producer(topics: &InMemoryTopics, topic: &str) -> Producer {
        Producer::new(
            Arc::new(FixedGenerator("Hello world".into())),
            Publisher::new(Arc::new(topics.clone())),
            TopicHandle::new(topic),
        )
    }

    #[tokio::test]
    async fn publishes_the_encoded_event() {
        let topics = InMemoryTopics::new();
        let topic = TopicHandle::new("greetings");
        let queue = DurableQueue::new("q", Duration::from_secs(30));
        topics.subscribe(&topic, queue.clone());

        let response = producer(&topics, "greetings")
            .handle(InvocationContext::with_origin("10.0.0.1"))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(
            response.greeting().expect("json body"),
            GreetingBody {
                message: "Hello world".into(),
                ip: Some("10.0.0.1".into()),
            }
        );
        let delivered = queue.receive(10);
        assert_eq!(delivered[0].body, "Greeting: Hello world || Visitor IP: 10.0.0.1");
    }

    #[tokio::test]
    async fn publish_failure_still_returns_the_greeting() {
        let topics = InMemoryTopics::new();
        let response = producer(&topics, "missing-topic")
            .handle(InvocationContext::anonymous())
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, r#"{"message":"Hello world"}"#);
    }

    #[test]
    fn origin_is_read_from_the_proxy_event() {
        let request: ProxyRequest = serde_json::from_str(
            r#"{"requestContext":{"identity":{"sourceIp":"203.0.113.4"}},"path":"/greeting"}"#,
        )
        .expect("event parses");
        assert_eq!(
            InvocationContext::from(request),
            InvocationContext::with_origin("203.0.113.4")
        );
        let bare: ProxyRequest = serde_json::from_str("{}").expect("empty event parses");
        assert_eq!(InvocationContext::from(bare), InvocationContext::anonymous());
    }

    #[test]
    fn response_serialises_with_proxy_field_names() {
        let response = ProducerResponse::ok(&GreetingEvent::new("hi", None));
        let json = serde_json::to_value(&response).expect("serialises");
        assert_eq!(json["statusCode"], 200);
    }
}
