//! ---
//! grelay_section: "15-testing-qa-runbook"
//! grelay_subsection: "integration-tests"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "End-to-end tests for the producer, topic, queue and consumer."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use grelay_common::{AppConfig, Environment, RelaySettings, TransportBackend};
use grelay_metrics::new_registry;
use grelay_msg::{
    connect_transport, parse_queue_event, Consumer, DurableQueue, FixedGenerator, InMemoryTopics,
    InvocationContext, LoremGenerator, Producer, Publisher, QueuePoller, RelayMetrics,
    TopicHandle,
};

const TOPIC: &str = "arn:aws:sns:eu-west-1:000000000000:GreetingsTopic-staging";

struct Relay {
    producer: Producer,
    queue: DurableQueue,
    consumer: Arc<Consumer>,
}

async fn relay(topic_address: Option<&str>, text: &str) -> Relay {
    let config = AppConfig::default();
    let settings = RelaySettings::resolve_with(&config.relay, |_| Some(TOPIC.to_owned()))
        .expect("topic resolves");
    let profile = config.profile(Environment::Staging);

    let topics = InMemoryTopics::new();
    let queue = DurableQueue::new(
        &profile.resource_name("GreetingQueue"),
        settings.visibility_timeout,
    );
    topics.subscribe(&TopicHandle::new(settings.topic_address.clone()), queue.clone());

    let transport = connect_transport(TransportBackend::InMemory, &topics)
        .await
        .expect("transport");
    let producer = Producer::new(
        Arc::new(FixedGenerator(text.to_owned())),
        Publisher::new(transport),
        TopicHandle::new(topic_address.unwrap_or(TOPIC)),
    );
    Relay {
        producer,
        queue,
        consumer: Arc::new(Consumer::default()),
    }
}

#[tokio::test]
async fn greeting_travels_from_producer_to_consumer() {
    let relay = relay(None, "Hello world").await;
    let response = relay
        .producer
        .handle(InvocationContext::with_origin("10.0.0.1"))
        .await;
    assert_eq!(response.status_code, 200);

    let batch = relay.queue.receive(10);
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].body, "Greeting: Hello world || Visitor IP: 10.0.0.1");

    let event = relay
        .consumer
        .process_message(&batch[0])
        .expect("consumer decodes");
    assert_eq!(event.text, "Hello world");
    assert_eq!(event.origin(), Some("10.0.0.1"));
}

#[tokio::test]
async fn delimiter_inside_the_greeting_survives_the_relay() {
    let relay = relay(None, "odd || text with | pipes \\ and slashes").await;
    relay
        .producer
        .handle(InvocationContext::with_origin("192.0.2.44"))
        .await;
    let batch = relay.queue.receive(10);
    let event = relay.consumer.process_message(&batch[0]).expect("decodes");
    assert_eq!(event.text, "odd || text with | pipes \\ and slashes");
    assert_eq!(event.origin(), Some("192.0.2.44"));
}

#[tokio::test]
async fn publish_failure_leaves_the_response_intact_and_the_queue_empty() {
    let relay = relay(Some("arn:aws:sns:eu-west-1:000000000000:Unknown"), "Salve.").await;
    let response = relay
        .producer
        .handle(InvocationContext::with_origin("10.0.0.2"))
        .await;
    assert_eq!(response.status_code, 200);
    let body = response.greeting().expect("json body");
    assert_eq!(body.message, "Salve.");
    assert_eq!(body.ip.as_deref(), Some("10.0.0.2"));
    assert_eq!(relay.queue.visible_len(), 0);
}

#[tokio::test]
async fn malformed_message_is_skipped_and_the_batch_completes() {
    let relay = relay(None, "Hello world").await;
    for origin in ["10.0.0.1", "10.0.0.2"] {
        relay
            .producer
            .handle(InvocationContext::with_origin(origin))
            .await;
    }
    relay.queue.send("garbage-no-delimiter");

    let registry = new_registry();
    let metrics = RelayMetrics::register(&registry).expect("metrics");
    let poller = QueuePoller::new(
        relay.queue.clone(),
        Arc::new(Consumer::new(Some(metrics))),
        10,
        Duration::from_millis(10),
    );
    let report = poller.poll_once();
    assert_eq!(report.decoded, 2);
    assert_eq!(report.malformed, 1);
    assert_eq!(relay.queue.in_flight_len(), 0);

    let consumed = registry
        .gather()
        .into_iter()
        .find(|family| family.get_name() == "grelay_messages_consumed_total")
        .expect("consumed counter registered");
    assert_eq!(consumed.get_metric().len(), 2);
}

#[tokio::test]
async fn many_concurrent_invocations_each_deliver_once() {
    let config = AppConfig::default();
    let topics = InMemoryTopics::new();
    let topic = TopicHandle::new(TOPIC);
    let queue = DurableQueue::new("GreetingQueue-staging", config.relay.visibility_timeout);
    topics.subscribe(&topic, queue.clone());
    let producer = Producer::new(
        Arc::new(LoremGenerator::seeded(11)),
        Publisher::new(Arc::new(topics)),
        topic,
    );

    let mut handles = Vec::new();
    for index in 0..32 {
        let producer = producer.clone();
        handles.push(tokio::spawn(async move {
            producer
                .handle(InvocationContext::with_origin(format!("10.0.1.{index}")))
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("join").status_code, 200);
    }

    let consumer = Consumer::default();
    let mut decoded = 0;
    loop {
        let batch = queue.receive(config.relay.batch_size);
        if batch.is_empty() {
            break;
        }
        decoded += consumer.process_batch(&batch).decoded;
        for message in &batch {
            assert!(queue.acknowledge(&message.receipt_handle));
        }
    }
    assert_eq!(decoded, 32);
}

#[test]
fn queue_event_with_notification_envelopes_is_consumed() {
    let event = parse_queue_event(
        &serde_json::json!({
            "Records": [
                {
                    "messageId": "a",
                    "body": serde_json::json!({
                        "Type": "Notification",
                        "Message": "Greeting: wrapped || Visitor IP: 198.51.100.1",
                    }).to_string(),
                },
                { "messageId": "b", "body": "Greeting: raw || Visitor IP: 198.51.100.2" },
                { "messageId": "c", "body": "no delimiter here" },
            ]
        })
        .to_string(),
    )
    .expect("event parses");
    let report = Consumer::default().process_batch(&event.records);
    assert_eq!(report.decoded, 2);
    assert_eq!(report.malformed, 1);
}
