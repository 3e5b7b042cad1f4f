//! ---
//! grelay_section: "03-observability"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Prometheus counters for relay traffic."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::fmt;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Prometheus metric handles for relay activity.
#[derive(Clone)]
pub struct RelayMetrics {
    published: IntCounter,
    publish_failures: IntCounter,
    consumed: IntCounterVec,
    redelivered: IntCounter,
}

impl RelayMetrics {
    /// Register relay metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let published = IntCounter::with_opts(Opts::new(
            "grelay_messages_published_total",
            "Greeting events accepted by the topic transport",
        ))?;
        let publish_failures = IntCounter::with_opts(Opts::new(
            "grelay_publish_failures_total",
            "Publish attempts rejected by the topic transport",
        ))?;
        let consumed = IntCounterVec::new(
            Opts::new(
                "grelay_messages_consumed_total",
                "Queued messages processed by the consumer, by outcome",
            ),
            &["outcome"],
        )?;
        let redelivered = IntCounter::with_opts(Opts::new(
            "grelay_messages_redelivered_total",
            "Queued messages seen more than once by the consumer",
        ))?;

        registry.register(Box::new(published.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;
        registry.register(Box::new(consumed.clone()))?;
        registry.register(Box::new(redelivered.clone()))?;

        Ok(Self {
            published,
            publish_failures,
            consumed,
            redelivered,
        })
    }

    pub fn observe_published(&self) {
        self.published.inc();
    }

    pub fn observe_publish_failure(&self) {
        self.publish_failures.inc();
    }

    pub fn observe_decoded(&self) {
        self.consumed.with_label_values(&["decoded"]).inc();
    }

    pub fn observe_malformed(&self) {
        self.consumed.with_label_values(&["malformed"]).inc();
    }

    pub fn observe_redelivery(&self) {
        self.redelivered.inc();
    }
}

impl fmt::Debug for RelayMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayMetrics")
            .field("published", &self.published.get())
            .field("publish_failures", &self.publish_failures.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_exported() {
        let registry = Registry::new();
        let metrics = RelayMetrics::register(&registry).expect("register metrics");
        metrics.observe_published();
        metrics.observe_malformed();
        metrics.observe_malformed();

        let families = registry.gather();
        let consumed = families
            .iter()
            .find(|f| f.get_name() == "grelay_messages_consumed_total")
            .expect("consumed family");
        assert_eq!(consumed.get_metric()[0].get_counter().get_value() as u64, 2);
        assert!(RelayMetrics::register(&registry).is_err());
    }
}
