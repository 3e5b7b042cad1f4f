//! ---
//! grelay_section: "04-deployment-rollout"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Prometheus metrics for staged rollouts."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::fmt;

use anyhow::Result;
use grelay_metrics::SharedRegistry;
use prometheus::{IntCounterVec, IntGaugeVec, Opts};

use crate::controller::RolloutStatus;

/// Metrics published by the rollout controller.
#[derive(Clone)]
pub struct RolloutMetrics {
    registry: SharedRegistry,
    steps_total: IntCounterVec,
    outcomes_total: IntCounterVec,
    traffic_percent: IntGaugeVec,
}

impl RolloutMetrics {
    /// Register the rollout metric family against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let steps_total = IntCounterVec::new(
            Opts::new(
                "grelay_rollout_steps_total",
                "Traffic-shift steps applied per deployment group",
            ),
            &["group"],
        )?;
        registry.register(Box::new(steps_total.clone()))?;

        let outcomes_total = IntCounterVec::new(
            Opts::new(
                "grelay_rollout_outcomes_total",
                "Rollouts reaching a terminal state, by outcome",
            ),
            &["group", "outcome"],
        )?;
        registry.register(Box::new(outcomes_total.clone()))?;

        let traffic_percent = IntGaugeVec::new(
            Opts::new(
                "grelay_rollout_traffic_percent",
                "Share of traffic currently routed to the target version",
            ),
            &["group"],
        )?;
        registry.register(Box::new(traffic_percent.clone()))?;

        Ok(Self {
            registry,
            steps_total,
            outcomes_total,
            traffic_percent,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_step(&self, group: &str, traffic_percent: u8) {
        self.steps_total.with_label_values(&[group]).inc();
        self.traffic_percent
            .with_label_values(&[group])
            .set(i64::from(traffic_percent));
    }

    pub fn record_outcome(&self, group: &str, status: RolloutStatus) {
        self.outcomes_total
            .with_label_values(&[group, status.as_str()])
            .inc();
        if status == RolloutStatus::RolledBack {
            self.traffic_percent.with_label_values(&[group]).set(0);
        }
    }
}

impl fmt::Debug for RolloutMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RolloutMetrics").finish_non_exhaustive()
    }
}
