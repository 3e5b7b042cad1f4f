//! ---
//! grelay_section: "04-deployment-rollout"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Staged, alarm-gated traffic shifting between function versions."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
//! Rollout primitives: metric alarms, alias routing, the deployment state
//! machine and a time-driven runner.

pub mod alarm;
pub mod controller;
pub mod metrics;
pub mod router;
pub mod runner;

pub use alarm::{
    aggregate, breaches, AlarmSignal, AlarmState, FeedError, MetricAlarm, MetricDatapoint,
    MetricFeed, MetricStore, ScriptedAlarm,
};
pub use controller::{
    AlarmTriggered, DeploymentState, RolloutController, RolloutError, RolloutStatus, TickOutcome,
};
pub use metrics::RolloutMetrics;
pub use router::{AliasRouter, AliasWeights, RouteAction, RoutingError, TrafficRouter};
pub use runner::RolloutRunner;
