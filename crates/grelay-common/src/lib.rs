//! ---
//! grelay_section: "01-core-functionality"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Shared primitives and utilities for the relay runtime."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
//! Shared primitives for the greeting relay workspace.
//! This crate exposes configuration loading, environment profiles, and
//! tracing initialisation consumed by the producer, consumer, and rollout
//! crates.

pub mod config;
pub mod logging;

pub use config::{
    AlarmConfig, ApiConfig, AppConfig, ComparisonOperator, ConfigurationError, DeploymentConfig,
    Environment, EnvironmentProfile, LoggingConfig, MetricsConfig, RelayConfig, RelaySettings,
    Statistic, StepSchedule, TransportBackend,
};
pub use logging::{init_stderr, init_tracing, LogFormat};
