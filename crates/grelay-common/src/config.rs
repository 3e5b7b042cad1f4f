//! ---
//! grelay_section: "01-core-functionality"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Shared primitives and utilities for the relay runtime."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use tracing::debug;

use crate::logging::LogFormat;

/// Name of the schedule used by lower-risk environments.
pub const FAST_SCHEDULE: &str = "fast";
/// Name of the schedule used by higher-risk environments.
pub const CONSERVATIVE_SCHEDULE: &str = "conservative";
/// Routes the API server always mounts next to the greeting route.
pub const RESERVED_API_PATHS: &[&str] = &["/healthz", "/metrics"];

fn default_topic_env_var() -> String {
    "SNS_TOPIC_ARN".to_owned()
}

fn default_alarm_topic_env_var() -> String {
    "ALARM_TOPIC_ARN".to_owned()
}

fn default_visibility_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_resource_path() -> String {
    "/greeting".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_alias() -> String {
    "live".to_owned()
}

fn default_functions() -> Vec<String> {
    vec!["GreetingLambda".to_owned(), "SQSConsumerLambda".to_owned()]
}

fn default_namespace() -> String {
    "AWS/CodeDeploy".to_owned()
}

fn default_metric_name() -> String {
    "DeploymentSuccess".to_owned()
}

fn default_alarm_period() -> Duration {
    Duration::from_secs(60)
}

fn default_evaluation_periods() -> u32 {
    1
}

fn default_threshold() -> f64 {
    1.0
}

fn default_schedules() -> IndexMap<String, StepSchedule> {
    let mut schedules = IndexMap::new();
    schedules.insert(FAST_SCHEDULE.to_owned(), StepSchedule::fast());
    schedules.insert(CONSERVATIVE_SCHEDULE.to_owned(), StepSchedule::conservative());
    schedules
}

/// Built-in schedules stay addressable by name even when the `schedules`
/// table replaces the defaults.
fn builtin_schedule(name: &str) -> Option<StepSchedule> {
    match name {
        FAST_SCHEDULE => Some(StepSchedule::fast()),
        CONSERVATIVE_SCHEDULE => Some(StepSchedule::conservative()),
        _ => None,
    }
}

/// Failures detected while resolving or validating configuration. All of
/// these are fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("topic address missing: set {variable} or relay.topic_address")]
    MissingTopicAddress { variable: String },
    #[error("profile '{profile}' references unknown schedule '{schedule}'")]
    UnknownSchedule { profile: String, schedule: String },
    #[error("schedule '{schedule}' step must be between 1 and 100 percent, got {step}")]
    InvalidStep { schedule: String, step: u8 },
    #[error("schedule '{schedule}' must have a non-zero interval")]
    ZeroInterval { schedule: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Primary configuration object for the relay runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default = "default_schedules")]
    pub schedules: IndexMap<String, StepSchedule>,
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub alarm: AlarmConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "GRELAY_CONFIG";

    /// Load configuration from disk, respecting the `GRELAY_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Profile describing the given environment.
    pub fn profile(&self, environment: Environment) -> &EnvironmentProfile {
        match environment {
            Environment::Staging => &self.profiles.staging,
            Environment::Production => &self.profiles.production,
        }
    }

    /// Resolve the step schedule selected by an environment's profile.
    pub fn schedule_for(&self, environment: Environment) -> Result<StepSchedule, ConfigurationError> {
        let profile = self.profile(environment);
        self.schedules
            .get(&profile.schedule)
            .copied()
            .or_else(|| builtin_schedule(&profile.schedule))
            .ok_or_else(|| ConfigurationError::UnknownSchedule {
                profile: environment.to_string(),
                schedule: profile.schedule.clone(),
            })
    }

    /// Deployment group names for every managed function in an environment.
    pub fn deployment_groups(&self, environment: Environment) -> Vec<String> {
        let profile = self.profile(environment);
        self.deployment
            .functions
            .iter()
            .map(|function| profile.deployment_group(function))
            .collect()
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (name, schedule) in &self.schedules {
            schedule.validate(name)?;
        }
        for environment in [Environment::Staging, Environment::Production] {
            let profile = self.profile(environment);
            if profile.suffix.trim().is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "profile '{environment}' must declare a resource suffix"
                )));
            }
            if profile.memory_mb == 0 {
                return Err(ConfigurationError::Invalid(format!(
                    "profile '{environment}' must declare a non-zero memory size"
                )));
            }
            self.schedule_for(environment)?;
        }
        if self.deployment.functions.is_empty() {
            return Err(ConfigurationError::Invalid(
                "deployment must manage at least one function".to_owned(),
            ));
        }
        if self.alarm.evaluation_periods == 0 || self.alarm.period.is_zero() {
            return Err(ConfigurationError::Invalid(
                "alarm period and evaluation_periods must be non-zero".to_owned(),
            ));
        }
        if self.relay.batch_size == 0 {
            return Err(ConfigurationError::Invalid(
                "relay.batch_size must be at least 1".to_owned(),
            ));
        }
        if !self.api.resource_path.starts_with('/') {
            return Err(ConfigurationError::Invalid(format!(
                "api.resource_path '{}' must start with '/'",
                self.api.resource_path
            )));
        }
        if RESERVED_API_PATHS.contains(&self.api.resource_path.as_str()) {
            return Err(ConfigurationError::Invalid(format!(
                "api.resource_path '{}' collides with a built-in route",
                self.api.resource_path
            )));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profiles: ProfilesConfig::default(),
            schedules: default_schedules(),
            deployment: DeploymentConfig::default(),
            alarm: AlarmConfig::default(),
            relay: RelayConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Deployment environment the relay runs in.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Staging,
    Production,
}

impl Environment {
    pub const ENV_VAR: &'static str = "ENVIRONMENT";

    /// Anything other than `production` selects staging.
    pub fn from_label(label: &str) -> Self {
        if label.trim().eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Staging
        }
    }

    /// Read the active environment from the `ENVIRONMENT` variable.
    pub fn detect() -> Self {
        std::env::var(Self::ENV_VAR)
            .map(|value| Self::from_label(&value))
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            other => Err(format!("unknown environment: {}", other)),
        }
    }
}

/// Settings that differ between staging and production.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentProfile {
    pub suffix: String,
    pub memory_mb: u32,
    pub schedule: String,
}

impl EnvironmentProfile {
    pub fn staging() -> Self {
        Self {
            suffix: "staging".to_owned(),
            memory_mb: 512,
            schedule: FAST_SCHEDULE.to_owned(),
        }
    }

    pub fn production() -> Self {
        Self {
            suffix: "prod".to_owned(),
            memory_mb: 1024,
            schedule: CONSERVATIVE_SCHEDULE.to_owned(),
        }
    }

    /// Suffix a base resource name with the environment, e.g. `GreetingsTopic-prod`.
    pub fn resource_name(&self, base: &str) -> String {
        format!("{}-{}", base, self.suffix)
    }

    /// Deployment group name for a managed function.
    pub fn deployment_group(&self, function: &str) -> String {
        self.resource_name(&format!("{function}DeploymentGroup"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    #[serde(default = "EnvironmentProfile::staging")]
    pub staging: EnvironmentProfile,
    #[serde(default = "EnvironmentProfile::production")]
    pub production: EnvironmentProfile,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            staging: EnvironmentProfile::staging(),
            production: EnvironmentProfile::production(),
        }
    }
}

/// Linear traffic-shift schedule: move `step_percent` of traffic every `interval`.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepSchedule {
    pub step_percent: u8,
    #[serde(rename = "interval_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
}

impl StepSchedule {
    /// 10% every minute.
    pub const fn fast() -> Self {
        Self {
            step_percent: 10,
            interval: Duration::from_secs(60),
        }
    }

    /// 10% every ten minutes.
    pub const fn conservative() -> Self {
        Self {
            step_percent: 10,
            interval: Duration::from_secs(600),
        }
    }

    /// Number of ticks needed to reach 100%, i.e. `ceil(100 / step)`.
    pub fn total_steps(&self) -> u32 {
        let step = u32::from(self.step_percent.max(1));
        (100 + step - 1) / step
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigurationError> {
        if self.step_percent == 0 || self.step_percent > 100 {
            return Err(ConfigurationError::InvalidStep {
                schedule: name.to_owned(),
                step: self.step_percent,
            });
        }
        if self.interval.is_zero() {
            return Err(ConfigurationError::ZeroInterval {
                schedule: name.to_owned(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default = "default_functions")]
    pub functions: Vec<String>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            alias: default_alias(),
            functions: default_functions(),
        }
    }
}

/// Aggregation applied to the datapoints of one alarm period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Statistic {
    #[default]
    Sum,
    Average,
    Minimum,
    Maximum,
    SampleCount,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonOperator {
    #[default]
    LessThanThreshold,
    LessThanOrEqualToThreshold,
    GreaterThanThreshold,
    GreaterThanOrEqualToThreshold,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_metric_name")]
    pub metric_name: String,
    #[serde(default)]
    pub statistic: Statistic,
    #[serde(default = "default_alarm_period", rename = "period_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period: Duration,
    #[serde(default = "default_evaluation_periods")]
    pub evaluation_periods: u32,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub comparison: ComparisonOperator,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            metric_name: default_metric_name(),
            statistic: Statistic::Sum,
            period: default_alarm_period(),
            evaluation_periods: default_evaluation_periods(),
            threshold: default_threshold(),
            comparison: ComparisonOperator::LessThanThreshold,
        }
    }
}

/// Pub/sub backend used by the publisher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportBackend {
    #[default]
    InMemory,
    Sns,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_topic_env_var")]
    pub topic_env_var: String,
    #[serde(default)]
    pub topic_address: Option<String>,
    #[serde(default = "default_alarm_topic_env_var")]
    pub alarm_topic_env_var: String,
    #[serde(default)]
    pub alarm_topic_address: Option<String>,
    #[serde(default)]
    pub backend: TransportBackend,
    #[serde(default = "default_visibility_timeout", rename = "visibility_timeout_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub visibility_timeout: Duration,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval", rename = "poll_interval_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic_env_var: default_topic_env_var(),
            topic_address: None,
            alarm_topic_env_var: default_alarm_topic_env_var(),
            alarm_topic_address: None,
            backend: TransportBackend::InMemory,
            visibility_timeout: default_visibility_timeout(),
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl RelayConfig {
    /// Alarm notification topic from the environment or the file, if any.
    pub fn alarm_topic(&self) -> Option<String> {
        self.alarm_topic_with(|name| std::env::var(name).ok())
    }

    fn alarm_topic_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        present(lookup(&self.alarm_topic_env_var))
            .or_else(|| present(self.alarm_topic_address.clone()))
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Relay settings after out-of-band values have been resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySettings {
    pub topic_address: String,
    pub alarm_topic_address: Option<String>,
    pub backend: TransportBackend,
    pub visibility_timeout: Duration,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl RelaySettings {
    /// Resolve against the process environment.
    pub fn resolve(config: &RelayConfig) -> Result<Self, ConfigurationError> {
        Self::resolve_with(config, |name| std::env::var(name).ok())
    }

    /// Resolve using `lookup` for environment variables. The variable wins over
    /// the file value; blank values count as absent.
    pub fn resolve_with<F>(config: &RelayConfig, lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let topic_address = present(lookup(&config.topic_env_var))
            .or_else(|| present(config.topic_address.clone()))
            .ok_or_else(|| ConfigurationError::MissingTopicAddress {
                variable: config.topic_env_var.clone(),
            })?;
        let alarm_topic_address = config.alarm_topic_with(&lookup);
        Ok(Self {
            topic_address,
            alarm_topic_address,
            backend: config.backend,
            visibility_timeout: config.visibility_timeout,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_resource_path")]
    pub resource_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
            resource_path: default_resource_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
