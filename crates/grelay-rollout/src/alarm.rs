//! ---
//! grelay_section: "04-deployment-rollout"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Metric datapoints and threshold alarms gating rollouts."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use grelay_common::{AlarmConfig, ComparisonOperator, Statistic};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Result of evaluating an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Ok,
    Alarm,
    /// No datapoints in the evaluation window. Never treated as a failure.
    InsufficientData,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Ok => "ok",
            AlarmState::Alarm => "alarm",
            AlarmState::InsufficientData => "insufficient_data",
        }
    }

    pub fn is_firing(&self) -> bool {
        matches!(self, AlarmState::Alarm)
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only failure signal consulted by the rollout controller after each
/// traffic shift.
pub trait AlarmSignal: Send + Sync {
    fn state(&self, group: &str, step: u32) -> AlarmState;
}

#[derive(Debug, Clone, Copy)]
struct Datapoint {
    at: DateTime<Utc>,
    value: f64,
}

/// Datapoints keyed by metric name and deployment group.
///
/// With a retention set, datapoints older than `now - retention` are dropped
/// whenever a series is written.
#[derive(Clone, Default)]
pub struct MetricStore {
    series: Arc<RwLock<HashMap<(String, String), Vec<Datapoint>>>>,
    retention: Option<ChronoDuration>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that keeps exactly what `config` can still evaluate.
    pub fn for_alarm(config: &AlarmConfig) -> Self {
        Self::new().with_retention(config.period * config.evaluation_periods.max(1))
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = ChronoDuration::from_std(retention).ok();
        self
    }

    pub fn record(&self, metric: &str, group: &str, value: f64, at: DateTime<Utc>) {
        let mut series = self.series.write();
        let points = series
            .entry((metric.to_owned(), group.to_owned()))
            .or_default();
        if let Some(retention) = self.retention {
            let cutoff = Utc::now() - retention;
            points.retain(|point| point.at > cutoff);
            if at <= cutoff {
                debug!(metric, group, at = %at, "datapoint older than retention dropped");
                return;
            }
        }
        debug!(metric, group, value, at = %at, "metric datapoint recorded");
        points.push(Datapoint { at, value });
    }

    pub fn record_now(&self, metric: &str, group: &str, value: f64) {
        self.record(metric, group, value, Utc::now());
    }

    /// Number of datapoints held for one series.
    pub fn datapoints(&self, metric: &str, group: &str) -> usize {
        self.series
            .read()
            .get(&(metric.to_owned(), group.to_owned()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Values with `start < at <= end`.
    fn window(
        &self,
        metric: &str,
        group: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<f64> {
        self.series
            .read()
            .get(&(metric.to_owned(), group.to_owned()))
            .map(|points| {
                points
                    .iter()
                    .filter(|point| point.at > start && point.at <= end)
                    .map(|point| point.value)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Debug for MetricStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricStore")
            .field("series", &self.series.read().len())
            .field("retention", &self.retention)
            .finish()
    }
}

/// One line of a datapoint feed. A missing timestamp means "now".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDatapoint {
    pub metric: String,
    pub group: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
#[error("metric feed {path} is unreadable: {source}")]
pub struct FeedError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

#[derive(Debug, Default)]
struct FeedCursor {
    offset: u64,
    line: usize,
}

/// Tails a JSON-lines file of [`MetricDatapoint`]s into a [`MetricStore`].
///
/// Only newline-terminated lines are consumed, so a line still being written
/// is picked up by a later poll. A file that does not exist yet holds no data.
#[derive(Debug)]
pub struct MetricFeed {
    path: PathBuf,
    store: MetricStore,
    cursor: Mutex<FeedCursor>,
}

impl MetricFeed {
    pub fn new(path: impl Into<PathBuf>, store: MetricStore) -> Self {
        Self {
            path: path.into(),
            store,
            cursor: Mutex::new(FeedCursor::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record every complete line appended since the last poll. Returns the
    /// number of datapoints recorded; unparsable lines are logged and skipped.
    pub fn poll(&self) -> Result<usize, FeedError> {
        let io_err = |source: io::Error| FeedError {
            path: self.path.clone(),
            source,
        };
        let mut cursor = self.cursor.lock();
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_err(err)),
        };
        file.seek(SeekFrom::Start(cursor.offset)).map_err(io_err)?;
        let mut appended = String::new();
        file.read_to_string(&mut appended).map_err(io_err)?;
        let Some(last_newline) = appended.rfind('\n') else {
            return Ok(0);
        };

        let mut recorded = 0;
        for line in appended[..=last_newline].split_inclusive('\n') {
            cursor.offset += line.len() as u64;
            cursor.line += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<MetricDatapoint>(trimmed) {
                Ok(point) => {
                    let at = point.timestamp.unwrap_or_else(Utc::now);
                    self.store.record(&point.metric, &point.group, point.value, at);
                    recorded += 1;
                }
                Err(err) => warn!(
                    feed = %self.path.display(),
                    line = cursor.line,
                    error = %err,
                    "skipping unparsable metric datapoint"
                ),
            }
        }
        Ok(recorded)
    }
}

/// Threshold alarm over a [`MetricStore`], evaluated per deployment group.
///
/// The window is split into `evaluation_periods` consecutive periods ending at
/// the evaluation time. The alarm fires only when every period has data and
/// every period breaches the threshold. If no period has data the state is
/// [`AlarmState::InsufficientData`].
#[derive(Debug, Clone)]
pub struct MetricAlarm {
    config: AlarmConfig,
    store: MetricStore,
    feed: Option<Arc<MetricFeed>>,
}

impl MetricAlarm {
    pub fn new(config: AlarmConfig, store: MetricStore) -> Self {
        Self {
            config,
            store,
            feed: None,
        }
    }

    /// Alarm over a store that is refreshed from `feed` before every check.
    pub fn with_feed(config: AlarmConfig, feed: MetricFeed) -> Self {
        Self {
            config,
            store: feed.store.clone(),
            feed: Some(Arc::new(feed)),
        }
    }

    pub fn name(&self, group: &str) -> String {
        format!("{}-{}", group, self.config.metric_name)
    }

    pub fn config(&self) -> &AlarmConfig {
        &self.config
    }

    pub fn evaluate(&self, group: &str, now: DateTime<Utc>) -> AlarmState {
        let period = ChronoDuration::from_std(self.config.period)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let periods = self.config.evaluation_periods.max(1);

        let mut with_data = 0;
        let mut breaching = 0;
        for index in 0..periods {
            let end = now - period * index as i32;
            let values = self
                .store
                .window(&self.config.metric_name, group, end - period, end);
            let Some(value) = aggregate(self.config.statistic, &values) else {
                continue;
            };
            with_data += 1;
            if breaches(self.config.comparison, value, self.config.threshold) {
                breaching += 1;
            }
        }

        let state = if with_data == 0 {
            AlarmState::InsufficientData
        } else if breaching == periods {
            AlarmState::Alarm
        } else {
            AlarmState::Ok
        };
        debug!(group, metric = %self.config.metric_name, state = %state, "alarm evaluated");
        state
    }
}

impl AlarmSignal for MetricAlarm {
    fn state(&self, group: &str, _step: u32) -> AlarmState {
        if let Some(feed) = &self.feed {
            match feed.poll() {
                Ok(recorded) => debug!(group, recorded, "metric feed polled"),
                Err(err) => warn!(group, error = %err, "metric feed poll failed"),
            }
        }
        self.evaluate(group, Utc::now())
    }
}

/// Alarm that fires at a fixed step, for dry runs and drills.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedAlarm {
    pub fail_at_step: Option<u32>,
}

impl AlarmSignal for ScriptedAlarm {
    fn state(&self, _group: &str, step: u32) -> AlarmState {
        match self.fail_at_step {
            Some(fail_at) if step >= fail_at => AlarmState::Alarm,
            _ => AlarmState::Ok,
        }
    }
}

/// Apply `statistic` to one period's values. `None` when there are none.
pub fn aggregate(statistic: Statistic, values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let value = match statistic {
        Statistic::Sum => values.iter().sum(),
        Statistic::Average => values.iter().sum::<f64>() / values.len() as f64,
        Statistic::Minimum => values.iter().copied().fold(f64::INFINITY, f64::min),
        Statistic::Maximum => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Statistic::SampleCount => values.len() as f64,
    };
    Some(value)
}

pub fn breaches(comparison: ComparisonOperator, value: f64, threshold: f64) -> bool {
    match comparison {
        ComparisonOperator::LessThanThreshold => value < threshold,
        ComparisonOperator::LessThanOrEqualToThreshold => value <= threshold,
        ComparisonOperator::GreaterThanThreshold => value > threshold,
        ComparisonOperator::GreaterThanOrEqualToThreshold => value >= threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: &str = "GreetingLambdaDeploymentGroup-staging";

    fn alarm(store: &MetricStore) -> MetricAlarm {
        MetricAlarm::new(AlarmConfig::default(), store.clone())
    }

    #[test]
    fn no_datapoints_is_insufficient_data() {
        let store = MetricStore::new();
        assert_eq!(alarm(&store).evaluate(GROUP, Utc::now()), AlarmState::InsufficientData);
    }

    #[test]
    fn zero_successes_in_the_window_fires() {
        let store = MetricStore::new();
        let now = Utc::now();
        store.record("DeploymentSuccess", GROUP, 0.0, now - ChronoDuration::seconds(10));
        assert_eq!(alarm(&store).evaluate(GROUP, now), AlarmState::Alarm);
    }

    #[test]
    fn successes_keep_the_alarm_ok() {
        let store = MetricStore::new();
        let now = Utc::now();
        store.record("DeploymentSuccess", GROUP, 0.0, now - ChronoDuration::seconds(20));
        store.record("DeploymentSuccess", GROUP, 1.0, now - ChronoDuration::seconds(10));
        assert_eq!(alarm(&store).evaluate(GROUP, now), AlarmState::Ok);
    }

    #[test]
    fn datapoints_outside_the_window_are_ignored() {
        let store = MetricStore::new();
        let now = Utc::now();
        store.record("DeploymentSuccess", GROUP, 0.0, now - ChronoDuration::seconds(61));
        assert_eq!(alarm(&store).evaluate(GROUP, now), AlarmState::InsufficientData);
    }

    #[test]
    fn groups_are_evaluated_independently() {
        let store = MetricStore::new();
        let now = Utc::now();
        store.record("DeploymentSuccess", GROUP, 0.0, now);
        assert_eq!(
            alarm(&store).evaluate("SQSConsumerLambdaDeploymentGroup-staging", now),
            AlarmState::InsufficientData
        );
    }

    #[test]
    fn every_period_must_breach() {
        let store = MetricStore::new();
        let now = Utc::now();
        let config = AlarmConfig {
            evaluation_periods: 2,
            ..AlarmConfig::default()
        };
        let alarm = MetricAlarm::new(config, store.clone());
        store.record("DeploymentSuccess", GROUP, 0.0, now - ChronoDuration::seconds(5));
        assert_eq!(alarm.evaluate(GROUP, now), AlarmState::Ok);
        store.record("DeploymentSuccess", GROUP, 0.0, now - ChronoDuration::seconds(65));
        assert_eq!(alarm.evaluate(GROUP, now), AlarmState::Alarm);
    }

    #[test]
    fn retention_drops_datapoints_the_alarm_can_no_longer_see() {
        let store = MetricStore::for_alarm(&AlarmConfig::default());
        let now = Utc::now();
        store.record("DeploymentSuccess", GROUP, 1.0, now - ChronoDuration::seconds(90));
        assert_eq!(store.datapoints("DeploymentSuccess", GROUP), 0);

        store.record("DeploymentSuccess", GROUP, 1.0, now - ChronoDuration::seconds(20));
        store.record("DeploymentSuccess", GROUP, 1.0, now - ChronoDuration::seconds(10));
        assert_eq!(store.datapoints("DeploymentSuccess", GROUP), 2);

        let unbounded = MetricStore::new();
        unbounded.record("DeploymentSuccess", GROUP, 1.0, now - ChronoDuration::days(1));
        assert_eq!(unbounded.datapoints("DeploymentSuccess", GROUP), 1);
    }

    #[test]
    fn feed_lines_appended_between_checks_drive_the_alarm() {
        use std::io::Write;

        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("deployment-success.jsonl");
        let config = AlarmConfig::default();
        let alarm = MetricAlarm::with_feed(
            config.clone(),
            MetricFeed::new(&path, MetricStore::for_alarm(&config)),
        );
        assert_eq!(alarm.state(GROUP, 1), AlarmState::InsufficientData);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .expect("open feed");
        writeln!(file, "not json").expect("write");
        write!(
            file,
            "{{\"metric\":\"DeploymentSuccess\",\"group\":\"{GROUP}\",\"value\":0}}"
        )
        .expect("write");
        file.flush().expect("flush");
        // the datapoint has no newline yet
        assert_eq!(alarm.state(GROUP, 2), AlarmState::InsufficientData);

        writeln!(file).expect("write");
        file.flush().expect("flush");
        assert_eq!(alarm.state(GROUP, 3), AlarmState::Alarm);
        assert_eq!(alarm.store.datapoints("DeploymentSuccess", GROUP), 1);
    }

    #[test]
    fn statistics_and_comparisons() {
        let values = [1.0, 4.0, 7.0];
        assert_eq!(aggregate(Statistic::Sum, &values), Some(12.0));
        assert_eq!(aggregate(Statistic::Average, &values), Some(4.0));
        assert_eq!(aggregate(Statistic::Minimum, &values), Some(1.0));
        assert_eq!(aggregate(Statistic::Maximum, &values), Some(7.0));
        assert_eq!(aggregate(Statistic::SampleCount, &values), Some(3.0));
        assert_eq!(aggregate(Statistic::Sum, &[]), None);

        assert!(breaches(ComparisonOperator::LessThanThreshold, 0.0, 1.0));
        assert!(!breaches(ComparisonOperator::LessThanThreshold, 1.0, 1.0));
        assert!(breaches(ComparisonOperator::LessThanOrEqualToThreshold, 1.0, 1.0));
        assert!(breaches(ComparisonOperator::GreaterThanThreshold, 2.0, 1.0));
        assert!(breaches(ComparisonOperator::GreaterThanOrEqualToThreshold, 1.0, 1.0));
    }

    #[test]
    fn scripted_alarm_fires_from_its_step() {
        let alarm = ScriptedAlarm {
            fail_at_step: Some(3),
        };
        assert_eq!(alarm.state(GROUP, 2), AlarmState::Ok);
        assert_eq!(alarm.state(GROUP, 3), AlarmState::Alarm);
        assert_eq!(ScriptedAlarm::default().state(GROUP, 99), AlarmState::Ok);
    }
}
