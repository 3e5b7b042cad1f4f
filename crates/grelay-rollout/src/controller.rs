//! ---
//! grelay_section: "04-deployment-rollout"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Deployment state machine for stepped, alarm-gated traffic shifts."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
//! A rollout moves traffic from a stable version to a target version in
//! fixed steps. After each shift the group's alarm is consulted: a firing
//! alarm reverts all traffic to the stable version and ends the rollout,
//! otherwise the rollout succeeds once the target carries 100%.
//!
//! Ticks are numbered from 1. Replaying a tick that was already applied is a
//! no-op, and a tick that skips ahead is rejected, so an external scheduler
//! can retry after a crash without double-applying an increment.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use grelay_common::{ConfigurationError, StepSchedule};
use grelay_msg::{Publisher, TopicHandle};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, FromInto};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alarm::{AlarmSignal, AlarmState};
use crate::metrics::RolloutMetrics;
use crate::router::{RoutingError, TrafficRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RolloutStatus {
    InProgress,
    Succeeded,
    RolledBack,
}

impl RolloutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::InProgress => "in_progress",
            RolloutStatus::Succeeded => "succeeded",
            RolloutStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RolloutStatus::InProgress)
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a rollout was rolled back.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("alarm {alarm} fired for {group} at step {step} with {traffic_percent}% traffic on {target_version}")]
pub struct AlarmTriggered {
    pub group: String,
    pub alarm: String,
    pub target_version: String,
    pub step: u32,
    pub traffic_percent: u8,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("rollout {id} for {group} is already {status}")]
    Terminal {
        id: Uuid,
        group: String,
        status: RolloutStatus,
    },
    #[error("step {requested} is out of order for {group}; next step is {expected}")]
    StepGap {
        group: String,
        expected: u32,
        requested: u32,
    },
    #[error("target and stable version are both {0}")]
    SameVersion(String),
    #[error("rollout state for {group} is inconsistent: {reason}")]
    InvalidState { group: String, reason: String },
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("rollout state i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("rollout state is not valid JSON: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// On-disk form of a schedule. Intervals keep millisecond precision so drill
/// schedules survive a save/load cycle.
#[serde_as]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PersistedSchedule {
    step_percent: u8,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    interval_ms: Duration,
}

impl From<StepSchedule> for PersistedSchedule {
    fn from(schedule: StepSchedule) -> Self {
        Self {
            step_percent: schedule.step_percent,
            interval_ms: schedule.interval,
        }
    }
}

impl From<PersistedSchedule> for StepSchedule {
    fn from(persisted: PersistedSchedule) -> Self {
        Self {
            step_percent: persisted.step_percent,
            interval: persisted.interval_ms,
        }
    }
}

/// Persistent record of one rollout, owned by its controller.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub id: Uuid,
    pub group: String,
    pub target_version: String,
    pub stable_version: String,
    pub current_traffic_percent: u8,
    pub steps_applied: u32,
    #[serde_as(as = "FromInto<PersistedSchedule>")]
    pub schedule: StepSchedule,
    pub status: RolloutStatus,
    #[serde(default)]
    pub rollback: Option<AlarmTriggered>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentState {
    pub fn new(group: &str, target_version: &str, stable_version: &str, schedule: StepSchedule) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            group: group.to_owned(),
            target_version: target_version.to_owned(),
            stable_version: stable_version.to_owned(),
            current_traffic_percent: 0,
            steps_applied: 0,
            schedule,
            status: RolloutStatus::InProgress,
            rollback: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn total_steps(&self) -> u32 {
        self.schedule.total_steps()
    }

    /// Traffic share after `step` steps, capped at 100.
    pub fn traffic_after(&self, step: u32) -> u8 {
        let percent = step.saturating_mul(u32::from(self.schedule.step_percent));
        percent.min(100) as u8
    }

    /// Check a state that did not come from [`DeploymentState::new`], e.g. one
    /// read back from disk.
    pub fn validate(&self) -> Result<(), RolloutError> {
        self.schedule.validate(&self.group)?;
        if self.target_version == self.stable_version {
            return Err(RolloutError::SameVersion(self.target_version.clone()));
        }
        let invalid = |reason: String| RolloutError::InvalidState {
            group: self.group.clone(),
            reason,
        };
        if self.steps_applied > self.total_steps() {
            return Err(invalid(format!(
                "{} steps applied but the schedule has {}",
                self.steps_applied,
                self.total_steps()
            )));
        }
        if self.current_traffic_percent > 100 {
            return Err(invalid(format!(
                "traffic share {}% exceeds 100%",
                self.current_traffic_percent
            )));
        }
        if self.status == RolloutStatus::InProgress && self.steps_applied == self.total_steps() {
            return Err(invalid(
                "all steps applied but the rollout is still in progress".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), RolloutError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, RolloutError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Result of a single tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Advanced { traffic_percent: u8 },
    Succeeded,
    RolledBack(AlarmTriggered),
    /// The step was already applied; nothing changed.
    Duplicate,
}

struct AlarmNotifier {
    publisher: Publisher,
    topic: TopicHandle,
}

/// Drives one [`DeploymentState`] through its steps.
pub struct RolloutController {
    state: DeploymentState,
    router: Arc<dyn TrafficRouter>,
    alarm: Arc<dyn AlarmSignal>,
    alarm_name: String,
    notifier: Option<AlarmNotifier>,
    metrics: Option<RolloutMetrics>,
}

impl RolloutController {
    /// Begin a fresh rollout with all traffic on the stable version.
    pub fn start(
        group: &str,
        target_version: &str,
        stable_version: &str,
        schedule: StepSchedule,
        router: Arc<dyn TrafficRouter>,
        alarm: Arc<dyn AlarmSignal>,
    ) -> Result<Self, RolloutError> {
        schedule.validate(group)?;
        if target_version == stable_version {
            return Err(RolloutError::SameVersion(target_version.to_owned()));
        }
        let state = DeploymentState::new(group, target_version, stable_version, schedule);
        info!(
            rollout_id = %state.id,
            group,
            target_version,
            stable_version,
            step_percent = schedule.step_percent,
            interval_secs = schedule.interval.as_secs(),
            total_steps = schedule.total_steps(),
            "rollout started"
        );
        Self::resume(state, router, alarm)
    }

    /// Continue a persisted rollout. Inconsistent state is refused.
    pub fn resume(
        state: DeploymentState,
        router: Arc<dyn TrafficRouter>,
        alarm: Arc<dyn AlarmSignal>,
    ) -> Result<Self, RolloutError> {
        state.validate()?;
        let alarm_name = format!("{}-DeploymentSuccess", state.group);
        Ok(Self {
            state,
            router,
            alarm,
            alarm_name,
            notifier: None,
            metrics: None,
        })
    }

    pub fn with_alarm_name(mut self, name: impl Into<String>) -> Self {
        self.alarm_name = name.into();
        self
    }

    /// Publish a notification to `topic` when the rollout rolls back.
    pub fn with_notifier(mut self, publisher: Publisher, topic: TopicHandle) -> Self {
        self.notifier = Some(AlarmNotifier { publisher, topic });
        self
    }

    pub fn with_metrics(mut self, metrics: RolloutMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    pub fn into_state(self) -> DeploymentState {
        self.state
    }

    /// Apply step `step` (1-based).
    pub async fn tick(&mut self, step: u32) -> Result<TickOutcome, RolloutError> {
        if step <= self.state.steps_applied {
            info!(group = %self.state.group, step, "step already applied; ignoring replay");
            return Ok(TickOutcome::Duplicate);
        }
        if self.state.is_terminal() {
            return Err(RolloutError::Terminal {
                id: self.state.id,
                group: self.state.group.clone(),
                status: self.state.status,
            });
        }
        let expected = self.state.steps_applied + 1;
        if step != expected {
            return Err(RolloutError::StepGap {
                group: self.state.group.clone(),
                expected,
                requested: step,
            });
        }

        let traffic_percent = self.state.traffic_after(step);
        self.router.shift(
            &self.state.group,
            &self.state.stable_version,
            &self.state.target_version,
            traffic_percent,
        )?;

        let alarm_state = self.alarm.state(&self.state.group, step);
        if alarm_state == AlarmState::Alarm {
            // state is only committed once the revert went through, so a failed
            // revert leaves the step retryable
            self.router
                .revert(&self.state.group, &self.state.stable_version)?;
            let trigger = AlarmTriggered {
                group: self.state.group.clone(),
                alarm: self.alarm_name.clone(),
                target_version: self.state.target_version.clone(),
                step,
                traffic_percent,
                at: Utc::now(),
            };
            self.commit(step, 0, RolloutStatus::RolledBack);
            self.state.rollback = Some(trigger.clone());
            warn!(
                rollout_id = %self.state.id,
                group = %self.state.group,
                step,
                traffic_percent,
                alarm = %trigger.alarm,
                "alarm fired; rolled back to stable version"
            );
            self.notify(&trigger).await;
            return Ok(TickOutcome::RolledBack(trigger));
        }

        if traffic_percent >= 100 {
            self.commit(step, 100, RolloutStatus::Succeeded);
            info!(
                rollout_id = %self.state.id,
                group = %self.state.group,
                steps = step,
                target_version = %self.state.target_version,
                "rollout succeeded"
            );
            return Ok(TickOutcome::Succeeded);
        }

        self.commit(step, traffic_percent, RolloutStatus::InProgress);
        info!(
            rollout_id = %self.state.id,
            group = %self.state.group,
            step,
            traffic_percent,
            alarm = %alarm_state,
            "rollout step applied"
        );
        Ok(TickOutcome::Advanced { traffic_percent })
    }

    fn commit(&mut self, step: u32, traffic_percent: u8, status: RolloutStatus) {
        self.state.steps_applied = step;
        self.state.current_traffic_percent = traffic_percent;
        self.state.status = status;
        self.state.updated_at = Utc::now();
        if let Some(metrics) = &self.metrics {
            metrics.record_step(&self.state.group, self.state.traffic_after(step));
            if status.is_terminal() {
                metrics.record_outcome(&self.state.group, status);
            }
        }
    }

    async fn notify(&self, trigger: &AlarmTriggered) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let body = serde_json::json!({
            "AlarmName": trigger.alarm,
            "NewStateValue": "ALARM",
            "NewStateReason": trigger.to_string(),
            "StateChangeTime": trigger.at.to_rfc3339(),
            "DeploymentGroup": trigger.group,
            "TargetVersion": trigger.target_version,
            "StableVersion": self.state.stable_version,
            "Step": trigger.step,
            "TrafficPercent": trigger.traffic_percent,
        });
        if let Err(err) = notifier
            .publisher
            .publish(&notifier.topic, &body.to_string())
            .await
        {
            warn!(topic = %notifier.topic, error = %err, "alarm notification not delivered");
        }
    }
}

impl fmt::Debug for RolloutController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RolloutController")
            .field("state", &self.state)
            .field("alarm_name", &self.alarm_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use grelay_msg::{DurableQueue, InMemoryTopics};

    use super::*;
    use crate::alarm::ScriptedAlarm;
    use crate::router::{AliasRouter, RouteAction};

    const GROUP: &str = "GreetingLambdaDeploymentGroup-staging";

    fn controller(
        schedule: StepSchedule,
        fail_at_step: Option<u32>,
    ) -> (RolloutController, AliasRouter) {
        let router = AliasRouter::new();
        let controller = RolloutController::start(
            GROUP,
            "2",
            "1",
            schedule,
            Arc::new(router.clone()),
            Arc::new(ScriptedAlarm { fail_at_step }),
        )
        .expect("rollout starts");
        (controller, router)
    }

    fn schedule(step_percent: u8) -> StepSchedule {
        StepSchedule {
            step_percent,
            interval: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn quiet_alarm_succeeds_after_ceil_steps() {
        for (step_percent, expected) in [(10u8, 10u32), (30, 4), (33, 4), (100, 1), (1, 100)] {
            let (mut controller, router) = controller(schedule(step_percent), None);
            let mut steps = 0;
            while !controller.state().is_terminal() {
                steps += 1;
                controller.tick(steps).await.expect("tick");
            }
            assert_eq!(steps, expected, "step {step_percent}%");
            assert_eq!(controller.state().status, RolloutStatus::Succeeded);
            assert_eq!(controller.state().current_traffic_percent, 100);
            assert_eq!(router.revert_count(GROUP), 0);
        }
    }

    #[tokio::test]
    async fn alarm_at_step_k_rolls_back_once() {
        let (mut controller, router) = controller(StepSchedule::fast(), Some(4));
        for step in 1..=3 {
            assert!(matches!(
                controller.tick(step).await.expect("tick"),
                TickOutcome::Advanced { .. }
            ));
        }
        let outcome = controller.tick(4).await.expect("tick");
        let TickOutcome::RolledBack(trigger) = outcome else {
            panic!("expected rollback, got {outcome:?}");
        };
        assert_eq!(trigger.step, 4);
        assert_eq!(trigger.traffic_percent, 40);
        assert_eq!(controller.state().status, RolloutStatus::RolledBack);
        assert_eq!(controller.state().current_traffic_percent, 0);

        // replays and later ticks never revert again
        assert_eq!(controller.tick(4).await.expect("replay"), TickOutcome::Duplicate);
        assert!(matches!(
            controller.tick(5).await,
            Err(RolloutError::Terminal { .. })
        ));
        assert_eq!(router.revert_count(GROUP), 1);
        assert_eq!(
            router.history().last(),
            Some(&RouteAction::Revert {
                group: GROUP.into(),
                stable: "1".into(),
            })
        );
    }

    #[tokio::test]
    async fn replayed_step_does_not_double_shift() {
        let (mut controller, router) = controller(StepSchedule::fast(), None);
        controller.tick(1).await.expect("tick");
        assert_eq!(controller.tick(1).await.expect("replay"), TickOutcome::Duplicate);
        assert_eq!(controller.state().current_traffic_percent, 10);
        assert_eq!(router.history().len(), 1);
    }

    #[tokio::test]
    async fn skipped_step_is_rejected() {
        let (mut controller, _router) = controller(StepSchedule::fast(), None);
        let err = controller.tick(2).await.expect_err("gap");
        assert!(matches!(
            err,
            RolloutError::StepGap {
                expected: 1,
                requested: 2,
                ..
            }
        ));
        assert_eq!(controller.state().steps_applied, 0);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let router: Arc<dyn TrafficRouter> = Arc::new(AliasRouter::new());
        let alarm: Arc<dyn AlarmSignal> = Arc::new(ScriptedAlarm::default());
        assert!(matches!(
            RolloutController::start(GROUP, "2", "1", schedule(0), router.clone(), alarm.clone()),
            Err(RolloutError::Configuration(_))
        ));
        assert!(matches!(
            RolloutController::start(GROUP, "1", "1", schedule(10), router, alarm),
            Err(RolloutError::SameVersion(_))
        ));
    }

    #[tokio::test]
    async fn persisted_state_resumes_where_it_stopped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("rollout.json");
        let (mut controller, router) = controller(StepSchedule::fast(), None);
        controller.tick(1).await.expect("tick");
        controller.tick(2).await.expect("tick");
        controller.state().save(&path).expect("save");

        let restored = DeploymentState::load(&path).expect("load");
        assert_eq!(&restored, controller.state());
        let mut resumed = RolloutController::resume(
            restored,
            Arc::new(router.clone()),
            Arc::new(ScriptedAlarm::default()),
        )
        .expect("resume");
        assert_eq!(resumed.tick(2).await.expect("replay"), TickOutcome::Duplicate);
        assert_eq!(
            resumed.tick(3).await.expect("tick"),
            TickOutcome::Advanced { traffic_percent: 30 }
        );
    }

    #[test]
    fn sub_second_intervals_survive_a_save() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("rollout.json");
        let state = DeploymentState::new(
            GROUP,
            "2",
            "1",
            StepSchedule {
                step_percent: 25,
                interval: Duration::from_millis(1500),
            },
        );
        state.save(&path).expect("save");

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\"interval_ms\": 1500"), "{raw}");
        let restored = DeploymentState::load(&path).expect("load");
        assert_eq!(restored.schedule.interval, Duration::from_millis(1500));
        assert_eq!(restored, state);
    }

    #[test]
    fn inconsistent_saved_state_is_not_resumed() {
        let router: Arc<dyn TrafficRouter> = Arc::new(AliasRouter::new());
        let alarm: Arc<dyn AlarmSignal> = Arc::new(ScriptedAlarm::default());
        let base = DeploymentState::new(GROUP, "2", "1", StepSchedule::fast());

        let mut zero_step = base.clone();
        zero_step.schedule.step_percent = 0;
        assert!(matches!(
            RolloutController::resume(zero_step, router.clone(), alarm.clone()),
            Err(RolloutError::Configuration(_))
        ));

        let mut same_version = base.clone();
        same_version.stable_version = "2".to_owned();
        assert!(matches!(
            RolloutController::resume(same_version, router.clone(), alarm.clone()),
            Err(RolloutError::SameVersion(_))
        ));

        let mut overrun = base.clone();
        overrun.steps_applied = 11;
        assert!(matches!(
            RolloutController::resume(overrun, router.clone(), alarm.clone()),
            Err(RolloutError::InvalidState { .. })
        ));

        let mut stalled = base;
        stalled.steps_applied = 10;
        stalled.current_traffic_percent = 100;
        assert!(matches!(
            RolloutController::resume(stalled, router, alarm),
            Err(RolloutError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn rollback_publishes_an_alarm_notification() {
        let topics = InMemoryTopics::new();
        let topic = TopicHandle::new("alarm-topic");
        let inbox = DurableQueue::new("alarm-inbox", Duration::from_secs(30));
        topics.subscribe(&topic, inbox.clone());

        let (controller, _router) = controller(StepSchedule::fast(), Some(1));
        let mut controller =
            controller.with_notifier(Publisher::new(Arc::new(topics.clone())), topic);
        controller.tick(1).await.expect("tick");

        let delivered = inbox.receive(10);
        assert_eq!(delivered.len(), 1);
        let body: serde_json::Value =
            serde_json::from_str(&delivered[0].body).expect("json notification");
        assert_eq!(body["NewStateValue"], "ALARM");
        assert_eq!(body["DeploymentGroup"], GROUP);
        assert_eq!(body["Step"], 1);
    }

    #[tokio::test]
    async fn undeliverable_notification_does_not_block_rollback() {
        let topics = InMemoryTopics::new();
        let (controller, router) = controller(StepSchedule::fast(), Some(2));
        let mut controller = controller.with_notifier(
            Publisher::new(Arc::new(topics)),
            TopicHandle::new("missing"),
        );
        controller.tick(1).await.expect("tick");
        assert!(matches!(
            controller.tick(2).await.expect("tick"),
            TickOutcome::RolledBack(_)
        ));
        assert_eq!(router.revert_count(GROUP), 1);
    }
}
