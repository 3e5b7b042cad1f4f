//! ---
//! grelay_section: "04-deployment-rollout"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Time-driven scheduler for rollout ticks."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::controller::{DeploymentState, RolloutController, RolloutError, TickOutcome};

/// Ticks a controller on its schedule until the rollout is terminal.
///
/// The first step is applied immediately, later steps one interval apart.
/// When a state file is set the state is written after every tick, so a
/// restarted runner resumes at the next step.
#[derive(Debug)]
pub struct RolloutRunner {
    controller: RolloutController,
    interval: Duration,
    state_file: Option<PathBuf>,
}

impl RolloutRunner {
    pub fn new(controller: RolloutController) -> Self {
        let interval = controller.state().schedule.interval;
        Self {
            controller,
            interval,
            state_file: None,
        }
    }

    /// Override the schedule's interval, e.g. for drills.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub async fn run(mut self) -> Result<DeploymentState, RolloutError> {
        self.persist()?;
        while !self.controller.state().is_terminal() {
            let step = self.controller.state().steps_applied + 1;
            let outcome = self.controller.tick(step).await?;
            self.persist()?;
            debug!(step, outcome = ?outcome, "rollout tick finished");
            match outcome {
                TickOutcome::Advanced { .. } | TickOutcome::Duplicate => sleep(self.interval).await,
                TickOutcome::Succeeded | TickOutcome::RolledBack(_) => break,
            }
        }
        let state = self.controller.into_state();
        info!(
            rollout_id = %state.id,
            group = %state.group,
            status = %state.status,
            steps_applied = state.steps_applied,
            "rollout finished"
        );
        Ok(state)
    }

    fn persist(&self) -> Result<(), RolloutError> {
        if let Some(path) = &self.state_file {
            self.controller.state().save(path)?;
        }
        Ok(())
    }
}
