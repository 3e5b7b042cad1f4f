//! ---
//! grelay_section: "04-deployment-rollout"
//! grelay_subsection: "module"
//! grelay_type: "source"
//! grelay_scope: "code"
//! grelay_description: "Weighted alias routing between function versions."
//! grelay_version: "v0.1.0"
//! grelay_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("routing for {group} failed: {reason}")]
pub struct RoutingError {
    pub group: String,
    pub reason: String,
}

/// Moves live traffic for a deployment group between two versions.
///
/// Both operations set absolute targets, so repeating a call is harmless.
pub trait TrafficRouter: Send + Sync {
    /// Send `percent` of traffic to `target`, the rest to `stable`.
    fn shift(
        &self,
        group: &str,
        stable: &str,
        target: &str,
        percent: u8,
    ) -> Result<(), RoutingError>;
    /// Send all traffic back to `stable`.
    fn revert(&self, group: &str, stable: &str) -> Result<(), RoutingError>;
}

/// One routing action, as recorded by [`AliasRouter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RouteAction {
    Shift {
        group: String,
        target: String,
        percent: u8,
    },
    Revert {
        group: String,
        stable: String,
    },
}

/// Current weights of an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasWeights {
    pub stable: String,
    pub canary: Option<(String, u8)>,
}

#[derive(Debug, Default)]
struct RouterState {
    aliases: HashMap<String, AliasWeights>,
    history: Vec<RouteAction>,
}

/// In-process alias router that keeps weights and an action history.
#[derive(Debug, Clone, Default)]
pub struct AliasRouter {
    state: Arc<Mutex<RouterState>>,
}

impl AliasRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weights(&self, group: &str) -> Option<AliasWeights> {
        self.state.lock().aliases.get(group).cloned()
    }

    pub fn history(&self) -> Vec<RouteAction> {
        self.state.lock().history.clone()
    }

    pub fn revert_count(&self, group: &str) -> usize {
        self.state
            .lock()
            .history
            .iter()
            .filter(|action| matches!(action, RouteAction::Revert { group: g, .. } if g == group))
            .count()
    }
}

impl TrafficRouter for AliasRouter {
    fn shift(
        &self,
        group: &str,
        stable: &str,
        target: &str,
        percent: u8,
    ) -> Result<(), RoutingError> {
        if percent > 100 {
            return Err(RoutingError {
                group: group.to_owned(),
                reason: format!("weight {percent}% exceeds 100%"),
            });
        }
        let weights = if percent == 100 {
            // full promotion: the target becomes the alias' only version
            AliasWeights {
                stable: target.to_owned(),
                canary: None,
            }
        } else {
            AliasWeights {
                stable: stable.to_owned(),
                canary: Some((target.to_owned(), percent)),
            }
        };
        let mut state = self.state.lock();
        state.aliases.insert(group.to_owned(), weights);
        state.history.push(RouteAction::Shift {
            group: group.to_owned(),
            target: target.to_owned(),
            percent,
        });
        info!(group, target, traffic_percent = percent, "traffic shifted");
        Ok(())
    }

    fn revert(&self, group: &str, stable: &str) -> Result<(), RoutingError> {
        let mut state = self.state.lock();
        state.aliases.insert(
            group.to_owned(),
            AliasWeights {
                stable: stable.to_owned(),
                canary: None,
            },
        );
        state.history.push(RouteAction::Revert {
            group: group.to_owned(),
            stable: stable.to_owned(),
        });
        info!(group, stable, "traffic reverted to stable version");
        Ok(())
    }
}
