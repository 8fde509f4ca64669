//! Convergence planner
//!
//! Computes the ordered actions that move one node from its observed state
//! to the desired deployment. Planning is pure: the same inputs always give
//! the same plan, and a converged node gets an empty one.
//!
//! Ordering rules:
//! - stops come first, so ports and resources are freed before starts
//! - a volume is handed off only after its application has stopped here
//! - a start that needs a volume held elsewhere waits for its arrival
//! - within each class, actions are sorted by application or volume name

use super::ownership::{Ownership, OwnershipIndex};
use crate::error::{Result, RuneError};
use crate::model::{
    Action, ActionId, Application, BlockedVolume, ClusterState, Deployment, NodeId, Plan,
    PlannedAction,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Plan the actions for `local`
///
/// Fails with a configuration error before anything is planned if the
/// desired deployment is contradictory.
pub fn plan(desired: &Deployment, current: &ClusterState, local: &NodeId) -> Result<Plan> {
    desired.validate()?;
    Planner::new(desired, current, local).plan()
}

struct Planner<'a> {
    desired: &'a Deployment,
    current: &'a ClusterState,
    local: &'a NodeId,
    ownership: OwnershipIndex,
}

struct PendingStart<'a> {
    application: &'a Application,
    waits_for: Option<String>,
}

impl<'a> Planner<'a> {
    fn new(desired: &'a Deployment, current: &'a ClusterState, local: &'a NodeId) -> Self {
        Self {
            desired,
            current,
            local,
            ownership: OwnershipIndex::new(current),
        }
    }

    fn plan(&self) -> Result<Plan> {
        let desired_apps: BTreeMap<&str, &Application> = self
            .desired
            .applications_on(self.local)
            .into_iter()
            .map(|app| (app.name.as_str(), app))
            .collect();

        let local_state = self.current.node(self.local);
        let empty = BTreeMap::new();
        let running = local_state.map(|n| &n.applications).unwrap_or(&empty);

        let mut actions = Vec::new();
        let mut blocked = Vec::new();

        let mut stop_ids: BTreeMap<&str, ActionId> = BTreeMap::new();
        for (name, app) in running {
            if desired_apps.contains_key(name.as_str()) {
                continue;
            }
            let id = actions.len();
            stop_ids.insert(name.as_str(), id);
            actions.push(PlannedAction {
                id,
                action: Action::StopApplication {
                    application: app.clone(),
                },
                requires: Vec::new(),
                after: Vec::new(),
            });
        }

        if let Some(state) = local_state {
            for volume in state.volumes.keys() {
                let Some(target) = self.desired.node_for_volume(volume)? else {
                    continue;
                };
                if target == self.local {
                    continue;
                }

                match self.ownership.owner_of(volume) {
                    Ok(Some(ref owner)) if owner == self.local => {
                        let requires = running
                            .values()
                            .filter(|app| app.volume_name() == Some(volume.as_str()))
                            .filter_map(|app| stop_ids.get(app.name.as_str()).copied())
                            .collect();
                        let id = actions.len();
                        actions.push(PlannedAction {
                            id,
                            action: Action::HandoffVolume {
                                volume: volume.clone(),
                                to: target.clone(),
                            },
                            requires,
                            after: Vec::new(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Not handing off volume {}: {}", volume, e);
                        blocked.push(self.blocked_volume(
                            volume,
                            &self.application_for_volume(volume),
                            e,
                        ));
                    }
                }
            }
        }

        let mut waits: Vec<(String, NodeId)> = Vec::new();
        let mut starts: Vec<PendingStart<'_>> = Vec::new();
        for (name, app) in &desired_apps {
            if running.contains_key(*name) {
                continue;
            }

            let Some(volume) = app.volume_name() else {
                starts.push(PendingStart {
                    application: *app,
                    waits_for: None,
                });
                continue;
            };

            match self.ownership.owner_of(volume) {
                Ok(None) => starts.push(PendingStart {
                    application: *app,
                    waits_for: None,
                }),
                Ok(Some(owner)) if &owner == self.local => starts.push(PendingStart {
                    application: *app,
                    waits_for: None,
                }),
                Ok(Some(owner)) => {
                    waits.push((volume.to_string(), owner));
                    starts.push(PendingStart {
                        application: *app,
                        waits_for: Some(volume.to_string()),
                    });
                }
                Err(e) => {
                    warn!("Not starting {}: {}", name, e);
                    blocked.push(self.blocked_volume(volume, name, e));
                }
            }
        }

        waits.sort();
        let mut wait_ids: BTreeMap<String, ActionId> = BTreeMap::new();
        for (volume, from) in waits {
            let id = actions.len();
            wait_ids.insert(volume.clone(), id);
            actions.push(PlannedAction {
                id,
                action: Action::WaitForVolumeArrival { volume, from },
                requires: Vec::new(),
                after: Vec::new(),
            });
        }

        let mut all_stops: Vec<ActionId> = stop_ids.values().copied().collect();
        all_stops.sort_unstable();

        for start in starts {
            let id = actions.len();
            let requires = start
                .waits_for
                .as_ref()
                .and_then(|volume| wait_ids.get(volume).copied())
                .into_iter()
                .collect();
            actions.push(PlannedAction {
                id,
                action: Action::StartApplication {
                    application: start.application.clone(),
                },
                requires,
                after: all_stops.clone(),
            });
        }

        blocked.sort_by(|a, b| a.volume.cmp(&b.volume));

        debug!(
            "Planned {} action(s) for {} ({} blocked volume(s))",
            actions.len(),
            self.local,
            blocked.len()
        );

        Ok(Plan {
            node: self.local.clone(),
            actions,
            blocked,
        })
    }

    fn blocked_volume(&self, volume: &str, application: &str, error: RuneError) -> BlockedVolume {
        let claimants = match self.ownership.ownership(volume) {
            Ownership::Ambiguous(nodes) => nodes,
            Ownership::Owned(_) | Ownership::Unowned => Vec::new(),
        };
        BlockedVolume {
            volume: volume.to_string(),
            application: application.to_string(),
            claimants,
            kind: error.kind(),
            error: error.to_string(),
        }
    }

    fn application_for_volume(&self, volume: &str) -> String {
        self.desired
            .applications
            .values()
            .find(|app| app.volume_name() == Some(volume))
            .map(|app| app.name.clone())
            .unwrap_or_else(|| volume.to_string())
    }
}
