//! Plan execution
//!
//! Every action runs on its own detached task as soon as the actions it
//! depends on have settled. A failure is recorded against the action and
//! only skips the actions that `require` it; there are no retries here, the
//! next convergence pass replans from freshly observed state.

use super::collector::{unit_name, APPLICATION_LABEL};
use crate::driver::{
    run_blocking, ContainerDriver, ContainerSpec, VolumeDriver, VolumeMount,
};
use crate::error::{ErrorKind, Result, RuneError};
use crate::handoff::{HandoffSender, SourceHandoff, VolumeTransport};
use crate::model::{Action, ActionId, Application, BlockedVolume, NodeId, Plan};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Collaborators an executor acts through
#[derive(Clone)]
pub struct Drivers {
    /// Local container runtime
    pub containers: Arc<dyn ContainerDriver>,
    /// Local volume storage
    pub volumes: Arc<dyn VolumeDriver>,
    /// Transport to other nodes' transfer endpoints
    pub transport: Arc<dyn VolumeTransport>,
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Prefix of the units this agent manages
    pub namespace: String,
    /// Upper bound on a single volume push
    pub transfer_timeout: Duration,
    /// Upper bound on waiting for an incoming volume
    pub arrival_timeout: Duration,
    /// How often to look for an incoming volume
    pub arrival_poll_interval: Duration,
    /// Address linked applications are reached through
    pub link_host: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            namespace: "rune--".to_string(),
            transfer_timeout: Duration::from_secs(300),
            arrival_timeout: Duration::from_secs(600),
            arrival_poll_interval: Duration::from_millis(1000),
            link_host: "localhost".to_string(),
        }
    }
}

/// How an action ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed { kind: ErrorKind, error: String },
    /// Not attempted because a required action did not succeed
    Skipped { blocked_by: Vec<ActionId> },
}

/// Outcome of one planned action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    pub id: ActionId,
    pub action: Action,
    pub outcome: ActionOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ActionResult {
    fn succeeded(&self) -> bool {
        self.outcome == ActionOutcome::Succeeded
    }
}

/// Result of executing one plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Identifier of the convergence pass
    pub pass_id: Uuid,
    /// Node the plan ran on
    pub node: NodeId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Per-action outcomes, in plan order
    pub results: Vec<ActionResult>,
    /// Volumes withheld by the planner
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<BlockedVolume>,
    /// Phase history of every outgoing handoff
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handoffs: Vec<SourceHandoff>,
}

impl ExecutionReport {
    /// Check if every action succeeded and nothing was blocked
    pub fn is_success(&self) -> bool {
        self.blocked.is_empty() && self.results.iter().all(ActionResult::succeeded)
    }

    /// Actions that failed or were skipped
    pub fn failures(&self) -> impl Iterator<Item = &ActionResult> {
        self.results.iter().filter(|result| !result.succeeded())
    }
}

struct Finished {
    result: ActionResult,
    handoff: Option<SourceHandoff>,
}

/// Applies plans through the local drivers
#[derive(Clone)]
pub struct ActionExecutor {
    drivers: Drivers,
    config: ExecutorConfig,
}

impl ActionExecutor {
    /// Create an executor
    pub fn new(drivers: Drivers, config: ExecutorConfig) -> Self {
        Self { drivers, config }
    }

    /// Execute a plan
    ///
    /// Returns once every action has either finished or been skipped.
    pub async fn execute(&self, plan: &Plan) -> ExecutionReport {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            "Pass {} on {}: executing {} action(s)",
            pass_id,
            plan.node,
            plan.actions.len()
        );
        for blocked in &plan.blocked {
            warn!(
                "Not starting {}: volume {} is claimed by {}",
                blocked.application,
                blocked.volume,
                blocked
                    .claimants
                    .iter()
                    .map(NodeId::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Finished>();
        let mut settled: BTreeMap<ActionId, ActionResult> = BTreeMap::new();
        let mut launched: Vec<bool> = vec![false; plan.actions.len()];
        let mut handoffs = Vec::new();
        let mut running = 0usize;

        loop {
            let mut progressed = true;
            while progressed {
                progressed = false;
                for (index, planned) in plan.actions.iter().enumerate() {
                    if launched[index] {
                        continue;
                    }
                    let ready = planned
                        .requires
                        .iter()
                        .chain(planned.after.iter())
                        .all(|dep| settled.contains_key(dep));
                    if !ready {
                        continue;
                    }

                    launched[index] = true;
                    progressed = true;

                    let blocked_by: Vec<ActionId> = planned
                        .requires
                        .iter()
                        .copied()
                        .filter(|dep| !settled.get(dep).is_some_and(ActionResult::succeeded))
                        .collect();
                    if !blocked_by.is_empty() {
                        warn!("Skipping {}: required action(s) did not succeed", planned.action);
                        let now = Utc::now();
                        settled.insert(
                            planned.id,
                            ActionResult {
                                id: planned.id,
                                action: planned.action.clone(),
                                outcome: ActionOutcome::Skipped { blocked_by },
                                started_at: now,
                                finished_at: now,
                            },
                        );
                        continue;
                    }

                    running += 1;
                    self.spawn_action(planned.id, planned.action.clone(), tx.clone());
                }
            }

            if running == 0 {
                break;
            }
            match rx.recv().await {
                Some(finished) => {
                    running -= 1;
                    if let Some(handoff) = finished.handoff {
                        handoffs.push(handoff);
                    }
                    settled.insert(finished.result.id, finished.result);
                }
                None => break,
            }
        }

        for (index, planned) in plan.actions.iter().enumerate() {
            if !launched[index] {
                let now = Utc::now();
                settled.insert(
                    planned.id,
                    ActionResult {
                        id: planned.id,
                        action: planned.action.clone(),
                        outcome: ActionOutcome::Failed {
                            kind: ErrorKind::Driver,
                            error: "unsatisfiable dependency".to_string(),
                        },
                        started_at: now,
                        finished_at: now,
                    },
                );
            }
        }

        let report = ExecutionReport {
            pass_id,
            node: plan.node.clone(),
            started_at,
            finished_at: Utc::now(),
            results: settled.into_values().collect(),
            blocked: plan.blocked.clone(),
            handoffs,
        };
        info!(
            "Pass {} on {} finished: {} failed or skipped",
            pass_id,
            plan.node,
            report.failures().count()
        );
        report
    }

    fn spawn_action(&self, id: ActionId, action: Action, tx: mpsc::UnboundedSender<Finished>) {
        let executor = self.clone();
        tokio::spawn(async move {
            let started_at = Utc::now();
            let inner = {
                let action = action.clone();
                tokio::spawn(async move { executor.run_action(&action).await })
            };
            let (result, handoff) = match inner.await {
                Ok(done) => done,
                Err(e) => (
                    Err(RuneError::Internal(format!("Action task failed: {}", e))),
                    None,
                ),
            };

            let outcome = match result {
                Ok(()) => {
                    info!("Completed {}", action);
                    ActionOutcome::Succeeded
                }
                Err(e) => {
                    warn!("Failed to {}: {}", action, e);
                    ActionOutcome::Failed {
                        kind: e.kind(),
                        error: e.to_string(),
                    }
                }
            };

            let _ = tx.send(Finished {
                result: ActionResult {
                    id,
                    action,
                    outcome,
                    started_at,
                    finished_at: Utc::now(),
                },
                handoff,
            });
        });
    }

    async fn run_action(&self, action: &Action) -> (Result<()>, Option<SourceHandoff>) {
        debug!("Starting {}", action);
        match action {
            Action::StartApplication { application } => {
                (self.start_application(application).await, None)
            }
            Action::StopApplication { application } => {
                (self.stop_application(application).await, None)
            }
            Action::WaitForVolumeArrival { volume, from } => {
                (self.wait_for_volume(volume, from).await, None)
            }
            Action::HandoffVolume { volume, to } => {
                let mut handoff = SourceHandoff::new(volume, to.clone());
                let sender = HandoffSender::new(
                    self.drivers.volumes.clone(),
                    self.drivers.transport.clone(),
                    self.config.transfer_timeout,
                );
                let result = sender.hand_off(&mut handoff).await.map(|_| ());
                (result, Some(handoff))
            }
            Action::NoOp => (Ok(()), None),
        }
    }

    async fn start_application(&self, app: &Application) -> Result<()> {
        let name = unit_name(&self.config.namespace, &app.name);

        let containers = self.drivers.containers.clone();
        let existing = run_blocking(move || containers.list_units())
            .await?
            .into_iter()
            .find(|unit| unit.name() == name);
        if let Some(unit) = existing {
            if unit.is_active() {
                debug!("Unit {} is already running", name);
                return Ok(());
            }
            debug!("Removing stale unit {}", name);
            let containers = self.drivers.containers.clone();
            let stale = name.clone();
            run_blocking(move || containers.remove(&stale)).await?;
        }

        let mut mounts = Vec::new();
        if let Some(attached) = &app.volume {
            let volumes = self.drivers.volumes.clone();
            let volume_name = attached.name.clone();
            let local = run_blocking(move || {
                match volumes
                    .list_volumes()?
                    .into_iter()
                    .find(|v| v.name == volume_name)
                {
                    Some(volume) => Ok(volume),
                    None => volumes.create_from_local(&volume_name),
                }
            })
            .await?;
            mounts.push(VolumeMount {
                host_path: local.path,
                container_path: attached.mountpoint.clone(),
            });
        }

        let mut environment = BTreeMap::new();
        for link in &app.links {
            environment.extend(link.environment(&self.config.link_host));
        }
        environment.extend(app.environment.clone());

        let mut labels = BTreeMap::new();
        labels.insert(APPLICATION_LABEL.to_string(), serde_json::to_string(app)?);

        let spec = ContainerSpec {
            name,
            image: app.image.full_name(),
            ports: app.ports.iter().copied().collect(),
            environment,
            mounts,
            labels,
        };
        let containers = self.drivers.containers.clone();
        run_blocking(move || containers.create(&spec)).await
    }

    async fn stop_application(&self, app: &Application) -> Result<()> {
        let name = unit_name(&self.config.namespace, &app.name);
        let containers = self.drivers.containers.clone();

        run_blocking(move || {
            let Some(unit) = containers
                .list_units()?
                .into_iter()
                .find(|unit| unit.name() == name)
            else {
                debug!("Unit {} is already gone", name);
                return Ok(());
            };
            if unit.is_active() {
                containers.stop(&name)?;
            }
            containers.remove(&name)
        })
        .await
    }

    async fn wait_for_volume(&self, volume: &str, from: &NodeId) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.arrival_timeout;
        info!("Waiting for volume {} from {}", volume, from);

        loop {
            let volumes = self.drivers.volumes.clone();
            let arrived = run_blocking(move || volumes.list_volumes())
                .await?
                .iter()
                .any(|v| v.name == volume);
            if arrived {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuneError::Timeout(format!(
                    "Volume {} did not arrive from {} within {:?}",
                    volume, from, self.config.arrival_timeout
                )));
            }
            tokio::time::sleep(self.config.arrival_poll_interval).await;
        }
    }
}
