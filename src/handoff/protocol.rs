//! Volume handoff state machines
//!
//! Source side: `Idle -> Pushing -> Acknowledged -> Retired`, with any
//! failure going `-> Failed -> Idle` so the next convergence pass retries.
//!
//! Destination side: `Awaiting -> Receiving -> Complete`, or
//! `Receiving -> Failed -> Awaiting`.

use super::transport::VolumeTransport;
use crate::driver::{run_blocking, VolumeDriver, VolumeSnapshot};
use crate::error::{Result, RuneError};
use crate::model::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

/// Source-side handoff phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePhase {
    Idle,
    Pushing,
    Acknowledged,
    Retired,
    Failed,
}

impl SourcePhase {
    fn can_become(self, next: SourcePhase) -> bool {
        matches!(
            (self, next),
            (SourcePhase::Idle, SourcePhase::Pushing)
                | (SourcePhase::Pushing, SourcePhase::Acknowledged)
                | (SourcePhase::Pushing, SourcePhase::Failed)
                | (SourcePhase::Acknowledged, SourcePhase::Retired)
                | (SourcePhase::Acknowledged, SourcePhase::Failed)
                | (SourcePhase::Failed, SourcePhase::Idle)
        )
    }
}

/// Destination-side handoff phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationPhase {
    Awaiting,
    Receiving,
    Complete,
    Failed,
}

impl DestinationPhase {
    fn can_become(self, next: DestinationPhase) -> bool {
        matches!(
            (self, next),
            (DestinationPhase::Awaiting, DestinationPhase::Receiving)
                | (DestinationPhase::Receiving, DestinationPhase::Complete)
                | (DestinationPhase::Receiving, DestinationPhase::Failed)
                | (DestinationPhase::Failed, DestinationPhase::Awaiting)
        )
    }
}

/// Receipt returned by the destination once a volume is published there
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAck {
    /// Volume name
    pub volume: String,
    /// Digest of the snapshot as received
    pub checksum: String,
    /// Receiving node
    pub node: NodeId,
    /// When the volume was published
    pub received_at: DateTime<Utc>,
}

/// One outgoing handoff and the phases it went through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHandoff {
    /// Volume being handed off
    pub volume: String,
    /// Node receiving the volume
    pub destination: NodeId,
    /// Phases in order, starting with `Idle`
    pub history: Vec<SourcePhase>,
}

impl SourceHandoff {
    /// Start tracking a handoff in the `Idle` phase
    pub fn new(volume: &str, destination: NodeId) -> Self {
        Self {
            volume: volume.to_string(),
            destination,
            history: vec![SourcePhase::Idle],
        }
    }

    /// Current phase
    pub fn phase(&self) -> SourcePhase {
        self.history.last().copied().unwrap_or(SourcePhase::Idle)
    }

    fn advance(&mut self, next: SourcePhase) -> Result<()> {
        let current = self.phase();
        if !current.can_become(next) {
            return Err(RuneError::Internal(format!(
                "Invalid handoff transition for {}: {:?} -> {:?}",
                self.volume, current, next
            )));
        }
        self.history.push(next);
        Ok(())
    }

    fn fail(&mut self, err: RuneError) -> RuneError {
        if self.advance(SourcePhase::Failed).is_ok() {
            let _ = self.advance(SourcePhase::Idle);
        }
        err
    }
}

/// Pushes locally owned volumes to other nodes
#[derive(Clone)]
pub struct HandoffSender {
    volumes: Arc<dyn VolumeDriver>,
    transport: Arc<dyn VolumeTransport>,
    timeout: Duration,
}

impl HandoffSender {
    /// Create a sender
    pub fn new(
        volumes: Arc<dyn VolumeDriver>,
        transport: Arc<dyn VolumeTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            volumes,
            transport,
            timeout,
        }
    }

    /// Run the source side of a handoff
    ///
    /// The local copy is deleted only after the destination acknowledges a
    /// snapshot whose digest matches the one sent.
    pub async fn hand_off(&self, handoff: &mut SourceHandoff) -> Result<TransferAck> {
        handoff.advance(SourcePhase::Pushing)?;
        info!(
            "Pushing volume {} to {}",
            handoff.volume, handoff.destination
        );

        let volumes = self.volumes.clone();
        let name = handoff.volume.clone();
        let snapshot = match run_blocking(move || volumes.export_snapshot(&name)).await {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(handoff.fail(e)),
        };
        let sent_checksum = snapshot.checksum.clone();

        let pushed = tokio::time::timeout(
            self.timeout,
            self.transport.push(&handoff.destination, snapshot),
        )
        .await;

        let ack = match pushed {
            Ok(Ok(ack)) => ack,
            Ok(Err(e)) => return Err(handoff.fail(e)),
            Err(_) => {
                return Err(handoff.fail(RuneError::Timeout(format!(
                    "Pushing volume {} to {} took longer than {:?}",
                    handoff.volume, handoff.destination, self.timeout
                ))))
            }
        };

        if ack.volume != handoff.volume || ack.checksum != sent_checksum {
            return Err(handoff.fail(RuneError::Transfer(format!(
                "Acknowledgement for volume {} does not match what was sent",
                handoff.volume
            ))));
        }
        handoff.advance(SourcePhase::Acknowledged)?;
        info!(
            "Volume {} acknowledged by {}",
            handoff.volume, handoff.destination
        );

        let volumes = self.volumes.clone();
        let name = handoff.volume.clone();
        if let Err(e) = run_blocking(move || volumes.delete(&name)).await {
            error!(
                "Volume {} was received by {} but the local copy could not be retired: {}",
                handoff.volume, handoff.destination, e
            );
            return Err(handoff.fail(e));
        }
        handoff.advance(SourcePhase::Retired)?;
        info!("Retired local copy of volume {}", handoff.volume);

        Ok(ack)
    }
}

/// Accepts volumes pushed by other nodes
pub struct HandoffReceiver {
    node: NodeId,
    volumes: Arc<dyn VolumeDriver>,
    phases: RwLock<HashMap<String, DestinationPhase>>,
}

impl HandoffReceiver {
    /// Create a receiver for the local node
    pub fn new(node: NodeId, volumes: Arc<dyn VolumeDriver>) -> Self {
        Self {
            node,
            volumes,
            phases: RwLock::new(HashMap::new()),
        }
    }

    /// Current phase for a volume
    pub fn phase(&self, volume: &str) -> Result<DestinationPhase> {
        let phases = self
            .phases
            .read()
            .map_err(|_| RuneError::Lock("Failed to acquire read lock".to_string()))?;

        Ok(phases
            .get(volume)
            .copied()
            .unwrap_or(DestinationPhase::Awaiting))
    }

    fn transition(&self, volume: &str, next: DestinationPhase) -> Result<()> {
        let mut phases = self
            .phases
            .write()
            .map_err(|_| RuneError::Lock("Failed to acquire write lock".to_string()))?;

        let current = match phases.get(volume).copied() {
            // A completed volume that is pushed again starts over
            Some(DestinationPhase::Complete) | None => DestinationPhase::Awaiting,
            Some(phase) => phase,
        };
        if !current.can_become(next) {
            return Err(RuneError::Transfer(format!(
                "Volume {} cannot move from {:?} to {:?}",
                volume, current, next
            )));
        }

        phases.insert(volume.to_string(), next);
        Ok(())
    }

    /// Scratch file for an incoming snapshot archive
    pub fn spool(&self) -> Result<NamedTempFile> {
        self.volumes.spool()
    }

    /// Receive a pushed snapshot and publish it locally
    pub async fn receive(&self, snapshot: VolumeSnapshot) -> Result<TransferAck> {
        let volume = snapshot.volume.clone();
        let checksum = snapshot.checksum.clone();

        self.transition(&volume, DestinationPhase::Receiving)?;
        info!("Receiving volume {} ({} bytes)", volume, snapshot.size);

        let volumes = self.volumes.clone();
        match run_blocking(move || volumes.create_from_transfer(snapshot)).await {
            Ok(_) => {
                self.transition(&volume, DestinationPhase::Complete)?;
                info!("Volume {} received and published", volume);
                Ok(TransferAck {
                    volume,
                    checksum,
                    node: self.node.clone(),
                    received_at: Utc::now(),
                })
            }
            Err(e) => {
                warn!("Receiving volume {} failed: {}", volume, e);
                self.transition(&volume, DestinationPhase::Failed)?;
                self.transition(&volume, DestinationPhase::Awaiting)?;
                Err(e)
            }
        }
    }
}
