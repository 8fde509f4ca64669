//! Volume transfer transports

use super::protocol::{HandoffReceiver, TransferAck};
use crate::driver::VolumeSnapshot;
use crate::error::{Result, RuneError};
use crate::model::NodeId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Header carrying the snapshot digest
pub const CHECKSUM_HEADER: &str = "x-rune-checksum";

/// Path prefix of the volume transfer endpoint
pub const VOLUMES_PATH: &str = "/v1/volumes/";

/// Delivers a volume snapshot to another node's transfer endpoint
#[async_trait]
pub trait VolumeTransport: Send + Sync {
    /// Push a snapshot and wait for the destination's acknowledgement
    async fn push(&self, destination: &NodeId, snapshot: VolumeSnapshot) -> Result<TransferAck>;
}

/// Transport posting snapshots to the destination's HTTP transfer endpoint
pub struct HttpTransport {
    client: reqwest::Client,
    port: u16,
}

impl HttpTransport {
    /// Create a transport targeting `port` on each destination node
    pub fn new(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            port,
        }
    }

    /// Endpoint URL for a volume on a destination node
    ///
    /// A destination that already names a port is used as-is.
    pub fn endpoint(&self, destination: &NodeId, volume: &str) -> String {
        let host = destination.as_str();
        if host.contains(':') {
            format!("http://{}{}{}", host, VOLUMES_PATH, volume)
        } else {
            format!("http://{}:{}{}{}", host, self.port, VOLUMES_PATH, volume)
        }
    }
}

#[async_trait]
impl VolumeTransport for HttpTransport {
    async fn push(&self, destination: &NodeId, snapshot: VolumeSnapshot) -> Result<TransferAck> {
        let url = self.endpoint(destination, &snapshot.volume);
        debug!("POST {} ({} bytes)", url, snapshot.size);

        let archive = tokio::fs::File::open(&snapshot.archive).await?;
        let response = self
            .client
            .post(&url)
            .header(CHECKSUM_HEADER, &snapshot.checksum)
            .header(reqwest::header::CONTENT_LENGTH, snapshot.size)
            .body(reqwest::Body::from(archive))
            .send()
            .await
            .map_err(|e| RuneError::Transfer(format!("Failed to reach {}: {}", destination, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RuneError::Transfer(format!(
                "{} refused volume {}: {} {}",
                destination, snapshot.volume, status, body
            )));
        }

        response
            .json::<TransferAck>()
            .await
            .map_err(|e| RuneError::Transfer(format!("Invalid acknowledgement from {}: {}", destination, e)))
    }
}

/// Transport delivering snapshots to receivers in the same process
#[derive(Default)]
pub struct LocalTransport {
    receivers: RwLock<HashMap<NodeId, Arc<HandoffReceiver>>>,
}

impl LocalTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the receiver for a node
    pub fn register(&self, node: NodeId, receiver: Arc<HandoffReceiver>) -> Result<()> {
        let mut receivers = self
            .receivers
            .write()
            .map_err(|_| RuneError::Lock("Failed to acquire write lock".to_string()))?;
        receivers.insert(node, receiver);
        Ok(())
    }
}

#[async_trait]
impl VolumeTransport for LocalTransport {
    async fn push(&self, destination: &NodeId, snapshot: VolumeSnapshot) -> Result<TransferAck> {
        let receiver = {
            let receivers = self
                .receivers
                .read()
                .map_err(|_| RuneError::Lock("Failed to acquire read lock".to_string()))?;
            receivers.get(destination).cloned()
        };

        match receiver {
            Some(receiver) => receiver.receive(snapshot).await,
            None => Err(RuneError::Transfer(format!(
                "No transfer endpoint for {}",
                destination
            ))),
        }
    }
}
