//! Volume handoff between nodes
//!
//! A volume moves by push: the node owning it exports a snapshot and sends
//! it to the destination's transfer endpoint. The destination publishes the
//! volume only once the whole snapshot is verified, and the source retires
//! its copy only after the destination acknowledges it.

pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{
    DestinationPhase, HandoffReceiver, HandoffSender, SourceHandoff, SourcePhase, TransferAck,
};
pub use server::{TransferServer, DEFAULT_TRANSFER_PORT};
pub use transport::{HttpTransport, LocalTransport, VolumeTransport};
