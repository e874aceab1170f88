//! Socket forwarders
//!
//! One forwarder per approved TCP or UDP flow. Each owns exactly one
//! protected outbound socket and one downlink task that turns socket
//! reads into synthesized datagrams on the tunnel device.
//!
//! ```text
//!  packet loop ──► uplink write ──► socket ──► remote
//!                                     │
//!  tun device ◄── synthesize ◄── downlink task
//!                     │
//!                     └──► ForwarderEvent ──► engine
//! ```

pub mod protect;
mod registry;
mod tcp;
mod udp;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::ForwarderConfig;
use crate::error::ErrorKind;
use crate::packet::FlowKey;
use crate::stats::EngineStats;
use crate::tun::TunWriter;

pub use protect::SocketProtector;
pub use registry::{CleanupReport, ForwarderRegistry};
pub use tcp::{TcpForwarder, TcpState};
pub use udp::UdpForwarder;

/// Lifecycle notifications sent by downlink tasks to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderEvent {
    /// TCP connect succeeded and the handshake was synthesized
    Connected(FlowKey),
    /// TCP connect failed; the client was sent a reset
    ConnectFailed { key: FlowKey, kind: ErrorKind },
    /// Remote closed gracefully (FIN injected)
    RemoteClosed(FlowKey),
    /// Socket error; TCP injected a reset
    Failed { key: FlowKey, kind: ErrorKind },
    /// UDP forwarder saw no traffic for its idle timeout
    IdleExpired(FlowKey),
}

impl ForwarderEvent {
    pub fn key(&self) -> &FlowKey {
        match self {
            Self::Connected(key)
            | Self::RemoteClosed(key)
            | Self::IdleExpired(key)
            | Self::ConnectFailed { key, .. }
            | Self::Failed { key, .. } => key,
        }
    }

    /// True when the forwarder behind this event is finished
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Connected(_))
    }
}

/// Everything a forwarder shares with the rest of the engine
#[derive(Clone)]
pub struct ForwarderContext {
    pub tun: TunWriter,
    pub protector: Arc<dyn SocketProtector>,
    pub config: Arc<ForwarderConfig>,
    pub stats: Arc<EngineStats>,
    pub events: mpsc::UnboundedSender<ForwarderEvent>,
}

impl ForwarderContext {
    fn emit(&self, event: ForwarderEvent) {
        // Receiver gone means the engine is shutting down
        let _ = self.events.send(event);
    }
}
