//! Error types for the forwarding engine

use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::FlowKey;

/// Failure classes tracked by the engine's counters.
///
/// None of these crash the engine; each maps onto a degraded behaviour
/// (drop, skip or close) at the point where it happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed header, packet dropped
    ParseFailure,
    /// Owning identity unresolved, flow continues unattributed
    AttributionMiss,
    /// Protect/connect failed, forwarder discarded
    SocketSetupFailure,
    /// Mid-session read/write error, forwarder torn down
    SocketIoFailure,
    /// Soft ceiling reached, new tracking/forwarding refused
    CapacityExceeded,
    /// Closing one entity during a sweep or shutdown failed
    CleanupFailure,
}

/// Forwarder errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("socket setup failed for {key}: {source}")]
    SocketSetup {
        key: FlowKey,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddrV4, timeout: Duration },

    #[error("socket I/O failed: {0}")]
    SocketIo(#[from] io::Error),

    #[error("forwarder is not connected")]
    NotConnected,

    #[error("forwarder is closed")]
    Closed,

    #[error("uplink queue full ({depth} segments pending), remote is not reading")]
    UplinkStalled { depth: usize },

    #[error("downlink task failed: {0}")]
    Task(String),
}

impl ForwardError {
    /// Counter class for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SocketSetup { .. } | Self::ConnectTimeout { .. } => ErrorKind::SocketSetupFailure,
            Self::SocketIo(_) | Self::NotConnected | Self::Closed | Self::UplinkStalled { .. } => {
                ErrorKind::SocketIoFailure
            }
            Self::Task(_) => ErrorKind::CleanupFailure,
        }
    }
}

/// Engine-level errors (startup, configuration, device)
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tunnel device error: {0}")]
    Device(#[from] io::Error),

    #[error("forwarder error: {0}")]
    Forward(#[from] ForwardError),

    #[error("no loop-prevention primitive configured; refusing to forward")]
    Unprotected,
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_forward_error_kinds() {
        let key = FlowKey::new(Ipv4Addr::LOCALHOST, 1, Ipv4Addr::LOCALHOST, 2, 6);
        let setup = ForwardError::SocketSetup {
            key,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "mark"),
        };
        assert_eq!(setup.kind(), ErrorKind::SocketSetupFailure);

        let io_err = ForwardError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert_eq!(io_err.kind(), ErrorKind::SocketIoFailure);
        assert_eq!(ForwardError::UplinkStalled { depth: 4 }.kind(), ErrorKind::SocketIoFailure);
        assert!(setup.to_string().contains("TCP 127.0.0.1:1 -> 127.0.0.1:2"));
    }
}
