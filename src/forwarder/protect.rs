//! Loop prevention for outbound sockets
//!
//! Every forwarding socket must be exempted from the tunnel's own routing
//! before it connects or sends, otherwise its traffic re-enters the tunnel
//! device and is forwarded again.

use std::io;
use std::sync::Arc;

use socket2::Socket;

use crate::config::ProtectConfig;
use crate::error::EngineError;

/// Host primitive exempting one socket from tunnel routing
pub trait SocketProtector: Send + Sync {
    fn protect(&self, socket: &Socket) -> io::Result<()>;
    fn name(&self) -> &'static str;
}

/// `SO_MARK` matched by a routing rule that bypasses the tunnel
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy)]
pub struct FwMarkProtector {
    mark: u32,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl FwMarkProtector {
    pub fn new(mark: u32) -> Self {
        Self { mark }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl SocketProtector for FwMarkProtector {
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        socket.set_mark(self.mark)
    }

    fn name(&self) -> &'static str {
        "fwmark"
    }
}

/// `SO_BINDTODEVICE` onto the physical uplink interface
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone)]
pub struct BindDeviceProtector {
    interface: String,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl BindDeviceProtector {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl SocketProtector for BindDeviceProtector {
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        socket.bind_device(Some(self.interface.as_bytes()))
    }

    fn name(&self) -> &'static str {
        "bind-device"
    }
}

/// Applies each protector in order; the first failure wins
pub struct ChainProtector {
    protectors: Vec<Box<dyn SocketProtector>>,
}

impl SocketProtector for ChainProtector {
    fn protect(&self, socket: &Socket) -> io::Result<()> {
        for p in &self.protectors {
            p.protect(socket)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

/// No-op protector. Only correct when the tunnel's routing already excludes
/// this process (per-uid routing) or in tests against loopback.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughProtector;

impl SocketProtector for PassthroughProtector {
    fn protect(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

/// Build the protector described by `config`.
///
/// Fails with [`EngineError::Unprotected`] when nothing is configured; the
/// engine must not forward without a loop-prevention primitive.
pub fn from_config(config: &ProtectConfig) -> Result<Arc<dyn SocketProtector>, EngineError> {
    if !config.is_configured() {
        return Err(EngineError::Unprotected);
    }
    build(config)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn build(config: &ProtectConfig) -> Result<Arc<dyn SocketProtector>, EngineError> {
    let mut protectors: Vec<Box<dyn SocketProtector>> = Vec::new();
    if let Some(mark) = config.fwmark {
        protectors.push(Box::new(FwMarkProtector::new(mark)));
    }
    if let Some(ref interface) = config.bind_interface {
        if interface.is_empty() {
            return Err(EngineError::Config("protect.bind_interface is empty".into()));
        }
        protectors.push(Box::new(BindDeviceProtector::new(interface.clone())));
    }

    if protectors.len() == 1 {
        let only = protectors.remove(0);
        tracing::info!("Outbound sockets protected with {}", only.name());
        return Ok(Arc::from(only));
    }
    tracing::info!("Outbound sockets protected with fwmark and bind-device");
    Ok(Arc::new(ChainProtector { protectors }))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn build(_config: &ProtectConfig) -> Result<Arc<dyn SocketProtector>, EngineError> {
    Err(EngineError::Config(
        "fwmark and bind_interface protection are only available on Linux".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Type};

    #[test]
    fn test_unconfigured_is_refused() {
        let err = from_config(&ProtectConfig::default()).err().unwrap();
        assert!(matches!(err, EngineError::Unprotected));
    }

    #[test]
    fn test_passthrough_accepts_any_socket() {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap();
        assert!(PassthroughProtector.protect(&socket).is_ok());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_chain_order() {
        let config = ProtectConfig {
            fwmark: Some(0x51),
            bind_interface: Some("lo".into()),
        };
        let protector = from_config(&config).unwrap();
        assert_eq!(protector.name(), "chain");

        let single = from_config(&ProtectConfig {
            fwmark: Some(0x51),
            bind_interface: None,
        })
        .unwrap();
        assert_eq!(single.name(), "fwmark");
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_empty_interface_rejected() {
        let config = ProtectConfig {
            fwmark: None,
            bind_interface: Some(String::new()),
        };
        assert!(matches!(from_config(&config), Err(EngineError::Config(_))));
    }
}
