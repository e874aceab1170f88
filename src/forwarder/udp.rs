//! UDP forwarder
//!
//! Connectionless relay: uplink datagrams are sent fire-and-forget from a
//! protected, unconnected socket; replies are wrapped back into IPv4/UDP
//! with swapped addressing. There is no close signal, so forwarders are
//! reclaimed once idle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ForwarderContext, ForwarderEvent};
use crate::error::{ErrorKind, ForwardError};
use crate::flow::FlowEntry;
use crate::packet::build;
use crate::packet::FlowKey;
use crate::stats::EngineStats;

struct Shared {
    key: FlowKey,
    flow: Arc<FlowEntry>,
    ctx: ForwarderContext,
    active: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }
}

/// Live UDP relay for one flow
pub struct UdpForwarder {
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpForwarder {
    /// Open, protect and bind the outbound socket, then start the receive loop
    pub(crate) fn open(flow: Arc<FlowEntry>, ctx: ForwarderContext) -> Result<Arc<Self>, ForwardError> {
        let key = *flow.key();
        let setup = |source: std::io::Error| ForwardError::SocketSetup { key, source };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(socket2::Protocol::UDP)).map_err(setup)?;
        ctx.protector.protect(&socket).map_err(setup)?;
        let any = SocketAddr::from(([0, 0, 0, 0], 0));
        socket.bind(&SockAddr::from(any)).map_err(setup)?;
        socket.set_nonblocking(true).map_err(setup)?;
        let socket = Arc::new(UdpSocket::from_std(socket.into()).map_err(setup)?);

        let shared = Arc::new(Shared {
            key,
            flow,
            ctx,
            active: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        });

        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(downlink(shared.clone(), socket.clone(), signal));

        tracing::debug!("{}: udp relay open", key);
        Ok(Arc::new(Self {
            shared,
            socket,
            closed: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn key(&self) -> &FlowKey {
        &self.shared.key
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock()
    }

    /// No uplink or downlink traffic for the configured idle timeout
    pub fn is_idle(&self, now: Instant) -> bool {
        self.shared.idle(now) >= self.shared.ctx.config.udp_idle_timeout()
    }

    /// Send one datagram to the flow's destination
    pub async fn send_uplink(&self, payload: &[u8]) -> Result<(), ForwardError> {
        if !self.is_active() {
            return Err(ForwardError::Closed);
        }

        let dest = SocketAddr::V4(self.shared.key.destination());
        match self.socket.send_to(payload, dest).await {
            Ok(_) => {
                self.shared.flow.lock().telemetry_mut().record_uplink(payload.len());
                self.shared.ctx.stats.record_uplink(payload.len());
                self.shared.touch();
                Ok(())
            }
            Err(e) => {
                tracing::debug!("{}: send failed: {}", self.key(), e);
                self.shared.flow.lock().telemetry_mut().record_error();
                if let Err(close_err) = self.close().await {
                    tracing::debug!("{}: close after send failure: {}", self.key(), close_err);
                }
                Err(ForwardError::SocketIo(e))
            }
        }
    }

    /// Open a relay whose receive loop has already panicked
    #[cfg(test)]
    pub(crate) fn open_crashed(flow: Arc<FlowEntry>, ctx: ForwarderContext) -> Arc<Self> {
        let fwd = Self::open(flow, ctx).expect("open udp relay");
        fwd.shared.active.store(false, Ordering::Release);
        let crashed = tokio::spawn(async { panic!("receive loop crashed") });
        if let Some(task) = fwd.task.lock().replace(crashed) {
            task.abort();
        }
        fwd
    }

    /// Idempotent teardown, same contract as the TCP forwarder
    pub async fn close(&self) -> Result<(), ForwardError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.active.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);

        let handle = self.task.lock().take();
        let result = match handle {
            Some(mut handle) => {
                let timeout = self.shared.ctx.config.close_timeout();
                match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) if e.is_cancelled() => Ok(()),
                    Ok(Err(e)) => Err(ForwardError::Task(e.to_string())),
                    Err(_) => {
                        tracing::warn!(
                            "{}: receive loop still running after {:?}, aborting",
                            self.key(),
                            timeout
                        );
                        handle.abort();
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        };

        EngineStats::incr(&self.shared.ctx.stats.forwarders_closed);
        tracing::debug!("{}: udp relay closed", self.key());
        result
    }
}

impl Drop for UdpForwarder {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Receive replies and inject them as server → client datagrams. The
/// per-receive timeout only exists so idleness and shutdown are observed.
async fn downlink(shared: Arc<Shared>, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
    let key = shared.key;
    let remote = shared.key.destination();
    let recv_timeout = shared.ctx.config.udp_recv_timeout();
    let idle_timeout = shared.ctx.config.udp_idle_timeout();
    let mut buf = vec![0u8; shared.ctx.config.udp_buffer_len()];

    let event = loop {
        let received = tokio::select! {
            _ = shutdown.changed() => break None,
            r = tokio::time::timeout(recv_timeout, socket.recv_from(&mut buf)) => r,
        };

        match received {
            Err(_) => {
                if shared.idle(Instant::now()) >= idle_timeout {
                    tracing::debug!("{}: idle for {:?}", key, idle_timeout);
                    break Some(ForwarderEvent::IdleExpired(key));
                }
            }
            Ok(Ok((n, from))) => {
                if from != SocketAddr::V4(remote) {
                    tracing::trace!("{}: ignoring datagram from {}", key, from);
                    continue;
                }
                let datagram = build::udp_datagram(remote, key.source(), &buf[..n]);
                if let Err(e) = shared.ctx.tun.write_datagram(&datagram).await {
                    tracing::debug!("{}: downlink injection failed: {}", key, e);
                    shared.flow.lock().telemetry_mut().record_error();
                    break Some(ForwarderEvent::Failed {
                        key,
                        kind: ErrorKind::SocketIoFailure,
                    });
                }
                shared.flow.lock().telemetry_mut().record_downlink(n);
                shared.touch();
            }
            Ok(Err(e)) => {
                tracing::debug!("{}: receive failed: {}", key, e);
                shared.flow.lock().telemetry_mut().record_error();
                break Some(ForwarderEvent::Failed {
                    key,
                    kind: ErrorKind::SocketIoFailure,
                });
            }
        }
    };

    shared.active.store(false, Ordering::Release);
    if let Some(event) = event {
        shared.ctx.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwarderConfig;
    use crate::forwarder::testing::{harness, ready_entry};
    use crate::packet::checksum::{internet_checksum, transport_checksum};
    use crate::packet::{parse, Transport, IPPROTO_UDP};
    use crate::tun::testing::next_datagram;
    use std::net::Ipv4Addr;

    fn key_to(port: u16) -> FlowKey {
        FlowKey::new(Ipv4Addr::new(10, 0, 0, 2), 40000, Ipv4Addr::LOCALHOST, port, IPPROTO_UDP)
    }

    #[tokio::test]
    async fn test_request_response() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut h = harness(ForwarderConfig::default());
        let key = key_to(port);

        let fwd = UdpForwarder::open(ready_entry(key), h.ctx.clone()).unwrap();
        fwd.send_uplink(b"query").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, client) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
        server.send_to(b"answer!", client).await.unwrap();

        let raw = next_datagram(&mut h.host).await;
        let parsed = parse(&raw, raw.len()).unwrap();
        assert_eq!(parsed.key, key.reverse());
        assert!(matches!(parsed.transport, Transport::Udp(u) if u.length == 15));
        assert_eq!(parsed.payload(&raw), b"answer!");
        assert_eq!(internet_checksum(&raw[..20]), 0);
        assert_eq!(transport_checksum(parsed.ip.src, parsed.ip.dst, IPPROTO_UDP, &raw[20..]), 0);

        let telemetry = fwd.shared.flow.lock().telemetry().clone();
        assert_eq!(telemetry.uplink_packets, 1);
        assert_eq!(telemetry.downlink_bytes, 7);
        fwd.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_bounded_by_buffer() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = server.local_addr().unwrap().port();
        let mut h = harness(ForwarderConfig {
            udp_buffer_size: 512,
            ..ForwarderConfig::default()
        });

        let fwd = UdpForwarder::open(ready_entry(key_to(port)), h.ctx.clone()).unwrap();
        fwd.send_uplink(b"query").await.unwrap();
        let mut buf = [0u8; 64];
        let (_, client) = server.recv_from(&mut buf).await.unwrap();
        server.send_to(&[7u8; 1000], client).await.unwrap();

        let raw = next_datagram(&mut h.host).await;
        let parsed = parse(&raw, raw.len()).unwrap();
        assert_eq!(parsed.payload(&raw).len(), 512);
        fwd.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_crashed_receive_loop_fails_close() {
        let h = harness(ForwarderConfig::default());
        let fwd = UdpForwarder::open_crashed(ready_entry(key_to(9)), h.ctx.clone());
        assert!(!fwd.is_active());
        assert!(matches!(fwd.close().await, Err(ForwardError::Task(_))));
        fwd.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_detection() {
        let h = harness(ForwarderConfig::default());
        let fwd = UdpForwarder::open(ready_entry(key_to(9)), h.ctx.clone()).unwrap();

        let now = Instant::now();
        assert!(!fwd.is_idle(now));
        assert!(fwd.is_idle(fwd.last_activity() + Duration::from_secs(60)));
        fwd.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_receive_loop_reports_idle() {
        let mut h = harness(ForwarderConfig {
            udp_idle_secs: 1,
            udp_recv_timeout_secs: 1,
            ..ForwarderConfig::default()
        });
        let key = key_to(9);
        let fwd = UdpForwarder::open(ready_entry(key), h.ctx.clone()).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, ForwarderEvent::IdleExpired(key));
        assert!(!fwd.is_active());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let h = harness(ForwarderConfig::default());
        let fwd = UdpForwarder::open(ready_entry(key_to(9)), h.ctx.clone()).unwrap();
        fwd.close().await.unwrap();
        fwd.close().await.unwrap();
        assert!(!fwd.is_active());
        assert!(matches!(fwd.send_uplink(b"x").await, Err(ForwardError::Closed)));
        assert_eq!(h.ctx.stats.snapshot().forwarders_closed, 1);
    }
}
