//! TCP forwarder
//!
//! Terminates the client's TCP session inside the engine and relays the
//! byte stream over a real, protected socket. The downlink side is
//! rebuilt segment by segment: sequence numbers come from a running
//! counter, acknowledgements from the last client sequence seen.
//!
//! Client data never waits on the remote: it is queued (bounded by
//! `uplink_queue_depth`) and drained by the forwarder's own task. A full
//! queue means the remote stopped reading; the client is reset.
//!
//! ```text
//! Created ──► Connecting ──► Active ──► Closing ──► Closed
//!                 │            │                      ▲
//!                 └── RST ─────┴──── FIN / RST ───────┘
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ForwarderContext, ForwarderEvent};
use crate::error::{ErrorKind, ForwardError};
use crate::flow::FlowEntry;
use crate::packet::build::{self, TcpSegment};
use crate::packet::{FlowKey, TcpFlags};
use crate::stats::EngineStats;

/// Forwarder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TcpState {
    Created = 0,
    Connecting = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl TcpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Connecting,
            2 => Self::Active,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Work for the socket writer, in client order
#[derive(Debug)]
enum Uplink {
    Data(Vec<u8>),
    /// Client FIN: shut the write half down
    Finish,
}

/// State shared between the forwarder handle and its downlink task
struct Shared {
    key: FlowKey,
    flow: Arc<FlowEntry>,
    ctx: ForwarderContext,
    state: AtomicU8,
    active: AtomicBool,
    /// Next sequence number placed on a synthesized segment
    send_seq: AtomicU32,
    /// Acknowledgement placed on synthesized segments
    recv_ack: AtomicU32,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn new(flow: Arc<FlowEntry>, ctx: ForwarderContext, isn: u32, client_isn: u32) -> Self {
        Self {
            key: *flow.key(),
            flow,
            ctx,
            state: AtomicU8::new(TcpState::Created as u8),
            active: AtomicBool::new(true),
            send_seq: AtomicU32::new(isn),
            recv_ack: AtomicU32::new(client_isn.wrapping_add(1)),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn state(&self) -> TcpState {
        TcpState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: TcpState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn finish(&self) {
        self.active.store(false, Ordering::Release);
        self.set_state(TcpState::Closed);
    }

    /// Synthesize a server → client segment and write it to the device
    async fn inject(&self, flags: TcpFlags, payload: &[u8]) -> io::Result<()> {
        let segment = TcpSegment {
            src: self.key.destination(),
            dst: self.key.source(),
            seq: self.send_seq.load(Ordering::Acquire),
            ack: self.recv_ack.load(Ordering::Acquire),
            flags,
            window: self.ctx.config.tcp_window,
        };
        self.ctx
            .tun
            .write_datagram(&build::tcp_segment(&segment, payload))
            .await
    }

    async fn inject_reset(&self) {
        match self.inject(TcpFlags::RST | TcpFlags::ACK, &[]).await {
            Ok(()) => self.flow.lock().telemetry_mut().record_rst(),
            Err(e) => tracing::debug!("{}: reset injection failed: {}", self.key, e),
        }
    }
}

/// Live TCP session for one flow
pub struct TcpForwarder {
    shared: Arc<Shared>,
    uplink: mpsc::Sender<Uplink>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpForwarder {
    /// Create and protect the outbound socket, then start the downlink task,
    /// which connects and synthesizes the handshake. `client_isn` is the
    /// sequence number of the client's SYN.
    pub(crate) fn open(
        flow: Arc<FlowEntry>,
        client_isn: u32,
        ctx: ForwarderContext,
    ) -> Result<Arc<Self>, ForwardError> {
        let key = *flow.key();
        let setup = |source: io::Error| ForwardError::SocketSetup { key, source };

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(socket2::Protocol::TCP)).map_err(setup)?;
        ctx.protector.protect(&socket).map_err(setup)?;
        socket.set_nonblocking(true).map_err(setup)?;

        let isn = ctx.config.tcp_initial_sequence.unwrap_or_else(rand::random);
        let (uplink, queue) = mpsc::channel(ctx.config.uplink_queue_depth.max(1));
        let shared = Arc::new(Shared::new(flow, ctx, isn, client_isn));

        let (shutdown, signal) = watch::channel(false);
        shared.set_state(TcpState::Connecting);
        let task = tokio::spawn(downlink(shared.clone(), socket, queue, signal));

        tracing::debug!("{}: connecting", key);
        Ok(Arc::new(Self {
            shared,
            uplink,
            closed: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn key(&self) -> &FlowKey {
        &self.shared.key
    }

    pub fn state(&self) -> TcpState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn send_seq(&self) -> u32 {
        self.shared.send_seq.load(Ordering::Acquire)
    }

    pub fn recv_ack(&self) -> u32 {
        self.shared.recv_ack.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        *self.shared.last_activity.lock()
    }

    /// Queue one client segment's payload for the remote and acknowledge it.
    ///
    /// The tracked acknowledgement is updated first so pure ACKs (empty
    /// payload) keep it current. Never waits on the remote socket; write
    /// failures surface from the forwarder task as a `Failed` event.
    pub async fn forward_uplink(&self, payload: &[u8], client_seq: u32) -> Result<(), ForwardError> {
        if !self.is_active() {
            return Err(ForwardError::Closed);
        }
        match self.state() {
            TcpState::Active => {}
            TcpState::Created | TcpState::Connecting => return Err(ForwardError::NotConnected),
            // Client keeps acknowledging downlink data after its FIN
            TcpState::Closing if payload.is_empty() => return Ok(()),
            TcpState::Closing | TcpState::Closed => return Err(ForwardError::Closed),
        }

        self.shared
            .recv_ack
            .store(client_seq.wrapping_add(payload.len() as u32), Ordering::Release);
        if payload.is_empty() {
            return Ok(());
        }

        self.enqueue(Uplink::Data(payload.to_vec())).await?;
        self.shared.touch();
        self.shared.inject(TcpFlags::ACK, &[]).await?;
        Ok(())
    }

    /// Hand work to the socket writer. A full queue resets the client and
    /// tears the forwarder down.
    async fn enqueue(&self, work: Uplink) -> Result<(), ForwardError> {
        match self.uplink.try_send(work) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let depth = self.shared.ctx.config.uplink_queue_depth;
                tracing::debug!("{}: uplink stalled with {} segments queued", self.key(), depth);
                self.shared.flow.lock().telemetry_mut().record_error();
                self.shared.inject_reset().await;
                if let Err(e) = self.close().await {
                    tracing::debug!("{}: close after uplink stall: {}", self.key(), e);
                }
                Err(ForwardError::UplinkStalled { depth })
            }
            Err(TrySendError::Closed(_)) => Err(ForwardError::Closed),
        }
    }

    /// Client sent FIN carrying sequence `fin_seq` (after any payload).
    /// Half-closes the remote socket and acknowledges the FIN.
    pub async fn client_fin(&self, fin_seq: u32) -> Result<(), ForwardError> {
        if !self.is_active() {
            return Err(ForwardError::Closed);
        }
        if self.state() != TcpState::Active {
            return self.close().await;
        }

        self.shared.recv_ack.store(fin_seq.wrapping_add(1), Ordering::Release);
        self.enqueue(Uplink::Finish).await?;
        self.shared.set_state(TcpState::Closing);
        self.shared.touch();
        self.shared.inject(TcpFlags::ACK, &[]).await?;
        tracing::debug!("{}: client half-closed", self.key());
        Ok(())
    }

    /// Client reset the connection; close without answering
    pub async fn client_reset(&self) -> Result<(), ForwardError> {
        tracing::debug!("{}: client reset", self.key());
        self.close().await
    }

    /// Idempotent teardown: mark inactive, signal the forwarder task and
    /// wait for it (bounded). The task owns the socket and drops it on exit.
    pub async fn close(&self) -> Result<(), ForwardError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.finish();
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
                            "{}: downlink task still running after {:?}, aborting",
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
        tracing::debug!("{}: closed", self.key());
        result
    }
}

impl Drop for TcpForwarder {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn connect(shared: &Shared, socket: Socket) -> Result<TcpStream, ForwardError> {
    let key = shared.key;
    let addr = key.destination();
    let timeout = shared.ctx.config.connect_timeout();

    let socket = TcpSocket::from_std_stream(socket.into());
    match tokio::time::timeout(timeout, socket.connect(SocketAddr::V4(addr))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ForwardError::SocketSetup { key, source }),
        Err(_) => Err(ForwardError::ConnectTimeout { addr, timeout }),
    }
}

/// Connect, synthesize the handshake, then relay both directions until
/// either side finishes or shutdown is signalled
async fn downlink(
    shared: Arc<Shared>,
    socket: Socket,
    queue: mpsc::Receiver<Uplink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let key = shared.key;

    let connected = tokio::select! {
        _ = shutdown.changed() => {
            shared.finish();
            return;
        }
        r = connect(&shared, socket) => r,
    };

    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("{}: {}", key, e);
            shared.flow.lock().telemetry_mut().record_error();
            shared.inject_reset().await;
            shared.finish();
            shared.ctx.emit(ForwarderEvent::ConnectFailed { key, kind: e.kind() });
            return;
        }
    };

    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!("{}: set_nodelay: {}", key, e);
    }
    let (reader, writer) = stream.into_split();
    shared.set_state(TcpState::Active);
    shared.touch();

    // SYN|ACK consumes one sequence number
    if let Err(e) = shared.inject(TcpFlags::SYN | TcpFlags::ACK, &[]).await {
        tracing::debug!("{}: handshake injection failed: {}", key, e);
        shared.finish();
        shared.ctx.emit(ForwarderEvent::Failed {
            key,
            kind: ErrorKind::SocketIoFailure,
        });
        return;
    }
    shared.send_seq.fetch_add(1, Ordering::AcqRel);
    shared.ctx.emit(ForwarderEvent::Connected(key));
    tracing::debug!("{}: connected", key);

    let event = tokio::select! {
        _ = shutdown.changed() => None,
        event = relay_downlink(&shared, reader) => Some(event),
        event = relay_uplink(&shared, writer, queue) => Some(event),
    };

    shared.finish();
    if let Some(event) = event {
        shared.ctx.emit(event);
    }
}

/// Socket reads become server → client segments
async fn relay_downlink(shared: &Shared, mut reader: OwnedReadHalf) -> ForwarderEvent {
    let key = shared.key;
    let mut buf = vec![0u8; shared.ctx.config.segment_size.min(build::MAX_TCP_PAYLOAD)];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                match shared.inject(TcpFlags::FIN | TcpFlags::ACK, &[]).await {
                    Ok(()) => shared.flow.lock().telemetry_mut().record_fin(),
                    Err(e) => tracing::debug!("{}: FIN injection failed: {}", key, e),
                }
                shared.send_seq.fetch_add(1, Ordering::AcqRel);
                tracing::debug!("{}: remote closed", key);
                return ForwarderEvent::RemoteClosed(key);
            }
            Ok(n) => {
                if let Err(e) = shared.inject(TcpFlags::PSH | TcpFlags::ACK, &buf[..n]).await {
                    tracing::debug!("{}: downlink injection failed: {}", key, e);
                    shared.flow.lock().telemetry_mut().record_error();
                    return ForwarderEvent::Failed {
                        key,
                        kind: ErrorKind::SocketIoFailure,
                    };
                }
                shared.send_seq.fetch_add(n as u32, Ordering::AcqRel);
                shared.flow.lock().telemetry_mut().record_downlink(n);
                shared.touch();
            }
            Err(e) => {
                tracing::debug!("{}: downlink read failed: {}", key, e);
                shared.flow.lock().telemetry_mut().record_error();
                shared.inject_reset().await;
                return ForwarderEvent::Failed {
                    key,
                    kind: ErrorKind::SocketIoFailure,
                };
            }
        }
    }
}

/// Drain queued client data into the socket. Returns only on a write
/// failure; a dropped queue leaves the other direction running.
async fn relay_uplink(
    shared: &Shared,
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Uplink>,
) -> ForwarderEvent {
    let key = shared.key;

    while let Some(work) = queue.recv().await {
        let written = match work {
            Uplink::Data(data) => writer.write_all(&data).await.map(|()| {
                shared.flow.lock().telemetry_mut().record_uplink(data.len());
                shared.ctx.stats.record_uplink(data.len());
            }),
            Uplink::Finish => writer.shutdown().await,
        };

        if let Err(e) = written {
            tracing::debug!("{}: uplink write failed: {}", key, e);
            shared.flow.lock().telemetry_mut().record_error();
            shared.inject_reset().await;
            return ForwarderEvent::Failed {
                key,
                kind: ErrorKind::SocketIoFailure,
            };
        }
    }

    std::future::pending().await
}
