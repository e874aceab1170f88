//! Forwarding engine
//!
//! Explicit context owning every component. One task drives
//! [`Engine::run`], reading the tunnel device strictly in order; all
//! maintenance (flow sweep, decision and enforcement passes, forwarder
//! cleanup, event drain) runs inline on that loop, each gated by its own
//! interval.

use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::attribution::{Attribution, AttributionCache, OwnerTable};
use crate::config::EngineConfig;
use crate::decision::{apply_decision, DecisionEngine};
use crate::enforcement::EnforcementController;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::flow::{EnforcementState, FlowEntry, FlowSnapshot, FlowState, FlowTable, SweepReport};
use crate::forwarder::{ForwarderContext, ForwarderEvent, ForwarderRegistry, SocketProtector};
use crate::packet::{self, ParsedPacket, TcpFlags, TcpHeader, Transport};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::tun::TunWriter;

/// Idle-loop tick so maintenance runs without traffic
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// What happened to one packet read from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Unparseable; dropped and counted
    Malformed,
    /// Flow is block-ready; dropped
    Blocked,
    /// No enforcement state yet; dropped
    Pending,
    /// Handed to a forwarder
    Forwarded,
    /// No forwarder available (capacity, setup failure, not a SYN, or a
    /// protocol without a forwarder)
    NotForwarded,
    /// Forwarder rejected the payload
    Failed,
}

struct Timers {
    last_decision: Instant,
    last_enforcement: Instant,
}

/// Detached engine state for telemetry consumers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub running: bool,
    pub captured_at: Option<DateTime<Utc>>,
    pub stats: StatsSnapshot,
    pub flows: Vec<FlowSnapshot>,
    pub tcp_forwarders: usize,
    pub udp_forwarders: usize,
}

pub struct Engine {
    config: EngineConfig,
    flows: FlowTable,
    decisions: DecisionEngine,
    enforcement: EnforcementController,
    attribution: AttributionCache,
    registry: ForwarderRegistry,
    stats: Arc<EngineStats>,
    events: Mutex<mpsc::UnboundedReceiver<ForwarderEvent>>,
    timers: Mutex<Timers>,
    running: AtomicBool,
}

impl Engine {
    /// Build an engine writing synthesized datagrams to `device`
    pub fn new<W>(
        config: EngineConfig,
        device: W,
        protector: Arc<dyn SocketProtector>,
        owners: Arc<dyn OwnerTable>,
    ) -> EngineResult<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let stats = Arc::new(EngineStats::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = ForwarderContext {
            tun: TunWriter::new(device, stats.clone()),
            protector,
            config: Arc::new(config.forwarder.clone()),
            stats: stats.clone(),
            events: events_tx,
        };
        let now = Instant::now();

        Ok(Self {
            flows: FlowTable::new(config.flow_table.clone()),
            decisions: DecisionEngine::from_config(&config.decision),
            enforcement: EnforcementController::new(&config.enforcement),
            attribution: AttributionCache::new(owners, &config.attribution),
            registry: ForwarderRegistry::new(ctx),
            stats,
            events: Mutex::new(events_rx),
            timers: Mutex::new(Timers {
                last_decision: now,
                last_enforcement: now,
            }),
            running: AtomicBool::new(false),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn registry(&self) -> &ForwarderRegistry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Weak, pull-based accessor for telemetry consumers
    pub fn telemetry(self: &Arc<Self>) -> TelemetryHandle {
        TelemetryHandle {
            engine: Arc::downgrade(self),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            running: self.is_running(),
            captured_at: Some(Utc::now()),
            stats: self.stats.snapshot(),
            flows: self.flows.snapshot(),
            tcp_forwarders: self.registry.tcp_count(),
            udp_forwarders: self.registry.udp_count(),
        }
    }

    /// Read the device until EOF, a device error, or `shutdown` fires,
    /// then close every forwarder.
    pub async fn run<R>(&self, mut device: R, mut shutdown: watch::Receiver<bool>) -> EngineResult<()>
    where
        R: AsyncRead + Unpin,
    {
        self.running.store(true, Ordering::Release);
        tracing::info!(
            "Engine started (flows <= {}, tcp <= {}, udp <= {})",
            self.config.flow_table.max_flows,
            self.config.forwarder.max_tcp,
            self.config.forwarder.max_udp
        );

        let mut buf = vec![0u8; self.config.device.read_buffer_size];
        let mut tick = tokio::time::interval(MAINTENANCE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let read = tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                _ = tick.tick() => {
                    self.maintain(Instant::now()).await;
                    continue;
                }
                r = device.read(&mut buf) => r,
            };

            match read {
                Ok(0) => {
                    tracing::info!("Tunnel device closed");
                    break Ok(());
                }
                Ok(n) => {
                    self.handle_packet(&buf[..n]).await;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {}
                Err(e) => {
                    tracing::error!("Tunnel device read failed: {}", e);
                    break Err(EngineError::Device(e));
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Stop reporting as running, close every forwarder and drop flow state
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let report = self.registry.close_all().await;
        self.drain_events_only();
        self.flows.clear();
        tracing::info!("Engine stopped ({} forwarders closed, {} failed)", report.closed, report.failed);
    }

    /// Process one raw datagram from the device
    pub async fn handle_packet(&self, buf: &[u8]) -> PacketOutcome {
        let now = Instant::now();
        self.stats.record_read(buf.len());

        let packet = match packet::parse(buf, buf.len()) {
            Ok(p) => p,
            Err(_) => {
                self.stats.record_error(ErrorKind::ParseFailure);
                return PacketOutcome::Malformed;
            }
        };

        let lookup = self.flows.process_at(&packet, buf.len(), now);
        if lookup.created {
            EngineStats::incr(&self.stats.flows_created);
        }
        if !lookup.tracked {
            EngineStats::incr(&self.stats.untracked_packets);
        }
        if lookup.created || !lookup.tracked {
            self.admit(&lookup.entry, now);
        }

        let outcome = match lookup.entry.enforcement() {
            EnforcementState::BlockReady => {
                EngineStats::incr(&self.stats.blocked_packets);
                PacketOutcome::Blocked
            }
            EnforcementState::None => {
                EngineStats::incr(&self.stats.pending_packets);
                PacketOutcome::Pending
            }
            EnforcementState::AllowReady => self.forward(&packet, buf, &lookup.entry).await,
        };

        self.maintain(now).await;
        outcome
    }

    /// First-packet evaluation so an opening packet can be forwarded
    fn admit(&self, entry: &FlowEntry, now: Instant) {
        self.refresh_owners(now);
        let mut state = entry.lock();
        self.decide(&mut state, now);
        self.enforcement.evaluate(&mut state, now);
    }

    /// Attribute (when due) against the cached owner table and apply the
    /// first matching verdict. Callers refresh the table beforehand so no
    /// reload happens under the flow lock.
    fn decide(&self, state: &mut FlowState, now: Instant) -> bool {
        if self.attribution.attribute(state, now) == Attribution::Miss {
            self.stats.record_error(ErrorKind::AttributionMiss);
        }
        apply_decision(state, self.decisions.evaluate(state))
    }

    fn refresh_owners(&self, now: Instant) {
        if let Err(e) = self.attribution.refresh(now) {
            tracing::debug!("Owner table unavailable: {}", e);
        }
    }

    async fn forward(&self, packet: &ParsedPacket, buf: &[u8], entry: &Arc<FlowEntry>) -> PacketOutcome {
        let payload = packet.payload(buf);
        match packet.transport {
            Transport::Tcp(tcp) => self.forward_tcp(&tcp, payload, entry).await,
            Transport::Udp(_) => self.forward_udp(payload, entry).await,
            Transport::Icmp(_) | Transport::Unknown => self.not_forwarded(),
        }
    }

    async fn forward_tcp(&self, tcp: &TcpHeader, payload: &[u8], entry: &Arc<FlowEntry>) -> PacketOutcome {
        if tcp.flags.is_bare_syn() {
            return match self.registry.get_or_create_tcp(entry, tcp.seq) {
                Some(_) => PacketOutcome::Forwarded,
                None => self.not_forwarded(),
            };
        }

        let Some(forwarder) = self.registry.get_tcp(entry.key()) else {
            return self.not_forwarded();
        };

        let result = if tcp.flags.contains(TcpFlags::RST) {
            forwarder.client_reset().await
        } else {
            let mut result = forwarder.forward_uplink(payload, tcp.seq).await;
            if result.is_ok() && tcp.flags.contains(TcpFlags::FIN) {
                let fin_seq = tcp.seq.wrapping_add(payload.len() as u32);
                result = forwarder.client_fin(fin_seq).await;
            }
            result
        };

        match result {
            Ok(()) => PacketOutcome::Forwarded,
            Err(e) => {
                tracing::debug!("{}: {}", entry.key(), e);
                self.stats.record_error(e.kind());
                PacketOutcome::Failed
            }
        }
    }

    async fn forward_udp(&self, payload: &[u8], entry: &Arc<FlowEntry>) -> PacketOutcome {
        let Some(forwarder) = self.registry.get_or_create_udp(entry) else {
            return self.not_forwarded();
        };
        match forwarder.send_uplink(payload).await {
            Ok(()) => PacketOutcome::Forwarded,
            Err(e) => {
                self.stats.record_error(e.kind());
                PacketOutcome::Failed
            }
        }
    }

    fn not_forwarded(&self) -> PacketOutcome {
        EngineStats::incr(&self.stats.unforwardable_packets);
        PacketOutcome::NotForwarded
    }

    /// Time-gated maintenance, amortised over the packet loop
    async fn maintain(&self, now: Instant) {
        if let Some(removed) = self.flows.maybe_sweep(now) {
            self.stats
                .flows_expired
                .fetch_add(removed as u64, Ordering::Relaxed);
        }

        let (decide, enforce) = {
            let mut timers = self.timers.lock();
            let decide = now.saturating_duration_since(timers.last_decision) >= self.config.decision.sweep_interval();
            if decide {
                timers.last_decision = now;
            }
            let enforce =
                now.saturating_duration_since(timers.last_enforcement) >= self.config.enforcement.sweep_interval();
            if enforce {
                timers.last_enforcement = now;
            }
            (decide, enforce)
        };
        if decide {
            self.run_decision_sweep(now);
        }
        if enforce {
            self.run_enforcement_sweep(now);
        }

        self.drain_events().await;
        self.registry.maybe_cleanup(now).await;
    }

    /// Attribute and decide every undecided flow
    pub fn run_decision_sweep(&self, now: Instant) -> SweepReport {
        self.refresh_owners(now);
        let report = self
            .flows
            .evaluate_decisions(|state| Ok::<_, Infallible>(self.decide(state, now)));
        self.record_sweep("decision", report);
        report
    }

    /// Move decided flows towards enforcement readiness
    pub fn run_enforcement_sweep(&self, now: Instant) -> SweepReport {
        let report = self
            .flows
            .evaluate_enforcement(|state| Ok::<_, Infallible>(self.enforcement.evaluate(state, now)));
        self.record_sweep("enforcement", report);
        report
    }

    fn record_sweep(&self, name: &str, report: SweepReport) {
        if report.failed > 0 {
            self.stats
                .evaluation_failures
                .fetch_add(report.failed as u64, Ordering::Relaxed);
        }
        if report.visited > 0 {
            tracing::trace!(
                "{} sweep: {} visited, {} changed, {} failed",
                name,
                report.visited,
                report.changed,
                report.failed
            );
        }
    }

    fn take_events(&self) -> Vec<ForwarderEvent> {
        let mut rx = self.events.lock();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Apply forwarder events: count failures and reap finished forwarders
    async fn drain_events(&self) {
        for event in self.take_events() {
            if let ForwarderEvent::ConnectFailed { kind, .. } | ForwarderEvent::Failed { kind, .. } = event {
                self.stats.record_error(kind);
            }
            if !event.is_terminal() {
                continue;
            }
            if let Err(e) = self.registry.reap(event.key()).await {
                self.stats.record_error(ErrorKind::CleanupFailure);
                tracing::warn!("{}: {}", event.key(), e);
            }
        }
    }

    /// Count pending failures without touching the (already empty) registry
    fn drain_events_only(&self) {
        for event in self.take_events() {
            if let ForwarderEvent::ConnectFailed { kind, .. } | ForwarderEvent::Failed { kind, .. } = event {
                self.stats.record_error(kind);
            }
        }
    }
}

/// Pull-based read-only view of a running engine
#[derive(Clone)]
pub struct TelemetryHandle {
    engine: Weak<Engine>,
}

impl TelemetryHandle {
    /// Detached snapshot; all-default when the engine is not running or gone
    pub fn snapshot(&self) -> EngineSnapshot {
        match self.engine.upgrade() {
            Some(engine) if engine.is_running() => engine.snapshot(),
            _ => EngineSnapshot::default(),
        }
    }
}
