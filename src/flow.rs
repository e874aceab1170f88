//! Concurrent Flow Table
//!
//! Tracks every flow seen on the tunnel device.
//!
//! # Design
//!
//! - `DashMap` from [`FlowKey`] to a shared [`FlowEntry`]
//! - Per-entry mutex; two packets of one flow update it in arrival order,
//!   different flows never contend on the same lock
//! - Soft capacity: once full, new flows are served by an untracked
//!   (ephemeral) entry so traffic continues without bookkeeping
//! - Idle sweep gated by a timestamp check, amortised over the packet loop

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::config::FlowTableConfig;
use crate::packet::{FlowKey, ParsedPacket, Protocol, TcpFlags, Transport};

/// Allow/block verdict. Moves at most once, away from `Undecided`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    #[default]
    Undecided,
    Allow,
    Block,
}

/// Readiness to act on a decision. Moves at most once, away from `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnforcementState {
    #[default]
    None,
    AllowReady,
    BlockReady,
}

/// Protocol-specific flow metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowMetadata {
    Tcp {
        initial_seq: u32,
        initial_ack: u32,
        /// Every control flag ever observed on the flow
        flags_seen: TcpFlags,
    },
    Udp {
        /// Smoothed payload size
        typical_size: u16,
    },
    Icmp {
        icmp_type: u8,
        code: u8,
    },
}

impl FlowMetadata {
    fn from_packet(packet: &ParsedPacket) -> Option<Self> {
        match packet.transport {
            Transport::Tcp(tcp) => Some(Self::Tcp {
                initial_seq: tcp.seq,
                initial_ack: tcp.ack,
                flags_seen: tcp.flags,
            }),
            Transport::Udp(_) => Some(Self::Udp {
                typical_size: packet.payload_len.min(u16::MAX as usize) as u16,
            }),
            Transport::Icmp(icmp) => Some(Self::Icmp {
                icmp_type: icmp.icmp_type,
                code: icmp.code,
            }),
            Transport::Unknown => None,
        }
    }

    fn merge(&mut self, packet: &ParsedPacket) {
        match (self, packet.transport) {
            (Self::Tcp { flags_seen, .. }, Transport::Tcp(tcp)) => flags_seen.insert(tcp.flags),
            (Self::Udp { typical_size }, Transport::Udp(_)) => {
                let size = packet.payload_len.min(u16::MAX as usize) as u32;
                *typical_size = ((*typical_size as u32 * 7 + size) / 8) as u16;
            }
            (Self::Icmp { icmp_type, code }, Transport::Icmp(icmp)) => {
                *icmp_type = icmp.icmp_type;
                *code = icmp.code;
            }
            _ => {}
        }
    }
}

/// Direction of the most recent forwarded traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Uplink,
    Downlink,
}

/// Forwarding telemetry for one flow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub uplink_packets: u64,
    pub uplink_bytes: u64,
    pub downlink_packets: u64,
    pub downlink_bytes: u64,
    pub first_forwarded: Option<DateTime<Utc>>,
    pub last_forwarded: Option<DateTime<Utc>>,
    pub errors: u64,
    pub fins_sent: u64,
    pub rsts_sent: u64,
    pub last_direction: Option<Direction>,
}

impl Telemetry {
    pub fn record_uplink(&mut self, bytes: usize) {
        self.uplink_packets += 1;
        self.uplink_bytes += bytes as u64;
        self.touch(Direction::Uplink);
    }

    pub fn record_downlink(&mut self, bytes: usize) {
        self.downlink_packets += 1;
        self.downlink_bytes += bytes as u64;
        self.touch(Direction::Downlink);
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn record_fin(&mut self) {
        self.fins_sent += 1;
        self.touch(Direction::Downlink);
    }

    pub fn record_rst(&mut self) {
        self.rsts_sent += 1;
        self.touch(Direction::Downlink);
    }

    fn touch(&mut self, direction: Direction) {
        let now = Utc::now();
        self.first_forwarded.get_or_insert(now);
        self.last_forwarded = Some(now);
        self.last_direction = Some(direction);
    }
}

/// Mutable per-flow state, only reachable through [`FlowEntry::lock`]
#[derive(Debug, Clone)]
pub struct FlowState {
    key: FlowKey,
    protocol: Protocol,
    first_seen: Instant,
    last_seen: Instant,
    created_at: DateTime<Utc>,
    packets: u64,
    bytes: u64,
    metadata: Option<FlowMetadata>,
    identity: Option<u32>,
    decision: Decision,
    enforcement: EnforcementState,
    telemetry: Telemetry,
    attribution_checked: Option<Instant>,
    attribution_attempts: u32,
}

impl FlowState {
    /// Fresh state for a flow first seen at `now`
    pub fn new(key: FlowKey, now: Instant) -> Self {
        Self {
            key,
            protocol: key.protocol_kind(),
            first_seen: now,
            last_seen: now,
            created_at: Utc::now(),
            packets: 0,
            bytes: 0,
            metadata: None,
            identity: None,
            decision: Decision::Undecided,
            enforcement: EnforcementState::None,
            telemetry: Telemetry::default(),
            attribution_checked: None,
            attribution_attempts: 0,
        }
    }

    /// Account one packet and merge its transport metadata
    pub fn update(&mut self, packet: &ParsedPacket, len: usize, now: Instant) {
        self.packets += 1;
        self.bytes += len as u64;
        if now > self.last_seen {
            self.last_seen = now;
        }
        match self.metadata.as_mut() {
            Some(meta) => meta.merge(packet),
            None => self.metadata = FlowMetadata::from_packet(packet),
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn first_seen(&self) -> Instant {
        self.first_seen
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn metadata(&self) -> Option<&FlowMetadata> {
        self.metadata.as_ref()
    }

    /// Time since the first packet
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_seen)
    }

    /// Time since the last packet
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn identity(&self) -> Option<u32> {
        self.identity
    }

    /// Attribute the flow to an owner. Single assignment: returns false and
    /// leaves the state untouched when an identity is already set.
    pub fn set_identity(&mut self, identity: u32) -> bool {
        if self.identity.is_some() {
            return false;
        }
        self.identity = Some(identity);
        true
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn enforcement(&self) -> EnforcementState {
        self.enforcement
    }

    /// Compare-and-set from `Undecided`. Returns true when the state moved.
    pub(crate) fn transition_decision(&mut self, decision: Decision) -> bool {
        if self.decision != Decision::Undecided || decision == Decision::Undecided {
            return false;
        }
        self.decision = decision;
        true
    }

    /// Compare-and-set from `None`. Returns true when the state moved.
    pub(crate) fn transition_enforcement(&mut self, state: EnforcementState) -> bool {
        if self.enforcement != EnforcementState::None || state == EnforcementState::None {
            return false;
        }
        self.enforcement = state;
        true
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut Telemetry {
        &mut self.telemetry
    }

    pub(crate) fn attribution_checked(&self) -> Option<Instant> {
        self.attribution_checked
    }

    pub(crate) fn mark_attribution_checked(&mut self, now: Instant) {
        self.attribution_checked = Some(now);
        self.attribution_attempts = self.attribution_attempts.saturating_add(1);
    }

    /// Owner lookups made so far, spaced by the attribution retry interval
    pub(crate) fn attribution_attempts(&self) -> u32 {
        self.attribution_attempts
    }

    /// Detached copy for telemetry consumers
    pub fn snapshot(&self, now: Instant) -> FlowSnapshot {
        let span = self.last_seen.saturating_duration_since(self.first_seen);
        let last_seen = chrono::Duration::from_std(span)
            .map(|d| self.created_at + d)
            .unwrap_or(self.created_at);
        FlowSnapshot {
            key: self.key,
            protocol: self.protocol,
            first_seen: self.created_at,
            last_seen,
            age_ms: self.age(now).as_millis() as u64,
            idle_ms: self.idle(now).as_millis() as u64,
            packets: self.packets,
            bytes: self.bytes,
            metadata: self.metadata,
            identity: self.identity,
            decision: self.decision,
            enforcement: self.enforcement,
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Shared handle to one tracked flow
#[derive(Debug)]
pub struct FlowEntry {
    key: FlowKey,
    state: Mutex<FlowState>,
}

impl FlowEntry {
    pub fn new(key: FlowKey, now: Instant) -> Self {
        Self {
            key,
            state: Mutex::new(FlowState::new(key, now)),
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    /// Lock the flow's mutable state. Never hold the guard across an await.
    pub fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state.lock()
    }

    pub fn enforcement(&self) -> EnforcementState {
        self.state.lock().enforcement
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.state.lock().snapshot(Instant::now())
    }
}

/// Immutable copy of one flow's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub protocol: Protocol,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub packets: u64,
    pub bytes: u64,
    pub metadata: Option<FlowMetadata>,
    pub identity: Option<u32>,
    pub decision: Decision,
    pub enforcement: EnforcementState,
    pub telemetry: Telemetry,
}

/// Outcome of [`FlowTable::process`]
#[derive(Debug, Clone)]
pub struct FlowLookup {
    pub entry: Arc<FlowEntry>,
    /// First packet of a tracked flow
    pub created: bool,
    /// False when the table was full and `entry` is an ephemeral view
    pub tracked: bool,
}

/// Result of one evaluator pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub visited: usize,
    pub changed: usize,
    pub failed: usize,
}

/// Concurrent flow table
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<FlowEntry>>,
    config: FlowTableConfig,
    /// Set while new flows are being refused; gates the capacity warning
    overflowing: AtomicBool,
    last_sweep: Mutex<Instant>,
}

impl FlowTable {
    pub fn new(config: FlowTableConfig) -> Self {
        Self {
            flows: DashMap::new(),
            config,
            overflowing: AtomicBool::new(false),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Get-or-create the flow for `packet` and account it
    pub fn process(&self, packet: &ParsedPacket, len: usize) -> FlowLookup {
        self.process_at(packet, len, Instant::now())
    }

    pub fn process_at(&self, packet: &ParsedPacket, len: usize, now: Instant) -> FlowLookup {
        let key = packet.key;
        // Release the shard read guard before a possible insert
        let existing = self.flows.get(&key).map(|e| e.value().clone());
        let lookup = match existing {
            Some(entry) => FlowLookup {
                entry,
                created: false,
                tracked: true,
            },
            None => self.create(key, now),
        };

        lookup.entry.lock().update(packet, len, now);
        lookup
    }

    fn create(&self, key: FlowKey, now: Instant) -> FlowLookup {
        if self.flows.len() >= self.config.max_flows {
            if !self.overflowing.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Flow table full ({} flows), new flows are forwarded untracked",
                    self.config.max_flows
                );
            }
            return FlowLookup {
                entry: Arc::new(FlowEntry::new(key, now)),
                created: false,
                tracked: false,
            };
        }

        if self.overflowing.swap(false, Ordering::Relaxed) {
            tracing::info!("Flow table below capacity, tracking resumed");
        }

        match self.flows.entry(key) {
            Entry::Occupied(o) => FlowLookup {
                entry: o.get().clone(),
                created: false,
                tracked: true,
            },
            Entry::Vacant(v) => {
                let entry = Arc::new(FlowEntry::new(key, now));
                v.insert(entry.clone());
                tracing::trace!("New flow {}", key);
                FlowLookup {
                    entry,
                    created: true,
                    tracked: true,
                }
            }
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<FlowEntry>> {
        self.flows.get(key).map(|e| e.value().clone())
    }

    fn entries(&self) -> Vec<Arc<FlowEntry>> {
        self.flows.iter().map(|e| e.value().clone()).collect()
    }

    /// Run `evaluate` on every undecided flow. A failing evaluator is
    /// counted and skipped; the pass continues with the next flow.
    pub fn evaluate_decisions<F, E>(&self, evaluate: F) -> SweepReport
    where
        F: FnMut(&mut FlowState) -> Result<bool, E>,
        E: fmt::Display,
    {
        self.evaluate_where(|s| s.decision() == Decision::Undecided, evaluate)
    }

    /// Run `evaluate` on every decided flow not yet enforcement-ready
    pub fn evaluate_enforcement<F, E>(&self, evaluate: F) -> SweepReport
    where
        F: FnMut(&mut FlowState) -> Result<bool, E>,
        E: fmt::Display,
    {
        self.evaluate_where(
            |s| s.decision() != Decision::Undecided && s.enforcement() == EnforcementState::None,
            evaluate,
        )
    }

    /// Run `evaluate` on every flow matching `filter`
    pub fn evaluate_where<P, F, E>(&self, filter: P, mut evaluate: F) -> SweepReport
    where
        P: Fn(&FlowState) -> bool,
        F: FnMut(&mut FlowState) -> Result<bool, E>,
        E: fmt::Display,
    {
        let mut report = SweepReport::default();
        for entry in self.entries() {
            let mut state = entry.lock();
            if !filter(&state) {
                continue;
            }
            report.visited += 1;
            match evaluate(&mut state) {
                Ok(true) => report.changed += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::debug!("Evaluation failed for {}: {}", entry.key(), e);
                }
            }
        }
        report
    }

    /// Idle sweep, skipped unless the sweep interval has elapsed.
    /// Returns the number of flows removed when a sweep ran.
    pub fn maybe_sweep(&self, now: Instant) -> Option<usize> {
        {
            let mut last = self.last_sweep.lock();
            if now.saturating_duration_since(*last) < self.config.sweep_interval() {
                return None;
            }
            *last = now;
        }
        Some(self.sweep(now))
    }

    /// Remove flows idle beyond their protocol's threshold
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, entry| {
            let state = entry.lock();
            state.idle(now) <= self.config.idle_timeout(state.protocol())
        });
        let removed = before.saturating_sub(self.flows.len());
        if removed > 0 {
            tracing::debug!("Swept {} idle flows, {} remaining", removed, self.flows.len());
        }
        removed
    }

    /// Detached copies of every tracked flow
    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        let now = Instant::now();
        self.entries()
            .iter()
            .map(|e| e.lock().snapshot(now))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.config.max_flows
    }

    pub fn clear(&self) {
        self.flows.clear();
        self.overflowing.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build::{self, TcpSegment};
    use crate::packet::parse;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn tcp_packet(src_port: u16, flags: TcpFlags, payload: &[u8]) -> (Vec<u8>, ParsedPacket) {
        let raw = build::tcp_segment(
            &TcpSegment {
                src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), src_port),
                dst: SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443),
                seq: 1000,
                ack: 0,
                flags,
                window: 65535,
            },
            payload,
        );
        let parsed = parse(&raw, raw.len()).unwrap();
        (raw, parsed)
    }

    fn udp_packet(src_port: u16, payload: &[u8]) -> (Vec<u8>, ParsedPacket) {
        let raw = build::udp_datagram(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), src_port),
            SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
            payload,
        );
        let parsed = parse(&raw, raw.len()).unwrap();
        (raw, parsed)
    }

    fn table(max_flows: usize) -> FlowTable {
        FlowTable::new(FlowTableConfig {
            max_flows,
            ..FlowTableConfig::default()
        })
    }

    #[test]
    fn test_process_creates_then_updates() {
        let table = table(16);
        let (raw, syn) = tcp_packet(5000, TcpFlags::SYN, &[]);

        let first = table.process(&syn, raw.len());
        assert!(first.created);
        assert!(first.tracked);

        let (raw2, fin) = tcp_packet(5000, TcpFlags::FIN | TcpFlags::ACK, b"bye");
        let second = table.process(&fin, raw2.len());
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.entry, &second.entry));

        let state = second.entry.lock();
        assert_eq!(state.packets(), 2);
        assert_eq!(state.bytes(), (raw.len() + raw2.len()) as u64);
        match state.metadata() {
            Some(FlowMetadata::Tcp { initial_seq, flags_seen, .. }) => {
                assert_eq!(*initial_seq, 1000);
                assert!(flags_seen.contains(TcpFlags::SYN | TcpFlags::FIN | TcpFlags::ACK));
                assert!(!flags_seen.contains(TcpFlags::RST));
            }
            other => panic!("unexpected metadata {:?}", other),
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_udp_typical_size() {
        let table = table(16);
        let (raw, pkt) = udp_packet(40000, &[0u8; 80]);
        let lookup = table.process(&pkt, raw.len());
        let (raw, pkt) = udp_packet(40000, &[0u8; 160]);
        table.process(&pkt, raw.len());

        let state = lookup.entry.lock();
        assert_eq!(state.metadata(), Some(&FlowMetadata::Udp { typical_size: 90 }));
    }

    #[test]
    fn test_capacity_refuses_tracking_not_traffic() {
        let table = table(2);
        for port in [1000, 1001] {
            let (raw, pkt) = tcp_packet(port, TcpFlags::SYN, &[]);
            assert!(table.process(&pkt, raw.len()).tracked);
        }

        let (raw, pkt) = tcp_packet(1002, TcpFlags::SYN, &[]);
        let lookup = table.process(&pkt, raw.len());
        assert!(!lookup.tracked);
        assert!(!lookup.created);
        assert_eq!(lookup.entry.lock().packets(), 1);
        assert_eq!(table.len(), 2);
        assert!(table.get(&pkt.key).is_none());

        // Existing flows keep updating
        let (raw, pkt) = tcp_packet(1000, TcpFlags::ACK, b"x");
        assert!(table.process(&pkt, raw.len()).tracked);
    }

    #[test]
    fn test_sweep_per_protocol_thresholds() {
        let table = table(16);
        let start = Instant::now();

        let (raw, tcp) = tcp_packet(5000, TcpFlags::SYN, &[]);
        table.process_at(&tcp, raw.len(), start);
        let (raw, udp) = udp_packet(40000, b"q");
        table.process_at(&udp, raw.len(), start);

        // UDP idle threshold is 60s, TCP is 300s
        assert_eq!(table.sweep(start + Duration::from_secs(59)), 0);
        assert_eq!(table.sweep(start + Duration::from_secs(61)), 1);
        assert!(table.get(&udp.key).is_none());
        assert!(table.get(&tcp.key).is_some());
        assert_eq!(table.sweep(start + Duration::from_secs(301)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_is_time_gated() {
        let table = table(16);
        let now = Instant::now();
        assert_eq!(table.maybe_sweep(now + Duration::from_secs(10)), None);
        assert_eq!(table.maybe_sweep(now + Duration::from_secs(31)), Some(0));
        assert_eq!(table.maybe_sweep(now + Duration::from_secs(40)), None);
    }

    #[test]
    fn test_evaluate_tolerates_failures() {
        let table = table(16);
        for port in 2000..2004 {
            let (raw, pkt) = tcp_packet(port, TcpFlags::SYN, &[]);
            table.process(&pkt, raw.len());
        }

        let report = table.evaluate_decisions(|state| {
            if state.key().src_port == 2001 {
                return Err("identity lookup exploded");
            }
            Ok(state.transition_decision(Decision::Allow))
        });
        assert_eq!(report, SweepReport { visited: 4, changed: 3, failed: 1 });

        // Only the failed flow is still undecided
        let report = table.evaluate_decisions(|_| Ok::<bool, String>(false));
        assert_eq!(report.visited, 1);

        let report = table.evaluate_enforcement(|state| {
            Ok::<bool, String>(state.transition_enforcement(EnforcementState::AllowReady))
        });
        assert_eq!(report.changed, 3);
    }

    #[test]
    fn test_single_assignment_identity() {
        let key = tcp_packet(5000, TcpFlags::SYN, &[]).1.key;
        let mut state = FlowState::new(key, Instant::now());
        assert!(state.set_identity(10_001));
        assert!(!state.set_identity(10_002));
        assert_eq!(state.identity(), Some(10_001));
    }

    #[test]
    fn test_monotonic_transitions() {
        let key = tcp_packet(5000, TcpFlags::SYN, &[]).1.key;
        let mut state = FlowState::new(key, Instant::now());

        assert!(!state.transition_decision(Decision::Undecided));
        assert!(state.transition_decision(Decision::Block));
        assert!(!state.transition_decision(Decision::Allow));
        assert_eq!(state.decision(), Decision::Block);

        assert!(state.transition_enforcement(EnforcementState::BlockReady));
        assert!(!state.transition_enforcement(EnforcementState::AllowReady));
        assert_eq!(state.enforcement(), EnforcementState::BlockReady);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let table = table(16);
        let (raw, pkt) = tcp_packet(5000, TcpFlags::SYN, &[]);
        let lookup = table.process(&pkt, raw.len());

        let snap = table.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].packets, 1);

        lookup.entry.lock().telemetry_mut().record_uplink(100);
        table.process(&pkt, raw.len());

        assert_eq!(snap[0].packets, 1);
        assert_eq!(snap[0].telemetry.uplink_bytes, 0);
        assert_eq!(table.snapshot()[0].telemetry.uplink_bytes, 100);
    }

    #[test]
    fn test_concurrent_process() {
        use std::thread;

        let table = Arc::new(table(65536));
        let mut handles = Vec::new();

        for t in 0..4u16 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250u16 {
                    let (raw, pkt) = tcp_packet(10_000 + t * 1000 + i, TcpFlags::SYN, &[]);
                    table.process(&pkt, raw.len());
                    // Shared flow hit by every thread
                    let (raw, pkt) = tcp_packet(9, TcpFlags::ACK, &[]);
                    table.process(&pkt, raw.len());
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(table.len(), 1001);
        let shared = tcp_packet(9, TcpFlags::ACK, &[]).1.key;
        assert_eq!(table.get(&shared).unwrap().lock().packets(), 1000);
    }
}
