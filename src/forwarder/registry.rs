//! Forwarder Registry
//!
//! Single owner of every live forwarder. Enforces protocol and readiness
//! checks, the soft ceilings, and per-entry isolated teardown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{ForwarderContext, TcpForwarder, UdpForwarder};
use crate::error::{ErrorKind, ForwardError};
use crate::flow::{EnforcementState, FlowEntry};
use crate::packet::{FlowKey, Protocol};
use crate::stats::EngineStats;

/// Result of a cleanup or shutdown pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub closed: usize,
    pub failed: usize,
}

pub struct ForwarderRegistry {
    tcp: DashMap<FlowKey, Arc<TcpForwarder>>,
    udp: DashMap<FlowKey, Arc<UdpForwarder>>,
    ctx: ForwarderContext,
    last_cleanup: Mutex<Instant>,
    tcp_full: AtomicBool,
    udp_full: AtomicBool,
}

impl ForwarderRegistry {
    pub fn new(ctx: ForwarderContext) -> Self {
        Self {
            tcp: DashMap::new(),
            udp: DashMap::new(),
            ctx,
            last_cleanup: Mutex::new(Instant::now()),
            tcp_full: AtomicBool::new(false),
            udp_full: AtomicBool::new(false),
        }
    }

    fn eligible(flow: &FlowEntry, protocol: Protocol) -> bool {
        flow.key().protocol_kind() == protocol && flow.enforcement() == EnforcementState::AllowReady
    }

    /// Whether a new forwarder fits under `max`. Warns once per burst.
    fn admit(&self, len: usize, max: usize, full: &AtomicBool, protocol: Protocol) -> bool {
        if len < max {
            full.store(false, Ordering::Relaxed);
            return true;
        }
        self.ctx.stats.record_error(ErrorKind::CapacityExceeded);
        if !full.swap(true, Ordering::Relaxed) {
            tracing::warn!("{} forwarder limit ({}) reached, new flows are not forwarded", protocol, max);
        }
        false
    }

    fn setup_failed(&self, flow: &FlowEntry, err: ForwardError) {
        tracing::debug!("{}", err);
        self.ctx.stats.record_error(err.kind());
        flow.lock().telemetry_mut().record_error();
    }

    /// Live TCP forwarder for `flow`, creating one when the flow is
    /// cleared for forwarding and the ceiling allows. `client_isn` is the
    /// sequence number of the SYN that opens the connection.
    pub fn get_or_create_tcp(&self, flow: &Arc<FlowEntry>, client_isn: u32) -> Option<Arc<TcpForwarder>> {
        if !Self::eligible(flow, Protocol::Tcp) {
            return None;
        }
        if let Some(existing) = self.get_tcp(flow.key()) {
            return Some(existing);
        }
        if !self.admit(self.tcp.len(), self.ctx.config.max_tcp, &self.tcp_full, Protocol::Tcp) {
            return None;
        }

        match TcpForwarder::open(flow.clone(), client_isn, self.ctx.clone()) {
            Ok(forwarder) => {
                self.replace_tcp(forwarder.clone());
                EngineStats::incr(&self.ctx.stats.forwarders_created);
                Some(forwarder)
            }
            Err(e) => {
                self.setup_failed(flow, e);
                None
            }
        }
    }

    /// Live UDP forwarder for `flow`, creating one when allowed
    pub fn get_or_create_udp(&self, flow: &Arc<FlowEntry>) -> Option<Arc<UdpForwarder>> {
        if !Self::eligible(flow, Protocol::Udp) {
            return None;
        }
        if let Some(existing) = self.get_udp(flow.key()) {
            return Some(existing);
        }
        if !self.admit(self.udp.len(), self.ctx.config.max_udp, &self.udp_full, Protocol::Udp) {
            return None;
        }

        match UdpForwarder::open(flow.clone(), self.ctx.clone()) {
            Ok(forwarder) => {
                if let Some(stale) = self.udp.insert(*forwarder.key(), forwarder.clone()) {
                    self.retire(*stale.key(), async move { stale.close().await });
                }
                EngineStats::incr(&self.ctx.stats.forwarders_created);
                Some(forwarder)
            }
            Err(e) => {
                self.setup_failed(flow, e);
                None
            }
        }
    }

    fn replace_tcp(&self, forwarder: Arc<TcpForwarder>) {
        // A finished forwarder awaiting cleanup may still hold the key
        if let Some(stale) = self.tcp.insert(*forwarder.key(), forwarder) {
            self.retire(*stale.key(), async move { stale.close().await });
        }
    }

    /// Close a replaced forwarder off the packet path
    fn retire<F>(&self, key: FlowKey, close: F)
    where
        F: Future<Output = Result<(), ForwardError>> + Send + 'static,
    {
        let stats = self.ctx.stats.clone();
        tokio::spawn(async move {
            if let Err(e) = close.await {
                stats.record_error(ErrorKind::CleanupFailure);
                tracing::warn!("{}: close of replaced forwarder failed: {}", key, e);
            }
        });
    }

    /// Active TCP forwarder for `key`, if any
    pub fn get_tcp(&self, key: &FlowKey) -> Option<Arc<TcpForwarder>> {
        self.tcp
            .get(key)
            .map(|f| f.value().clone())
            .filter(|f| f.is_active())
    }

    /// Active UDP forwarder for `key`, if any
    pub fn get_udp(&self, key: &FlowKey) -> Option<Arc<UdpForwarder>> {
        self.udp
            .get(key)
            .map(|f| f.value().clone())
            .filter(|f| f.is_active())
    }

    /// Remove and close the forwarder under `key` once it has finished.
    /// A live forwarder (for example a replacement) is left in place.
    pub async fn reap(&self, key: &FlowKey) -> Result<bool, ForwardError> {
        if let Some((_, fwd)) = self.tcp.remove_if(key, |_, f| !f.is_active()) {
            fwd.close().await?;
            return Ok(true);
        }
        if let Some((_, fwd)) = self.udp.remove_if(key, |_, f| !f.is_active()) {
            fwd.close().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Cleanup, skipped unless the cleanup interval has elapsed
    pub async fn maybe_cleanup(&self, now: Instant) -> Option<CleanupReport> {
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) < self.ctx.config.cleanup_interval() {
                return None;
            }
            *last = now;
        }
        Some(self.cleanup(now).await)
    }

    /// Close and remove inactive forwarders and UDP forwarders idle at `now`
    pub async fn cleanup(&self, now: Instant) -> CleanupReport {
        let tcp: Vec<_> = self
            .tcp
            .iter()
            .filter(|f| !f.is_active())
            .map(|f| *f.key())
            .collect();
        let udp: Vec<_> = self
            .udp
            .iter()
            .filter(|f| !f.is_active() || f.is_idle(now))
            .map(|f| *f.key())
            .collect();

        let mut report = CleanupReport::default();
        for key in tcp {
            if let Some((_, fwd)) = self.tcp.remove(&key) {
                self.tally(&mut report, &key, fwd.close().await);
            }
        }
        for key in udp {
            if let Some((_, fwd)) = self.udp.remove(&key) {
                self.tally(&mut report, &key, fwd.close().await);
            }
        }

        if report.closed + report.failed > 0 {
            tracing::debug!(
                "Forwarder cleanup: {} closed, {} failed, {} tcp / {} udp live",
                report.closed,
                report.failed,
                self.tcp.len(),
                self.udp.len()
            );
        }
        report
    }

    fn tally(&self, report: &mut CleanupReport, key: &FlowKey, result: Result<(), ForwardError>) {
        match result {
            Ok(()) => report.closed += 1,
            Err(e) => {
                report.failed += 1;
                self.ctx.stats.record_error(ErrorKind::CleanupFailure);
                tracing::warn!("{}: close failed: {}", key, e);
            }
        }
    }

    /// Shutdown path: close everything, then clear both maps regardless of
    /// individual failures
    pub async fn close_all(&self) -> CleanupReport {
        let tcp: Vec<_> = self.tcp.iter().map(|f| f.value().clone()).collect();
        let udp: Vec<_> = self.udp.iter().map(|f| f.value().clone()).collect();

        let mut report = CleanupReport::default();
        for fwd in tcp {
            self.tally(&mut report, fwd.key(), fwd.close().await);
        }
        for fwd in udp {
            self.tally(&mut report, fwd.key(), fwd.close().await);
        }

        self.tcp.clear();
        self.udp.clear();
        tracing::info!("Closed all forwarders ({} ok, {} failed)", report.closed, report.failed);
        report
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_count(&self) -> usize {
        self.udp.len()
    }
}
