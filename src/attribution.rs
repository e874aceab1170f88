//! Owning-identity attribution
//!
//! Best-effort mapping from a flow to the identity (uid) that owns its
//! local socket. The lookup table is an external collaborator behind
//! [`OwnerTable`]; the engine works unchanged when it is always empty.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::AttributionConfig;
use crate::flow::FlowState;
use crate::packet::FlowKey;

/// One row of the host's socket ownership table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub local_port: u16,
    /// Unspecified for unconnected datagram sockets
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
    pub protocol: u8,
    /// Kernel socket state code
    pub state: u8,
    pub owner: u32,
}

impl OwnerRecord {
    fn matches_remote(&self, key: &FlowKey) -> bool {
        self.remote_addr == key.dst_ip && self.remote_port == key.dst_port
    }

    fn is_wildcard(&self) -> bool {
        self.remote_addr.is_unspecified() && self.remote_port == 0
    }
}

/// Source of ownership records
pub trait OwnerTable: Send + Sync {
    fn load(&self) -> io::Result<Vec<OwnerRecord>>;
}

/// Table that never knows anyone
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyOwnerTable;

impl OwnerTable for EmptyOwnerTable {
    fn load(&self) -> io::Result<Vec<OwnerRecord>> {
        Ok(Vec::new())
    }
}

/// Fixed record set
#[derive(Debug, Default, Clone)]
pub struct StaticOwnerTable {
    records: Vec<OwnerRecord>,
}

impl StaticOwnerTable {
    pub fn new(records: Vec<OwnerRecord>) -> Self {
        Self { records }
    }
}

impl OwnerTable for StaticOwnerTable {
    fn load(&self) -> io::Result<Vec<OwnerRecord>> {
        Ok(self.records.clone())
    }
}

/// `/proc/net/{tcp,udp}` reader; the owner is the socket's uid
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone)]
pub struct ProcNetOwnerTable {
    root: std::path::PathBuf,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl ProcNetOwnerTable {
    pub fn new() -> Self {
        Self {
            root: std::path::PathBuf::from("/proc/net"),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Default for ProcNetOwnerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl OwnerTable for ProcNetOwnerTable {
    fn load(&self) -> io::Result<Vec<OwnerRecord>> {
        use crate::packet::{IPPROTO_TCP, IPPROTO_UDP};

        let mut records = Vec::new();
        for (file, protocol) in [("tcp", IPPROTO_TCP), ("udp", IPPROTO_UDP)] {
            let content = std::fs::read_to_string(self.root.join(file))?;
            records.extend(parse_proc_net(&content, protocol));
        }
        Ok(records)
    }
}

/// Parse the body of a `/proc/net/tcp`-style table. Malformed rows are skipped.
pub fn parse_proc_net(content: &str, protocol: u8) -> Vec<OwnerRecord> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let (_, local_port) = parse_hex_endpoint(fields[1])?;
            let (remote_addr, remote_port) = parse_hex_endpoint(fields[2])?;
            Some(OwnerRecord {
                local_port,
                remote_addr,
                remote_port,
                protocol,
                state: u8::from_str_radix(fields[3], 16).ok()?,
                owner: fields[7].parse().ok()?,
            })
        })
        .collect()
}

/// `0100007F:0035` → 127.0.0.1:53 (address in host byte order)
fn parse_hex_endpoint(field: &str) -> Option<(Ipv4Addr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let addr = u32::from_str_radix(addr, 16).ok()?;
    let port = u16::from_str_radix(port, 16).ok()?;
    Some((Ipv4Addr::from(addr.swap_bytes()), port))
}

/// Outcome of one attribution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    /// Identity newly assigned
    Resolved(u32),
    /// Flow already carries an identity
    Known,
    /// Lookup ran, no owner found
    Miss,
    /// Retry interval has not elapsed since the last attempt
    NotDue,
}

struct Cached {
    loaded_at: Option<Instant>,
    by_port: HashMap<(u8, u16), Vec<OwnerRecord>>,
}

/// TTL cache in front of an [`OwnerTable`]
pub struct AttributionCache {
    table: Arc<dyn OwnerTable>,
    cached: RwLock<Cached>,
    ttl: Duration,
    retry: Duration,
}

impl AttributionCache {
    pub fn new(table: Arc<dyn OwnerTable>, config: &AttributionConfig) -> Self {
        Self {
            table,
            cached: RwLock::new(Cached {
                loaded_at: None,
                by_port: HashMap::new(),
            }),
            ttl: config.cache_ttl(),
            retry: config.retry_interval(),
        }
    }

    /// Reload the table if the cached copy is older than the TTL
    pub fn refresh(&self, now: Instant) -> io::Result<()> {
        let fresh = matches!(
            self.cached.read().loaded_at,
            Some(at) if now.saturating_duration_since(at) < self.ttl
        );
        if fresh {
            return Ok(());
        }

        // Load outside the lock
        let records = self.table.load();
        let mut cached = self.cached.write();
        cached.loaded_at = Some(now);
        let records = records?;
        cached.by_port.clear();
        for record in records {
            cached
                .by_port
                .entry((record.protocol, record.local_port))
                .or_default()
                .push(record);
        }
        tracing::trace!("Owner table reloaded ({} local ports)", cached.by_port.len());
        Ok(())
    }

    /// Owner of the local socket behind `key` in the cached table. Prefers
    /// an exact remote match over a wildcard (unconnected) socket. Never
    /// reloads; callers [`refresh`](Self::refresh) before a batch of lookups.
    pub fn lookup(&self, key: &FlowKey) -> Option<u32> {
        let cached = self.cached.read();
        let candidates = cached.by_port.get(&(key.protocol, key.src_port))?;
        candidates
            .iter()
            .find(|r| r.matches_remote(key))
            .or_else(|| candidates.iter().find(|r| r.is_wildcard()))
            .map(|r| r.owner)
    }

    /// Try to attribute `flow` from the cached table, honouring the
    /// per-flow retry interval.
    pub fn attribute(&self, flow: &mut FlowState, now: Instant) -> Attribution {
        if flow.identity().is_some() {
            return Attribution::Known;
        }
        if let Some(at) = flow.attribution_checked() {
            if now.saturating_duration_since(at) < self.retry {
                return Attribution::NotDue;
            }
        }
        flow.mark_attribution_checked(now);

        match self.lookup(flow.key()) {
            Some(owner) => {
                flow.set_identity(owner);
                Attribution::Resolved(owner)
            }
            None => Attribution::Miss,
        }
    }
}

impl Default for AttributionCache {
    fn default() -> Self {
        Self::new(Arc::new(EmptyOwnerTable), &AttributionConfig::default())
    }
}
