//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::packet::Protocol;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Flow tracking
    pub flow_table: FlowTableConfig,
    /// Verdict rules
    pub decision: DecisionConfig,
    /// Verdict enforcement gating
    pub enforcement: EnforcementConfig,
    /// Socket forwarders
    pub forwarder: ForwarderConfig,
    /// Owning-identity lookup cadence
    pub attribution: AttributionConfig,
    /// Loop-prevention primitive for outbound sockets
    pub protect: ProtectConfig,
    /// Tunnel device
    pub device: DeviceConfig,
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow_table: FlowTableConfig::default(),
            decision: DecisionConfig::default(),
            enforcement: EnforcementConfig::default(),
            forwarder: ForwarderConfig::default(),
            attribution: AttributionConfig::default(),
            protect: ProtectConfig::default(),
            device: DeviceConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file
    pub fn load(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path, e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn save(&self, path: &str) -> Result<(), EngineError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(EngineError::from)
    }

    /// Reject settings that would disable tracking or forwarding outright
    pub fn validate(&self) -> Result<(), EngineError> {
        let checks: [(&str, bool); 11] = [
            ("flow_table.max_flows", self.flow_table.max_flows > 0),
            ("flow_table.sweep_interval_secs", self.flow_table.sweep_interval_secs > 0),
            ("forwarder.max_tcp", self.forwarder.max_tcp > 0),
            ("forwarder.max_udp", self.forwarder.max_udp > 0),
            ("forwarder.connect_timeout_secs", self.forwarder.connect_timeout_secs > 0),
            ("forwarder.udp_recv_timeout_secs", self.forwarder.udp_recv_timeout_secs > 0),
            ("forwarder.segment_size", self.forwarder.segment_size >= 64),
            ("forwarder.uplink_queue_depth", self.forwarder.uplink_queue_depth > 0),
            ("forwarder.udp_buffer_size", self.forwarder.udp_buffer_size >= 512),
            ("decision.fail_open_after_attempts", self.decision.fail_open_after_attempts > 0),
            ("device.read_buffer_size", self.device.read_buffer_size >= 576),
        ];
        for (name, ok) in checks {
            if !ok {
                return Err(EngineError::Config(format!("{} is out of range", name)));
            }
        }
        Ok(())
    }
}

/// Flow table settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowTableConfig {
    /// Soft ceiling on tracked flows
    pub max_flows: usize,
    /// Minimum spacing between idle sweeps
    pub sweep_interval_secs: u64,
    pub tcp_idle_secs: u64,
    pub udp_idle_secs: u64,
    pub icmp_idle_secs: u64,
    pub other_idle_secs: u64,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            max_flows: 10_000,
            sweep_interval_secs: 30,
            tcp_idle_secs: 300,
            udp_idle_secs: 60,
            icmp_idle_secs: 10,
            other_idle_secs: 60,
        }
    }
}

impl FlowTableConfig {
    /// Idle threshold after which a flow of `protocol` is swept
    pub fn idle_timeout(&self, protocol: Protocol) -> Duration {
        let secs = match protocol {
            Protocol::Tcp => self.tcp_idle_secs,
            Protocol::Udp => self.udp_idle_secs,
            Protocol::Icmp => self.icmp_idle_secs,
            Protocol::Other(_) => self.other_idle_secs,
        };
        Duration::from_secs(secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Decision rule settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub sweep_interval_secs: u64,
    /// Allow flows whose owner never resolves instead of leaving them
    /// undecided (and therefore unforwarded)
    pub fail_open_unattributed: bool,
    /// Owner lookups (initial plus retries) that must miss before the
    /// fail-open rule allows a flow
    pub fail_open_after_attempts: u32,
    /// Identities always allowed
    pub allowed_identities: Vec<u32>,
    /// Identities always blocked
    pub blocked_identities: Vec<u32>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 10,
            fail_open_unattributed: true,
            fail_open_after_attempts: 2,
            allowed_identities: Vec::new(),
            blocked_identities: Vec::new(),
        }
    }
}

impl DecisionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Enforcement gating settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub sweep_interval_secs: u64,
    /// Minimum flow age before a BLOCK may take effect
    pub block_min_age_ms: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 20,
            block_min_age_ms: 5_000,
        }
    }
}

impl EnforcementConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn block_min_age(&self) -> Duration {
        Duration::from_millis(self.block_min_age_ms)
    }
}

/// Forwarder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Soft ceiling on live TCP forwarders
    pub max_tcp: usize,
    /// Soft ceiling on live UDP forwarders
    pub max_udp: usize,
    pub connect_timeout_secs: u64,
    /// Per-receive timeout on UDP downlink reads
    pub udp_recv_timeout_secs: u64,
    /// UDP forwarders idle this long are reclaimed
    pub udp_idle_secs: u64,
    /// Bound on waiting for a downlink task to stop
    pub close_timeout_ms: u64,
    /// Minimum spacing between registry cleanup sweeps
    pub cleanup_interval_secs: u64,
    /// Largest TCP payload placed in one synthesized segment
    pub segment_size: usize,
    /// Client segments queued per TCP forwarder ahead of the socket write.
    /// A full queue resets the flow.
    pub uplink_queue_depth: usize,
    /// Receive buffer per UDP forwarder; longer replies are truncated
    pub udp_buffer_size: usize,
    /// Advertised receive window on synthesized segments
    pub tcp_window: u16,
    /// Fixed initial sequence number for synthesized TCP streams.
    /// Random per forwarder when unset.
    pub tcp_initial_sequence: Option<u32>,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_tcp: 1000,
            max_udp: 2000,
            connect_timeout_secs: 10,
            udp_recv_timeout_secs: 5,
            udp_idle_secs: 60,
            close_timeout_ms: 2_000,
            cleanup_interval_secs: 10,
            segment_size: 1400,
            uplink_queue_depth: 256,
            udp_buffer_size: 4096,
            tcp_window: 65535,
            tcp_initial_sequence: None,
        }
    }
}

impl ForwarderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn udp_recv_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_recv_timeout_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// UDP receive buffer length, capped at the largest UDP payload
    pub fn udp_buffer_len(&self) -> usize {
        self.udp_buffer_size.min(crate::packet::build::MAX_UDP_PAYLOAD)
    }
}

/// Owner lookup cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributionConfig {
    /// How long a loaded owner table is trusted
    pub cache_ttl_secs: u64,
    /// Minimum spacing between lookups for one unresolved flow
    pub retry_interval_secs: u64,
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 5,
            retry_interval_secs: 10,
        }
    }
}

impl AttributionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Loop-prevention primitive applied to every outbound socket
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectConfig {
    /// SO_MARK value excluded from the tunnel's routing rule
    pub fwmark: Option<u32>,
    /// Physical interface to bind outbound sockets to
    pub bind_interface: Option<String>,
}

impl ProtectConfig {
    /// True when at least one primitive is configured
    pub fn is_configured(&self) -> bool {
        self.fwmark.is_some() || self.bind_interface.is_some()
    }
}

/// Tunnel device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Read buffer; must hold the device MTU
    pub read_buffer_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 65535,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.flow_table.max_flows, 10_000);
        assert_eq!(config.flow_table.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.flow_table.idle_timeout(Protocol::Tcp), Duration::from_secs(300));
        assert_eq!(config.flow_table.idle_timeout(Protocol::Udp), Duration::from_secs(60));
        assert_eq!(config.flow_table.idle_timeout(Protocol::Icmp), Duration::from_secs(10));
        assert_eq!(config.flow_table.idle_timeout(Protocol::Other(47)), Duration::from_secs(60));
        assert_eq!(config.enforcement.block_min_age(), Duration::from_secs(5));
        assert_eq!(config.enforcement.sweep_interval(), Duration::from_secs(20));
        assert_eq!(config.forwarder.max_tcp, 1000);
        assert_eq!(config.forwarder.max_udp, 2000);
        assert_eq!(config.forwarder.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.forwarder.udp_recv_timeout(), Duration::from_secs(5));
        assert_eq!(config.forwarder.close_timeout(), Duration::from_secs(2));
        assert_eq!(config.attribution.cache_ttl(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
        assert!(!config.protect.is_configured());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "forwarder": { "max_tcp": 8 }, "protect": { "fwmark": 51820 } }"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.forwarder.max_tcp, 8);
        assert_eq!(config.forwarder.max_udp, 2000);
        assert_eq!(config.protect.fwmark, Some(51820));
        assert!(config.protect.is_configured());
        assert_eq!(config.flow_table.max_flows, 10_000);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = EngineConfig::default();
        config.forwarder.max_udp = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(msg)) if msg.contains("max_udp")));
    }

    #[test]
    fn test_forwarder_buffer_defaults() {
        let config = ForwarderConfig::default();
        assert_eq!(config.uplink_queue_depth, 256);
        assert_eq!(config.udp_buffer_len(), 4096);

        let oversized = ForwarderConfig {
            udp_buffer_size: 1 << 20,
            ..ForwarderConfig::default()
        };
        assert_eq!(oversized.udp_buffer_len(), crate::packet::build::MAX_UDP_PAYLOAD);

        let mut config = EngineConfig::default();
        config.forwarder.uplink_queue_depth = 0;
        assert!(matches!(config.validate(), Err(EngineError::Config(msg)) if msg.contains("uplink_queue_depth")));
        config.forwarder.uplink_queue_depth = 1;
        config.decision.fail_open_after_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_round_trip() {
        let path = std::env::temp_dir().join(format!("sase-forwarder-{}.json", std::process::id()));
        let path = path.to_string_lossy().into_owned();

        let mut config = EngineConfig::default();
        config.decision.blocked_identities = vec![10123];
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.decision.blocked_identities, vec![10123]);
        let _ = std::fs::remove_file(&path);
    }
}
