//! OpenSASE Forwarder
//!
//! Userspace tunnel engine: raw IPv4 datagrams read from a TUN device are
//! tracked as flows, attributed to an owning identity, given a verdict,
//! and (once allowed) relayed through real protected sockets. Replies are
//! synthesized back into IPv4/TCP or IPv4/UDP datagrams and written to the
//! same device.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        FORWARDING ENGINE                        │
//! │                                                                 │
//! │  TUN read ──► parse ──► Flow Table ──► Decision ──► Enforcement │
//! │                            │   ▲          ▲              │      │
//! │                            │   └── Attribution (owner    │      │
//! │                            │       table, TTL cache)     ▼      │
//! │                            │                   ┌──────────────┐ │
//! │                            └──────────────────►│  Forwarder   │ │
//! │                                                │  Registry    │ │
//! │                                                │ TCP │ UDP    │ │
//! │                                                └──┬───────┬───┘ │
//! │                                                   │       │     │
//! │  TUN write ◄── synthesize ◄── downlink tasks ◄────┴───────┘     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decisions and enforcement states only ever move forward:
//! `Undecided → Allow | Block` and `None → AllowReady | BlockReady`.
//! A block is enforced only after the flow has been observed for a
//! minimum age and its owner is known.

pub mod attribution;
pub mod config;
pub mod decision;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod flow;
pub mod forwarder;
pub mod packet;
pub mod stats;
pub mod tun;

pub use attribution::{AttributionCache, OwnerRecord, OwnerTable};
pub use config::EngineConfig;
pub use decision::{DecisionEngine, DecisionRule};
pub use enforcement::EnforcementController;
pub use engine::{Engine, EngineSnapshot, PacketOutcome, TelemetryHandle};
pub use error::{EngineError, EngineResult, ErrorKind, ForwardError};
pub use flow::{Decision, EnforcementState, FlowSnapshot, FlowTable};
pub use forwarder::{ForwarderRegistry, SocketProtector};
pub use packet::{parse, FlowKey, ParseError, ParsedPacket, Protocol};
pub use stats::{EngineStats, StatsSnapshot};
