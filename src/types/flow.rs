//! Network flow identity

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::OnceLock;

/// Numeric flow identifier handed out by the storage collaborator.
pub type FlowId = u64;

/// Transport protocol derived from the record's next-header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl Protocol {
    /// Map an IP next-header value.
    pub fn from_next_header(next_header: u8) -> Self {
        match next_header {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }

    /// Whether the record carries transport ports.
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
            Protocol::Other(n) => write!(f, "ip{}", n),
        }
    }
}

/// Identity of one traffic stream observed by the qdisc.
///
/// Equality and hashing cover only the 5-tuple. The display string is built
/// at most once per key and reused as the aggregation key.
#[derive(Debug, Clone)]
pub struct FlowKey {
    pub protocol: Protocol,
    pub source_ip: Ipv4Addr,
    pub source_port: u16,
    pub destination_ip: Ipv4Addr,
    pub destination_port: u16,
    display: OnceLock<String>,
}

impl FlowKey {
    pub fn new(
        protocol: Protocol,
        source_ip: Ipv4Addr,
        source_port: u16,
        destination_ip: Ipv4Addr,
        destination_port: u16,
    ) -> Self {
        Self {
            protocol,
            source_ip,
            source_port,
            destination_ip,
            destination_port,
            display: OnceLock::new(),
        }
    }

    /// Memoized `"<proto> <src>:<sport>-<dst>:<dport>"` string.
    pub fn id_str(&self) -> &str {
        self.display.get_or_init(|| {
            format!(
                "{} {}:{}-{}:{}",
                self.protocol,
                self.source_ip,
                self.source_port,
                self.destination_ip,
                self.destination_port
            )
        })
    }

    /// nft match expression selecting this flow.
    pub fn nft_filter(&self) -> String {
        format!(
            "ip saddr {} {proto} sport {} ip daddr {} {proto} dport {}",
            self.source_ip,
            self.source_port,
            self.destination_ip,
            self.destination_port,
            proto = self.protocol
        )
    }

    fn tuple(&self) -> (Protocol, Ipv4Addr, u16, Ipv4Addr, u16) {
        (
            self.protocol,
            self.source_ip,
            self.source_port,
            self.destination_ip,
            self.destination_port,
        )
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &Self) -> bool {
        self.tuple() == other.tuple()
    }
}

impl Eq for FlowKey {}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tuple().hash(state);
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id_str())
    }
}
