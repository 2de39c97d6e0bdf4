//! Decoded events and emitted samples

use serde::{Deserialize, Serialize};

use super::{FlowId, FlowKey, PacketFlags};

/// Session identifier handed out by the orchestrator.
pub type SessionId = u64;

/// Column names of the packet summary export, also printed as stdout heading.
pub const PACKET_HEADING: [&str; 7] = [
    "timestampMs",
    "sojournTimeMs",
    "loadKbits",
    "capacityKbits",
    "ecnCePercent",
    "dropped",
    "netflow",
];

/// Column names of the queue sample export.
pub const QUEUE_HEADING: [&str; 3] = ["timestampMs", "memUsageBytes", "packetsinqueue"];

/// One packet as seen by the qdisc.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketSample {
    /// Monotonic timestamp in milliseconds
    pub timestamp_ms: u64,
    /// Time spent in the queue, milliseconds
    pub sojourn_ms: u32,
    pub flags: PacketFlags,
    pub ip_version: u8,
    pub priority: u8,
    pub size_bytes: u32,
    pub flow: FlowKey,
}

impl PacketSample {
    pub fn ecn_in(&self) -> u8 {
        self.flags.ecn_in()
    }

    pub fn ecn_out(&self) -> u8 {
        self.flags.ecn_out()
    }
}

/// Queue state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSample {
    /// Epoch timestamp in milliseconds
    pub timestamp_ms: u64,
    pub queue_depth: u16,
    pub mem_usage_bytes: u32,
    pub session_id: SessionId,
}

impl QueueSample {
    pub fn csv_record(&self) -> [String; 3] {
        [
            self.timestamp_ms.to_string(),
            self.mem_usage_bytes.to_string(),
            self.queue_depth.to_string(),
        ]
    }
}

/// Output of the record decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Packet(PacketSample),
    Queue(QueueSample),
}

/// Per-flow summary of one aggregation window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSummary {
    /// Epoch timestamp in milliseconds
    pub timestamp_ms: u64,
    pub sojourn_ms: u32,
    pub load_kbits: u32,
    pub capacity_kbits: u32,
    pub ecn_ce_percent: u32,
    pub dropped: u32,
    pub flow_id: FlowId,
    /// Display string of the flow
    pub flow: String,
    /// Number of packets that went into this summary
    pub sample_count: u32,
}

impl PacketSummary {
    pub fn csv_record(&self) -> [String; 7] {
        [
            self.timestamp_ms.to_string(),
            self.sojourn_ms.to_string(),
            self.load_kbits.to_string(),
            self.capacity_kbits.to_string(),
            self.ecn_ce_percent.to_string(),
            self.dropped.to_string(),
            self.flow.clone(),
        ]
    }

    /// Whitespace separated line in heading order.
    pub fn print_line(&self) -> String {
        format!(
            "{} {} {} {} {} {} {}",
            self.timestamp_ms,
            self.sojourn_ms,
            self.load_kbits,
            self.capacity_kbits,
            self.ecn_ce_percent,
            self.dropped,
            self.flow
        )
    }
}

/// Item flowing through the persistence sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Packet(PacketSummary),
    Queue(QueueSample),
}

impl Sample {
    pub fn kind(&self) -> &'static str {
        match self {
            Sample::Packet(_) => "packet",
            Sample::Queue(_) => "queue",
        }
    }
}

impl From<PacketSummary> for Sample {
    fn from(summary: PacketSummary) -> Self {
        Sample::Packet(summary)
    }
}

impl From<QueueSample> for Sample {
    fn from(sample: QueueSample) -> Self {
        Sample::Queue(sample)
    }
}
