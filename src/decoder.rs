//! Record decoder: one 64-byte telemetry frame to a typed event

use std::net::Ipv4Addr;

use crate::types::{
    Decoded, FlowKey, OFFSET_DST_IP, OFFSET_DST_PORT, OFFSET_FLAGS, OFFSET_IP_VERSION,
    OFFSET_MEM_USAGE, OFFSET_NEXT_HEADER, OFFSET_PRIORITY, OFFSET_QUEUE_DEPTH, OFFSET_SIZE,
    OFFSET_SOJOURN, OFFSET_SRC_IP, OFFSET_SRC_PORT, PacketFlags, PacketSample, Protocol,
    QueueSample, RECORD_TYPE_PACKET, RECORD_TYPE_QUEUE, RawFrame, SessionId,
};
use crate::{Error, Result};

/// Decodes raw frames for one session.
///
/// Queue timestamps are translated from the monotonic clock to epoch
/// milliseconds with the offset captured when the session started. Packet
/// timestamps stay monotonic; they are only used for ordering.
#[derive(Debug, Clone, Copy)]
pub struct RecordDecoder {
    session_id: SessionId,
    clock_offset_ms: u64,
}

impl RecordDecoder {
    pub fn new(session_id: SessionId, clock_offset_ms: u64) -> Self {
        Self { session_id, clock_offset_ms }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Decode one frame.
    ///
    /// Returns:
    /// - `Ok(Some(event))` for a packet or queue record
    /// - `Ok(None)` for a packet record without addresses (non-IP traffic)
    /// - `Err(Error::UnknownRecordType)` for any other type tag
    pub fn decode(&self, frame: &RawFrame) -> Result<Option<Decoded>> {
        match frame.type_tag() {
            RECORD_TYPE_PACKET => Ok(decode_packet(frame).map(Decoded::Packet)),
            RECORD_TYPE_QUEUE => Ok(Some(Decoded::Queue(self.decode_queue(frame)))),
            tag => Err(Error::unknown_record_type(tag)),
        }
    }

    fn decode_queue(&self, frame: &RawFrame) -> QueueSample {
        QueueSample {
            timestamp_ms: ns_to_ms(frame.timestamp_ns()).saturating_add(self.clock_offset_ms),
            queue_depth: frame.u16_at(OFFSET_QUEUE_DEPTH),
            mem_usage_bytes: frame.u32_at(OFFSET_MEM_USAGE),
            session_id: self.session_id,
        }
    }
}

fn decode_packet(frame: &RawFrame) -> Option<PacketSample> {
    let source_ip = frame.ipv4_at(OFFSET_SRC_IP);
    let destination_ip = frame.ipv4_at(OFFSET_DST_IP);
    if source_ip == Ipv4Addr::UNSPECIFIED && destination_ip == Ipv4Addr::UNSPECIFIED {
        return None;
    }

    let protocol = Protocol::from_next_header(frame.u8_at(OFFSET_NEXT_HEADER));
    let (source_port, destination_port) = if protocol.has_ports() {
        (frame.u16_at(OFFSET_SRC_PORT), frame.u16_at(OFFSET_DST_PORT))
    } else {
        (0, 0)
    };

    Some(PacketSample {
        timestamp_ms: ns_to_ms(frame.timestamp_ns()),
        sojourn_ms: frame.u32_at(OFFSET_SOJOURN) / 1000,
        flags: PacketFlags::new(frame.u8_at(OFFSET_FLAGS)),
        ip_version: frame.u8_at(OFFSET_IP_VERSION),
        priority: frame.u8_at(OFFSET_PRIORITY),
        size_bytes: frame.u32_at(OFFSET_SIZE),
        flow: FlowKey::new(protocol, source_ip, source_port, destination_ip, destination_port),
    })
}

#[inline]
fn ns_to_ms(ns: u64) -> u64 {
    ns / 1_000_000
}
