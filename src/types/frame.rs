//! Raw telemetry frame read from the qdisc debug interface

use std::net::Ipv4Addr;

/// Size of one telemetry record in bytes.
pub const RECORD_SIZE: usize = 64;

/// Type tag of a queue-state record.
pub const RECORD_TYPE_QUEUE: u8 = 6;

/// Type tag of a per-packet record.
pub const RECORD_TYPE_PACKET: u8 = 7;

// Field offsets within a record
pub(crate) const OFFSET_TIMESTAMP: usize = 0;
pub(crate) const OFFSET_TYPE: usize = 8;
pub(crate) const OFFSET_FLAGS: usize = 9;
pub(crate) const OFFSET_PRIORITY: usize = 10;
pub(crate) const OFFSET_QUEUE_DEPTH: usize = 10;
pub(crate) const OFFSET_SOJOURN: usize = 12;
pub(crate) const OFFSET_MEM_USAGE: usize = 12;
pub(crate) const OFFSET_SRC_IP: usize = 28;
pub(crate) const OFFSET_DST_IP: usize = 44;
pub(crate) const OFFSET_SIZE: usize = 48;
pub(crate) const OFFSET_IP_VERSION: usize = 52;
pub(crate) const OFFSET_NEXT_HEADER: usize = 53;
pub(crate) const OFFSET_SRC_PORT: usize = 54;
pub(crate) const OFFSET_DST_PORT: usize = 56;

/// One fixed-size binary record from the telemetry device.
///
/// The buffer is always exactly [`RECORD_SIZE`] bytes, so every accessor is
/// infallible. All multi-byte fields are little-endian.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    bytes: [u8; RECORD_SIZE],
}

impl RawFrame {
    /// Wrap a record buffer.
    pub fn new(bytes: [u8; RECORD_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copy a record out of a slice. Returns `None` unless the slice is exactly one record long.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; RECORD_SIZE] = slice.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Raw record bytes.
    pub fn as_bytes(&self) -> &[u8; RECORD_SIZE] {
        &self.bytes
    }

    /// Monotonic timestamp in nanoseconds.
    pub fn timestamp_ns(&self) -> u64 {
        self.u64_at(OFFSET_TIMESTAMP)
    }

    /// Record type tag.
    pub fn type_tag(&self) -> u8 {
        self.bytes[OFFSET_TYPE]
    }

    pub(crate) fn u8_at(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub(crate) fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    pub(crate) fn u32_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    pub(crate) fn u64_at(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    pub(crate) fn ipv4_at(&self, offset: usize) -> Ipv4Addr {
        Ipv4Addr::new(
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        )
    }
}

impl From<[u8; RECORD_SIZE]> for RawFrame {
    fn from(bytes: [u8; RECORD_SIZE]) -> Self {
        Self::new(bytes)
    }
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("timestamp_ns", &self.timestamp_ns())
            .field("type_tag", &self.type_tag())
            .finish_non_exhaustive()
    }
}

/// Builder for synthetic records, used by replay fixtures and tests.
#[derive(Debug, Clone, Copy)]
pub struct FrameBuilder {
    bytes: [u8; RECORD_SIZE],
}

impl FrameBuilder {
    /// Start a packet record at the given monotonic timestamp.
    pub fn packet(timestamp_ns: u64) -> Self {
        Self::with_tag(RECORD_TYPE_PACKET, timestamp_ns)
    }

    /// Start a queue record at the given monotonic timestamp.
    pub fn queue(timestamp_ns: u64) -> Self {
        Self::with_tag(RECORD_TYPE_QUEUE, timestamp_ns)
    }

    /// Start a record with an arbitrary type tag.
    pub fn with_tag(tag: u8, timestamp_ns: u64) -> Self {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8].copy_from_slice(&timestamp_ns.to_le_bytes());
        bytes[OFFSET_TYPE] = tag;
        Self { bytes }
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.bytes[OFFSET_FLAGS] = flags;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.bytes[OFFSET_PRIORITY] = priority;
        self
    }

    pub fn sojourn_us(mut self, sojourn_us: u32) -> Self {
        self.bytes[OFFSET_SOJOURN..OFFSET_SOJOURN + 4].copy_from_slice(&sojourn_us.to_le_bytes());
        self
    }

    pub fn addresses(mut self, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        self.bytes[OFFSET_SRC_IP..OFFSET_SRC_IP + 4].copy_from_slice(&src.octets());
        self.bytes[OFFSET_DST_IP..OFFSET_DST_IP + 4].copy_from_slice(&dst.octets());
        self
    }

    pub fn size(mut self, bytes: u32) -> Self {
        self.bytes[OFFSET_SIZE..OFFSET_SIZE + 4].copy_from_slice(&bytes.to_le_bytes());
        self
    }

    pub fn ip_version(mut self, version: u8) -> Self {
        self.bytes[OFFSET_IP_VERSION] = version;
        self
    }

    /// Set next header and ports.
    pub fn transport(mut self, next_header: u8, src_port: u16, dst_port: u16) -> Self {
        self.bytes[OFFSET_NEXT_HEADER] = next_header;
        self.bytes[OFFSET_SRC_PORT..OFFSET_SRC_PORT + 2].copy_from_slice(&src_port.to_le_bytes());
        self.bytes[OFFSET_DST_PORT..OFFSET_DST_PORT + 2].copy_from_slice(&dst_port.to_le_bytes());
        self
    }

    pub fn queue_depth(mut self, packets: u16) -> Self {
        self.bytes[OFFSET_QUEUE_DEPTH..OFFSET_QUEUE_DEPTH + 2]
            .copy_from_slice(&packets.to_le_bytes());
        self
    }

    pub fn mem_usage(mut self, bytes: u32) -> Self {
        self.bytes[OFFSET_MEM_USAGE..OFFSET_MEM_USAGE + 4].copy_from_slice(&bytes.to_le_bytes());
        self
    }

    pub fn build(self) -> RawFrame {
        RawFrame::new(self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_requires_exact_length() {
        assert!(RawFrame::from_slice(&[0u8; 63]).is_none());
        assert!(RawFrame::from_slice(&[0u8; 65]).is_none());
        assert!(RawFrame::from_slice(&[0u8; RECORD_SIZE]).is_some());
    }

    #[test]
    fn builder_places_fields_at_wire_offsets() {
        let frame = FrameBuilder::packet(0x0102_0304_0506_0708)
            .sojourn_us(0xAABB_CCDD)
            .size(1500)
            .transport(6, 0x1234, 0x5678)
            .build();
        let bytes = frame.as_bytes();

        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[7], 0x01);
        assert_eq!(bytes[8], RECORD_TYPE_PACKET);
        assert_eq!(&bytes[12..16], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(frame.u32_at(OFFSET_SIZE), 1500);
        assert_eq!(bytes[53], 6);
        assert_eq!(&bytes[54..56], &[0x34, 0x12]);
        assert_eq!(frame.u16_at(OFFSET_DST_PORT), 0x5678);
        assert_eq!(frame.timestamp_ns(), 0x0102_0304_0506_0708);
    }
}
