//! Packet flag byte as reported by the qdisc

use serde::{Deserialize, Serialize};

/// ECN codepoint "Congestion Experienced".
pub const ECN_CE: u8 = 3;

/// Bit masks within the packet flag byte.
pub mod relay {
    pub const ECN_IN_MASK: u8 = 0b0000_0011;
    pub const ECN_VALID: u8 = 1 << 2;
    pub const ECN_OUT_MASK: u8 = 0b0001_1000;
    pub const ECN_OUT_SHIFT: u8 = 3;
    pub const SOJOURN_SLOW: u8 = 1 << 5;
    pub const SOJOURN_MARK: u8 = 1 << 6;
    pub const SOJOURN_DROP: u8 = 1 << 7;
}

/// Flag byte of a packet record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacketFlags(pub u8);

impl PacketFlags {
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    /// Check if a specific flag is set using a bitmask.
    pub fn has_flag(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    /// ECN codepoint on ingress.
    pub fn ecn_in(&self) -> u8 {
        self.0 & relay::ECN_IN_MASK
    }

    /// ECN codepoint on egress, after the qdisc had its say.
    pub fn ecn_out(&self) -> u8 {
        (self.0 & relay::ECN_OUT_MASK) >> relay::ECN_OUT_SHIFT
    }

    pub fn ecn_valid(&self) -> bool {
        self.has_flag(relay::ECN_VALID)
    }

    pub fn slow(&self) -> bool {
        self.has_flag(relay::SOJOURN_SLOW)
    }

    pub fn marked(&self) -> bool {
        self.has_flag(relay::SOJOURN_MARK)
    }

    pub fn dropped(&self) -> bool {
        self.has_flag(relay::SOJOURN_DROP)
    }

    /// Whether the packet left the queue with ECN-CE set.
    pub fn congestion_experienced(&self) -> bool {
        self.ecn_out() == ECN_CE
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecn_fields_are_split_from_flag_byte() {
        let flags = PacketFlags::new(0b1001_1110);
        assert_eq!(flags.ecn_in(), 0b10);
        assert!(flags.ecn_valid());
        assert_eq!(flags.ecn_out(), 0b11);
        assert!(flags.congestion_experienced());
        assert!(!flags.slow());
        assert!(!flags.marked());
        assert!(flags.dropped());
    }

    #[test]
    fn empty_flags() {
        let flags = PacketFlags::default();
        assert_eq!(flags.ecn_in(), 0);
        assert_eq!(flags.ecn_out(), 0);
        assert!(!flags.congestion_experienced());
        assert!(!flags.dropped());
    }
}
