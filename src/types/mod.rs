//! Core types for telemetry and shaping data.
//!
//! ## Architecture
//!
//! - [`RawFrame`] is one fixed 64-byte record from the qdisc debug interface
//! - [`PacketSample`] / [`QueueSample`] are what the decoder makes of it
//! - [`FlowKey`] identifies a traffic stream, [`FlowId`] is its storage id
//! - [`PacketSummary`] is the per-flow output of one aggregation window
//! - [`Sample`] is anything that goes to the persistence sink
//! - [`SharedRate`] carries the current shaping rate from controller to aggregator
//!
//! ## Usage Example
//!
//! ```rust
//! use ratecast::types::{FrameBuilder, RECORD_TYPE_PACKET};
//! use std::net::Ipv4Addr;
//!
//! let frame = FrameBuilder::packet(5_000_000)
//!     .addresses(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
//!     .size(1500)
//!     .build();
//!
//! assert_eq!(frame.type_tag(), RECORD_TYPE_PACKET);
//! assert_eq!(frame.timestamp_ns(), 5_000_000);
//! ```

mod flags;
mod flow;
mod frame;
mod rate;
mod sample;
mod update_rate;

pub use flags::{ECN_CE, PacketFlags, relay};
pub use flow::{FlowId, FlowKey, Protocol};
pub use frame::{FrameBuilder, RECORD_SIZE, RECORD_TYPE_PACKET, RECORD_TYPE_QUEUE, RawFrame};
pub(crate) use frame::{
    OFFSET_DST_IP, OFFSET_DST_PORT, OFFSET_FLAGS, OFFSET_IP_VERSION, OFFSET_MEM_USAGE,
    OFFSET_NEXT_HEADER, OFFSET_PRIORITY, OFFSET_QUEUE_DEPTH, OFFSET_SIZE, OFFSET_SOJOURN,
    OFFSET_SRC_IP, OFFSET_SRC_PORT,
};
pub use rate::{CAPACITY_UNKNOWN, SharedRate};
pub use sample::{
    Decoded, PACKET_HEADING, PacketSample, PacketSummary, QUEUE_HEADING, QueueSample, Sample,
    SessionId,
};
pub use update_rate::UpdateRate;
