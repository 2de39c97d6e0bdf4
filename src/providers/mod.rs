//! Record source implementations

pub mod device;
pub mod replay;

pub use device::{DEFAULT_DEVICE, DeviceSource};
pub use replay::ReplaySource;
