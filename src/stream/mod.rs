//! Stream combinators for live feeds

pub mod throttle;

pub use throttle::{Throttle, ThrottleExt};
