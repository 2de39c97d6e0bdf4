//! Update rate control for live feeds

use serde::{Deserialize, Serialize};

/// Update rate for live feeds handed to dashboards
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every update as produced
    Native,

    /// Throttled to maximum Hz
    /// If the requested rate exceeds source rate, Native is used
    Max(u32),
}

impl UpdateRate {
    /// Normalize rate against source frequency
    pub fn normalize(self, source_hz: f64) -> Self {
        match self {
            UpdateRate::Native => UpdateRate::Native,
            UpdateRate::Max(0) => UpdateRate::Native,
            UpdateRate::Max(hz) if hz as f64 >= source_hz => UpdateRate::Native,
            UpdateRate::Max(hz) => UpdateRate::Max(hz),
        }
    }

    /// Get throttle interval if needed
    pub fn throttle_interval(self, source_hz: f64) -> Option<std::time::Duration> {
        match self.normalize(source_hz) {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(std::time::Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faster_than_source_is_native() {
        assert_eq!(UpdateRate::Max(100).normalize(10.0), UpdateRate::Native);
        assert_eq!(UpdateRate::Max(0).normalize(10.0), UpdateRate::Native);
        assert_eq!(UpdateRate::Max(4).normalize(10.0), UpdateRate::Max(4));
    }

    #[test]
    fn throttle_interval_for_slower_rate() {
        assert_eq!(
            UpdateRate::Max(4).throttle_interval(10.0),
            Some(std::time::Duration::from_millis(250))
        );
        assert_eq!(UpdateRate::Native.throttle_interval(10.0), None);
    }
}
