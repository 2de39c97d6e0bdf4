//! Shared "current shaping rate" value

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Capacity value meaning "not attributable to a specific rate".
pub const CAPACITY_UNKNOWN: f64 = u32::MAX as f64;

/// Current shaping rate in kbit/s.
///
/// Written only by the rate controller, read by the aggregator for every
/// packet. Stored as `f64` bits in an atomic so readers never observe a torn
/// value; a reader may see the previous rate for up to one controller tick.
#[derive(Debug, Clone, Default)]
pub struct SharedRate {
    bits: Arc<AtomicU64>,
}

impl SharedRate {
    pub fn new(initial_kbits: f64) -> Self {
        Self { bits: Arc::new(AtomicU64::new(initial_kbits.to_bits())) }
    }

    /// Last rate written by the controller.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn set(&self, kbits: f64) {
        self.bits.store(kbits.to_bits(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_value() {
        let rate = SharedRate::new(1000.0);
        let reader = rate.clone();
        rate.set(2500.5);
        assert_eq!(reader.get(), 2500.5);
    }

    #[test]
    fn sentinel_survives_the_round_trip() {
        let rate = SharedRate::default();
        assert_eq!(rate.get(), 0.0);
        rate.set(CAPACITY_UNKNOWN);
        assert_eq!(rate.get(), CAPACITY_UNKNOWN);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_readers_never_see_torn_values() {
        let rate = SharedRate::new(1.0);
        let writer = rate.clone();
        let handle = tokio::spawn(async move {
            for i in 0..10_000u32 {
                writer.set(f64::from(i % 2) * 1000.0 + 1.0);
            }
        });
        for _ in 0..10_000 {
            let v = rate.get();
            assert!(v == 1.0 || v == 1001.0, "unexpected rate {v}");
        }
        handle.await.expect("writer task");
    }
}
