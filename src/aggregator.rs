//! Windowed aggregator: per-flow 10 ms windows of packet samples.
//!
//! Producers call [`WindowedAggregator::record`] for every packet. A sweep
//! every window drains all accumulators and turns each non-empty one into a
//! [`PacketSummary`]. The accumulator store is a sharded [`DashMap`]; the
//! sweep removes entries shard by shard under the shard lock, so a packet
//! racing the sweep ends up in exactly one window.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock;
use crate::flow::FlowResolver;
use crate::session::Reporter;
use crate::types::{CAPACITY_UNKNOWN, FlowId, FlowKey, PacketSample, PacketSummary, Sample, SharedRate};

/// Length of one aggregation window.
pub const WINDOW: Duration = Duration::from_millis(10);

/// Running capacity total of a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CapacitySum {
    Sum(f64),
    /// At least one packet was recorded while the rate was the unknown sentinel
    Unknown,
}

/// Per-flow accumulator for one window.
#[derive(Debug, Clone)]
pub struct AggregateWindow {
    pub flow_id: FlowId,
    pub flow: FlowKey,
    pub count: u32,
    pub sojourn_sum_ms: u64,
    pub bytes_sum: u64,
    pub capacity: CapacitySum,
    pub ce_count: u32,
    pub dropped: u32,
}

impl AggregateWindow {
    pub fn new(flow_id: FlowId, flow: FlowKey) -> Self {
        Self {
            flow_id,
            flow,
            count: 0,
            sojourn_sum_ms: 0,
            bytes_sum: 0,
            capacity: CapacitySum::Sum(0.0),
            ce_count: 0,
            dropped: 0,
        }
    }

    pub fn add(&mut self, sample: &PacketSample, capacity_kbits: f64) {
        self.count += 1;
        self.sojourn_sum_ms += u64::from(sample.sojourn_ms);
        self.bytes_sum += u64::from(sample.size_bytes);
        self.capacity = match self.capacity {
            _ if capacity_kbits == CAPACITY_UNKNOWN => CapacitySum::Unknown,
            CapacitySum::Unknown => CapacitySum::Unknown,
            CapacitySum::Sum(sum) => CapacitySum::Sum(sum + capacity_kbits),
        };
        if sample.flags.congestion_experienced() {
            self.ce_count += 1;
        }
        if sample.flags.dropped() {
            self.dropped += 1;
        }
    }

    /// Summary of this window, `None` if nothing was recorded.
    pub fn summarize(&self, timestamp_ms: u64, window: Duration) -> Option<PacketSummary> {
        if self.count == 0 {
            return None;
        }
        let count = u64::from(self.count);
        let window_ms = (window.as_millis() as u64).max(1);
        let load_kbits = saturate(self.bytes_sum * 8 / window_ms);
        let capacity_kbits = match self.capacity {
            CapacitySum::Unknown => load_kbits,
            CapacitySum::Sum(sum) => (sum / count as f64) as u32,
        };

        Some(PacketSummary {
            timestamp_ms,
            sojourn_ms: saturate(self.sojourn_sum_ms / count),
            load_kbits,
            capacity_kbits,
            ecn_ce_percent: (f64::from(self.ce_count) / count as f64 * 100.0) as u32,
            dropped: self.dropped,
            flow_id: self.flow_id,
            flow: self.flow.id_str().to_string(),
            sample_count: self.count,
        })
    }
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Outcome of checking a summary with zero capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Degenerate {
    No,
    /// Capacity zero but something else happened in the window
    Anomalous,
    /// Nothing but a timestamp
    Empty,
}

fn classify(summary: &PacketSummary) -> Degenerate {
    if summary.capacity_kbits != 0 {
        return Degenerate::No;
    }
    if summary.load_kbits != 0
        || summary.sojourn_ms != 0
        || summary.ecn_ce_percent != 0
        || summary.dropped != 0
    {
        Degenerate::Anomalous
    } else {
        Degenerate::Empty
    }
}

/// Concurrent per-flow accumulator store.
#[derive(Debug)]
pub struct WindowedAggregator {
    windows: DashMap<String, AggregateWindow>,
    window: Duration,
}

impl Default for WindowedAggregator {
    fn default() -> Self {
        Self::new(WINDOW)
    }
}

impl WindowedAggregator {
    pub fn new(window: Duration) -> Self {
        Self { windows: DashMap::new(), window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Add one packet to its flow's current window.
    pub fn record(&self, sample: &PacketSample, flow_id: FlowId, capacity_kbits: f64) {
        let key = sample.flow.id_str();
        if let Some(mut window) = self.windows.get_mut(key) {
            window.add(sample, capacity_kbits);
            return;
        }
        self.windows
            .entry(key.to_string())
            .or_insert_with(|| AggregateWindow::new(flow_id, sample.flow.clone()))
            .add(sample, capacity_kbits);
    }

    /// Number of flows with an open window.
    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    /// Drain every window and summarize the non-empty ones.
    ///
    /// Windows with zero capacity and nothing else are dropped; zero capacity
    /// with other activity is kept and logged.
    pub fn sweep(&self, timestamp_ms: u64) -> Vec<PacketSummary> {
        let mut summaries = Vec::new();
        self.windows.retain(|_, window| {
            if let Some(summary) = window.summarize(timestamp_ms, self.window) {
                summaries.push(summary);
            }
            false
        });

        summaries.retain(|summary| match classify(summary) {
            Degenerate::No => true,
            Degenerate::Anomalous => {
                warn!(
                    flow = %summary.flow,
                    load_kbits = summary.load_kbits,
                    dropped = summary.dropped,
                    "Window has zero capacity but traffic"
                );
                true
            }
            Degenerate::Empty => {
                debug!(flow = %summary.flow, "Not emitting empty window");
                false
            }
        });
        summaries
    }

    /// Resolve flows and record packets until cancelled or the queue closes.
    pub async fn ingest(
        self: Arc<Self>,
        mut packets: mpsc::Receiver<PacketSample>,
        resolver: Arc<FlowResolver>,
        rate: SharedRate,
        reporter: Reporter,
        cancel: CancellationToken,
    ) {
        info!("Aggregator ingest started");
        let mut recorded = 0u64;
        loop {
            let sample = tokio::select! {
                _ = cancel.cancelled() => {
                    // Packets already queued belong to the last window
                    while let Ok(sample) = packets.try_recv() {
                        recorded += u64::from(self.absorb(&sample, &resolver, &rate, &reporter).await);
                    }
                    break;
                }
                sample = packets.recv() => match sample {
                    Some(sample) => sample,
                    None => break,
                },
            };
            recorded += u64::from(self.absorb(&sample, &resolver, &rate, &reporter).await);
        }
        info!(recorded, "Aggregator ingest ended");
    }

    async fn absorb(
        &self,
        sample: &PacketSample,
        resolver: &FlowResolver,
        rate: &SharedRate,
        reporter: &Reporter,
    ) -> bool {
        match resolver.resolve(&sample.flow).await {
            Ok(flow_id) => {
                self.record(sample, flow_id, rate.get());
                true
            }
            Err(e) => {
                reporter.warn("aggregator", e).await;
                false
            }
        }
    }

    /// Summarize whatever the open windows hold, stamped like a regular sweep.
    ///
    /// Used once on shutdown, after ingest has stopped, so the last partial
    /// window is not lost.
    pub fn flush(&self) -> Vec<PacketSummary> {
        let summaries = self.sweep(self.sweep_timestamp_ms());
        debug!(summaries = summaries.len(), "Flushed open windows");
        summaries
    }

    fn sweep_timestamp_ms(&self) -> u64 {
        clock::epoch_ms().saturating_sub(self.window.as_millis() as u64 / 2)
    }

    /// Sweep every window and forward summaries until cancelled.
    ///
    /// Summaries are stamped with the wall clock at the middle of the window
    /// that just closed.
    pub async fn run_sweeps(self: Arc<Self>, summaries: mpsc::Sender<Sample>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.window;
        let mut ticker = tokio::time::interval_at(start, self.window);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let batch = self.sweep(self.sweep_timestamp_ms());
            trace!(summaries = batch.len(), "Swept windows");
            for summary in batch {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = summaries.send(Sample::Packet(summary)) => sent,
                };
                if sent.is_err() {
                    debug!("Summary queue closed, stopping sweeps");
                    return;
                }
            }
        }
        debug!("Aggregator sweeps cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryStorage;
    use crate::test_utils::packet;
    use crate::types::{PacketFlags, relay};

    fn sample(src_port: u16, sojourn_ms: u32, size: u32) -> PacketSample {
        packet(src_port, sojourn_ms, size, PacketFlags::default())
    }

    #[test]
    fn two_flows_give_two_summaries() {
        let aggregator = WindowedAggregator::default();
        for sojourn in [2, 4, 6] {
            aggregator.record(&sample(1000, sojourn, 100), 1, 5000.0);
        }
        for sojourn in [10, 20] {
            aggregator.record(&sample(2000, sojourn, 1000), 2, 5000.0);
        }

        let mut summaries = aggregator.sweep(42);
        summaries.sort_by_key(|s| s.flow_id);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].sample_count, 3);
        assert_eq!(summaries[0].sojourn_ms, 4);
        assert_eq!(summaries[0].load_kbits, 240);
        assert_eq!(summaries[1].sample_count, 2);
        assert_eq!(summaries[1].sojourn_ms, 15);
        assert_eq!(summaries[1].load_kbits, 1600);
        assert!(summaries.iter().all(|s| s.capacity_kbits == 5000 && s.timestamp_ms == 42));
        assert_eq!(aggregator.open_windows(), 0);
    }

    #[test]
    fn unknown_capacity_reports_load() {
        let aggregator = WindowedAggregator::default();
        aggregator.record(&sample(1, 1, 500), 1, 3000.0);
        aggregator.record(&sample(1, 1, 500), 1, CAPACITY_UNKNOWN);
        aggregator.record(&sample(1, 1, 500), 1, 3000.0);

        let summaries = aggregator.sweep(0);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].load_kbits, 1200);
        assert_eq!(summaries[0].capacity_kbits, summaries[0].load_kbits);
    }

    #[test]
    fn capacity_is_mean_of_samples() {
        let aggregator = WindowedAggregator::default();
        aggregator.record(&sample(1, 0, 10), 1, 1000.0);
        aggregator.record(&sample(1, 0, 10), 1, 2000.0);
        assert_eq!(aggregator.sweep(0)[0].capacity_kbits, 1500);
    }

    #[test]
    fn ecn_and_drop_counts() {
        let aggregator = WindowedAggregator::default();
        let ce = PacketFlags::new(0b0001_1000);
        let dropped = PacketFlags::new(relay::SOJOURN_DROP);
        aggregator.record(&packet(1, 0, 10, ce), 1, 100.0);
        aggregator.record(&packet(1, 0, 10, ce), 1, 100.0);
        aggregator.record(&packet(1, 0, 10, dropped), 1, 100.0);
        aggregator.record(&packet(1, 0, 10, PacketFlags::default()), 1, 100.0);

        let summary = &aggregator.sweep(0)[0];
        assert_eq!(summary.ecn_ce_percent, 50);
        assert_eq!(summary.dropped, 1);
    }

    #[test]
    fn zero_capacity_policy() {
        let aggregator = WindowedAggregator::default();
        aggregator.record(&sample(1, 0, 0), 1, 0.0);
        assert!(aggregator.sweep(0).is_empty(), "nothing but a timestamp");

        aggregator.record(&sample(1, 3, 1500), 1, 0.0);
        let summaries = aggregator.sweep(0);
        assert_eq!(summaries.len(), 1, "traffic without capacity is still emitted");
        assert_eq!(summaries[0].capacity_kbits, 0);
    }

    #[test]
    fn sweep_starts_fresh_windows() {
        let aggregator = WindowedAggregator::default();
        aggregator.record(&sample(1, 1, 100), 1, 100.0);
        assert_eq!(aggregator.sweep(0).len(), 1);
        assert!(aggregator.sweep(10).is_empty());
        aggregator.record(&sample(1, 1, 100), 1, 100.0);
        assert_eq!(aggregator.sweep(20)[0].sample_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_sweeps_lose_no_packets() {
        let aggregator = Arc::new(WindowedAggregator::default());
        let producers: Vec<_> = (0..4u16)
            .map(|port| {
                let aggregator = Arc::clone(&aggregator);
                tokio::spawn(async move {
                    for _ in 0..2_000 {
                        aggregator.record(&sample(port, 1, 10), u64::from(port), 100.0);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        let mut total = 0u64;
        let mut finished = false;
        while !finished {
            finished = producers.iter().all(|p| p.is_finished());
            total += aggregator.sweep(0).iter().map(|s| u64::from(s.sample_count)).sum::<u64>();
            tokio::task::yield_now().await;
        }
        total += aggregator.sweep(0).iter().map(|s| u64::from(s.sample_count)).sum::<u64>();
        assert_eq!(total, 4 * 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_forward_summaries() {
        let aggregator = Arc::new(WindowedAggregator::default());
        let storage = Arc::new(MemoryStorage::new());
        let resolver = Arc::new(FlowResolver::new(1, storage));
        let (reporter, _reports) = Reporter::channel();
        let (packet_tx, packet_rx) = mpsc::channel(16);
        let (summary_tx, mut summary_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let ingest = tokio::spawn(Arc::clone(&aggregator).ingest(
            packet_rx,
            resolver,
            SharedRate::new(8000.0),
            reporter,
            cancel.clone(),
        ));
        let sweeps = tokio::spawn(Arc::clone(&aggregator).run_sweeps(summary_tx, cancel.clone()));

        packet_tx.send(sample(443, 5, 1250)).await.unwrap();
        packet_tx.send(sample(443, 7, 1250)).await.unwrap();

        let Some(Sample::Packet(summary)) = summary_rx.recv().await else {
            panic!("expected a packet summary");
        };
        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.sojourn_ms, 6);
        assert_eq!(summary.capacity_kbits, 8000);

        cancel.cancel();
        ingest.await.unwrap();
        sweeps.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_ingest_keeps_queued_packets_for_flush() {
        let aggregator = Arc::new(WindowedAggregator::default());
        let storage = Arc::new(MemoryStorage::new());
        let resolver = Arc::new(FlowResolver::new(1, storage));
        let (reporter, _reports) = Reporter::channel();
        let (packet_tx, packet_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        for sojourn in [3, 5, 7] {
            packet_tx.send(sample(8080, sojourn, 500)).await.unwrap();
        }
        cancel.cancel();

        Arc::clone(&aggregator)
            .ingest(packet_rx, resolver, SharedRate::new(2000.0), reporter, cancel)
            .await;
        assert_eq!(aggregator.open_windows(), 1);

        let tail = aggregator.flush();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sample_count, 3);
        assert_eq!(tail[0].sojourn_ms, 5);
        assert_eq!(aggregator.open_windows(), 0);
        assert!(aggregator.flush().is_empty());
    }
}
