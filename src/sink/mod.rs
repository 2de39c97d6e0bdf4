//! Persistence sink: batches samples into the storage collaborator and optional exports.
//!
//! The sink owns the receiving end of the summary queue. Once per second it
//! pulls everything queued without waiting, hands each sample to every
//! [`SampleWriter`] and flushes each writer exactly once. Per-item failures are
//! reported at warning level and do not stop the cycle.

mod csv;
mod memory;
mod stdout;

pub use csv::{CsvExport, PACKET_FILE, QUEUE_FILE};
pub use memory::MemoryStorage;
pub use stdout::StdoutPrinter;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::session::Reporter;
use crate::types::{FlowId, FlowKey, Sample, SessionId};
use crate::{Error, Result};

/// Interval between two drain cycles.
pub const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// What the storage collaborator knows about a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub name: String,
    pub device: String,
    pub pattern_name: String,
    pub pattern_fingerprint: String,
    /// Epoch milliseconds
    pub started_ms: u64,
}

/// Aggregate figures for a finished session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Highest load seen in any packet summary, `None` without summaries
    pub load_kbits: Option<u32>,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// External store for sessions, flows and samples.
///
/// Only the consumed interface is defined here; SQL backends live outside
/// this crate. [`MemoryStorage`] is the in-process implementation.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Persist a new session and return its id.
    async fn register_session(&self, session: &SessionRecord) -> Result<SessionId>;

    /// Persist a flow for `session` and return its id.
    async fn register_flow(&self, session: SessionId, flow: &FlowKey) -> Result<FlowId>;

    /// Stage one sample for the next commit.
    async fn persist(&self, sample: &Sample) -> Result<()>;

    /// Make everything staged since the last commit durable.
    async fn commit(&self) -> Result<()>;

    /// Forget cached flow ids, called between sessions.
    async fn clear_cache(&self);

    async fn session_stats(&self, session: SessionId) -> Result<SessionStats>;

    /// Whether a real database sits behind this store.
    fn has_db_connection(&self) -> bool;
}

/// One destination of the fan-out.
#[async_trait::async_trait]
pub trait SampleWriter: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn write(&mut self, sample: &Sample) -> Result<()>;

    /// Called once per drain cycle after all writes.
    async fn flush(&mut self) -> Result<()>;

    /// Called once after the final drain.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writer backed by the storage collaborator; flush commits.
pub struct StorageWriter {
    storage: Arc<dyn Storage>,
}

impl StorageWriter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait::async_trait]
impl SampleWriter for StorageWriter {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn write(&mut self, sample: &Sample) -> Result<()> {
        self.storage.persist(sample).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.storage.commit().await
    }
}

/// Ordered set of writers that every sample goes to.
#[derive(Default)]
pub struct FanOut {
    writers: Vec<Box<dyn SampleWriter>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, writer: impl SampleWriter + 'static) -> Self {
        self.push(Box::new(writer));
        self
    }

    pub fn push(&mut self, writer: Box<dyn SampleWriter>) {
        self.writers.push(writer);
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Write to every writer, collecting failures instead of stopping.
    pub async fn write(&mut self, sample: &Sample) -> Vec<(&'static str, Error)> {
        let mut failures = Vec::new();
        for writer in &mut self.writers {
            if let Err(e) = writer.write(sample).await {
                failures.push((writer.name(), e));
            }
        }
        failures
    }

    pub async fn flush(&mut self) -> Vec<(&'static str, Error)> {
        let mut failures = Vec::new();
        for writer in &mut self.writers {
            if let Err(e) = writer.flush().await {
                failures.push((writer.name(), e));
            }
        }
        failures
    }

    pub async fn finish(&mut self) -> Vec<(&'static str, Error)> {
        let mut failures = Vec::new();
        for writer in &mut self.writers {
            if let Err(e) = writer.finish().await {
                failures.push((writer.name(), e));
            }
        }
        failures
    }
}

/// Counters over the sink's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub packets: u64,
    pub queues: u64,
    pub cycles: u64,
    pub failures: u64,
}

/// Periodic drain of the summary queue into the fan-out.
pub struct PersistenceSink {
    rx: mpsc::Receiver<Sample>,
    writers: FanOut,
    reporter: Reporter,
    interval: Duration,
    stats: SinkStats,
}

impl PersistenceSink {
    pub fn new(rx: mpsc::Receiver<Sample>, writers: FanOut, reporter: Reporter) -> Self {
        Self { rx, writers, reporter, interval: DRAIN_INTERVAL, stats: SinkStats::default() }
    }

    /// Override the drain interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    /// Pull everything currently queued, write it and flush once.
    ///
    /// Returns the number of samples drained and whether the queue is closed.
    pub async fn drain_once(&mut self) -> (usize, bool) {
        let mut drained = 0;
        let mut closed = false;

        loop {
            let sample = match self.rx.try_recv() {
                Ok(sample) => sample,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            };
            drained += 1;
            self.write(&sample).await;
        }

        for (writer, error) in self.writers.flush().await {
            self.stats.failures += 1;
            self.reporter
                .warn("sink", Error::persistence_with_source(format!("{writer} flush"), error))
                .await;
        }

        self.stats.cycles += 1;
        trace!(drained, closed, "Sink cycle");
        (drained, closed)
    }

    async fn write(&mut self, sample: &Sample) {
        match sample {
            Sample::Packet(_) => self.stats.packets += 1,
            Sample::Queue(_) => self.stats.queues += 1,
        }
        for (writer, error) in self.writers.write(sample).await {
            self.stats.failures += 1;
            self.reporter
                .warn("sink", Error::persistence_with_source(format!("{writer} write"), error))
                .await;
        }
    }

    /// Drain every interval until cancelled or the queue closes, then hand
    /// the sink back for the final drain.
    pub async fn run(mut self, cancel: CancellationToken) -> Self {
        info!(interval_ms = self.interval.as_millis() as u64, writers = self.writers.len(), "Sink started");
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Sink cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    let (_, closed) = self.drain_once().await;
                    if closed {
                        debug!("Summary queue closed");
                        break;
                    }
                }
            }
        }
        self
    }

    /// Final drain of whatever is still queued, then close every writer.
    pub async fn finish(self) -> SinkStats {
        self.finish_with(Vec::new()).await
    }

    /// Like [`finish`](Self::finish), writing `tail` after the queue is
    /// drained and before the writers close.
    pub async fn finish_with(mut self, tail: Vec<Sample>) -> SinkStats {
        self.rx.close();
        loop {
            let (drained, closed) = self.drain_once().await;
            if drained == 0 || closed {
                break;
            }
        }
        if !tail.is_empty() {
            for sample in &tail {
                self.write(sample).await;
            }
            for (writer, error) in self.writers.flush().await {
                self.stats.failures += 1;
                self.reporter
                    .warn("sink", Error::persistence_with_source(format!("{writer} flush"), error))
                    .await;
            }
        }
        for (writer, error) in self.writers.finish().await {
            self.stats.failures += 1;
            self.reporter
                .warn("sink", Error::persistence_with_source(format!("{writer} finish"), error))
                .await;
        }
        info!(
            packets = self.stats.packets,
            queues = self.stats.queues,
            failures = self.stats.failures,
            "Sink finished"
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::session::ReportKind;
    use crate::test_utils::{packet_summary, queue_sample};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recording {
        writes: Arc<Mutex<Vec<Sample>>>,
        flushes: Arc<Mutex<u32>>,
        fail_writes: bool,
    }

    #[async_trait::async_trait]
    impl SampleWriter for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn write(&mut self, sample: &Sample) -> Result<()> {
            if self.fail_writes {
                return Err(Error::persistence("rejected"));
            }
            self.writes.lock().push(sample.clone());
            Ok(())
        }

        async fn flush(&mut self) -> Result<()> {
            *self.flushes.lock() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn drain_writes_everything_and_flushes_once() {
        let (reporter, _reports) = Reporter::channel();
        let (tx, rx) = mpsc::channel(16);
        let recording = Recording::default();
        let mut sink = PersistenceSink::new(rx, FanOut::new().with(recording.clone()), reporter);

        tx.send(packet_summary(1, "tcp a").into()).await.unwrap();
        tx.send(queue_sample(2).into()).await.unwrap();
        tx.send(packet_summary(3, "tcp b").into()).await.unwrap();

        let (drained, closed) = sink.drain_once().await;
        assert_eq!(drained, 3);
        assert!(!closed);
        assert_eq!(recording.writes.lock().len(), 3);
        assert_eq!(*recording.flushes.lock(), 1);
        assert_eq!(sink.stats().packets, 2);
        assert_eq!(sink.stats().queues, 1);
    }

    #[tokio::test]
    async fn write_failures_are_reported_as_warnings() {
        let (reporter, mut reports) = Reporter::channel();
        let (tx, rx) = mpsc::channel(4);
        let failing = Recording { fail_writes: true, ..Recording::default() };
        let healthy = Recording::default();
        let mut sink = PersistenceSink::new(
            rx,
            FanOut::new().with(failing).with(healthy.clone()),
            reporter,
        );

        tx.send(queue_sample(1).into()).await.unwrap();
        sink.drain_once().await;

        assert_eq!(healthy.writes.lock().len(), 1, "other writers still get the sample");
        let report = reports.recv().await.expect("a report");
        let ReportKind::Error { severity, error } = report.kind else {
            panic!("expected an error report");
        };
        assert_eq!(severity, Severity::Warn);
        assert!(matches!(error, Error::Persistence { .. }));
        assert_eq!(sink.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_sink_on_cancel_and_finish_drains_rest() {
        let (reporter, _reports) = Reporter::channel();
        let (tx, rx) = mpsc::channel(16);
        let recording = Recording::default();
        let sink = PersistenceSink::new(rx, FanOut::new().with(recording.clone()), reporter);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sink.run(cancel.clone()));

        tx.send(queue_sample(1).into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(recording.writes.lock().len(), 1);

        tx.send(queue_sample(2).into()).await.unwrap();
        cancel.cancel();
        let sink = handle.await.unwrap();
        assert_eq!(recording.writes.lock().len(), 1, "nothing drained after cancel yet");

        let stats = sink.finish().await;
        assert_eq!(recording.writes.lock().len(), 2);
        assert_eq!(stats.queues, 2);
    }

    #[tokio::test]
    async fn finish_with_writes_tail_after_the_queue() {
        let (reporter, _reports) = Reporter::channel();
        let (tx, rx) = mpsc::channel(4);
        let recording = Recording::default();
        let sink = PersistenceSink::new(rx, FanOut::new().with(recording.clone()), reporter);

        tx.send(queue_sample(1).into()).await.unwrap();
        let stats = sink.finish_with(vec![packet_summary(2, "udp last").into()]).await;

        let writes = recording.writes.lock();
        assert_eq!(writes.len(), 2);
        assert!(matches!(writes[0], Sample::Queue(_)));
        assert!(matches!(writes[1], Sample::Packet(_)));
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.queues, 1);
    }

    #[tokio::test]
    async fn storage_writer_commits_on_flush() {
        let storage = Arc::new(MemoryStorage::new());
        let mut writer = StorageWriter::new(storage.clone());

        writer.write(&queue_sample(5).into()).await.unwrap();
        assert!(storage.committed().is_empty());
        writer.flush().await.unwrap();
        assert_eq!(storage.committed().len(), 1);
        assert_eq!(storage.commit_count(), 1);
    }
}
