//! Session orchestration: wiring, the error-report path and ordered shutdown.
//!
//! [`Player`] sets up one play invocation and [`PlayerHandle`] supervises it.
//! Startup order:
//!
//! 1. register the session with the storage collaborator
//! 2. install qdisc and marking rules, open the control file
//! 3. warm up
//! 4. start the measurement tasks (reader, aggregator, sink)
//! 5. start playing
//!
//! Any failure before step 5 is returned from [`Player::start`] after the link
//! has been restored. From then on every task reports through a [`Reporter`];
//! the first fatal report or the end of the pattern ends the session, and
//! [`PlayerHandle::shutdown`] tears everything down exactly once.

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::WindowedAggregator;
use crate::clock;
use crate::config::PlayConfig;
use crate::control::command::{CommandRunner, SystemRunner};
use crate::control::tc::{NetworkConfig, ShapingParams};
use crate::control::{ControlFile, INITIAL_RATE_FACTOR, RateController, Teardown};
use crate::decoder::RecordDecoder;
use crate::driver::{Driver, DriverStats};
use crate::error::Severity;
use crate::flow::FlowResolver;
use crate::pattern::DataRatePattern;
use crate::provider::RecordSource;
use crate::providers::DeviceSource;
use crate::sink::{
    CsvExport, FanOut, PersistenceSink, SampleWriter, SessionRecord, SessionStats, SinkStats,
    StdoutPrinter, Storage, StorageWriter,
};
use crate::stream::ThrottleExt;
use crate::types::{Sample, SessionId, SharedRate, UpdateRate};
use crate::{Error, Result};

/// Capacity of the packet and summary queues.
pub const QUEUE_CAPACITY: usize = 10_000;

/// How long shutdown waits for tasks before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const REPORT_CAPACITY: usize = 64;

/// Something a task tells the supervisor.
#[derive(Debug)]
pub struct Report {
    /// Task that sent the report
    pub source: &'static str,
    pub kind: ReportKind,
}

#[derive(Debug)]
pub enum ReportKind {
    Error { severity: Severity, error: Error },
    /// Regular end of the session
    Finished { reason: String },
}

/// Sending half of the error-report path.
///
/// Every report is logged when it is sent. Warnings mark the session as
/// degraded and are dropped if the supervisor lags behind; fatal reports and
/// the finish notice always wait for room.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::Sender<Report>,
    degraded: Arc<AtomicBool>,
}

impl Reporter {
    pub fn channel() -> (Self, mpsc::Receiver<Report>) {
        let (tx, rx) = mpsc::channel(REPORT_CAPACITY);
        (Self { tx, degraded: Arc::new(AtomicBool::new(false)) }, rx)
    }

    /// Report with the error's default severity.
    pub async fn report(&self, source: &'static str, error: Error) {
        self.send_error(source, Severity::of(&error), error).await;
    }

    pub async fn info(&self, source: &'static str, error: Error) {
        self.send_error(source, Severity::Info, error).await;
    }

    pub async fn warn(&self, source: &'static str, error: Error) {
        self.send_error(source, Severity::Warn, error).await;
    }

    pub async fn fatal(&self, source: &'static str, error: Error) {
        self.send_error(source, Severity::Fatal, error).await;
    }

    pub async fn finished(&self, reason: impl Into<String>) {
        let reason = reason.into();
        info!(%reason, "Session finished");
        self.send(Report { source: "session", kind: ReportKind::Finished { reason } }).await;
    }

    /// Whether any warning was reported.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    async fn send_error(&self, source: &'static str, severity: Severity, error: Error) {
        match severity {
            Severity::Info => info!(source, %error, "Session report"),
            Severity::Warn => {
                self.degraded.store(true, Ordering::Relaxed);
                warn!(source, %error, "Session degraded");
            }
            Severity::Fatal => error!(
                source,
                %error,
                suggestions = ?error.recovery_suggestions(),
                "Fatal session error"
            ),
        }
        self.send(Report { source, kind: ReportKind::Error { severity, error } }).await;
    }

    async fn send(&self, report: Report) {
        let urgent = match &report.kind {
            ReportKind::Error { severity, .. } => *severity == Severity::Fatal,
            ReportKind::Finished { .. } => true,
        };
        let sent = if urgent {
            self.tx.send(report).await.is_ok()
        } else {
            match self.tx.try_send(report) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Report queue full, dropping report");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        };
        if !sent {
            debug!("Supervisor gone, report not delivered");
        }
    }
}

/// One play invocation.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    /// Epoch milliseconds
    pub started_ms: u64,
    pub device: String,
    pub shaping: ShapingParams,
    pub pattern: Arc<DataRatePattern>,
    resolver: Arc<FlowResolver>,
}

impl Session {
    pub fn resolver(&self) -> &Arc<FlowResolver> {
        &self.resolver
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    Finished { reason: String },
    /// Cancelled from outside, or every task stopped without a finish notice
    Cancelled,
    Failed { source: &'static str, error: Error },
}

/// What shutdown leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub name: String,
    /// Control file writes including warm-up
    pub rate_writes: u64,
    pub driver: DriverStats,
    /// `None` when nothing was measured
    pub sink: Option<SinkStats>,
    pub stats: Option<SessionStats>,
    pub degraded: bool,
    /// Tasks that had to be aborted after the grace period
    pub aborted: Vec<&'static str>,
}

/// Builder for one play invocation.
pub struct Player {
    config: PlayConfig,
    pattern: DataRatePattern,
    storage: Arc<dyn Storage>,
    runner: Arc<dyn CommandRunner>,
    source: Option<Box<dyn RecordSource>>,
    control: Option<ControlFile>,
    writers: Vec<Box<dyn SampleWriter>>,
    cancel: CancellationToken,
    sink_interval: Option<Duration>,
    grace: Duration,
}

impl Player {
    pub fn new(config: PlayConfig, pattern: DataRatePattern, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            pattern,
            storage,
            runner: Arc::new(SystemRunner),
            source: None,
            control: None,
            writers: Vec::new(),
            cancel: CancellationToken::new(),
            sink_interval: None,
            grace: SHUTDOWN_GRACE,
        }
    }

    /// Load the pattern the configuration names.
    pub fn from_config(config: PlayConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;
        let pattern = config.load_pattern()?;
        Ok(Self::new(config, pattern, storage))
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Read records from `source` instead of the telemetry device.
    pub fn with_source(mut self, source: impl RecordSource) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Write rates to `control` instead of the qdisc control file.
    pub fn with_control_file(mut self, control: ControlFile) -> Self {
        self.control = Some(control);
        self
    }

    /// Additional sink destination after storage, CSV and stdout.
    pub fn with_writer(mut self, writer: impl SampleWriter + 'static) -> Self {
        self.writers.push(Box::new(writer));
        self
    }

    pub fn with_sink_interval(mut self, interval: Duration) -> Self {
        self.sink_interval = Some(interval);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Token that cancels the session, usable before `start` returns.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Set up the link, warm up, start measuring and start playing.
    pub async fn start(self) -> Result<PlayerHandle> {
        let Player {
            config,
            pattern,
            storage,
            runner,
            source,
            control,
            writers,
            cancel,
            sink_interval,
            grace,
        } = self;
        config.validate_for(&pattern)?;

        let name = config.session_name();
        let started_ms = clock::epoch_ms();
        let record = SessionRecord {
            name: name.clone(),
            device: config.dev.clone(),
            pattern_name: pattern.name().to_string(),
            pattern_fingerprint: pattern.fingerprint().to_string(),
            started_ms,
        };
        let id = storage.register_session(&record).await?;
        info!(
            session_id = id,
            %name,
            dev = %config.dev,
            pattern = pattern.name(),
            values = pattern.len(),
            freq = pattern.freq(),
            looping = pattern.is_looping(),
            "Starting session"
        );

        let rate = SharedRate::new(pattern.first() * INITIAL_RATE_FACTOR);
        let net = NetworkConfig::new(config.dev.clone(), runner);
        let mut controller =
            RateController::new(net, &pattern, config.controller_settings(), rate.clone());
        if let Some(control) = control {
            controller = controller.with_control_file(control);
        }
        if let Err(e) = prepare(&mut controller, &cancel).await {
            controller.close().await;
            return Err(e);
        }

        let (reporter, reports) = Reporter::channel();
        let resolver = Arc::new(FlowResolver::new(id, Arc::clone(&storage)));
        let session = Session {
            id,
            name,
            started_ms,
            device: config.dev.clone(),
            shaping: config.shaping.clone(),
            pattern: Arc::new(pattern),
            resolver: Arc::clone(&resolver),
        };

        let measurement = if config.no_measure {
            info!("Measurement disabled, only playing the pattern");
            None
        } else {
            let parts = MeasurementParts {
                config: &config,
                session: &session,
                storage: Arc::clone(&storage),
                source,
                writers,
                sink_interval,
                rate: rate.clone(),
                reporter: reporter.clone(),
                cancel: cancel.clone(),
            };
            match start_measurement(parts).await {
                Ok(measurement) => Some(measurement),
                Err(e) => {
                    cancel.cancel();
                    controller.close().await;
                    return Err(e);
                }
            }
        };

        let teardown = controller.teardown();
        let rate_feed = controller.subscribe();
        let controller = tokio::spawn(controller.run(reporter.clone(), cancel.clone()));

        let degraded = Arc::clone(&reporter.degraded);
        drop(reporter);

        let (aggregator, driver, tasks, sink) = match measurement {
            Some(Measurement { aggregator, driver, tasks, sink }) => {
                (Some(aggregator), Some(driver), tasks, Some(sink))
            }
            None => (None, None, Vec::new(), None),
        };

        Ok(PlayerHandle {
            freq: session.pattern.freq(),
            session,
            storage,
            cancel,
            reports,
            degraded,
            rate,
            rate_feed,
            controller: Some(controller),
            teardown,
            aggregator,
            driver,
            tasks,
            sink,
            grace,
            summary: None,
        })
    }
}

async fn prepare(controller: &mut RateController, cancel: &CancellationToken) -> Result<()> {
    controller.setup().await?;
    if controller.warm_up(cancel).await? { Ok(()) } else { Err(Error::Cancelled) }
}

struct MeasurementParts<'a> {
    config: &'a PlayConfig,
    session: &'a Session,
    storage: Arc<dyn Storage>,
    source: Option<Box<dyn RecordSource>>,
    writers: Vec<Box<dyn SampleWriter>>,
    sink_interval: Option<Duration>,
    rate: SharedRate,
    reporter: Reporter,
    cancel: CancellationToken,
}

struct Measurement {
    aggregator: Arc<WindowedAggregator>,
    driver: JoinHandle<DriverStats>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    sink: JoinHandle<PersistenceSink>,
}

async fn start_measurement(parts: MeasurementParts<'_>) -> Result<Measurement> {
    let MeasurementParts {
        config,
        session,
        storage,
        source,
        writers,
        sink_interval,
        rate,
        reporter,
        cancel,
    } = parts;

    let source: Box<dyn RecordSource> = match source {
        Some(source) => source,
        None => Box::new(DeviceSource::open(&config.telemetry_path).await?),
    };

    let mut fan_out = FanOut::new().with(StorageWriter::new(storage));
    if config.csv {
        fan_out.push(Box::new(CsvExport::create(&config.csv_dir, &session.name).await?));
    }
    if config.print_stdout {
        fan_out.push(Box::new(StdoutPrinter::stdout()));
    }
    for writer in writers {
        fan_out.push(writer);
    }

    let (packet_tx, packet_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (summary_tx, summary_rx) = mpsc::channel(QUEUE_CAPACITY);
    let decoder = RecordDecoder::new(session.id, clock::monotonic_offset_ms());
    let aggregator = Arc::new(WindowedAggregator::default());

    let mut sink = PersistenceSink::new(summary_rx, fan_out, reporter.clone());
    if let Some(interval) = sink_interval {
        sink = sink.with_interval(interval);
    }

    let tasks = vec![
        (
            "ingest",
            tokio::spawn(Arc::clone(&aggregator).ingest(
                packet_rx,
                Arc::clone(&session.resolver),
                rate,
                reporter.clone(),
                cancel.clone(),
            )),
        ),
        ("sweeps", tokio::spawn(Arc::clone(&aggregator).run_sweeps(summary_tx.clone(), cancel.clone()))),
    ];
    let driver = Driver::spawn(source, decoder, packet_tx, summary_tx, reporter, cancel.clone());
    let sink = tokio::spawn(sink.run(cancel));

    debug!(session_id = session.id, "Measurement started");
    Ok(Measurement { aggregator, driver, tasks, sink })
}

/// Supervises a running session.
///
/// Dropping the handle cancels the session without waiting for the link to
/// be restored; call [`PlayerHandle::shutdown`] for an orderly end.
pub struct PlayerHandle {
    session: Session,
    storage: Arc<dyn Storage>,
    cancel: CancellationToken,
    reports: mpsc::Receiver<Report>,
    degraded: Arc<AtomicBool>,
    rate: SharedRate,
    rate_feed: watch::Receiver<f64>,
    freq: u32,
    controller: Option<JoinHandle<RateController>>,
    teardown: Teardown,
    aggregator: Option<Arc<WindowedAggregator>>,
    driver: Option<JoinHandle<DriverStats>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    sink: Option<JoinHandle<PersistenceSink>>,
    grace: Duration,
    summary: Option<SessionSummary>,
}

impl PlayerHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Rate most recently written to the control file, kbit/s.
    pub fn current_rate(&self) -> f64 {
        self.rate.get()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Stream of rate changes for dashboards, throttled to `rate`.
    ///
    /// Ends once the session has been shut down.
    pub fn rate_updates(&self, rate: UpdateRate) -> Pin<Box<dyn Stream<Item = f64> + Send>> {
        let updates = WatchStream::from_changes(self.rate_feed.clone());
        match rate.throttle_interval(f64::from(self.freq)) {
            Some(period) => Box::pin(updates.throttle(period)),
            None => Box::pin(updates),
        }
    }

    /// Wait until the pattern finishes, a task fails fatally or the session
    /// is cancelled. Warnings are only logged.
    pub async fn wait(&mut self) -> SessionEnd {
        loop {
            let report = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                report = self.reports.recv() => report,
            };
            match report {
                None => {
                    debug!("Every task has stopped");
                    return SessionEnd::Cancelled;
                }
                Some(Report { kind: ReportKind::Finished { reason }, .. }) => {
                    return SessionEnd::Finished { reason };
                }
                Some(Report { source, kind: ReportKind::Error { severity: Severity::Fatal, error } }) => {
                    return SessionEnd::Failed { source, error };
                }
                Some(_) => {}
            }
        }
    }

    /// Wait for the end of the session and shut it down.
    ///
    /// A fatal error is returned after the shutdown has completed.
    pub async fn run(mut self) -> Result<SessionSummary> {
        let end = self.wait().await;
        let summary = self.shutdown().await;
        match end {
            SessionEnd::Failed { error, .. } => Err(error),
            SessionEnd::Finished { .. } | SessionEnd::Cancelled => Ok(summary),
        }
    }

    /// Cancel every task, join them, restore the link and flush the sink.
    ///
    /// Tasks still running after the grace period are aborted. Calling this
    /// again returns the first summary.
    pub async fn shutdown(&mut self) -> SessionSummary {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }
        info!(session_id = self.session.id, "Shutting down session");
        self.cancel.cancel();

        let deadline = Instant::now() + self.grace;
        let mut aborted = Vec::new();

        let controller = match self.controller.take() {
            Some(handle) => join_until(deadline, "controller", handle, &mut aborted).await,
            None => None,
        };
        for (name, handle) in self.tasks.drain(..) {
            join_until(deadline, name, handle, &mut aborted).await;
        }
        let driver = match self.driver.take() {
            Some(handle) => join_until(deadline, "driver", handle, &mut aborted).await,
            None => None,
        };
        let sink = match self.sink.take() {
            Some(handle) => join_until(deadline, "sink", handle, &mut aborted).await,
            None => None,
        };

        let rate_writes = match controller {
            Some(mut controller) => {
                controller.close().await;
                controller.writes()
            }
            None => {
                self.teardown.run().await;
                0
            }
        };

        // Ingest has stopped; the last partial window goes out with the final drain
        let tail = match &self.aggregator {
            Some(aggregator) => aggregator.flush().into_iter().map(Sample::Packet).collect(),
            None => Vec::new(),
        };
        let sink = match sink {
            Some(sink) => Some(sink.finish_with(tail).await),
            None => None,
        };

        self.session.resolver.clear().await;
        let stats = match self.storage.session_stats(self.session.id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Could not read session statistics");
                None
            }
        };

        let summary = SessionSummary {
            session_id: self.session.id,
            name: self.session.name.clone(),
            rate_writes,
            driver: driver.unwrap_or_default(),
            sink,
            stats,
            degraded: self.is_degraded(),
            aborted,
        };
        info!(
            session_id = summary.session_id,
            rate_writes = summary.rate_writes,
            degraded = summary.degraded,
            aborted = summary.aborted.len(),
            "Session closed"
        );
        self.summary = Some(summary.clone());
        summary
    }
}

impl Drop for PlayerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerHandle")
            .field("session", &self.session)
            .field("closed", &self.summary.is_some())
            .finish_non_exhaustive()
    }
}

async fn join_until<T>(
    deadline: Instant,
    name: &'static str,
    mut handle: JoinHandle<T>,
    aborted: &mut Vec<&'static str>,
) -> Option<T> {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(task = name, error = %e, "Task failed");
            None
        }
        Err(_) => {
            warn!(task = name, "Task did not stop within grace period, aborting");
            handle.abort();
            aborted.push(name);
            None
        }
    }
}
