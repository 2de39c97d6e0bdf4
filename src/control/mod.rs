//! Rate controller: plays a data-rate pattern into the qdisc control file.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --setup--> WarmingUp --warm_up--> Playing --exhausted--> Draining
//!   \                 \                     \                      |
//!    `-----------------`---------------------`------close------> Closed
//! ```
//!
//! `setup` installs the qdisc and marking rules and opens the control file,
//! any failure there is fatal. `close` undoes everything and may be called
//! from any state, any number of times.

pub mod command;
pub mod tc;

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pattern::{DataRatePattern, PatternCursor};
use crate::session::Reporter;
use crate::types::SharedRate;
use crate::{Error, Result};
use tc::{NFT_TABLE_PREMARK, NFT_TABLE_SIGNAL, NFT_TABLE_UEMARK, NetworkConfig, QdiscKind, ShapingParams};

/// Control file of the single-queue qdisc.
pub const JANZ_CONTROL_FILE: &str = "/sys/kernel/debug/sch_janz/0001:v1";
/// Control file of the multi-queue qdisc.
pub const MULTIJENS_CONTROL_FILE: &str = "/sys/kernel/debug/sch_multijens/0001:v1";

/// Factor applied to the first rate during warm-up.
pub const WARMUP_FACTOR: f64 = 1.33;
/// The qdisc is created with this multiple of the first rate.
pub const INITIAL_RATE_FACTOR: f64 = 2.0;
/// How long the start-of-playback ECT(0) marker stays installed.
pub const SIGNAL_MARKER_DURATION: Duration = Duration::from_millis(200);

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    WarmingUp,
    Playing,
    Draining,
    Closed,
}

/// How playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// A non-looping pattern ran out of values
    Exhausted,
    Cancelled,
}

/// Writable handle on the qdisc rate control file.
///
/// Every update is the rate in bit/s as a little-endian `u64`, repeated once
/// per rate slot.
pub struct ControlFile {
    path: PathBuf,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    slots: usize,
    buf: Vec<u8>,
}

impl ControlFile {
    pub async fn open(path: impl AsRef<Path>, slots: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| Error::control_file(path, e))?;
        Ok(Self::from_writer(path, file, slots))
    }

    /// Wrap any writer, e.g. an in-memory buffer.
    pub fn from_writer(
        path: impl Into<PathBuf>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        slots: usize,
    ) -> Self {
        let slots = slots.max(1);
        Self { path: path.into(), writer: Box::new(writer), slots, buf: Vec::with_capacity(8 * slots) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a rate given in kbit/s.
    pub async fn write_rate(&mut self, kbits: f64) -> Result<()> {
        let bits = (kbits as u64).saturating_mul(1000).to_le_bytes();
        self.buf.clear();
        for _ in 0..self.slots {
            self.buf.extend_from_slice(&bits);
        }
        self.writer.write_all(&self.buf).await.map_err(|e| Error::control_file(&self.path, e))?;
        self.writer.flush().await.map_err(|e| Error::control_file(&self.path, e))
    }
}

impl std::fmt::Debug for ControlFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlFile")
            .field("path", &self.path)
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

/// Options that shape how the controller sets up the link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerSettings {
    /// Premark all outgoing traffic as ECT(1)
    pub l4s_premarking: bool,
    /// Mark traffic ECT(0) for a moment when playback starts
    pub signal_start: bool,
    pub shaping: ShapingParams,
    /// Override of the control file path
    pub control_path: Option<PathBuf>,
}

impl ControllerSettings {
    pub fn control_path(&self) -> PathBuf {
        match (&self.control_path, self.shaping.qdisc()) {
            (Some(path), _) => path.clone(),
            (None, QdiscKind::Janz) => PathBuf::from(JANZ_CONTROL_FILE),
            (None, QdiscKind::MultiJens { .. }) => PathBuf::from(MULTIJENS_CONTROL_FILE),
        }
    }
}

/// Drives the shaping rate from a pattern cursor.
pub struct RateController {
    net: NetworkConfig,
    settings: ControllerSettings,
    cursor: PatternCursor,
    first_rate: f64,
    tick_period: Duration,
    warmup: Duration,
    state: ControllerState,
    control: Option<ControlFile>,
    rate: SharedRate,
    rate_tx: watch::Sender<f64>,
    marker_removal: Option<JoinHandle<()>>,
    writes: u64,
}

impl RateController {
    pub fn new(
        net: NetworkConfig,
        pattern: &DataRatePattern,
        settings: ControllerSettings,
        rate: SharedRate,
    ) -> Self {
        let (rate_tx, _) = watch::channel(rate.get());
        Self {
            net,
            settings,
            cursor: pattern.cursor(),
            first_rate: pattern.first(),
            tick_period: pattern.tick_period(),
            warmup: pattern.warmup(),
            state: ControllerState::Idle,
            control: None,
            rate,
            rate_tx,
            marker_removal: None,
            writes: 0,
        }
    }

    /// Use an already open control file instead of opening one in `setup`.
    pub fn with_control_file(mut self, control: ControlFile) -> Self {
        self.control = Some(control);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Number of successful control file writes.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Live feed of every rate written.
    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.rate_tx.subscribe()
    }

    pub fn shared_rate(&self) -> SharedRate {
        self.rate.clone()
    }

    /// Install marking rules and the qdisc, then open the control file.
    pub async fn setup(&mut self) -> Result<()> {
        let initial_kbits = (self.first_rate * INITIAL_RATE_FACTOR) as u32;
        let shaping = &self.settings.shaping;
        debug!(dev = self.net.dev(), initial_kbits, ?shaping, "Setting up traffic control");

        self.net.reset_table(NFT_TABLE_PREMARK).await;
        if self.settings.l4s_premarking {
            self.net.add_ect_rule(NFT_TABLE_PREMARK, "ect1", 0).await?;
        }
        if let QdiscKind::MultiJens { .. } = shaping.qdisc() {
            self.net.reset_table(NFT_TABLE_UEMARK).await;
            self.net.add_ue_mark_rules(&shaping.netflows).await?;
        }

        shaping.validate(initial_kbits)?;

        if let Err(e) = self.net.delete_root_qdisc().await {
            debug!(error = %e, "No root qdisc to delete");
        }
        self.net.add_root_qdisc(shaping, initial_kbits).await?;

        if self.control.is_none() {
            let path = self.settings.control_path();
            let slots = shaping.qdisc().rate_slots();
            self.control = Some(ControlFile::open(&path, slots).await?);
        }
        self.state = ControllerState::WarmingUp;
        info!(dev = self.net.dev(), initial_kbits, "Traffic control ready");
        Ok(())
    }

    /// Write the warm-up rate and hold it for the warm-up duration.
    ///
    /// Returns `Ok(false)` if cancelled while waiting.
    pub async fn warm_up(&mut self, cancel: &CancellationToken) -> Result<bool> {
        self.state = ControllerState::WarmingUp;
        if self.warmup.is_zero() {
            return Ok(true);
        }
        let rate = self.first_rate * WARMUP_FACTOR;
        info!(rate_kbits = rate, warmup_ms = self.warmup.as_millis() as u64, "Warming up");
        self.apply(rate).await?;

        tokio::select! {
            _ = cancel.cancelled() => Ok(false),
            _ = tokio::time::sleep(self.warmup) => Ok(true),
        }
    }

    /// Play the pattern, one value per tick.
    pub async fn play(&mut self, cancel: &CancellationToken) -> Result<PlayOutcome> {
        self.state = ControllerState::Playing;
        if self.settings.signal_start {
            self.signal_start(cancel).await?;
        }

        info!(
            period_ms = self.tick_period.as_millis() as u64,
            looping = self.cursor.is_looping(),
            "Start playing data rate pattern"
        );
        let start = tokio::time::Instant::now() + self.tick_period;
        let mut ticker = tokio::time::interval_at(start, self.tick_period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Playback cancelled");
                    return Ok(PlayOutcome::Cancelled);
                }
                _ = ticker.tick() => {}
            }

            match self.cursor.next() {
                Ok(rate) => self.apply(rate).await?,
                Err(Error::PatternExhausted) => {
                    self.state = ControllerState::Draining;
                    info!(writes = self.writes, "Data rate pattern has finished");
                    return Ok(PlayOutcome::Exhausted);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop playback at the next tick.
    pub fn stop(&mut self) {
        self.cursor.set_done();
    }

    /// Play and report the outcome. Hands the controller back so the
    /// caller can close it.
    pub async fn run(mut self, reporter: Reporter, cancel: CancellationToken) -> Self {
        match self.play(&cancel).await {
            Ok(PlayOutcome::Exhausted) => reporter.finished("data rate pattern has finished").await,
            Ok(PlayOutcome::Cancelled) => {}
            Err(e) => reporter.fatal("controller", e).await,
        }
        self
    }

    /// Handle that can undo the link setup without the controller itself.
    pub fn teardown(&self) -> Teardown {
        Teardown { net: self.net.clone(), settings: self.settings.clone() }
    }

    /// Remove rules and qdisc and release the control file. Errors are logged only.
    pub async fn close(&mut self) {
        if self.state == ControllerState::Closed {
            return;
        }
        if let Some(handle) = self.marker_removal.take() {
            handle.abort();
        }
        self.teardown().run().await;
        self.control = None;
        self.state = ControllerState::Closed;
    }

    async fn apply(&mut self, rate: f64) -> Result<()> {
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| Error::config("control file is not open, call setup first"))?;
        control.write_rate(rate).await?;
        self.writes += 1;
        self.rate.set(rate);
        self.rate_tx.send_replace(rate);
        Ok(())
    }

    async fn signal_start(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.net.reset_table(NFT_TABLE_SIGNAL).await;
        self.net.add_ect_rule(NFT_TABLE_SIGNAL, "ect0", 1).await?;

        let net = self.net.clone();
        let cancel = cancel.clone();
        self.marker_removal = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(SIGNAL_MARKER_DURATION) => {
                    net.reset_table(NFT_TABLE_SIGNAL).await;
                    debug!("Removed start signal marker");
                }
            }
        }));
        Ok(())
    }
}

/// Undo of everything `setup` installs.
///
/// Used by `close`, and by the session when the controller task had to be
/// aborted.
#[derive(Debug, Clone)]
pub struct Teardown {
    net: NetworkConfig,
    settings: ControllerSettings,
}

impl Teardown {
    pub async fn run(&self) {
        debug!(dev = self.net.dev(), "Closing traffic control");
        if self.settings.l4s_premarking {
            self.net.reset_table(NFT_TABLE_PREMARK).await;
        }
        if self.settings.signal_start {
            self.net.reset_table(NFT_TABLE_SIGNAL).await;
        }
        if let QdiscKind::MultiJens { .. } = self.settings.shaping.qdisc() {
            self.net.reset_table(NFT_TABLE_UEMARK).await;
        }
        if let Err(e) = self.net.delete_root_qdisc().await {
            warn!(error = %e, "Could not delete root qdisc");
        }
    }
}

impl std::fmt::Debug for RateController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateController")
            .field("dev", &self.net.dev())
            .field("state", &self.state)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}
