//! Data-rate pattern player and qdisc telemetry harvester for L4S evaluation.
//!
//! Ratecast shapes a network link along a scripted bandwidth trace (a
//! *data-rate pattern*) and at the same time collects per-packet telemetry
//! from the shaping qdisc's debug interface.
//!
//! # Features
//!
//! - **Pattern playback**: rates written to the qdisc control file at a fixed cadence
//! - **Telemetry**: fixed 64-byte records decoded and aggregated per flow every 10 ms
//! - **Persistence**: pluggable storage with optional CSV export and stdout printing
//! - **Live feed**: the current shaping rate as a throttled stream
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ratecast::{MemoryStorage, PlayConfig, Ratecast};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ratecast::Result<()> {
//!     let config = PlayConfig { dev: "eth0".into(), csv: true, ..PlayConfig::default() };
//!     let summary = Ratecast::play(config, Arc::new(MemoryStorage::new())).await?;
//!     println!("{} rates written", summary.rate_writes);
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Ingest pipeline
pub mod aggregator;
pub mod clock;
pub mod decoder;
pub mod driver;
pub mod flow;
pub mod provider;
pub mod providers;
pub mod sink;

// Playback and orchestration
pub mod config;
pub mod control;
pub mod pattern;
pub mod session;
pub mod stream;

// Core exports
pub use error::*;
pub use types::*;

pub use config::PlayConfig;
pub use control::{ControllerState, RateController};
pub use pattern::{DataRatePattern, PatternCursor, PlaybackSettings};
pub use provider::RecordSource;
pub use providers::{DeviceSource, ReplaySource};
pub use session::{Player, PlayerHandle, SessionEnd, SessionSummary};
pub use sink::{MemoryStorage, SampleWriter, Storage};

use std::path::Path;
use std::sync::Arc;

/// Unified entry point for one play invocation.
///
/// Both methods run the session to completion: they set up the link, play
/// the pattern while measuring and restore the link before returning.
/// Use [`Player`] directly to supervise a running session.
pub struct Ratecast;

impl Ratecast {
    /// Play the pattern `config` names.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid or the pattern cannot be loaded
    /// - Setting up the qdisc or the marking rules fails
    /// - The telemetry device or the control file cannot be opened
    /// - A task fails fatally during playback
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use ratecast::{MemoryStorage, PlayConfig, Ratecast};
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> ratecast::Result<()> {
    /// let config = PlayConfig { dev: "eth0".into(), bandwidth: Some("20m".into()), ..PlayConfig::default() };
    /// Ratecast::play(config, Arc::new(MemoryStorage::new())).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn play(config: PlayConfig, storage: Arc<dyn Storage>) -> Result<SessionSummary> {
        Player::from_config(config, storage)?.start().await?.run().await
    }

    /// Load a YAML play configuration from `path` and play it.
    pub async fn play_file<P: AsRef<Path>>(
        path: P,
        storage: Arc<dyn Storage>,
    ) -> Result<SessionSummary> {
        let config = PlayConfig::load(path).await?;
        Self::play(config, storage).await
    }
}
