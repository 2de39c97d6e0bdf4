//! Play configuration loaded from YAML
//!
//! ```yaml
//! dev: eth0
//! tag: valley run
//! pattern: /etc/jens-cli/drp_3valleys.csv
//! freq: 10
//! looping: false
//! csv: true
//! shaping:
//!   markfree_ms: 2
//!   markfull_ms: 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock;
use crate::control::tc::ShapingParams;
use crate::control::{ControllerSettings, INITIAL_RATE_FACTOR};
use crate::pattern::{DataRatePattern, MAX_FREQ, MIN_SCALE, PlaybackSettings};
use crate::providers::DEFAULT_DEVICE;
use crate::{Error, Result};

/// Pattern played when none is configured.
pub const DEFAULT_PATTERN: &str = "/etc/jens-cli/drp_3valleys.csv";

/// Everything one play invocation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayConfig {
    /// Network device to shape
    pub dev: String,
    /// Session name, generated if empty
    pub tag: String,
    /// Pattern file, ignored when `bandwidth` is set
    pub pattern: PathBuf,
    /// Samples per second
    pub freq: u32,
    pub looping: bool,
    pub scale: f64,
    pub min_rate_kbits: f64,
    pub warmup_ms: u64,
    /// Mark traffic ECT(0) for 200 ms when playback starts
    pub signal_start: bool,
    /// Premark all outgoing traffic as ECT(1)
    pub l4s_premarking: bool,
    /// Only play the pattern, record nothing
    pub no_measure: bool,
    pub csv: bool,
    pub csv_dir: PathBuf,
    pub print_stdout: bool,
    pub telemetry_path: PathBuf,
    /// Control file override; derived from the qdisc when unset
    pub control_path: Option<PathBuf>,
    /// Constant bandwidth such as `20m` or `5000k` instead of a pattern
    pub bandwidth: Option<String>,
    pub shaping: ShapingParams,
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            dev: String::new(),
            tag: String::new(),
            pattern: PathBuf::from(DEFAULT_PATTERN),
            freq: 10,
            looping: false,
            scale: 1.0,
            min_rate_kbits: 0.0,
            warmup_ms: 0,
            signal_start: false,
            l4s_premarking: false,
            no_measure: false,
            csv: false,
            csv_dir: PathBuf::from("."),
            print_stdout: false,
            telemetry_path: PathBuf::from(DEFAULT_DEVICE),
            control_path: None,
            bandwidth: None,
            shaping: ShapingParams::default(),
        }
    }
}

impl PlayConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml)
            .map_err(|e| Error::config(format!("YAML parsing failed: {e}")))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&yaml)
    }

    /// Check everything that can be checked before the pattern is known.
    pub fn validate(&self) -> Result<()> {
        if self.dev.trim().is_empty() {
            return Err(Error::config("dev was not set"));
        }
        if !(1..=MAX_FREQ).contains(&self.freq) {
            return Err(Error::config(format!(
                "frequency {} is outside 1..={MAX_FREQ}",
                self.freq
            )));
        }
        if self.scale < MIN_SCALE {
            return Err(Error::config(format!("scale must be at least {MIN_SCALE}")));
        }
        self.bandwidth_kbits()?;
        Ok(())
    }

    /// Full validation including the qdisc parameters at the initial rate.
    pub fn validate_for(&self, pattern: &DataRatePattern) -> Result<()> {
        self.validate()?;
        self.shaping.validate((pattern.first() * INITIAL_RATE_FACTOR) as u32)
    }

    /// Parsed `bandwidth` in kbit/s.
    pub fn bandwidth_kbits(&self) -> Result<Option<f64>> {
        self.bandwidth.as_deref().map(parse_bandwidth).transpose()
    }

    pub fn playback(&self) -> PlaybackSettings {
        PlaybackSettings {
            scale: self.scale,
            min_rate_kbits: self.min_rate_kbits,
            looping: self.looping,
            freq: self.freq,
            warmup: Duration::from_millis(self.warmup_ms),
        }
    }

    /// Constant pattern for `bandwidth`, otherwise the pattern file.
    pub fn load_pattern(&self) -> Result<DataRatePattern> {
        match self.bandwidth_kbits()? {
            Some(kbits) => DataRatePattern::constant(kbits, self.playback()),
            None => DataRatePattern::from_file(&self.pattern, self.playback()),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            l4s_premarking: self.l4s_premarking,
            signal_start: self.signal_start,
            shaping: self.shaping.clone(),
            control_path: self.control_path.clone(),
        }
    }

    /// Configured tag, or one derived from the start time.
    pub fn session_name(&self) -> String {
        if self.tag.trim().is_empty() {
            format!("session_{}", clock::epoch_ms())
        } else {
            self.tag.clone()
        }
    }
}

/// `<number>m` for Mbit/s or `<number>k` for kbit/s.
fn parse_bandwidth(value: &str) -> Result<f64> {
    let value = value.trim().to_ascii_lowercase();
    let invalid = || {
        Error::config(format!(
            "bandwidth '{value}' must be a number with unit m(mbits) or k(kbits), e.g. 20000k"
        ))
    };
    let (number, factor) = if let Some(number) = value.strip_suffix('m') {
        (number, 1000.0)
    } else if let Some(number) = value.strip_suffix('k') {
        (number, 1.0)
    } else {
        return Err(invalid());
    };
    let number: u32 = number.parse().map_err(|_| invalid())?;
    Ok(f64::from(number) * factor)
}
