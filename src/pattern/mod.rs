//! Data-rate patterns: scripted bandwidth traces played onto a link.
//!
//! A pattern file holds one rate in kbit/s per line. Lines starting with `#`
//! are comments; a comment of the form `#key=a,b` (or `#:key=a,b`) sets an
//! evaluation threshold, anything else becomes part of the description.
//!
//! ```text
//! # Three valleys, recorded on a 5G testbed
//! #:th_link_usage=70,90
//! 12000
//! 8000.5
//! 15000
//! ```
//!
//! Values are scaled and floored at load time; the stored sequence is what the
//! controller plays.

mod cursor;

pub use cursor::PatternCursor;

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Highest supported playback frequency in samples per second.
pub const MAX_FREQ: u32 = 100;

/// Smallest accepted scale factor.
pub const MIN_SCALE: f64 = 0.1;

/// Evaluation thresholds every pattern carries, with their defaults.
pub const DEFAULT_THRESHOLDS: [(&str, &str); 5] = [
    ("th_mq_latency", "{2,4}"),
    ("th_p95_latency", "{10,20}"),
    ("th_p99_latency", "{10,20}"),
    ("th_p999_latency", "{10,20}"),
    ("th_link_usage", "{60,80}"),
];

/// How a pattern is loaded and played.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSettings {
    /// Multiplier applied to every value on load
    pub scale: f64,
    /// Lower bound for every value after scaling, kbit/s
    pub min_rate_kbits: f64,
    pub looping: bool,
    /// Samples per second
    pub freq: u32,
    pub warmup: Duration,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self { scale: 1.0, min_rate_kbits: 0.0, looping: false, freq: 10, warmup: Duration::ZERO }
    }
}

/// Summary statistics over the stored values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl PatternStats {
    fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self { min: 0.0, max: 0.0, avg: 0.0 };
        }
        let (min, max, sum) = values.iter().fold(
            (f64::MAX, f64::MIN, 0.0),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
        );
        Self { min, max, avg: sum / values.len() as f64 }
    }

    fn scaled(self, factor: f64) -> Self {
        Self { min: self.min * factor, max: self.max * factor, avg: self.avg * factor }
    }
}

/// Parsed and scaled data-rate pattern.
///
/// The values are immutable once loaded except through [`DataRatePattern::rescale`],
/// which keeps statistics and fingerprint consistent.
#[derive(Debug, Clone)]
pub struct DataRatePattern {
    name: String,
    description: String,
    thresholds: BTreeMap<String, String>,
    values: Arc<[f64]>,
    settings: PlaybackSettings,
    stats: PatternStats,
    fingerprint: String,
}

impl DataRatePattern {
    /// Load a pattern file.
    pub fn from_file(path: impl AsRef<Path>, settings: PlaybackSettings) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("could not read '{}': {}", path.display(), e)))?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("pattern")
            .to_string();

        let pattern = Self::parse(name, &text, settings).map_err(|e| match e {
            Error::Config { reason } => Error::config(format!("{}: {}", path.display(), reason)),
            other => other,
        })?;
        info!(
            path = %path.display(),
            samples = pattern.len(),
            fingerprint = %pattern.fingerprint(),
            "Loaded data rate pattern"
        );
        Ok(pattern)
    }

    /// Parse pattern text.
    pub fn parse(name: impl Into<String>, text: &str, settings: PlaybackSettings) -> Result<Self> {
        let mut raw = Vec::new();
        let mut description = String::new();
        let mut thresholds = default_thresholds();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix('#') {
                match parse_setting(comment) {
                    Some((key, value)) => {
                        if !is_value_pair(&value) {
                            warn!(key = %key, value = %value, "Threshold is not a pair of integers");
                        }
                        thresholds.insert(key, format!("{{{}}}", value));
                    }
                    None => {
                        let text = comment.trim();
                        if !text.is_empty() {
                            description.push_str(text);
                            description.push('\n');
                        }
                    }
                }
                continue;
            }
            if line.contains(',') {
                return Err(Error::config(format!("line {line_no}: too many columns in '{line}'")));
            }
            let value: f64 = line.parse().map_err(|_| {
                Error::config(format!("line {line_no}: '{line}' is not a valid rate"))
            })?;
            if !value.is_finite() {
                return Err(Error::config(format!("line {line_no}: rate must be finite")));
            }
            raw.push(value);
        }

        if raw.is_empty() {
            return Err(Error::config("pattern contains no rates"));
        }

        let mut pattern = Self::from_values(name, raw, settings)?;
        pattern.description = description;
        pattern.thresholds = thresholds;
        Ok(pattern)
    }

    /// Build a pattern from raw (unscaled) values.
    pub fn from_values(
        name: impl Into<String>,
        raw: impl IntoIterator<Item = f64>,
        settings: PlaybackSettings,
    ) -> Result<Self> {
        validate_settings(&settings)?;
        let values: Arc<[f64]> =
            raw.into_iter().map(|v| (v * settings.scale).max(settings.min_rate_kbits)).collect();
        if values.is_empty() {
            return Err(Error::config("pattern contains no rates"));
        }
        let stats = PatternStats::of(&values);
        let fingerprint = fingerprint(&values);

        Ok(Self {
            name: name.into(),
            description: String::new(),
            thresholds: default_thresholds(),
            values,
            settings,
            stats,
            fingerprint,
        })
    }

    /// Single-value looping pattern holding a fixed bandwidth.
    pub fn constant(kbits: f64, settings: PlaybackSettings) -> Result<Self> {
        let settings = PlaybackSettings { looping: true, ..settings };
        Self::from_values(format!("constant_{}k", kbits), [kbits], settings)
    }

    /// Load every `*.csv` pattern in a directory, sorted by file name.
    ///
    /// Files that fail to parse are skipped with a warning.
    pub fn load_dir(dir: impl AsRef<Path>, settings: &PlaybackSettings) -> Result<Vec<Self>> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::config(format!("could not list '{}': {}", dir.display(), e)))?;

        let mut paths: Vec<_> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("csv"))
            .collect();
        paths.sort();

        let mut patterns = Vec::with_capacity(paths.len());
        for path in paths {
            match Self::from_file(&path, settings.clone()) {
                Ok(pattern) => patterns.push(pattern),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping faulty pattern"),
            }
        }
        Ok(patterns)
    }

    /// Multiply every value by `factor` and recompute statistics and fingerprint.
    ///
    /// The factor obeys the same lower bound as the load-time scale and is
    /// folded into [`PlaybackSettings::scale`].
    pub fn rescale(&mut self, factor: f64) -> Result<()> {
        if !factor.is_finite() || factor < MIN_SCALE {
            return Err(Error::config(format!(
                "rescale factor must be at least {MIN_SCALE}, got {factor}"
            )));
        }
        self.values = self.values.iter().map(|v| v * factor).collect();
        self.settings.scale *= factor;
        self.stats = self.stats.scaled(factor);
        self.fingerprint = fingerprint(&self.values);
        debug!(factor, fingerprint = %self.fingerprint, "Rescaled pattern");
        Ok(())
    }

    /// Check the playback settings and that there is something to play.
    pub fn validate(&self) -> Result<()> {
        validate_settings(&self.settings)?;
        if self.values.is_empty() {
            return Err(Error::config("pattern contains no rates"));
        }
        Ok(())
    }

    /// Fresh cursor over the values, looping as configured.
    pub fn cursor(&self) -> PatternCursor {
        PatternCursor::new(Arc::clone(&self.values), self.settings.looping)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Threshold map, always containing the known defaults.
    pub fn thresholds(&self) -> &BTreeMap<String, String> {
        &self.thresholds
    }

    pub fn threshold(&self, key: &str) -> Option<&str> {
        self.thresholds.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First value of the pattern.
    pub fn first(&self) -> f64 {
        self.values.first().copied().unwrap_or_default()
    }

    pub fn stats(&self) -> PatternStats {
        self.stats
    }

    /// Hex encoded SHA-256 of the stored values.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn settings(&self) -> &PlaybackSettings {
        &self.settings
    }

    pub fn is_looping(&self) -> bool {
        self.settings.looping
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.settings.looping = looping;
    }

    pub fn freq(&self) -> u32 {
        self.settings.freq
    }

    /// Interval between two controller ticks.
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.settings.freq.max(1)))
    }

    pub fn warmup(&self) -> Duration {
        self.settings.warmup
    }

    /// Warm-up plus one pass over the values.
    pub fn estimated_playtime(&self) -> Duration {
        self.settings.warmup + self.tick_period() * self.values.len() as u32
    }
}

fn validate_settings(settings: &PlaybackSettings) -> Result<()> {
    if !(1..=MAX_FREQ).contains(&settings.freq) {
        return Err(Error::config(format!(
            "frequency must be in 1..={MAX_FREQ}, got {}",
            settings.freq
        )));
    }
    if settings.scale.is_nan() || settings.scale < MIN_SCALE {
        return Err(Error::config(format!(
            "scale factor must be at least {MIN_SCALE}, got {}",
            settings.scale
        )));
    }
    Ok(())
}

fn default_thresholds() -> BTreeMap<String, String> {
    DEFAULT_THRESHOLDS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// `key=value` with whitespace removed, for comments like `#:th_link_usage = 60, 80`.
fn parse_setting(comment: &str) -> Option<(String, String)> {
    let compact: String = comment.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.strip_prefix(':').unwrap_or(&compact);
    let (key, value) = compact.split_once('=')?;
    if key.is_empty()
        || value.is_empty()
        || value.contains('=')
        || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}

fn is_value_pair(value: &str) -> bool {
    match value.split_once(',') {
        Some((a, b)) => {
            !a.is_empty()
                && !b.is_empty()
                && a.chars().all(|c| c.is_ascii_digit())
                && b.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn fingerprint(values: &[f64]) -> String {
    let mut hasher = Sha256::new();
    for value in values {
        hasher.update(value.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}
