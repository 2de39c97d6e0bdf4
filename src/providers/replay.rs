//! Replay source for captured telemetry records

use std::collections::VecDeque;
use std::path::Path;
use tokio::time::{Duration, Interval, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::provider::RecordSource;
use crate::types::{RECORD_SIZE, RawFrame};
use crate::{Error, Result};

/// Replay source that hands out a fixed list of records
///
/// Records come either from memory or from a capture file that is a plain
/// concatenation of 64-byte records. Without pacing every record is available
/// immediately.
pub struct ReplaySource {
    frames: VecDeque<RawFrame>,

    /// Optional record pacing
    interval: Option<Interval>,

    total: usize,
    label: String,
}

impl ReplaySource {
    /// Create a replay source from in-memory records
    pub fn new(frames: impl IntoIterator<Item = RawFrame>) -> Self {
        let frames: VecDeque<_> = frames.into_iter().collect();
        let total = frames.len();
        Self { frames, interval: None, total, label: "memory".to_string() }
    }

    /// Load a capture file
    ///
    /// A trailing partial record is ignored with a warning.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| Error::device(path, e))?;

        let chunks = bytes.chunks_exact(RECORD_SIZE);
        let trailing = chunks.remainder().len();
        if trailing > 0 {
            warn!(path = %path.display(), trailing, "Ignoring partial trailing record");
        }
        let mut source = Self::new(chunks.filter_map(RawFrame::from_slice));
        source.label = path.display().to_string();

        info!(path = %path.display(), records = source.total, "Opened telemetry capture");
        Ok(source)
    }

    /// Hand out one record per `period`
    pub fn with_pacing(mut self, period: Duration) -> Self {
        let mut pacing = interval(period);
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(pacing);
        self
    }

    /// Records not yet handed out
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

#[async_trait::async_trait]
impl RecordSource for ReplaySource {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        if self.frames.is_empty() {
            debug!(records = self.total, "Reached end of replay");
            return Ok(None);
        }

        if let Some(pacing) = self.interval.as_mut() {
            pacing.tick().await;
        }
        Ok(self.frames.pop_front())
    }

    fn describe(&self) -> String {
        format!("replay {} ({} records)", self.label, self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameBuilder;

    #[tokio::test]
    async fn replays_in_order_then_ends() {
        let frames = [FrameBuilder::queue(1).build(), FrameBuilder::packet(2).build()];
        let mut source = ReplaySource::new(frames);

        assert_eq!(source.next_frame().await.unwrap(), Some(frames[0]));
        assert_eq!(source.next_frame().await.unwrap(), Some(frames[1]));
        assert_eq!(source.next_frame().await.unwrap(), None);
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test]
    async fn capture_file_drops_partial_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.bin");
        let frame = FrameBuilder::queue(7).mem_usage(4096).build();
        let mut bytes = frame.as_bytes().repeat(2);
        bytes.extend_from_slice(&[0xff; 10]);
        tokio::fs::write(&path, bytes).await.unwrap();

        let source = ReplaySource::from_file(&path).await.unwrap();
        assert_eq!(source.total(), 2);
        assert!(source.describe().contains("2 records"));
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_spaces_records() {
        let frames = (0..3).map(|i| FrameBuilder::queue(i).build());
        let mut source = ReplaySource::new(frames).with_pacing(Duration::from_millis(10));

        let start = tokio::time::Instant::now();
        while source.next_frame().await.unwrap().is_some() {}
        assert_eq!(start.elapsed(), Duration::from_millis(20));
    }
}
