//! Record source for the qdisc debugfs telemetry device

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{info, trace};

use crate::provider::RecordSource;
use crate::types::{RECORD_SIZE, RawFrame};
use crate::{Error, Result};

/// Telemetry device of the single-queue qdisc.
pub const DEFAULT_DEVICE: &str = "/sys/kernel/debug/sch_janz/0001:0";

/// Upper bound for one read attempt.
pub const READ_TIMEOUT: Duration = Duration::from_millis(9);

/// Pause after a read that produced nothing.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Reads one 64-byte record per read call from the telemetry device.
///
/// Each read attempt is bounded by [`READ_TIMEOUT`]. A read that times out,
/// returns nothing or returns a short record is dropped and the next attempt
/// starts; only full records are handed out.
#[derive(Debug)]
pub struct DeviceSource {
    path: PathBuf,
    file: File,
    buf: [u8; RECORD_SIZE],
    short_reads: u64,
}

impl DeviceSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await.map_err(|e| Error::device(&path, e))?;
        info!(path = %path.display(), "Opened telemetry device");
        Ok(Self { path, file, buf: [0; RECORD_SIZE], short_reads: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads that returned something other than a full record.
    pub fn short_reads(&self) -> u64 {
        self.short_reads
    }
}

#[async_trait::async_trait]
impl RecordSource for DeviceSource {
    async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        loop {
            match tokio::time::timeout(READ_TIMEOUT, self.file.read(&mut self.buf)).await {
                Ok(Ok(RECORD_SIZE)) => return Ok(Some(RawFrame::new(self.buf))),
                Ok(Ok(read)) => {
                    if read > 0 {
                        self.short_reads += 1;
                        trace!(read, "Dropping short record");
                    }
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
                Ok(Err(e)) => return Err(Error::device(&self.path, e)),
                Err(_) => trace!("No record within read timeout"),
            }
        }
    }

    fn describe(&self) -> String {
        format!("device {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FrameBuilder;

    #[tokio::test]
    async fn missing_device_is_a_device_error() {
        let error = DeviceSource::open("/nonexistent/sch_janz/0001:0").await.unwrap_err();
        assert!(matches!(error, Error::Device { .. }));
        assert!(error.is_fatal());
    }

    #[tokio::test]
    async fn reads_full_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0001:0");
        let frame = FrameBuilder::queue(42).queue_depth(3).build();
        tokio::fs::write(&path, frame.as_bytes()).await.unwrap();

        let mut source = DeviceSource::open(&path).await.unwrap();
        let read = source.next_frame().await.unwrap().unwrap();
        assert_eq!(read, frame);
        assert!(source.describe().ends_with("0001:0"));
    }
}
