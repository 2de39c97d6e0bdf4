//! CSV export of a session's samples

use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::info;

use super::SampleWriter;
use crate::clock;
use crate::types::{PACKET_HEADING, QUEUE_HEADING, Sample};
use crate::{Error, Result};

pub const PACKET_FILE: &str = "measure_packet.csv";
pub const QUEUE_FILE: &str = "measure_queue.csv";

/// Writes packet summaries and queue samples into two CSV files in a
/// per-session directory.
pub struct CsvExport {
    dir: PathBuf,
    packets: BufWriter<File>,
    queues: BufWriter<File>,
    line: String,
}

impl CsvExport {
    /// Create `<base>/<session_name>` and both files with their headings.
    ///
    /// If the directory already exists a `_HH:MM:SS` suffix is appended.
    pub async fn create(base: impl AsRef<Path>, session_name: &str) -> Result<Self> {
        let base = base.as_ref();
        let mut dir = base.join(session_name);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                info!(dir = %dir.display(), "CSV directory exists");
                dir = base.join(format!("{}_{}", session_name, time_of_day(clock::epoch_ms())));
                tokio::fs::create_dir_all(&dir).await.map_err(|e| io_error(&dir, e))?;
            }
            Err(e) => return Err(io_error(&dir, e)),
        }
        info!(dir = %dir.display(), "Storing CSV measures");

        let mut export = Self {
            packets: create_file(&dir.join(PACKET_FILE)).await?,
            queues: create_file(&dir.join(QUEUE_FILE)).await?,
            dir,
            line: String::with_capacity(128),
        };

        let packet_heading = PACKET_HEADING.map(String::from);
        let queue_heading = QUEUE_HEADING.map(String::from);
        export.write_packet_row(&packet_heading).await?;
        export.write_queue_row(&queue_heading).await?;
        Ok(export)
    }

    /// Directory the files live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_packet_row(&mut self, fields: &[String]) -> Result<()> {
        encode_row(&mut self.line, fields);
        self.packets
            .write_all(self.line.as_bytes())
            .await
            .map_err(|e| io_error(&self.dir.join(PACKET_FILE), e))
    }

    async fn write_queue_row(&mut self, fields: &[String]) -> Result<()> {
        encode_row(&mut self.line, fields);
        self.queues
            .write_all(self.line.as_bytes())
            .await
            .map_err(|e| io_error(&self.dir.join(QUEUE_FILE), e))
    }
}

#[async_trait::async_trait]
impl SampleWriter for CsvExport {
    fn name(&self) -> &'static str {
        "csv"
    }

    async fn write(&mut self, sample: &Sample) -> Result<()> {
        match sample {
            Sample::Packet(summary) => self.write_packet_row(&summary.csv_record()).await,
            Sample::Queue(queue) => self.write_queue_row(&queue.csv_record()).await,
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.packets.flush().await.map_err(|e| io_error(&self.dir.join(PACKET_FILE), e))?;
        self.queues.flush().await.map_err(|e| io_error(&self.dir.join(QUEUE_FILE), e))
    }

    async fn finish(&mut self) -> Result<()> {
        self.flush().await
    }
}

async fn create_file(path: &Path) -> Result<BufWriter<File>> {
    let file = File::create(path).await.map_err(|e| io_error(path, e))?;
    Ok(BufWriter::new(file))
}

fn io_error(path: &Path, source: std::io::Error) -> Error {
    Error::persistence_with_source(format!("csv export {}", path.display()), source)
}

/// One CSV line, quoting fields that need it.
fn encode_row(line: &mut String, fields: &[String]) {
    line.clear();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        if field.contains([',', '"', '\n']) {
            line.push('"');
            line.push_str(&field.replace('"', "\"\""));
            line.push('"');
        } else {
            line.push_str(field);
        }
    }
    line.push('\n');
}

/// `HH:MM:SS` (UTC) of an epoch millisecond timestamp.
fn time_of_day(epoch_ms: u64) -> String {
    let secs = (epoch_ms / 1000) % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{packet_summary, queue_sample};
    use anyhow::{Result, ensure};

    #[tokio::test]
    async fn writes_headings_and_rows() -> Result<()> {
        let base = tempfile::tempdir()?;
        let mut export = CsvExport::create(base.path(), "session-1").await?;

        export.write(&packet_summary(1000, "tcp 10.0.0.1:1-10.0.0.2:2").into()).await?;
        export.write(&queue_sample(2000).into()).await?;
        export.flush().await?;

        let packets = std::fs::read_to_string(base.path().join("session-1").join(PACKET_FILE))?;
        let queues = std::fs::read_to_string(base.path().join("session-1").join(QUEUE_FILE))?;

        let mut lines = packets.lines();
        ensure!(
            lines.next()
                == Some("timestampMs,sojournTimeMs,loadKbits,capacityKbits,ecnCePercent,dropped,netflow")
        );
        ensure!(lines.next().is_some_and(|l| l.starts_with("1000,") && l.ends_with(",tcp 10.0.0.1:1-10.0.0.2:2")));
        ensure!(queues.lines().count() == 2);
        ensure!(queues.starts_with("timestampMs,memUsageBytes,packetsinqueue\n"));
        Ok(())
    }

    #[tokio::test]
    async fn existing_directory_gets_time_suffix() -> Result<()> {
        let base = tempfile::tempdir()?;
        std::fs::create_dir(base.path().join("tagged"))?;

        let export = CsvExport::create(base.path(), "tagged").await?;
        let name = export.dir().file_name().and_then(|n| n.to_str()).unwrap_or_default();
        ensure!(name.starts_with("tagged_"), "got {name}");
        ensure!(name.len() == "tagged_".len() + 8);
        Ok(())
    }

    #[test]
    fn quotes_only_when_needed() {
        let mut line = String::new();
        encode_row(&mut line, &["a".into(), "b,c".into(), "say \"hi\"".into()]);
        assert_eq!(line, "a,\"b,c\",\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn time_of_day_wraps_at_midnight() {
        assert_eq!(time_of_day(0), "00:00:00");
        assert_eq!(time_of_day((86_400 + 3_723) * 1000 + 999), "01:02:03");
    }
}
