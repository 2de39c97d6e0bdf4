//! Line-per-summary printer for piping into a dashboard

use std::io::Write;

use super::SampleWriter;
use crate::types::{PACKET_HEADING, Sample};
use crate::{Error, Result};

/// Printed after the last summary so a reading dashboard knows the player ended.
pub const END_MARKER: &str = "data rate player ended";

/// Prints every packet summary as a whitespace separated line.
///
/// The heading is printed before the first line. Queue samples are not printed.
pub struct StdoutPrinter<W = std::io::Stdout> {
    out: W,
    heading_written: bool,
}

impl StdoutPrinter {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> StdoutPrinter<W> {
    pub fn new(out: W) -> Self {
        Self { out, heading_written: false }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn ensure_heading(&mut self) -> std::io::Result<()> {
        if !self.heading_written {
            writeln!(self.out, "{}", PACKET_HEADING.join(" "))?;
            self.heading_written = true;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<W: Write + Send> SampleWriter for StdoutPrinter<W> {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn write(&mut self, sample: &Sample) -> Result<()> {
        let Sample::Packet(summary) = sample else {
            return Ok(());
        };
        self.ensure_heading()
            .and_then(|_| writeln!(self.out, "{}", summary.print_line()))
            .map_err(|e| Error::persistence_with_source("stdout", e))
    }

    async fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(|e| Error::persistence_with_source("stdout", e))
    }

    async fn finish(&mut self) -> Result<()> {
        self.ensure_heading()
            .and_then(|_| writeln!(self.out, "{END_MARKER}"))
            .and_then(|_| self.out.flush())
            .map_err(|e| Error::persistence_with_source("stdout", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{packet_summary, queue_sample};

    #[tokio::test]
    async fn prints_heading_once_then_lines() {
        let mut printer = StdoutPrinter::new(Vec::new());
        printer.write(&packet_summary(10, "udp a").into()).await.unwrap();
        printer.write(&queue_sample(11).into()).await.unwrap();
        printer.write(&packet_summary(20, "udp b").into()).await.unwrap();
        printer.finish().await.unwrap();

        let text = String::from_utf8(printer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], PACKET_HEADING.join(" "));
        assert!(lines[1].starts_with("10 "));
        assert!(lines[2].ends_with(" udp b"));
        assert_eq!(lines[3], END_MARKER);
    }
}
