//! Test utilities shared by unit tests, integration tests and benches
//!
//! Fixtures for records, samples and flows, plus in-process stand-ins for the
//! external collaborators: a command runner that records instead of running,
//! a storage that registers slowly and a control file backed by memory.

use parking_lot::Mutex;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;

use crate::control::command::{CommandOutput, CommandRunner, command_line};
use crate::sink::{SessionRecord, SessionStats, Storage};
use crate::types::{
    FlowId, FlowKey, FrameBuilder, PacketFlags, PacketSample, PacketSummary, Protocol,
    QueueSample, RawFrame, Sample, SessionId,
};
use crate::{Error, Result};

/// Source address of every fixture flow.
pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
/// Destination address of every fixture flow.
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// TCP flow from `CLIENT_IP:src_port` to `SERVER_IP:443`.
pub fn flow_key(src_port: u16) -> FlowKey {
    FlowKey::new(Protocol::Tcp, CLIENT_IP, src_port, SERVER_IP, 443)
}

/// Decoded packet on [`flow_key`]`(src_port)`.
pub fn packet(src_port: u16, sojourn_ms: u32, size: u32, flags: PacketFlags) -> PacketSample {
    PacketSample {
        timestamp_ms: 0,
        sojourn_ms,
        flags,
        ip_version: 4,
        priority: 0,
        size_bytes: size,
        flow: flow_key(src_port),
    }
}

/// Packet record matching [`packet`].
pub fn packet_frame(src_port: u16, sojourn_us: u32, size: u32) -> RawFrame {
    FrameBuilder::packet(1_000_000)
        .addresses(CLIENT_IP, SERVER_IP)
        .sojourn_us(sojourn_us)
        .size(size)
        .ip_version(4)
        .transport(6, src_port, 443)
        .build()
}

pub fn queue_frame(timestamp_ns: u64, depth: u16, mem_usage: u32) -> RawFrame {
    FrameBuilder::queue(timestamp_ns).queue_depth(depth).mem_usage(mem_usage).build()
}

pub fn packet_summary(timestamp_ms: u64, flow: &str) -> PacketSummary {
    PacketSummary {
        timestamp_ms,
        sojourn_ms: 3,
        load_kbits: 1200,
        capacity_kbits: 5000,
        ecn_ce_percent: 10,
        dropped: 0,
        flow_id: 1,
        flow: flow.to_string(),
        sample_count: 4,
    }
}

pub fn queue_sample(timestamp_ms: u64) -> QueueSample {
    QueueSample { timestamp_ms, queue_depth: 12, mem_usage_bytes: 18_000, session_id: 1 }
}

/// Command runner that records every command line instead of running it.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
    fail_prefix: Option<String>,
}

impl RecordingRunner {
    /// Fail every command whose line starts with `prefix`. Failing commands
    /// are still recorded.
    pub fn failing_on(prefix: impl Into<String>) -> Self {
        Self { commands: Mutex::default(), fail_prefix: Some(prefix.into()) }
    }

    /// Every command line run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait::async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let line = command_line(program, args);
        self.commands.lock().push(line.clone());

        if self.fail_prefix.as_deref().is_some_and(|prefix| line.starts_with(prefix)) {
            return Err(Error::Command {
                command: line,
                status: "exit status: 2".to_string(),
                stdout: String::new(),
                stderr: "simulated failure".to_string(),
            });
        }
        Ok(CommandOutput::default())
    }
}

/// Storage whose flow registration takes a while, for exercising concurrent
/// resolution.
#[derive(Debug, Default)]
pub struct SlowStorage {
    registrations: AtomicUsize,
    next_id: AtomicU64,
}

impl SlowStorage {
    pub const DELAY: Duration = Duration::from_millis(20);

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Storage for SlowStorage {
    async fn register_session(&self, _session: &SessionRecord) -> Result<SessionId> {
        Ok(1)
    }

    async fn register_flow(&self, _session: SessionId, _flow: &FlowKey) -> Result<FlowId> {
        tokio::time::sleep(Self::DELAY).await;
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn persist(&self, _sample: &Sample) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn clear_cache(&self) {}

    async fn session_stats(&self, _session: SessionId) -> Result<SessionStats> {
        Ok(SessionStats { load_kbits: None, start_ms: 0, end_ms: 0 })
    }

    fn has_db_connection(&self) -> bool {
        false
    }
}

/// In-memory control file. Clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    broken: bool,
}

impl SharedBuffer {
    /// Buffer that fails every write.
    pub fn broken() -> Self {
        Self { bytes: Arc::default(), broken: true }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Written rates decoded as little-endian bit/s values.
    pub fn rates(&self) -> Vec<u64> {
        self.bytes
            .lock()
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            })
            .collect()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.broken {
            return Poll::Ready(Err(io::Error::other("control file gone")));
        }
        self.bytes.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::RecordDecoder;
    use crate::types::Decoded;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn packet_frame_decodes_to_packet_fixture() {
        let decoded = RecordDecoder::new(1, 0).decode(&packet_frame(8080, 7_000, 900)).unwrap();
        let Some(Decoded::Packet(sample)) = decoded else {
            panic!("expected a packet");
        };
        assert_eq!(sample.flow, flow_key(8080));
        assert_eq!(sample.sojourn_ms, 7);
        assert_eq!(sample.size_bytes, 900);
    }

    #[tokio::test]
    async fn shared_buffer_collects_rates() {
        let buffer = SharedBuffer::default();
        let mut writer = buffer.clone();
        writer.write_all(&1000u64.to_le_bytes()).await.unwrap();
        writer.write_all(&2000u64.to_le_bytes()).await.unwrap();
        assert_eq!(buffer.rates(), [1000, 2000]);
        assert_eq!(buffer.bytes().len(), 16);

        let mut broken = SharedBuffer::broken();
        assert!(broken.write_all(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn recording_runner_fails_on_prefix() {
        let runner = RecordingRunner::failing_on("tc");
        assert!(runner.run("nft", &["list".to_string()]).await.is_ok());
        assert!(runner.run("tc", &["qdisc".to_string()]).await.is_err());
        assert_eq!(runner.commands(), ["nft list", "tc qdisc"]);
    }
}
