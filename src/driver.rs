//! Driver spawns the record reader task

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Error;
use crate::decoder::RecordDecoder;
use crate::provider::RecordSource;
use crate::session::Reporter;
use crate::types::{Decoded, PacketSample, Sample};

/// Consecutive recoverable source errors after which the reader gives up.
pub const MAX_ERRORS: u32 = 10;

/// Counters of one reader run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub frames: u64,
    pub packets: u64,
    pub queues: u64,
    /// Packet records without addresses
    pub skipped: u64,
    /// Records with an unknown type tag
    pub unknown: u64,
    pub errors: u64,
}

/// Driver spawns and manages the record reader
///
/// The reader owns the source, decodes every record and routes packet events
/// to the aggregator queue and queue samples straight to the summary queue.
/// Both queues are bounded; a full queue blocks the reader.
pub struct Driver;

impl Driver {
    /// Spawn the reader task for the given source
    pub fn spawn<S>(
        source: S,
        decoder: RecordDecoder,
        packets: mpsc::Sender<PacketSample>,
        samples: mpsc::Sender<Sample>,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> JoinHandle<DriverStats>
    where
        S: RecordSource,
    {
        tokio::spawn(Self::reader_task(source, decoder, packets, samples, reporter, cancel))
    }

    /// Reader task - reads, decodes and routes records until cancelled or the source ends
    pub async fn reader_task<S>(
        mut source: S,
        decoder: RecordDecoder,
        packets: mpsc::Sender<PacketSample>,
        samples: mpsc::Sender<Sample>,
        reporter: Reporter,
        cancel: CancellationToken,
    ) -> DriverStats
    where
        S: RecordSource,
    {
        info!(source = %source.describe(), session_id = decoder.session_id(), "Record reader started");
        let mut stats = DriverStats::default();
        let mut error_count = 0u32;

        loop {
            // Use select to allow cancellation during source.next_frame()
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Record reader cancelled");
                    break;
                }
                result = source.next_frame() => result,
            };

            let frame = match result {
                Ok(Some(frame)) => {
                    error_count = 0;
                    frame
                }
                Ok(None) => {
                    info!(frames = stats.frames, "Record source ended");
                    break;
                }
                Err(e) if e.is_fatal() => {
                    // Device I/O failures end the session
                    stats.errors += 1;
                    error!(error = %e, "Record source failed, stopping reader");
                    reporter.fatal("driver", e).await;
                    break;
                }
                Err(e) => {
                    error_count += 1;
                    stats.errors += 1;
                    warn!(error = %e, error_count, max = MAX_ERRORS, "Record source error");

                    if error_count >= MAX_ERRORS {
                        error!("Too many record source errors, stopping reader");
                        reporter.fatal("driver", e).await;
                        break;
                    }

                    // Exponential backoff: 100ms, 200ms, 400ms, ...
                    let backoff = std::time::Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };
            stats.frames += 1;

            let sent = match decoder.decode(&frame) {
                Ok(Some(Decoded::Packet(sample))) => {
                    stats.packets += 1;
                    trace!(flow = %sample.flow, size = sample.size_bytes, "Packet record");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = packets.send(sample) => {
                            sent.map_err(|_| Error::ChannelClosed { channel: "packets" })
                        }
                    }
                }
                Ok(Some(Decoded::Queue(sample))) => {
                    stats.queues += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = samples.send(Sample::Queue(sample)) => {
                            sent.map_err(|_| Error::ChannelClosed { channel: "samples" })
                        }
                    }
                }
                Ok(None) => {
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    stats.unknown += 1;
                    debug!(error = %e, "Skipping record");
                    continue;
                }
            };

            if let Err(e) = sent {
                warn!(error = %e, "Record queue closed, stopping reader");
                break;
            }
        }

        info!(
            frames = stats.frames,
            packets = stats.packets,
            queues = stats.queues,
            unknown = stats.unknown,
            "Record reader ended"
        );
        stats
    }
}
