//! Benchmarks for the telemetry ingest hot path
//!
//! Every 64-byte record is decoded, and every packet record is folded into
//! its flow's 10 ms window. Both have to keep up with the qdisc's record
//! rate on a saturated link.
//!
//! Platform: Cross-platform (synthetic records, CI-safe)

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use ratecast::aggregator::WindowedAggregator;
use ratecast::decoder::RecordDecoder;
use ratecast::test_utils::{packet_frame, queue_frame};
use ratecast::types::{Decoded, PacketSample, RECORD_SIZE, RawFrame};
use std::hint::black_box;

/// Packet records over `flows` distinct source ports, one queue record every 16.
fn records(count: usize, flows: u16) -> Vec<RawFrame> {
    (0..count)
        .map(|i| {
            if i % 16 == 15 {
                queue_frame(i as u64 * 1_000, 8, 12_000)
            } else {
                packet_frame(10_000 + (i as u16 % flows), 1_500, 1_200)
            }
        })
        .collect()
}

fn decoded_packets(frames: &[RawFrame]) -> Vec<PacketSample> {
    let decoder = RecordDecoder::new(1, 0);
    frames
        .iter()
        .filter_map(|frame| match decoder.decode(frame) {
            Ok(Some(Decoded::Packet(sample))) => Some(sample),
            _ => None,
        })
        .collect()
}

fn bench_decode(c: &mut Criterion) {
    let frames = records(1_024, 8);
    let decoder = RecordDecoder::new(1, 0);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes((frames.len() * RECORD_SIZE) as u64));

    group.bench_function("mixed_records", |b| {
        b.iter(|| {
            for frame in &frames {
                black_box(decoder.decode(black_box(frame)).ok());
            }
        })
    });

    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate");

    for flows in [1u16, 16, 256] {
        let packets = decoded_packets(&records(1_024, flows));
        group.throughput(Throughput::Elements(packets.len() as u64));

        group.bench_with_input(BenchmarkId::new("record_and_sweep", flows), &packets, |b, packets| {
            let aggregator = WindowedAggregator::default();
            b.iter(|| {
                for sample in packets {
                    aggregator.record(black_box(sample), 1, 20_000.0);
                }
                black_box(aggregator.sweep(0))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_aggregate);
criterion_main!(benches);
