//! Snowdrift decoding benchmarks.
//!
//! - Line splitting and record extraction throughput
//! - Event-stream unframing throughput

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio_util::codec::Decoder;

use snowdrift::decode::event_stream::{end_message, records_message};
use snowdrift::decode::{EventStreamDecoder, Extractor, LineDecoder, decode_chunks};

const CHUNK_SIZE: usize = 64 * 1024;

fn json_lines(count: usize) -> Vec<u8> {
    let sides = ["buy", "sell"];
    (0..count)
        .map(|i| {
            format!(
                r#"{{"id":"order_{i}","timestamp":{},"price":{:.2},"side":"{}"}}"#,
                1_700_000_000_000u64 + i as u64,
                100.0 + (i % 997) as f64 * 0.25,
                sides[i % 2]
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
        .into_bytes()
}

fn chunks(body: &[u8]) -> Vec<Bytes> {
    body.chunks(CHUNK_SIZE).map(Bytes::copy_from_slice).collect()
}

fn bench_line_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("line_decoding");

    for count in [1_000, 10_000] {
        let body = json_lines(count);
        let input = chunks(&body);
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(BenchmarkId::new("raw", count), &input, |b, input| {
            b.iter(|| decode_chunks(input.iter().cloned(), LineDecoder::new(["\n"], Extractor::Raw)))
        });

        group.bench_with_input(BenchmarkId::new("json", count), &input, |b, input| {
            b.iter(|| {
                decode_chunks(input.iter().cloned(), LineDecoder::new(["\n"], Extractor::Json))
            })
        });
    }

    group.finish();
}

fn bench_frame_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decoding");

    for count in [1_000, 10_000] {
        let payload = json_lines(count);
        let mut body = BytesMut::new();
        for piece in payload.chunks(CHUNK_SIZE) {
            body.extend_from_slice(&records_message(piece));
        }
        body.extend_from_slice(&end_message());
        let body = body.freeze();
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(BenchmarkId::new("records", count), &body, |b, body| {
            b.iter(|| {
                let mut decoder = EventStreamDecoder::new();
                let mut buffer = BytesMut::from(&body[..]);
                let mut payload_bytes = 0;
                while let Ok(Some(piece)) = decoder.decode_eof(&mut buffer) {
                    payload_bytes += piece.len();
                }
                payload_bytes
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_line_decoding, bench_frame_decoding);
criterion_main!(benches);
