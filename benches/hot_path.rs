//! Per-packet hot path benchmarks

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sase_forwarder::config::FlowTableConfig;
use sase_forwarder::packet::build::{self, TcpSegment};
use sase_forwarder::packet::{checksum, parse, TcpFlags};
use sase_forwarder::FlowTable;

fn segment(src_port: u16, payload: &[u8]) -> Vec<u8> {
    build::tcp_segment(
        &TcpSegment {
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), src_port),
            dst: SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443),
            seq: 1,
            ack: 1,
            flags: TcpFlags::PSH | TcpFlags::ACK,
            window: 65535,
        },
        payload,
    )
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for size in [0usize, 64, 1400] {
        let packet = segment(40000, &vec![0xab; size]);
        group.throughput(Throughput::Bytes(packet.len() as u64));
        group.bench_with_input(BenchmarkId::new("tcp", size), &packet, |b, packet| {
            b.iter(|| parse(black_box(packet), packet.len()))
        });
    }
    group.finish();
}

fn bench_checksum(c: &mut Criterion) {
    let data = vec![0x5au8; 1460];
    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("internet_1460", |b| {
        b.iter(|| checksum::internet_checksum(black_box(&data)))
    });
    group.finish();
}

fn bench_flow_table(c: &mut Criterion) {
    let table = FlowTable::new(FlowTableConfig::default());
    let packets: Vec<_> = (0..1024u16)
        .map(|i| {
            let raw = segment(30000 + i, b"x");
            let parsed = parse(&raw, raw.len()).unwrap();
            (parsed, raw.len())
        })
        .collect();
    let now = Instant::now();

    let mut group = c.benchmark_group("flow_table");
    group.throughput(Throughput::Elements(packets.len() as u64));
    group.bench_function("process_1024_flows", |b| {
        b.iter(|| {
            for (packet, len) in &packets {
                black_box(table.process_at(packet, *len, now));
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_parse, bench_checksum, bench_flow_table);
criterion_main!(benches);
