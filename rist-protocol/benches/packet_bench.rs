use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rist_protocol::loss::LossRange;
use rist_protocol::nack::{NackInfo, NackMode};
use rist_protocol::packet::{ControlPacket, DataPacket, Packet};
use rist_protocol::sequence::SeqNumber;

fn data_packet() -> DataPacket {
    // Seven TS packets, the usual payload size
    DataPacket::new(0x1234_5678, SeqNumber::new(1000), 9999, Bytes::from(vec![0u8; 1316]))
        .with_ports(1971, 1968)
}

fn bench_data_packet(c: &mut Criterion) {
    let packet = data_packet();
    let bytes = packet.to_bytes().freeze();

    let mut group = c.benchmark_group("data_packet");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("serialize", |b| {
        b.iter(|| black_box(black_box(&packet).to_bytes()));
    });

    group.bench_function("deserialize", |b| {
        b.iter(|| black_box(Packet::from_bytes(black_box(bytes.clone()))));
    });

    group.finish();
}

fn bench_nack_codec(c: &mut Criterion) {
    let ranges: Vec<LossRange> = (0..32u32)
        .map(|i| LossRange::new(SeqNumber::new(i * 40), SeqNumber::new(i * 40 + 3)))
        .collect();
    let info = NackInfo::new(ranges);

    let mut group = c.benchmark_group("nack");
    for mode in [NackMode::Range, NackMode::Bitmask] {
        let body = info.encode(mode);
        group.bench_function(format!("encode_{:?}", mode), |b| {
            b.iter(|| black_box(black_box(&info).encode(mode)));
        });
        group.bench_function(format!("decode_{:?}", mode), |b| {
            b.iter(|| black_box(NackInfo::decode(mode, black_box(&body))));
        });
    }
    group.finish();

    let packet = ControlPacket::nack(1, 0, &info, NackMode::Range);
    c.bench_function("nack_packet_serialize", |b| {
        b.iter(|| black_box(black_box(&packet).to_bytes()));
    });
}

fn bench_seq_number_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_number");

    group.bench_function("increment", |b| {
        let mut seq = SeqNumber::new(1000);
        b.iter(|| {
            seq.increment();
            black_box(&seq);
        });
    });

    group.bench_function("distance", |b| {
        let lo = SeqNumber::new(u32::MAX - 10);
        let hi = SeqNumber::new(20);
        b.iter(|| black_box(black_box(lo).distance_to(black_box(hi))));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_data_packet,
    bench_nack_codec,
    bench_seq_number_ops
);
criterion_main!(benches);
