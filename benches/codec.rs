use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};

use veilport::{Frame, PacketBuilder, PacketParser};

fn bench_frame_codec(c: &mut Criterion) {
    let frame = Frame::Data {
        sequence: 42,
        payload: Bytes::from(vec![0xA5u8; 1200]),
    };
    let encoded = frame.encode().expect("encode");

    c.bench_function("frame_encode_1200", |b| b.iter(|| frame.encode().unwrap()));
    c.bench_function("frame_decode_1200", |b| {
        b.iter(|| veilport::frame::decode(&encoded).unwrap())
    });
}

fn bench_packet_seal_open(c: &mut Criterion) {
    let key = [0x42u8; 32];
    let base = [0x17u8; 12];

    let mut builder = PacketBuilder::new(1400);
    builder.set_keys(key, base);
    builder.set_session_id(7);
    let mut parser = PacketParser::new();
    parser.set_keys(key, base);

    let frame = Frame::Data {
        sequence: 1,
        payload: Bytes::from(vec![0x5Au8; 1200]),
    };

    c.bench_function("packet_seal_1200", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            builder.add_frame(&frame).unwrap();
            counter += 1;
            builder.build(counter).unwrap()
        })
    });

    builder.add_frame(&frame).unwrap();
    let packet = builder.build(1).unwrap();
    c.bench_function("packet_open_1200", |b| b.iter(|| parser.parse(&packet).unwrap()));
}

criterion_group!(benches, bench_frame_codec, bench_packet_seal_open);
criterion_main!(benches);
