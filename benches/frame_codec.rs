use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};

use confidential_tx_relay::frame::codec::FrameCodec;
use confidential_tx_relay::frame::{batch, Frame};
use confidential_tx_relay::ConfidentialTransaction;

fn bench_frame_encode_decode(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xABu8; 4096]);

    let mut group = c.benchmark_group("frame_codec");
    group.throughput(Throughput::Bytes(4096));

    group.bench_function("encode_4k", |b| {
        b.iter(|| {
            let frame = Frame::transactions(0, payload.clone());
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::with_capacity(4096 + 12);
            codec.encode(frame, &mut buf).unwrap();
            black_box(buf);
        })
    });

    group.bench_function("decode_4k", |b| {
        let mut encoded = BytesMut::new();
        FrameCodec::new()
            .encode(Frame::transactions(0, payload.clone()), &mut encoded)
            .unwrap();
        let encoded = encoded.freeze();

        b.iter(|| {
            let mut codec = FrameCodec::new();
            let mut buf = BytesMut::from(&encoded[..]);
            black_box(codec.decode(&mut buf).unwrap().unwrap());
        })
    });

    group.finish();
}

fn bench_batch_encode_decode(c: &mut Criterion) {
    // 256 transactions of 512 bytes, a busy relay frame.
    let txs: Vec<_> = (0..256u32)
        .map(|i| ConfidentialTransaction::new(Bytes::from(vec![i as u8; 512])))
        .collect();
    let total: usize = txs.iter().map(|tx| tx.len()).sum();

    let mut group = c.benchmark_group("batch_codec");
    group.throughput(Throughput::Bytes(total as u64));

    group.bench_function("encode_256x512", |b| {
        b.iter(|| {
            let mut buf = BytesMut::new();
            batch::encode(black_box(&txs), &mut buf);
            black_box(buf);
        })
    });

    group.bench_function("decode_256x512", |b| {
        let mut buf = BytesMut::new();
        batch::encode(&txs, &mut buf);
        let encoded = buf.freeze();

        b.iter(|| black_box(batch::decode(encoded.clone()).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode, bench_batch_encode_decode);
criterion_main!(benches);
