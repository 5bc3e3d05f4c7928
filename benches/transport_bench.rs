//! Benchmarks for the transport hot paths: packet encryption, the
//! fixed-size metadata codec, and segment tree churn.

use std::hint::black_box;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};

use shroud::crypto::{derive_key, select_decrypt, BlockCipher};
use shroud::protocol::{DataAckStruct, ProtocolType, Segment, SegmentTree};

fn bench_cipher(c: &mut Criterion) {
    let cipher = BlockCipher::new(derive_key("bench", "bench-password"));
    let payload = vec![0xAB; 1400];
    let wire = cipher.encrypt(&payload).unwrap();

    c.bench_function("cipher_encrypt_1400", |b| {
        b.iter(|| cipher.encrypt(black_box(&payload)).unwrap())
    });

    c.bench_function("cipher_decrypt_1400", |b| {
        b.iter(|| cipher.decrypt(black_box(&wire)).unwrap())
    });
}

fn bench_trial_decrypt(c: &mut Criterion) {
    let candidates: Vec<BlockCipher> = (0..8)
        .map(|i| BlockCipher::new(derive_key(&format!("user{i}"), "bench-password")))
        .collect();
    let wire = candidates[7].encrypt(&[0u8; 32]).unwrap();

    c.bench_function("trial_decrypt_8_candidates", |b| {
        b.iter(|| select_decrypt(black_box(&wire), &candidates).unwrap())
    });
}

fn bench_metadata_codec(c: &mut Criterion) {
    let metadata = DataAckStruct {
        protocol: ProtocolType::DataClientToServer,
        session_id: 0xDEADBEEF,
        seq: 12345,
        un_ack_seq: 12000,
        window_size: 32,
        prefix_len: 17,
        payload_len: 1380,
        suffix_len: 96,
    };
    let wire = metadata.marshal();

    c.bench_function("metadata_marshal", |b| b.iter(|| black_box(&metadata).marshal()));

    c.bench_function("metadata_unmarshal", |b| {
        b.iter(|| DataAckStruct::unmarshal(black_box(&wire)).unwrap())
    });
}

fn bench_segment_tree(c: &mut Criterion) {
    c.bench_function("segment_tree_insert_delete_64", |b| {
        let tree = SegmentTree::new(64);
        b.iter(|| {
            for seq in 0..64u32 {
                tree.insert(Segment::data(
                    ProtocolType::DataClientToServer,
                    1,
                    seq,
                    0,
                    0,
                    Bytes::from_static(&[0u8; 16]),
                ));
            }
            while tree.delete_min().is_some() {}
        })
    });
}

criterion_group!(
    benches,
    bench_cipher,
    bench_trial_decrypt,
    bench_metadata_codec,
    bench_segment_tree
);
criterion_main!(benches);
