//! Microbenchmarks: varint codec and posting skips

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use searchstore::blocks::{PosinfoBlock, PosinfoBlockBuilder};
use searchstore::codec;

fn bench_codec(c: &mut Criterion) {
    let values: Vec<u32> = (0..4096u32).map(|i| i.wrapping_mul(2654435761) >> 12).collect();
    c.bench_function("codec/pack_index", |b| {
        b.iter(|| {
            let mut buf = Vec::with_capacity(4096 * 4);
            for &v in &values {
                codec::pack_index(&mut buf, black_box(v));
            }
            buf
        })
    });

    let mut packed = Vec::new();
    for &v in &values {
        codec::pack_index(&mut packed, v);
    }
    c.bench_function("codec/unpack_index", |b| {
        b.iter(|| {
            let mut at = 0;
            let mut sum = 0u64;
            while at < packed.len() {
                let (v, n) = codec::unpack_index(&packed[at..]).unwrap();
                sum += v as u64;
                at += n;
            }
            sum
        })
    });

    let mut ascending = Vec::new();
    for i in 0..2000u32 {
        codec::pack_index(&mut ascending, 10 + i * 5);
    }
    c.bench_function("codec/find_upper_bound", |b| {
        b.iter(|| codec::find_index_upper_bound_asc(&ascending, black_box(7321)))
    });
}

fn bench_posinfo_skip(c: &mut Criterion) {
    let mut builder = PosinfoBlockBuilder::new();
    for d in 1..=2000u32 {
        builder.append(d * 3, &[1, 2, 5]).unwrap();
    }
    let blk: PosinfoBlock = builder.build().unwrap();

    c.bench_function("posinfo/skip_doc_sequential", |b| {
        b.iter(|| {
            let mut cursor = 0;
            let mut found = 0u64;
            let mut d = blk.skip_doc(1, &mut cursor);
            while d != 0 {
                found += 1;
                d = blk.skip_doc(d + 1, &mut cursor);
            }
            found
        })
    });

    c.bench_function("posinfo/skip_doc_random", |b| {
        let mut seed = 12345u32;
        b.iter(|| {
            let mut cursor = 0;
            seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
            let target = 1 + (seed % 6000);
            blk.skip_doc(black_box(target), &mut cursor)
        })
    });
}

criterion_group!(benches, bench_codec, bench_posinfo_skip);
criterion_main!(benches);
