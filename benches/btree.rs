use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;

use quadra::memstore::btree::Tree;

fn bench_set_sequential(c: &mut Criterion) {
    c.bench_function("btree_set_seq_10k", |b| {
        b.iter(|| {
            let mut t = Tree::new();
            for k in 0..10_000i64 {
                t.set(black_box(k), k as u64);
            }
            t
        })
    });
}

fn bench_set_random(c: &mut Criterion) {
    let mut keys: Vec<i64> = (0..10_000).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(1));
    c.bench_function("btree_set_rnd_10k", |b| {
        b.iter(|| {
            let mut t = Tree::new();
            for &k in &keys {
                t.set(black_box(k), k as u64);
            }
            t
        })
    });
}

fn bench_get(c: &mut Criterion) {
    let mut t = Tree::new();
    for k in 0..100_000i64 {
        t.set(k, k as u64);
    }
    let mut rng = StdRng::seed_from_u64(2);
    c.bench_function("btree_get_rnd", |b| {
        b.iter(|| {
            let k = rng.gen_range(0..100_000i64);
            black_box(t.get(k))
        })
    });
}

fn bench_enumerate(c: &mut Criterion) {
    let mut t = Tree::new();
    for k in 0..100_000i64 {
        t.set(k, k as u64);
    }
    c.bench_function("btree_enumerate_100k", |b| {
        b.iter(|| {
            let mut e = t.seek_first().expect("nonempty");
            let mut sum = 0i64;
            while let Some((k, _)) = e.next(&t) {
                sum += k;
            }
            black_box(sum)
        })
    });
}

criterion_group!(
    benches,
    bench_set_sequential,
    bench_set_random,
    bench_get,
    bench_enumerate
);
criterion_main!(benches);
