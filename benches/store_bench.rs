use burrow::store::{Options, Store};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

fn bench_store(c: &mut Criterion) {
    let root = TempDir::new().unwrap();
    let store = Store::create(
        &root.path().join("data"),
        &root.path().join("journal"),
        &root.path().join("meta"),
        Options { block_size: 1 << 24 },
    )
    .unwrap();

    let mut i = 0u64;
    c.bench_function("set_64b_value", |b| {
        b.iter(|| {
            i += 1;
            store.set(black_box(&i.to_le_bytes()), black_box(&[0u8; 64])).unwrap();
        })
    });

    store.set(b"probe", &[1u8; 64]).unwrap();
    c.bench_function("get_64b_value", |b| {
        b.iter(|| store.get(black_box(b"probe")).unwrap())
    });
}

criterion_group!(benches, bench_store);
criterion_main!(benches);
