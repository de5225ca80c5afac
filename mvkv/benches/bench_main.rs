use criterion::{criterion_group, criterion_main, Criterion};

use mvkv::store::StoreBuilder;
use mvkv::Value;

fn bench_put(c: &mut Criterion) {
    let dir = tempdir::TempDir::new("mvkv-bench").unwrap();
    let store = StoreBuilder::new()
        .file_name(dir.path().join("bench.mv"))
        .write_delay(0)
        .open()
        .unwrap();
    let map = store.open_map("bench").unwrap();

    let mut i = 0i64;
    c.bench_function("put", |b| {
        b.iter(|| {
            map.put(Value::Long(i % 10_000), Value::Long(i)).unwrap();
            i += 1;
        })
    });
}

fn bench_get(c: &mut Criterion) {
    let dir = tempdir::TempDir::new("mvkv-bench").unwrap();
    let store = StoreBuilder::new()
        .file_name(dir.path().join("bench.mv"))
        .write_delay(0)
        .open()
        .unwrap();
    let map = store.open_map("bench").unwrap();
    for i in 0..10_000i64 {
        map.put(Value::Long(i), Value::Long(i)).unwrap();
    }
    store.commit().unwrap();

    let mut i = 0i64;
    c.bench_function("get", |b| {
        b.iter(|| {
            map.get(&Value::Long(i % 10_000)).unwrap();
            i += 1;
        })
    });
}

fn bench_commit(c: &mut Criterion) {
    let dir = tempdir::TempDir::new("mvkv-bench").unwrap();
    let store = StoreBuilder::new()
        .file_name(dir.path().join("bench.mv"))
        .write_delay(0)
        .retention_time(0)
        .open()
        .unwrap();
    let map = store.open_map("bench").unwrap();

    let mut i = 0i64;
    c.bench_function("commit 100 entries", |b| {
        b.iter(|| {
            for _ in 0..100 {
                map.put(Value::Long(i % 1_000), Value::Long(i)).unwrap();
                i += 1;
            }
            store.commit().unwrap();
        })
    });
}

criterion_group!(benches, bench_put, bench_get, bench_commit);
criterion_main!(benches);
