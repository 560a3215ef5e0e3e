use criterion::{criterion_group, criterion_main, Criterion};
use tempora::{Archive, ArchiveConfig, Tuple, DEFAULT_CONTEXT};
use tempfile::{tempdir, TempDir};

const BASE_TIME: i64 = 1_704_067_200;
const WEEK: i64 = 7 * 24 * 3600;

/// Ten weekly batches of 100 sensors, each reporting two properties every ten minutes.
fn populated_archive() -> (TempDir, Archive) {
    let dir = tempdir().unwrap();
    let archive = Archive::open(ArchiveConfig::new(dir.path())).unwrap();
    for week in 0..10i64 {
        let mut batch = Vec::new();
        for step in 0..100i64 {
            let time = BASE_TIME + week * WEEK + step * 600;
            for sensor in 0..100 {
                let item = format!("http://example.org/sensor/{}", sensor);
                batch.push(Tuple::new(&item, "http://example.org/temperature", DEFAULT_CONTEXT, time, 0, 20.0 + step as f64 / 10.0));
                batch.push(Tuple::new(&item, "http://example.org/humidity", DEFAULT_CONTEXT, time, 1, 40i64 + step));
            }
        }
        archive.put(batch).unwrap();
    }
    (dir, archive)
}

fn bench_fetch(c: &mut Criterion) {
    let (_dir, archive) = populated_archive();
    let item = "http://example.org/sensor/42";

    c.bench_function("fetch_item", |b| {
        b.iter(|| archive.fetch(item, None, None, 0).unwrap().count());
    });
    c.bench_function("fetch_property_limit_10", |b| {
        b.iter(|| archive.fetch(item, Some("http://example.org/temperature"), None, 10).unwrap().count());
    });
    c.bench_function("fetch_range_hourly_avg", |b| {
        b.iter(|| {
            archive
                .fetch_range(item, Some("http://example.org/temperature"), None, 0, 0, 0, 3600, Some("avg"))
                .unwrap()
                .count()
        });
    });
    c.bench_function("properties", |b| {
        b.iter(|| archive.properties(item).unwrap().count());
    });
}

criterion_group!(benches, bench_fetch);
criterion_main!(benches);
