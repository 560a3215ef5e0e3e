use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use tempora::{Archive, ArchiveConfig, Error, Result, Tuple, DEFAULT_CONTEXT};

const PROPERTY: &str = "http://example.org/value";

fn batch(writer: i64, round: i64) -> Vec<Tuple> {
    (0..20)
        .map(|i| {
            let item = format!("http://example.org/item/{}", i % 4);
            Tuple::new(&item, PROPERTY, DEFAULT_CONTEXT, 1_000 + round * 100 + i, writer as i32, round)
        })
        .collect()
}

#[test]
fn test_readers_never_observe_partial_batches() {
    let dir = tempdir().unwrap();
    let archive = Arc::new(Archive::open(ArchiveConfig::new(dir.path())).unwrap());

    thread::scope(|scope| {
        for writer in 0..2 {
            let archive = Arc::clone(&archive);
            scope.spawn(move || {
                for round in 0..10 {
                    archive.put(batch(writer, round)).unwrap();
                }
            });
        }
        for _ in 0..3 {
            let archive = Arc::clone(&archive);
            scope.spawn(move || {
                for _ in 0..20 {
                    let tuples: Vec<Tuple> =
                        archive.fetch("http://example.org/item/0", None, None, 0).unwrap().collect::<Result<_>>().unwrap();
                    // every batch contributes exactly five tuples for item 0
                    assert_eq!(tuples.len() % 5, 0);
                    assert!(tuples.windows(2).all(|w| (w[0].time, w[0].seq_nr) <= (w[1].time, w[1].seq_nr)));
                }
            });
        }
    });

    let total: usize = (0..4)
        .map(|i| archive.fetch(&format!("http://example.org/item/{}", i), None, None, 0).unwrap().count())
        .sum();
    assert_eq!(total, 2 * 10 * 20);
}

#[test]
fn test_lock_timeout_on_contended_permit() {
    let dir = tempdir().unwrap();
    let mut config = ArchiveConfig::new(dir.path());
    config.lock_timeout_ms = Some(50);
    let archive = Arc::new(Archive::open(config).unwrap());
    archive.put(batch(0, 0)).unwrap();

    let reader = archive.fetch("http://example.org/item/1", None, None, 0).unwrap();
    let contender = Arc::clone(&archive);
    let result = thread::spawn(move || contender.put(batch(1, 1))).join().unwrap();
    assert!(matches!(result, Err(Error::LockTimeout(_))));
    assert_eq!(reader.count(), 5);

    archive.put(batch(1, 1)).unwrap();
    assert_eq!(archive.fetch("http://example.org/item/1", None, None, 0).unwrap().count(), 10);
}

#[test]
fn test_nested_reads_proceed_while_writer_waits() {
    let dir = tempdir().unwrap();
    let archive = Arc::new(Archive::open(ArchiveConfig::new(dir.path())).unwrap());
    archive.put(batch(0, 0)).unwrap();

    let item = "http://example.org/item/2";
    let properties = archive.properties(item).unwrap();

    let (started, waiting) = std::sync::mpsc::channel();
    let writer = {
        let archive = Arc::clone(&archive);
        thread::spawn(move || {
            started.send(()).unwrap();
            archive.put(batch(1, 1))
        })
    };
    waiting.recv().unwrap();
    thread::sleep(Duration::from_millis(100));

    // the writer is parked behind `properties`; a second read on this thread must not queue behind it
    for property in properties {
        let property = property.unwrap();
        assert_eq!(archive.fetch(item, Some(&property), None, 0).unwrap().count(), 5);
    }

    writer.join().unwrap().unwrap();
    assert_eq!(archive.fetch(item, None, None, 0).unwrap().count(), 10);
}
