//! Read path: pruned, merged and limited iteration over committed rows.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLockReadGuard;
use tracing::debug;

use crate::core::encoding::{time_filter, KeyPattern};
use crate::core::Tuple;
use crate::error::{Error, Result};
use crate::storage::indexing::dictionary::{IdRegistry, Namespace, UNKNOWN_ID};
use crate::storage::layout::{ArchiveLayout, PartitionGroup};
use crate::storage::rows::TupleRow;
use crate::storage::table::{Filter, FooterCache, TableScan};

/// Parameters of a raw fetch. Time bounds are `begin <= time < end`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchRequest<'q> {
    pub item: &'q str,
    pub property: Option<&'q str>,
    pub context: Option<&'q str>,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    /// Maximum rows per run of one property; 0 for no limit
    pub limit: usize,
}

struct HeapEntry {
    time: i64,
    seq_nr: i32,
    source: usize,
    row: TupleRow,
}

impl HeapEntry {
    fn sort_key(&self) -> (i64, i32, usize) {
        (self.time, self.seq_nr, self.source)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// K-way merge of the files of one partition group on (time, seq_nr).
///
/// Holds at most one buffered row per file. Ties go to the earlier file.
struct MergeReader {
    scans: Vec<TableScan<TupleRow>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl MergeReader {
    fn open(files: &[PathBuf], cache: &FooterCache, filter: &Arc<Filter>) -> Result<Self> {
        let mut reader = Self { scans: Vec::with_capacity(files.len()), heap: BinaryHeap::new() };
        for path in files {
            reader.scans.push(TableScan::open(path, cache, Arc::clone(filter))?);
        }
        for source in 0..reader.scans.len() {
            reader.refill(source)?;
        }
        Ok(reader)
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some(row) = self.scans[source].next().transpose()? {
            self.heap.push(Reverse(HeapEntry { time: row.time, seq_nr: row.seq_nr, source, row }));
        }
        Ok(())
    }

    fn next_row(&mut self) -> Result<Option<TupleRow>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(entry.source)?;
        Ok(Some(entry.row))
    }
}

/// Tuples of one item, group by group, newest partition first.
///
/// Owns the shared archive permit until dropped. After an error the
/// iterator is exhausted.
pub struct FetchIter<'a> {
    _permit: RwLockReadGuard<'a, ()>,
    registry: &'a IdRegistry,
    file_cache: &'a FooterCache,
    filter: Arc<Filter>,
    groups: VecDeque<PartitionGroup>,
    current: Option<MergeReader>,
    item: String,
    context: Option<String>,
    limit: usize,
    last_property: Option<u64>,
    emitted: usize,
    done: bool,
}

impl<'a> FetchIter<'a> {
    pub(crate) fn new(
        permit: RwLockReadGuard<'a, ()>,
        layout: &ArchiveLayout,
        registry: &'a IdRegistry,
        file_cache: &'a FooterCache,
        request: &FetchRequest<'_>,
    ) -> Result<Self> {
        let mut iter = Self {
            _permit: permit,
            registry,
            file_cache,
            filter: Arc::new(Filter::All),
            groups: VecDeque::new(),
            current: None,
            item: request.item.to_string(),
            context: request.context.map(str::to_string),
            limit: request.limit,
            last_property: None,
            emitted: 0,
            done: false,
        };

        let item = registry.resolve(Namespace::Item, request.item)?;
        let property = resolve_optional(registry, Namespace::Property, request.property)?;
        let context = resolve_optional(registry, Namespace::Context, request.context)?;
        let (Some(property), Some(context)) = (property, context) else {
            debug!(item = request.item, "unknown property or context");
            return Ok(iter);
        };
        if item == UNKNOWN_ID {
            debug!(item = request.item, "unknown item");
            return Ok(iter);
        }

        let pattern = KeyPattern::new(item, property, context);
        iter.filter = Arc::new(pattern.filter().and(time_filter(request.begin, request.end)));
        iter.groups = layout.prune_candidates(item).into();
        Ok(iter)
    }

    fn fail(&mut self, error: Error) -> Option<Result<Tuple>> {
        self.done = true;
        self.current = None;
        Some(Err(error))
    }

    fn materialize(&self, row: TupleRow) -> Result<Tuple> {
        let (_, property_id, context_id) = row.ids();
        let property = self
            .registry
            .lookup(Namespace::Property, property_id)?
            .ok_or(Error::MissingMapping { namespace: Namespace::Property.name(), id: property_id })?;
        let context = match &self.context {
            Some(context) => context.clone(),
            None => self
                .registry
                .lookup(Namespace::Context, context_id)?
                .ok_or(Error::MissingMapping { namespace: Namespace::Context.name(), id: context_id })?,
        };
        let value = row.value()?.ok_or_else(|| Error::Codec("row without a value".to_string()))?;
        Ok(Tuple { item: self.item.clone(), property, context, time: row.time, seq_nr: row.seq_nr, value })
    }
}

/// `Some(None)` leaves the slot open, `None` means a given URI is unknown.
fn resolve_optional(registry: &IdRegistry, namespace: Namespace, uri: Option<&str>) -> Result<Option<Option<u64>>> {
    Ok(match uri {
        None => Some(None),
        Some(uri) => match registry.resolve(namespace, uri)? {
            UNKNOWN_ID => None,
            id => Some(Some(id)),
        },
    })
}

impl Iterator for FetchIter<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.current.is_none() {
                let Some(group) = self.groups.pop_front() else {
                    self.done = true;
                    return None;
                };
                debug!(year = group.key.year, week = group.key.week, files = group.files.len(), "reading partition");
                match MergeReader::open(&group.files, self.file_cache, &self.filter) {
                    Ok(reader) => self.current = Some(reader),
                    Err(e) => return self.fail(e),
                }
            }
            let Some(reader) = self.current.as_mut() else {
                continue;
            };
            let row = match reader.next_row() {
                Ok(Some(row)) => row,
                Ok(None) => {
                    self.current = None;
                    continue;
                }
                Err(e) => return self.fail(e),
            };

            let property = row.property_id();
            if self.last_property != Some(property) {
                self.last_property = Some(property);
                self.emitted = 0;
            }
            if self.limit > 0 && self.emitted >= self.limit {
                continue;
            }
            self.emitted += 1;
            return match self.materialize(row) {
                Ok(tuple) => Some(Ok(tuple)),
                Err(e) => self.fail(e),
            };
        }
    }
}

/// Distinct property URIs of an item in ascending id order.
///
/// Each step scans the candidate files for the smallest property id at or
/// above the previous one plus one.
pub struct PropertyIter<'a> {
    _permit: RwLockReadGuard<'a, ()>,
    registry: &'a IdRegistry,
    file_cache: &'a FooterCache,
    item: u64,
    files: Vec<PathBuf>,
    lower: Option<u64>,
}

impl<'a> PropertyIter<'a> {
    pub(crate) fn new(
        permit: RwLockReadGuard<'a, ()>,
        layout: &ArchiveLayout,
        registry: &'a IdRegistry,
        file_cache: &'a FooterCache,
        item: &str,
    ) -> Result<Self> {
        let item = registry.resolve(Namespace::Item, item)?;
        let files = if item == UNKNOWN_ID {
            Vec::new()
        } else {
            layout.prune_candidates(item).into_iter().flat_map(|g| g.files).collect()
        };
        Ok(Self { _permit: permit, registry, file_cache, item, files, lower: Some(UNKNOWN_ID + 1) })
    }

    fn smallest_from(&self, lower: u64) -> Result<Option<u64>> {
        let filter = Arc::new(KeyPattern::properties_from(self.item, lower));
        let mut best: Option<u64> = None;
        for path in &self.files {
            for row in TableScan::<TupleRow>::open(path, self.file_cache, Arc::clone(&filter))? {
                let property = row?.property_id();
                if best.map_or(true, |b| property < b) {
                    best = Some(property);
                }
                if property == lower {
                    return Ok(best);
                }
            }
        }
        Ok(best)
    }
}

impl Iterator for PropertyIter<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let lower = self.lower?;
        let found = match self.smallest_from(lower) {
            Ok(found) => found,
            Err(e) => {
                self.lower = None;
                return Some(Err(e));
            }
        };
        let Some(property) = found else {
            self.lower = None;
            return None;
        };
        self.lower = property.checked_add(1);
        Some(self.registry.lookup(Namespace::Property, property).and_then(|uri| {
            uri.ok_or(Error::MissingMapping { namespace: Namespace::Property.name(), id: property })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Value, DEFAULT_CONTEXT};
    use crate::storage::ingest::ingest;
    use parking_lot::RwLock;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        lock: RwLock<()>,
        cache: Arc<FooterCache>,
        layout: ArchiveLayout,
        registry: IdRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let cache = Arc::new(FooterCache::new(32));
            let layout = ArchiveLayout::open(dir.path(), Arc::clone(&cache), 4).unwrap();
            let registry = IdRegistry::open(&dir.path().join("metadata"), Arc::clone(&cache), 64, 4).unwrap();
            Self { _dir: dir, lock: RwLock::new(()), cache, layout, registry }
        }

        fn put(&self, tuples: Vec<Tuple>) {
            ingest(&self.layout, &self.registry, tuples).unwrap();
        }

        fn fetch(&self, request: FetchRequest<'_>) -> Vec<Tuple> {
            FetchIter::new(self.lock.read(), &self.layout, &self.registry, &self.cache, &request)
                .unwrap()
                .collect::<Result<Vec<_>>>()
                .unwrap()
        }

        fn properties(&self, item: &str) -> Vec<String> {
            PropertyIter::new(self.lock.read(), &self.layout, &self.registry, &self.cache, item)
                .unwrap()
                .collect::<Result<Vec<_>>>()
                .unwrap()
        }
    }

    fn times(tuples: &[Tuple]) -> Vec<(i64, i32)> {
        tuples.iter().map(|t| (t.time, t.seq_nr)).collect()
    }

    #[test]
    fn test_merge_across_batches_is_ordered() {
        let fx = Fixture::new();
        fx.put(vec![
            Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 10, 0, 1),
            Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 30, 0, 3),
        ]);
        fx.put(vec![
            Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 10, 1, 4),
            Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 20, 0, 2),
            Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 40, 0, 5),
        ]);

        let rows = fx.fetch(FetchRequest { item: "ex:s", ..Default::default() });
        assert_eq!(times(&rows), vec![(10, 0), (10, 1), (20, 0), (30, 0), (40, 0)]);
        let merged = fx.fetch(FetchRequest { item: "ex:s", begin: Some(15), ..Default::default() });
        assert_eq!(times(&merged), vec![(20, 0), (30, 0), (40, 0)]);
    }

    #[test]
    fn test_equal_times_break_ties_by_seq_nr_then_file() {
        let fx = Fixture::new();
        fx.put(vec![Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 10, 2, "b1")]);
        fx.put(vec![Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 10, 1, "a")]);
        fx.put(vec![Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 10, 2, "b3")]);

        let values: Vec<Value> = fx.fetch(FetchRequest { item: "ex:s", ..Default::default() }).into_iter().map(|t| t.value).collect();
        assert_eq!(values, vec![Value::from("a"), Value::from("b1"), Value::from("b3")]);
    }

    #[test]
    fn test_limit_applies_per_property_run() {
        let fx = Fixture::new();
        let mut tuples = Vec::new();
        for i in 0..10 {
            tuples.push(Tuple::new("ex:s", "ex:a", DEFAULT_CONTEXT, i, 0, i));
        }
        for i in 10..15 {
            tuples.push(Tuple::new("ex:s", "ex:b", DEFAULT_CONTEXT, i, 0, i));
        }
        fx.put(tuples);

        let rows = fx.fetch(FetchRequest { item: "ex:s", limit: 3, ..Default::default() });
        let properties: Vec<&str> = rows.iter().map(|t| t.property.as_str()).collect();
        assert_eq!(properties, vec!["ex:a", "ex:a", "ex:a", "ex:b", "ex:b", "ex:b"]);
        assert_eq!(times(&rows), vec![(0, 0), (1, 0), (2, 0), (10, 0), (11, 0), (12, 0)]);
    }

    #[test]
    fn test_key_patterns() {
        let fx = Fixture::new();
        fx.put(vec![
            Tuple::new("ex:s", "ex:a", "ex:c1", 1, 0, 1),
            Tuple::new("ex:s", "ex:a", "ex:c2", 2, 0, 2),
            Tuple::new("ex:s", "ex:b", "ex:c1", 3, 0, 3),
            Tuple::new("ex:t", "ex:a", "ex:c1", 4, 0, 4),
        ]);

        let exact = fx.fetch(FetchRequest { item: "ex:s", property: Some("ex:a"), context: Some("ex:c2"), ..Default::default() });
        assert_eq!(times(&exact), vec![(2, 0)]);

        let by_property = fx.fetch(FetchRequest { item: "ex:s", property: Some("ex:a"), ..Default::default() });
        assert_eq!(times(&by_property), vec![(1, 0), (2, 0)]);
        assert_eq!(by_property[1].context, "ex:c2");

        let by_context = fx.fetch(FetchRequest { item: "ex:s", context: Some("ex:c1"), ..Default::default() });
        assert_eq!(times(&by_context), vec![(1, 0), (3, 0)]);
        assert!(by_context.iter().all(|t| t.context == "ex:c1" && t.item == "ex:s"));

        assert!(fx.fetch(FetchRequest { item: "ex:s", property: Some("ex:zzz"), ..Default::default() }).is_empty());
        assert!(fx.fetch(FetchRequest { item: "ex:s", context: Some("ex:zzz"), ..Default::default() }).is_empty());
        assert!(fx.fetch(FetchRequest { item: "ex:nobody", ..Default::default() }).is_empty());
    }

    #[test]
    fn test_groups_are_read_newest_first() {
        let fx = Fixture::new();
        let week = 7 * 24 * 3600;
        fx.put(vec![
            Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 1_704_067_200, 0, 1),
            Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 1_704_067_200 + week, 0, 2),
            Tuple::new("ex:s", "ex:p", DEFAULT_CONTEXT, 1_704_067_200 + 2 * week, 0, 3),
        ]);
        let values: Vec<Value> = fx.fetch(FetchRequest { item: "ex:s", ..Default::default() }).into_iter().map(|t| t.value).collect();
        assert_eq!(values, vec![Value::Int(3), Value::Int(2), Value::Int(1)]);
    }

    #[test]
    fn test_properties_in_id_order() {
        let fx = Fixture::new();
        fx.put(vec![
            Tuple::new("ex:s", "ex:first", DEFAULT_CONTEXT, 1, 0, 1),
            Tuple::new("ex:t", "ex:other", DEFAULT_CONTEXT, 1, 0, 1),
        ]);
        fx.put(vec![
            Tuple::new("ex:s", "ex:third", DEFAULT_CONTEXT, 2, 0, 1),
            Tuple::new("ex:s", "ex:first", DEFAULT_CONTEXT, 3, 0, 1),
        ]);

        assert_eq!(fx.properties("ex:s"), vec!["ex:first", "ex:third"]);
        assert_eq!(fx.properties("ex:t"), vec!["ex:other"]);
        assert!(fx.properties("ex:unknown").is_empty());
    }
}
