//! Identifier registry: dense u64 ids for item, property and context URIs.
//!
//! Each namespace keeps its own counter and its own set of append-only mapping
//! files (`metadata/<namespace>_mapping__<seq>`). The full index of a namespace
//! is the union of its files. Lookups in either direction go through bounded
//! LRU caches and fall back to scanning the mapping files.

use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::rows::{MappingRow, ID_COLUMN, VALUE_COLUMN};
use crate::storage::table::{Filter, FooterCache, Literal, TableScan, TableWriter};

/// Sentinel returned for URIs that have no id. Never assigned.
pub const UNKNOWN_ID: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Item,
    Property,
    Context,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Item, Namespace::Property, Namespace::Context];

    pub fn name(self) -> &'static str {
        match self {
            Namespace::Item => "item",
            Namespace::Property => "property",
            Namespace::Context => "context",
        }
    }

    fn index(self) -> usize {
        match self {
            Namespace::Item => 0,
            Namespace::Property => 1,
            Namespace::Context => 2,
        }
    }

    fn file_prefix(self) -> String {
        format!("{}_mapping__", self.name())
    }
}

struct NamespaceIndex {
    namespace: Namespace,
    counter: AtomicU64,
    /// Mapping files ordered by sequence number.
    files: RwLock<Vec<(u64, PathBuf)>>,
    forward: Mutex<LruCache<String, u64>>,
    reverse: Mutex<LruCache<u64, String>>,
}

pub struct IdRegistry {
    metadata_dir: PathBuf,
    file_cache: Arc<FooterCache>,
    rows_per_block: usize,
    namespaces: [NamespaceIndex; 3],
}

impl IdRegistry {
    /// Opens the registry stored under `metadata_dir`.
    ///
    /// Counters resume from the largest id recorded in each namespace's mapping files.
    pub fn open(
        metadata_dir: &Path,
        file_cache: Arc<FooterCache>,
        cache_capacity: usize,
        rows_per_block: usize,
    ) -> Result<Self> {
        fs::create_dir_all(metadata_dir)?;
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);

        let mut listed = list_mapping_files(metadata_dir)?;
        let mut load = |namespace: Namespace| -> Result<NamespaceIndex> {
            let files = listed.remove(&namespace).unwrap_or_default();
            let mut max_id = UNKNOWN_ID;
            for (_, path) in &files {
                let footer = file_cache.footer(path)?;
                if let Some((_, Literal::UInt(max))) = footer.column_range(ID_COLUMN) {
                    max_id = max_id.max(max);
                }
            }
            debug!(namespace = namespace.name(), files = files.len(), max_id, "loaded mapping files");
            Ok(NamespaceIndex {
                namespace,
                counter: AtomicU64::new(max_id),
                files: RwLock::new(files),
                forward: Mutex::new(LruCache::new(capacity)),
                reverse: Mutex::new(LruCache::new(capacity)),
            })
        };
        let namespaces = [load(Namespace::Item)?, load(Namespace::Property)?, load(Namespace::Context)?];

        info!(
            items = namespaces[0].counter.load(Ordering::SeqCst),
            properties = namespaces[1].counter.load(Ordering::SeqCst),
            contexts = namespaces[2].counter.load(Ordering::SeqCst),
            "identifier registry opened"
        );
        Ok(Self { metadata_dir: metadata_dir.to_path_buf(), file_cache, rows_per_block, namespaces })
    }

    fn index(&self, namespace: Namespace) -> &NamespaceIndex {
        &self.namespaces[namespace.index()]
    }

    /// Id of `uri`, or [`UNKNOWN_ID`] when it was never interned.
    pub fn resolve(&self, namespace: Namespace, uri: &str) -> Result<u64> {
        let index = self.index(namespace);
        if let Some(id) = index.forward.lock().get(uri) {
            return Ok(*id);
        }
        let filter = Filter::Eq(VALUE_COLUMN, Literal::Str(uri.to_string()));
        match self.find(index, filter)? {
            Some(mapping) => {
                self.remember(index, mapping.id, &mapping.value);
                Ok(mapping.id)
            }
            None => Ok(UNKNOWN_ID),
        }
    }

    /// URI of `id`, or `None` when no mapping file records it.
    pub fn lookup(&self, namespace: Namespace, id: u64) -> Result<Option<String>> {
        let index = self.index(namespace);
        if let Some(uri) = index.reverse.lock().get(&id) {
            return Ok(Some(uri.clone()));
        }
        match self.find(index, Filter::Eq(ID_COLUMN, Literal::UInt(id)))? {
            Some(mapping) => {
                self.remember(index, mapping.id, &mapping.value);
                Ok(Some(mapping.value))
            }
            None => Ok(None),
        }
    }

    /// Raises the counter of `namespace` so the next id is above `floor`.
    pub fn reserve_through(&self, namespace: Namespace, floor: u64) {
        let previous = self.index(namespace).counter.fetch_max(floor, Ordering::SeqCst);
        if previous < floor {
            warn!(namespace = namespace.name(), previous, floor, "ids in use without a mapping, counter raised");
        }
    }

    /// Largest id handed out so far in `namespace`.
    pub fn max_id(&self, namespace: Namespace) -> u64 {
        self.index(namespace).counter.load(Ordering::SeqCst)
    }

    pub fn mapping_files(&self, namespace: Namespace) -> Vec<PathBuf> {
        self.index(namespace).files.read().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Starts assigning ids for one ingest batch.
    pub fn begin_session(&self) -> IngestSession<'_> {
        IngestSession { registry: self, assigned: Default::default(), pending: Default::default() }
    }

    pub fn clear_caches(&self) {
        for index in &self.namespaces {
            index.forward.lock().clear();
            index.reverse.lock().clear();
        }
    }

    fn remember(&self, index: &NamespaceIndex, id: u64, uri: &str) {
        index.forward.lock().put(uri.to_string(), id);
        index.reverse.lock().put(id, uri.to_string());
    }

    fn find(&self, index: &NamespaceIndex, filter: Filter) -> Result<Option<MappingRow>> {
        let files = index.files.read().clone();
        let filter = Arc::new(filter);
        for (_, path) in &files {
            let mut scan = TableScan::<MappingRow>::open(path, &self.file_cache, Arc::clone(&filter))?;
            if let Some(row) = scan.next() {
                return row.map(Some);
            }
        }
        Ok(None)
    }

    fn allocate(&self, namespace: Namespace) -> u64 {
        self.index(namespace).counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Moves a finished staged mapping file into the metadata directory under
    /// the next unused sequence number of its namespace.
    fn install(&self, namespace: Namespace, staged: &Path) -> Result<PathBuf> {
        let index = self.index(namespace);
        let mut files = index.files.write();
        let mut seq = files.last().map_or(0, |(seq, _)| *seq) + 1;
        let mut target = self.metadata_dir.join(format!("{}{}", namespace.file_prefix(), seq));
        while target.exists() {
            seq += 1;
            target = self.metadata_dir.join(format!("{}{}", namespace.file_prefix(), seq));
        }
        fs::rename(staged, &target)?;
        files.push((seq, target.clone()));
        Ok(target)
    }
}

fn list_mapping_files(metadata_dir: &Path) -> Result<HashMap<Namespace, Vec<(u64, PathBuf)>>> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^(item|property|context)_mapping__(\d+)$").expect("valid mapping file pattern"));
    let mut files: HashMap<Namespace, Vec<(u64, PathBuf)>> = HashMap::new();
    for entry in fs::read_dir(metadata_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(captures) = name.to_str().and_then(|n| pattern.captures(n)) else {
            continue;
        };
        let namespace = match &captures[1] {
            "item" => Namespace::Item,
            "property" => Namespace::Property,
            _ => Namespace::Context,
        };
        let Ok(seq) = captures[2].parse::<u64>() else {
            continue;
        };
        files.entry(namespace).or_default().push((seq, entry.path()));
    }
    for list in files.values_mut() {
        list.sort_by_key(|(seq, _)| *seq);
    }
    Ok(files)
}

/// Id assignment for one ingest batch.
///
/// Ids are allocated eagerly from the registry counters; the mappings become
/// visible to readers when [`IngestSession::commit`] installs the mapping files.
pub struct IngestSession<'a> {
    registry: &'a IdRegistry,
    assigned: [HashMap<String, u64>; 3],
    pending: [Vec<MappingRow>; 3],
}

impl IngestSession<'_> {
    /// Id for `uri`: assigned earlier in this batch, persisted earlier, or freshly allocated.
    pub fn intern(&mut self, namespace: Namespace, uri: &str) -> Result<u64> {
        let slot = namespace.index();
        if let Some(id) = self.assigned[slot].get(uri) {
            return Ok(*id);
        }
        let id = match self.registry.resolve(namespace, uri)? {
            UNKNOWN_ID => {
                let id = self.registry.allocate(namespace);
                self.pending[slot].push(MappingRow { id, value: uri.to_string() });
                id
            }
            id => id,
        };
        self.assigned[slot].insert(uri.to_string(), id);
        Ok(id)
    }

    /// Number of ids this batch allocated in `namespace`.
    pub fn new_ids(&self, namespace: Namespace) -> usize {
        self.pending[namespace.index()].len()
    }

    /// Writes the new mappings to `staging_dir` and installs them into the
    /// metadata directory. Returns the number of new ids per namespace.
    pub fn commit(self, staging_dir: &Path) -> Result<[usize; 3]> {
        let mut counts = [0usize; 3];
        for namespace in Namespace::ALL {
            let rows = &self.pending[namespace.index()];
            if rows.is_empty() {
                continue;
            }
            let staged = staging_dir.join(format!("{}staged", namespace.file_prefix()));
            let mut writer = TableWriter::<MappingRow>::create(&staged, self.registry.rows_per_block)?;
            for row in rows {
                writer.append(row.clone())?;
            }
            writer.finish()?;
            let installed = self.registry.install(namespace, &staged)?;
            debug!(namespace = namespace.name(), file = %installed.display(), ids = rows.len(), "mapping file installed");

            let index = self.registry.index(namespace);
            for row in rows {
                self.registry.remember(index, row.id, &row.value);
            }
            counts[namespace.index()] = rows.len();
        }
        Ok(counts)
    }
}
