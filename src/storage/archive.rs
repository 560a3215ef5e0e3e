//! The archive: public entry point tying registry, layout and query engine together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::core::Tuple;
use crate::error::{Error, Result};
use crate::storage::indexing::dictionary::{IdRegistry, Namespace};
use crate::storage::ingest::{ingest, IngestSummary};
use crate::storage::layout::ArchiveLayout;
use crate::storage::query::{FetchIter, FetchRequest, PropertyIter};
use crate::storage::table::FooterCache;
use crate::storage::util::ArchiveConfig;
use crate::stream::operators::aggregating::{AggregateOp, AggregatingIterator};

/// A partitioned, append-only archive of time-stamped tuples.
///
/// Writers are serialized against each other and against readers through one
/// archive-wide permit. Iterators returned by the read methods hold the shared
/// permit until they are dropped, so a `put` on the same thread while an
/// iterator is alive waits forever unless a lock timeout is configured.
pub struct Archive {
    config: ArchiveConfig,
    permit: RwLock<()>,
    file_cache: Arc<FooterCache>,
    layout: ArchiveLayout,
    registry: IdRegistry,
    closed: AtomicBool,
}

/// Result stream of [`Archive::fetch_range`].
pub enum TupleIter<'a> {
    Raw(FetchIter<'a>),
    Aggregated(AggregatingIterator<FetchIter<'a>>),
}

impl Iterator for TupleIter<'_> {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            TupleIter::Raw(iter) => iter.next(),
            TupleIter::Aggregated(iter) => iter.next(),
        }
    }
}

impl Archive {
    pub fn open(config: ArchiveConfig) -> Result<Self> {
        config.validate()?;
        let file_cache = Arc::new(FooterCache::new(config.file_cache_capacity));
        let layout = ArchiveLayout::open(&config.root, Arc::clone(&file_cache), config.rows_per_block)?;
        let registry = IdRegistry::open(
            &config.metadata_path(),
            Arc::clone(&file_cache),
            config.id_cache_capacity,
            config.rows_per_block,
        )?;
        // rows may reference item ids whose mapping commit failed
        registry.reserve_through(Namespace::Item, layout.max_item_id());
        info!(root = %config.root.display(), files = layout.file_count(), "archive opened");
        Ok(Self { config, permit: RwLock::new(()), file_cache, layout, registry, closed: AtomicBool::new(false) })
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Recursive, so a thread holding an iterator can open another one while a
    /// writer is queued.
    fn shared(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.ensure_open()?;
        match self.config.lock_timeout() {
            Some(timeout) => self.permit.try_read_recursive_for(timeout).ok_or(Error::LockTimeout("shared")),
            None => Ok(self.permit.read_recursive()),
        }
    }

    fn exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.ensure_open()?;
        match self.config.lock_timeout() {
            Some(timeout) => self.permit.try_write_for(timeout).ok_or(Error::LockTimeout("exclusive")),
            None => Ok(self.permit.write()),
        }
    }

    /// Stores a batch of tuples. The batch becomes visible to readers as a whole
    /// once this returns.
    pub fn put<I>(&self, tuples: I) -> Result<IngestSummary>
    where
        I: IntoIterator<Item = Tuple>,
    {
        let _permit = self.exclusive()?;
        self.ensure_open()?;
        ingest(&self.layout, &self.registry, tuples)
    }

    /// All tuples of `item`, optionally narrowed to one property and context.
    ///
    /// `limit` caps each run of one property; 0 returns everything.
    pub fn fetch(&self, item: &str, property: Option<&str>, context: Option<&str>, limit: usize) -> Result<FetchIter<'_>> {
        let request = FetchRequest { item, property, context, begin: None, end: None, limit };
        FetchIter::new(self.shared()?, &self.layout, &self.registry, &self.file_cache, &request)
    }

    /// Tuples with `begin <= time < end`, optionally aggregated per `interval`.
    ///
    /// A bound of 0 leaves that side open. With an operator, `limit` caps the
    /// aggregates per property instead of the raw rows.
    #[allow(clippy::too_many_arguments)]
    pub fn fetch_range(
        &self,
        item: &str,
        property: Option<&str>,
        context: Option<&str>,
        end: i64,
        begin: i64,
        limit: usize,
        interval: i64,
        op: Option<&str>,
    ) -> Result<TupleIter<'_>> {
        let op = op.map(str::parse::<AggregateOp>).transpose()?;
        let request = FetchRequest {
            item,
            property,
            context,
            begin: (begin != 0).then_some(begin),
            end: (end != 0).then_some(end),
            limit: if op.is_some() { 0 } else { limit },
        };
        let raw = FetchIter::new(self.shared()?, &self.layout, &self.registry, &self.file_cache, &request)?;
        Ok(match op {
            Some(op) => TupleIter::Aggregated(AggregatingIterator::new(raw, interval, op, limit)),
            None => TupleIter::Raw(raw),
        })
    }

    /// Distinct property URIs recorded for `item`, in ascending id order.
    pub fn properties(&self, item: &str) -> Result<PropertyIter<'_>> {
        PropertyIter::new(self.shared()?, &self.layout, &self.registry, &self.file_cache, item)
    }

    /// Re-reads the partition tree, picking up directories created by another process.
    pub fn refresh(&self) -> Result<()> {
        let _permit = self.exclusive()?;
        self.file_cache.clear();
        self.layout.refresh()
    }

    /// Releases caches. Every later call fails with [`Error::Closed`]; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!(root = %self.config.root.display(), "archive already closed");
            return Ok(());
        }
        self.file_cache.clear();
        self.registry.clear_caches();
        info!(root = %self.config.root.display(), "archive closed");
        Ok(())
    }
}
