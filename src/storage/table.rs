//! Append-only row files with block statistics and predicate pushdown.
//!
//! A row file is a sequence of blocks followed by a footer:
//!
//! ```text
//! MAGIC | (u32 len, bincode(Vec<Row>))* | bincode(TableFooter) | u64 footer_len | MAGIC
//! ```
//!
//! The footer records, per block, the min/max value of every indexed column.
//! Readers use these statistics to skip blocks that cannot satisfy a [`Filter`],
//! then evaluate the filter row by row on the blocks they do load.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"TMP1";
const MAGIC_LEN: u64 = 4;
const TRAILER_SIZE: u64 = 8 + MAGIC_LEN;

/// Owned column value, used for filter operands and block statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bytes(Vec<u8>),
    Int(i64),
    UInt(u64),
    Str(String),
}

/// Borrowed column value read from a row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field<'a> {
    Bytes(&'a [u8]),
    Int(i64),
    UInt(u64),
    Str(&'a str),
}

impl Field<'_> {
    /// Orders a row field against a literal. `None` when the kinds differ.
    pub fn compare(&self, literal: &Literal) -> Option<Ordering> {
        self.compare_field(&literal.as_field())
    }

    fn compare_field(&self, other: &Field<'_>) -> Option<Ordering> {
        match (self, other) {
            (Field::Bytes(a), Field::Bytes(b)) => Some(a.cmp(b)),
            (Field::Int(a), Field::Int(b)) => Some(a.cmp(b)),
            (Field::UInt(a), Field::UInt(b)) => Some(a.cmp(b)),
            (Field::Str(a), Field::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn to_literal(&self) -> Literal {
        match self {
            Field::Bytes(b) => Literal::Bytes(b.to_vec()),
            Field::Int(v) => Literal::Int(*v),
            Field::UInt(v) => Literal::UInt(*v),
            Field::Str(s) => Literal::Str((*s).to_string()),
        }
    }
}

impl Literal {
    fn as_field(&self) -> Field<'_> {
        match self {
            Literal::Bytes(b) => Field::Bytes(b),
            Literal::Int(v) => Field::Int(*v),
            Literal::UInt(v) => Field::UInt(*v),
            Literal::Str(s) => Field::Str(s),
        }
    }

    /// Ordering between literals of the same kind.
    pub fn compare(&self, other: &Literal) -> Option<Ordering> {
        self.as_field().compare(other)
    }
}

/// A row type that can be stored in a row file.
pub trait TableRow: Serialize + DeserializeOwned {
    /// Columns for which per-block min/max statistics are recorded.
    const INDEXED_COLUMNS: &'static [&'static str];

    /// Value of `column` in this row; `None` for null or unknown columns.
    fn field(&self, column: &str) -> Option<Field<'_>>;
}

/// Row predicate. Comparisons against null fields never match.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every row.
    All,
    Eq(&'static str, Literal),
    Gt(&'static str, Literal),
    GtEq(&'static str, Literal),
    Lt(&'static str, Literal),
    LtEq(&'static str, Literal),
    /// Equality on the byte range `start..start + value.len()` of a bytes column.
    Segment { column: &'static str, start: usize, value: Vec<u8> },
    And(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (a, b) => Filter::And(Box::new(a), Box::new(b)),
        }
    }

    /// Evaluates the predicate against a single row.
    pub fn matches<R: TableRow>(&self, row: &R) -> bool {
        let test = |column: &str, literal: &Literal, accept: fn(Ordering) -> bool| {
            row.field(column).and_then(|f| f.compare(literal)).map_or(false, accept)
        };
        match self {
            Filter::All => true,
            Filter::Eq(c, v) => test(*c, v, |o| o == Ordering::Equal),
            Filter::Gt(c, v) => test(*c, v, |o| o == Ordering::Greater),
            Filter::GtEq(c, v) => test(*c, v, |o| o != Ordering::Less),
            Filter::Lt(c, v) => test(*c, v, |o| o == Ordering::Less),
            Filter::LtEq(c, v) => test(*c, v, |o| o != Ordering::Greater),
            Filter::Segment { column, start, value } => match row.field(column) {
                Some(Field::Bytes(bytes)) => {
                    bytes.get(*start..*start + value.len()).map_or(false, |s| s == value.as_slice())
                }
                _ => false,
            },
            Filter::And(a, b) => a.matches(row) && b.matches(row),
        }
    }

    /// Whether a block with the given statistics may contain a matching row.
    pub fn may_match(&self, stats: &[ColumnStats]) -> bool {
        let range = |column: &str| stats.iter().find(|s| s.column == column);
        // Kinds that cannot be compared never prune.
        let check = |column: &str, literal: &Literal, accept: fn(&ColumnStats, &Literal) -> Option<bool>| {
            range(column).and_then(|s| accept(s, literal)).unwrap_or(true)
        };
        match self {
            Filter::All | Filter::Segment { .. } => true,
            Filter::Eq(c, v) => check(*c, v, |s, v| {
                Some(s.min.compare(v)? != Ordering::Greater && s.max.compare(v)? != Ordering::Less)
            }),
            Filter::Gt(c, v) => check(*c, v, |s, v| Some(s.max.compare(v)? == Ordering::Greater)),
            Filter::GtEq(c, v) => check(*c, v, |s, v| Some(s.max.compare(v)? != Ordering::Less)),
            Filter::Lt(c, v) => check(*c, v, |s, v| Some(s.min.compare(v)? == Ordering::Less)),
            Filter::LtEq(c, v) => check(*c, v, |s, v| Some(s.min.compare(v)? != Ordering::Greater)),
            Filter::And(a, b) => a.may_match(stats) && b.may_match(stats),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column: String,
    pub min: Literal,
    pub max: Literal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    pub offset: u64,
    pub len: u32,
    pub row_count: u32,
    pub stats: Vec<ColumnStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFooter {
    pub blocks: Vec<BlockMeta>,
    pub row_count: u64,
}

impl TableFooter {
    /// Min and max of `column` across all blocks of the file.
    pub fn column_range(&self, column: &str) -> Option<(Literal, Literal)> {
        let mut range: Option<(Literal, Literal)> = None;
        for stats in self.blocks.iter().flat_map(|b| b.stats.iter()).filter(|s| s.column == column) {
            range = Some(match range {
                None => (stats.min.clone(), stats.max.clone()),
                Some((min, max)) => (
                    if stats.min.compare(&min) == Some(Ordering::Less) { stats.min.clone() } else { min },
                    if stats.max.compare(&max) == Some(Ordering::Greater) { stats.max.clone() } else { max },
                ),
            });
        }
        range
    }
}

/// Outcome of a finished writer.
#[derive(Debug, Clone)]
pub struct TableSummary {
    pub path: PathBuf,
    pub row_count: u64,
    pub block_count: usize,
}

/// Append-only writer. Nothing is readable until [`TableWriter::finish`] writes the footer.
pub struct TableWriter<R: TableRow> {
    path: PathBuf,
    out: BufWriter<File>,
    offset: u64,
    pending: Vec<R>,
    rows_per_block: usize,
    blocks: Vec<BlockMeta>,
    row_count: u64,
}

impl<R: TableRow> TableWriter<R> {
    pub fn create(path: &Path, rows_per_block: usize) -> Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(MAGIC)?;
        Ok(Self {
            path: path.to_path_buf(),
            out,
            offset: MAGIC_LEN,
            pending: Vec::new(),
            rows_per_block: rows_per_block.max(1),
            blocks: Vec::new(),
            row_count: 0,
        })
    }

    pub fn append(&mut self, row: R) -> Result<()> {
        self.pending.push(row);
        if self.pending.len() >= self.rows_per_block {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<TableSummary> {
        self.flush_block()?;
        let footer = TableFooter { blocks: std::mem::take(&mut self.blocks), row_count: self.row_count };
        let encoded = bincode::serialize(&footer)?;
        self.out.write_all(&encoded)?;
        self.out.write_all(&(encoded.len() as u64).to_be_bytes())?;
        self.out.write_all(MAGIC)?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(TableSummary { path: self.path, row_count: footer.row_count, block_count: footer.blocks.len() })
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let stats = block_stats(&self.pending);
        let encoded = bincode::serialize(&self.pending)?;
        let len = u32::try_from(encoded.len()).map_err(|_| {
            Error::InvalidArgument(format!("block of {} bytes exceeds the block size limit", encoded.len()))
        })?;
        self.out.write_all(&len.to_be_bytes())?;
        self.offset += 4;
        self.blocks.push(BlockMeta {
            offset: self.offset,
            len,
            row_count: self.pending.len() as u32,
            stats,
        });
        self.out.write_all(&encoded)?;
        self.offset += u64::from(len);
        self.row_count += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }
}

fn block_stats<R: TableRow>(rows: &[R]) -> Vec<ColumnStats> {
    let mut stats = Vec::new();
    for column in R::INDEXED_COLUMNS {
        let mut min: Option<Field<'_>> = None;
        let mut max: Option<Field<'_>> = None;
        for field in rows.iter().filter_map(|r| r.field(column)) {
            if min.map_or(true, |m| field.compare_field(&m) == Some(Ordering::Less)) {
                min = Some(field);
            }
            if max.map_or(true, |m| field.compare_field(&m) == Some(Ordering::Greater)) {
                max = Some(field);
            }
        }
        if let (Some(min), Some(max)) = (min, max) {
            stats.push(ColumnStats { column: (*column).to_string(), min: min.to_literal(), max: max.to_literal() });
        }
    }
    stats
}

/// Reads and validates the footer of a finished row file.
pub fn read_footer(path: &Path) -> Result<TableFooter> {
    let corrupt = |reason: &str| Error::CorruptTable { path: path.to_path_buf(), reason: reason.to_string() };
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < MAGIC_LEN + TRAILER_SIZE {
        return Err(corrupt("file too short"));
    }
    file.seek(SeekFrom::Start(len - TRAILER_SIZE))?;
    let mut trailer = [0u8; TRAILER_SIZE as usize];
    file.read_exact(&mut trailer)?;
    if &trailer[8..] != MAGIC {
        return Err(corrupt("missing trailing magic"));
    }
    let mut footer_len = [0u8; 8];
    footer_len.copy_from_slice(&trailer[..8]);
    let footer_len = u64::from_be_bytes(footer_len);
    if footer_len > len - TRAILER_SIZE - MAGIC_LEN {
        return Err(corrupt("footer length out of bounds"));
    }
    file.seek(SeekFrom::Start(len - TRAILER_SIZE - footer_len))?;
    let mut encoded = vec![0u8; footer_len as usize];
    file.read_exact(&mut encoded)?;
    Ok(bincode::deserialize(&encoded)?)
}

/// Footers of opened row files, keyed by path.
///
/// Committed files are immutable, so a cached footer stays valid for as long as
/// the path exists.
pub struct FooterCache {
    entries: Mutex<LruCache<PathBuf, Arc<TableFooter>>>,
}

impl FooterCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: Mutex::new(LruCache::new(capacity)) }
    }

    pub fn footer(&self, path: &Path) -> Result<Arc<TableFooter>> {
        if let Some(footer) = self.entries.lock().get(path) {
            return Ok(Arc::clone(footer));
        }
        let footer = Arc::new(read_footer(path)?);
        self.entries.lock().put(path.to_path_buf(), Arc::clone(&footer));
        Ok(footer)
    }

    /// Drops entries for files below `dir`, e.g. after the directory was renamed.
    pub fn invalidate_under(&self, dir: &Path) {
        let mut entries = self.entries.lock();
        let stale: Vec<PathBuf> =
            entries.iter().filter(|(p, _)| p.starts_with(dir)).map(|(p, _)| p.clone()).collect();
        for path in stale {
            entries.pop(&path);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sequential scan over the rows of one file that satisfy a filter.
///
/// An I/O or decode failure is yielded once, after which the scan ends.
pub struct TableScan<R: TableRow> {
    path: PathBuf,
    file: BufReader<File>,
    footer: Arc<TableFooter>,
    filter: Arc<Filter>,
    next_block: usize,
    rows: std::vec::IntoIter<R>,
    failed: bool,
}

impl<R: TableRow> TableScan<R> {
    pub fn open(path: &Path, cache: &FooterCache, filter: Arc<Filter>) -> Result<Self> {
        let footer = cache.footer(path)?;
        let file = BufReader::new(File::open(path)?);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            footer,
            filter,
            next_block: 0,
            rows: Vec::new().into_iter(),
            failed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_block(&mut self, meta: &BlockMeta) -> Result<Vec<R>> {
        self.file.seek(SeekFrom::Start(meta.offset))?;
        let mut encoded = vec![0u8; meta.len as usize];
        self.file.read_exact(&mut encoded)?;
        Ok(bincode::deserialize(&encoded)?)
    }
}

impl<R: TableRow> Iterator for TableScan<R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for row in self.rows.by_ref() {
                if self.filter.matches(&row) {
                    return Some(Ok(row));
                }
            }
            if self.failed || self.next_block >= self.footer.blocks.len() {
                return None;
            }
            let footer = Arc::clone(&self.footer);
            let meta = &footer.blocks[self.next_block];
            self.next_block += 1;
            if !self.filter.may_match(&meta.stats) {
                debug!(path = %self.path.display(), block = self.next_block - 1, "block skipped by statistics");
                continue;
            }
            match self.read_block(meta) {
                Ok(rows) => self.rows = rows.into_iter(),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u64,
        name: String,
        score: Option<i64>,
    }

    impl TableRow for Sample {
        const INDEXED_COLUMNS: &'static [&'static str] = &["id", "name"];

        fn field(&self, column: &str) -> Option<Field<'_>> {
            match column {
                "id" => Some(Field::UInt(self.id)),
                "name" => Some(Field::Str(&self.name)),
                "score" => self.score.map(Field::Int),
                _ => None,
            }
        }
    }

    fn sample(id: u64) -> Sample {
        Sample { id, name: format!("n{:03}", id), score: if id % 2 == 0 { Some(id as i64) } else { None } }
    }

    fn write_samples(path: &Path, count: u64, rows_per_block: usize) -> TableSummary {
        let mut writer = TableWriter::create(path, rows_per_block).unwrap();
        for id in 1..=count {
            writer.append(sample(id)).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_write_then_scan_all() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        let summary = write_samples(&path, 25, 10);
        assert_eq!(summary.row_count, 25);
        assert_eq!(summary.block_count, 3);

        let cache = FooterCache::new(4);
        let rows: Vec<Sample> =
            TableScan::open(&path, &cache, Arc::new(Filter::All)).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 25);
        assert_eq!(rows[0], sample(1));
        assert_eq!(rows[24], sample(25));
    }

    #[test]
    fn test_filter_pushdown_and_row_evaluation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        write_samples(&path, 100, 8);

        let cache = FooterCache::new(4);
        let filter = Filter::GtEq("id", Literal::UInt(40)).and(Filter::Lt("id", Literal::UInt(43)));
        let ids: Vec<u64> =
            TableScan::<Sample>::open(&path, &cache, Arc::new(filter)).unwrap().map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec![40, 41, 42]);

        let by_name = Filter::Eq("name", Literal::Str("n077".to_string()));
        let ids: Vec<u64> =
            TableScan::<Sample>::open(&path, &cache, Arc::new(by_name)).unwrap().map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec![77]);
    }

    #[test]
    fn test_null_fields_never_match() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows");
        write_samples(&path, 6, 4);

        let cache = FooterCache::new(4);
        let filter = Filter::GtEq("score", Literal::Int(0));
        let ids: Vec<u64> =
            TableScan::<Sample>::open(&path, &cache, Arc::new(filter)).unwrap().map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec![2, 4, 6]);
    }

    #[test]
    fn test_block_statistics_prune() {
        let stats = vec![ColumnStats { column: "id".to_string(), min: Literal::UInt(10), max: Literal::UInt(20) }];
        assert!(Filter::Eq("id", Literal::UInt(15)).may_match(&stats));
        assert!(!Filter::Eq("id", Literal::UInt(21)).may_match(&stats));
        assert!(!Filter::Gt("id", Literal::UInt(20)).may_match(&stats));
        assert!(Filter::GtEq("id", Literal::UInt(20)).may_match(&stats));
        assert!(!Filter::Lt("id", Literal::UInt(10)).may_match(&stats));
        // unknown columns and mismatched kinds never prune
        assert!(Filter::Eq("other", Literal::UInt(1)).may_match(&stats));
        assert!(Filter::Eq("id", Literal::Int(99)).may_match(&stats));
    }

    #[test]
    fn test_segment_filter() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Keyed {
            key: Vec<u8>,
        }
        impl TableRow for Keyed {
            const INDEXED_COLUMNS: &'static [&'static str] = &["key"];
            fn field(&self, column: &str) -> Option<Field<'_>> {
                (column == "key").then(|| Field::Bytes(&self.key))
            }
        }

        let filter = Filter::Segment { column: "key", start: 2, value: vec![7, 8] };
        assert!(filter.matches(&Keyed { key: vec![0, 0, 7, 8, 1] }));
        assert!(!filter.matches(&Keyed { key: vec![0, 0, 7, 9, 1] }));
        assert!(!filter.matches(&Keyed { key: vec![0, 0, 7] }));
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken");
        std::fs::write(&path, b"TMP1 not a table").unwrap();
        assert!(matches!(read_footer(&path), Err(Error::CorruptTable { .. })));
    }

    #[test]
    fn test_footer_cache_reuses_and_invalidates() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir_all(&sub).unwrap();
        let path = sub.join("rows");
        write_samples(&path, 3, 2);

        let cache = FooterCache::new(2);
        let first = cache.footer(&path).unwrap();
        let second = cache.footer(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.column_range("id"), Some((Literal::UInt(1), Literal::UInt(3))));

        cache.invalidate_under(&sub);
        assert!(cache.is_empty());
    }
}
