//! On-disk partition layout.
//!
//! ```text
//! <root>/
//!   metadata/                      identifier mapping files
//!   .staging/                      in-flight batches, never read by queries
//!   <yyyy>_<min>-<max>/            year partition
//!     <ww>_<min>-<max>/            ISO week partition
//!       data__1, data__2, ...      one row file per committed batch
//! ```
//!
//! `min`/`max` bound the item ids stored below a directory. They only grow, and
//! a directory is renamed whenever its bounds change. Year and week numbers
//! follow the ISO-8601 week date of the tuple time in UTC.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Datelike};
use parking_lot::RwLock;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage::rows::TupleRow;
use crate::storage::table::{FooterCache, TableWriter};
use crate::storage::util::{METADATA_DIR, STAGING_DIR};

/// Inclusive item-id bounds of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub min: u64,
    pub max: u64,
}

impl IdRange {
    pub fn single(id: u64) -> Self {
        Self { min: id, max: id }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.min <= id && id <= self.max
    }

    pub fn union(self, other: IdRange) -> IdRange {
        IdRange { min: self.min.min(other.min), max: self.max.max(other.max) }
    }
}

/// ISO week-based year and week of a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub year: i32,
    pub week: u32,
}

/// Partition a tuple time (seconds since the epoch) belongs to.
pub fn partition_of(time: i64) -> Result<PartitionKey> {
    let date = DateTime::from_timestamp(time, 0)
        .ok_or_else(|| Error::InvalidArgument(format!("time {} is out of range", time)))?;
    let week = date.iso_week();
    if !(0..=9999).contains(&week.year()) {
        return Err(Error::InvalidArgument(format!("time {} falls outside years 0..=9999", time)));
    }
    Ok(PartitionKey { year: week.year(), week: week.week() })
}

pub fn year_dir_name(year: i32, bounds: IdRange) -> String {
    format!("{:04}_{}-{}", year, bounds.min, bounds.max)
}

pub fn week_dir_name(week: u32, bounds: IdRange) -> String {
    format!("{:02}_{}-{}", week, bounds.min, bounds.max)
}

pub fn data_file_name(seq: u64) -> String {
    format!("data__{}", seq)
}

/// Parses `<number>_<min>-<max>`. Malformed names yield `None`.
pub fn parse_partition_name(name: &str) -> Option<(u32, IdRange)> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"^(\d{1,4})_(\d+)-(\d+)$").expect("valid partition pattern"));
    let captures = pattern.captures(name)?;
    let number = captures[1].parse().ok()?;
    let min = captures[2].parse().ok()?;
    let max = captures[3].parse().ok()?;
    (min <= max).then_some((number, IdRange { min, max }))
}

pub fn parse_data_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("data__")?.parse().ok()
}

#[derive(Debug, Clone)]
struct WeekPartition {
    week: u32,
    bounds: IdRange,
    path: PathBuf,
    files: Vec<(u64, PathBuf)>,
}

impl WeekPartition {
    fn relocate(&mut self, path: PathBuf) {
        for (seq, file) in &mut self.files {
            *file = path.join(data_file_name(*seq));
        }
        self.path = path;
    }
}

#[derive(Debug, Clone)]
struct YearPartition {
    year: i32,
    bounds: IdRange,
    path: PathBuf,
    weeks: Vec<WeekPartition>,
}

impl YearPartition {
    fn relocate(&mut self, path: PathBuf) {
        for week in &mut self.weeks {
            let name = week_dir_name(week.week, week.bounds);
            week.relocate(path.join(name));
        }
        self.path = path;
    }
}

/// All data files of one week partition; the unit of merged reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionGroup {
    pub key: PartitionKey,
    pub files: Vec<PathBuf>,
}

/// Private directory of one batch. Whatever is still inside is removed on drop.
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove staging directory");
            }
        }
    }
}

/// Row writer for one (year, week) of a batch, tracking the item-id bounds it saw.
pub struct StagedPartition {
    pub key: PartitionKey,
    writer: TableWriter<TupleRow>,
    bounds: Option<IdRange>,
}

impl StagedPartition {
    pub fn append(&mut self, item_id: u64, row: TupleRow) -> Result<()> {
        self.writer.append(row)?;
        self.bounds = Some(match self.bounds {
            Some(bounds) => bounds.union(IdRange::single(item_id)),
            None => IdRange::single(item_id),
        });
        Ok(())
    }

    /// Closes the writer. A partition that never received a row yields `None`.
    pub fn finish(self) -> Result<Option<FinishedPartition>> {
        let summary = self.writer.finish()?;
        Ok(self.bounds.map(|bounds| FinishedPartition {
            key: self.key,
            bounds,
            path: summary.path,
            row_count: summary.row_count,
        }))
    }
}

/// A closed staged file ready to be moved into the layout.
#[derive(Debug, Clone)]
pub struct FinishedPartition {
    pub key: PartitionKey,
    pub bounds: IdRange,
    pub path: PathBuf,
    pub row_count: u64,
}

pub struct ArchiveLayout {
    root: PathBuf,
    staging_root: PathBuf,
    file_cache: Arc<FooterCache>,
    rows_per_block: usize,
    catalog: RwLock<Vec<YearPartition>>,
    batch_counter: AtomicU64,
}

impl ArchiveLayout {
    /// Opens the layout under `root`, discarding batches abandoned by a previous process.
    pub fn open(root: &Path, file_cache: Arc<FooterCache>, rows_per_block: usize) -> Result<Self> {
        fs::create_dir_all(root)?;
        let staging_root = root.join(STAGING_DIR);
        if staging_root.exists() {
            warn!(dir = %staging_root.display(), "removing abandoned staging data");
            fs::remove_dir_all(&staging_root)?;
        }
        fs::create_dir_all(&staging_root)?;

        let layout = Self {
            root: root.to_path_buf(),
            staging_root,
            file_cache,
            rows_per_block,
            catalog: RwLock::new(Vec::new()),
            batch_counter: AtomicU64::new(0),
        };
        layout.refresh()?;
        Ok(layout)
    }

    /// Rebuilds the in-memory partition catalog by walking the directory tree.
    pub fn refresh(&self) -> Result<()> {
        let years = scan_partitions(&self.root)?;
        let files: usize = years.iter().flat_map(|y| y.weeks.iter()).map(|w| w.files.len()).sum();
        info!(root = %self.root.display(), years = years.len(), files, "partition catalog loaded");
        *self.catalog.write() = years;
        Ok(())
    }

    pub fn begin_staging(&self) -> Result<StagingArea> {
        let batch = self.batch_counter.fetch_add(1, Ordering::SeqCst);
        let dir = self.staging_root.join(format!("batch-{}-{}", std::process::id(), batch));
        fs::create_dir_all(&dir)?;
        Ok(StagingArea { dir })
    }

    /// Opens a fresh writer for `key` inside the batch's staging area.
    pub fn stage_partition(&self, staging: &StagingArea, key: PartitionKey) -> Result<StagedPartition> {
        let path = staging.path().join(format!("{:04}-{:02}", key.year, key.week));
        let writer = TableWriter::create(&path, self.rows_per_block)?;
        Ok(StagedPartition { key, writer, bounds: None })
    }

    /// Moves staged files into the layout, merging bounds with existing partitions.
    ///
    /// Must run under the exclusive archive permit. A failure leaves whatever
    /// renames already happened in place.
    pub fn commit_partitions(&self, staged: Vec<FinishedPartition>) -> Result<Vec<PathBuf>> {
        let mut by_year: BTreeMap<i32, Vec<FinishedPartition>> = BTreeMap::new();
        for partition in staged {
            by_year.entry(partition.key.year).or_default().push(partition);
        }

        let mut catalog = self.catalog.write();
        let mut committed = Vec::new();
        for (year, partitions) in by_year {
            let Some(staged_bounds) = partitions.iter().map(|p| p.bounds).reduce(IdRange::union) else {
                continue;
            };
            let year_idx = self.merge_year(&mut catalog, year, staged_bounds)?;
            for partition in partitions {
                let path = self.merge_week(&mut catalog[year_idx], partition)?;
                committed.push(path);
            }
        }
        Ok(committed)
    }

    fn merge_year(&self, catalog: &mut Vec<YearPartition>, year: i32, bounds: IdRange) -> Result<usize> {
        if let Some(idx) = catalog.iter().position(|y| y.year == year) {
            let partition = &mut catalog[idx];
            let merged = partition.bounds.union(bounds);
            if merged != partition.bounds {
                let target = self.root.join(year_dir_name(year, merged));
                debug!(from = %partition.path.display(), to = %target.display(), "widening year partition");
                fs::rename(&partition.path, &target)?;
                self.file_cache.invalidate_under(&partition.path);
                partition.relocate(target);
                partition.bounds = merged;
            }
            return Ok(idx);
        }

        let path = self.root.join(year_dir_name(year, bounds));
        fs::create_dir_all(&path)?;
        catalog.push(YearPartition { year, bounds, path, weeks: Vec::new() });
        catalog.sort_by_key(|y| y.year);
        Ok(catalog.iter().position(|y| y.year == year).unwrap_or(catalog.len() - 1))
    }

    fn merge_week(&self, year: &mut YearPartition, staged: FinishedPartition) -> Result<PathBuf> {
        let week_no = staged.key.week;
        let week = match year.weeks.iter().position(|w| w.week == week_no) {
            Some(idx) => {
                let week = &mut year.weeks[idx];
                let merged = week.bounds.union(staged.bounds);
                if merged != week.bounds {
                    let target = year.path.join(week_dir_name(week_no, merged));
                    debug!(from = %week.path.display(), to = %target.display(), "widening week partition");
                    fs::rename(&week.path, &target)?;
                    self.file_cache.invalidate_under(&week.path);
                    week.relocate(target);
                    week.bounds = merged;
                }
                week
            }
            None => {
                let path = year.path.join(week_dir_name(week_no, staged.bounds));
                fs::create_dir_all(&path)?;
                year.weeks.push(WeekPartition { week: week_no, bounds: staged.bounds, path, files: Vec::new() });
                year.weeks.sort_by_key(|w| w.week);
                let idx = year.weeks.iter().position(|w| w.week == week_no).unwrap_or(year.weeks.len() - 1);
                &mut year.weeks[idx]
            }
        };

        let seq = next_data_seq(&week.path)?.max(week.files.last().map_or(0, |(s, _)| *s) + 1);
        let target = week.path.join(data_file_name(seq));
        fs::rename(&staged.path, &target)?;
        info!(file = %target.display(), rows = staged.row_count, "committed partition file");
        week.files.push((seq, target.clone()));
        Ok(target)
    }

    /// Week partitions that may hold rows of `item_id`, newest first.
    ///
    /// Containment in the name-encoded bounds is the only criterion, so groups
    /// may turn out to hold no row of the item.
    pub fn prune_candidates(&self, item_id: u64) -> Vec<PartitionGroup> {
        let catalog = self.catalog.read();
        let mut groups: Vec<PartitionGroup> = catalog
            .iter()
            .filter(|y| y.bounds.contains(item_id))
            .flat_map(|y| {
                y.weeks.iter().filter(|w| w.bounds.contains(item_id) && !w.files.is_empty()).map(move |w| {
                    PartitionGroup {
                        key: PartitionKey { year: y.year, week: w.week },
                        files: w.files.iter().map(|(_, p)| p.clone()).collect(),
                    }
                })
            })
            .collect();
        groups.sort_by_key(|g| Reverse(g.key));
        debug!(item_id, groups = groups.len(), "pruned partitions");
        groups
    }

    /// Largest item id any committed partition may hold; 0 for an empty archive.
    pub fn max_item_id(&self) -> u64 {
        self.catalog.read().iter().map(|y| y.bounds.max).max().unwrap_or(0)
    }

    /// Number of committed data files, for diagnostics.
    pub fn file_count(&self) -> usize {
        self.catalog.read().iter().flat_map(|y| y.weeks.iter()).map(|w| w.files.len()).sum()
    }
}

fn next_data_seq(dir: &Path) -> Result<u64> {
    let mut max = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_data_file_name) {
            max = max.max(seq);
        }
    }
    Ok(max + 1)
}

fn scan_partitions(root: &Path) -> Result<Vec<YearPartition>> {
    let mut years = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == METADATA_DIR || name == STAGING_DIR || !entry.file_type()?.is_dir() {
            continue;
        }
        let Some((year, bounds)) = parse_partition_name(&name) else {
            debug!(name = %name, "skipping unrecognized directory");
            continue;
        };
        let path = entry.path();
        let mut weeks = Vec::new();
        for week_entry in fs::read_dir(&path)? {
            let week_entry = week_entry?;
            let week_name = week_entry.file_name().to_string_lossy().into_owned();
            let parsed = parse_partition_name(&week_name).filter(|(w, _)| (1..=53).contains(w));
            let (Some((week, week_bounds)), true) = (parsed, week_entry.file_type()?.is_dir()) else {
                debug!(name = %week_name, "skipping unrecognized week entry");
                continue;
            };
            let mut files = Vec::new();
            for file_entry in fs::read_dir(week_entry.path())? {
                let file_entry = file_entry?;
                if let Some(seq) = file_entry.file_name().to_str().and_then(parse_data_file_name) {
                    files.push((seq, file_entry.path()));
                }
            }
            files.sort_by_key(|(seq, _)| *seq);
            weeks.push(WeekPartition { week, bounds: week_bounds, path: week_entry.path(), files });
        }
        weeks.sort_by_key(|w| w.week);
        years.push(YearPartition { year: year as i32, bounds, path, weeks });
    }
    years.sort_by_key(|y| y.year);
    Ok(years)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::encoding::encode_key;
    use crate::core::Value;
    use tempfile::tempdir;

    fn open(root: &Path) -> ArchiveLayout {
        ArchiveLayout::open(root, Arc::new(FooterCache::new(16)), 16).unwrap()
    }

    fn stage(layout: &ArchiveLayout, staging: &StagingArea, key: PartitionKey, items: &[u64]) -> FinishedPartition {
        let mut partition = layout.stage_partition(staging, key).unwrap();
        for (i, item) in items.iter().enumerate() {
            let row = TupleRow::new(encode_key(*item, 1, 1), i as i64, 0, &Value::Int(i as i32)).unwrap();
            partition.append(*item, row).unwrap();
        }
        partition.finish().unwrap().unwrap()
    }

    fn dir_names(path: &Path) -> Vec<String> {
        let mut names: Vec<String> =
            fs::read_dir(path).unwrap().map(|e| e.unwrap().file_name().to_string_lossy().into_owned()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_partition_of_uses_iso_weeks() {
        assert_eq!(partition_of(100).unwrap(), PartitionKey { year: 1970, week: 1 });
        // 2021-01-01 belongs to the last ISO week of 2020
        assert_eq!(partition_of(1_609_459_200).unwrap(), PartitionKey { year: 2020, week: 53 });
        // 2024-01-01 is the Monday of week 1
        assert_eq!(partition_of(1_704_067_200).unwrap(), PartitionKey { year: 2024, week: 1 });
        assert!(partition_of(i64::MAX).is_err());
    }

    #[test]
    fn test_names_round_trip() {
        let bounds = IdRange { min: 3, max: 17 };
        assert_eq!(year_dir_name(2024, bounds), "2024_3-17");
        assert_eq!(week_dir_name(5, bounds), "05_3-17");
        assert_eq!(parse_partition_name("2024_3-17"), Some((2024, bounds)));
        assert_eq!(parse_partition_name("05_3-17"), Some((5, bounds)));
        assert_eq!(parse_partition_name("2024_17-3"), None);
        assert_eq!(parse_partition_name("temp"), None);
        assert_eq!(parse_partition_name("2024_a-b"), None);
        assert_eq!(parse_data_file_name("data__12"), Some(12));
        assert_eq!(parse_data_file_name("data__x"), None);
    }

    #[test]
    fn test_staged_files_are_invisible_until_commit() {
        let dir = tempdir().unwrap();
        let layout = open(dir.path());
        let staging = layout.begin_staging().unwrap();
        let key = PartitionKey { year: 2024, week: 3 };
        let finished = stage(&layout, &staging, key, &[4, 2, 9]);
        assert_eq!(finished.bounds, IdRange { min: 2, max: 9 });
        assert!(layout.prune_candidates(4).is_empty());

        let committed = layout.commit_partitions(vec![finished]).unwrap();
        assert_eq!(committed, vec![dir.path().join("2024_2-9").join("03_2-9").join("data__1")]);
        assert_eq!(layout.prune_candidates(4).len(), 1);
        assert!(layout.prune_candidates(10).is_empty());
    }

    #[test]
    fn test_commit_widens_existing_partitions() {
        let dir = tempdir().unwrap();
        let layout = open(dir.path());
        let key = PartitionKey { year: 2024, week: 3 };

        let staging = layout.begin_staging().unwrap();
        let first = stage(&layout, &staging, key, &[2, 3]);
        layout.commit_partitions(vec![first]).unwrap();

        let staging = layout.begin_staging().unwrap();
        let second = stage(&layout, &staging, key, &[5]);
        let other_week = stage(&layout, &staging, PartitionKey { year: 2024, week: 4 }, &[7]);
        layout.commit_partitions(vec![second, other_week]).unwrap();

        assert_eq!(dir_names(dir.path()), vec![".staging", "2024_2-7"]);
        let year = dir.path().join("2024_2-7");
        assert_eq!(dir_names(&year), vec!["03_2-5", "04_7-7"]);
        assert_eq!(dir_names(&year.join("03_2-5")), vec!["data__1", "data__2"]);

        let groups = layout.prune_candidates(3);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].files.len(), 2);
        assert!(groups[0].files.iter().all(|f| f.exists()));
    }

    #[test]
    fn test_prune_orders_newest_first_and_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let layout = open(dir.path());
            let staging = layout.begin_staging().unwrap();
            let parts = vec![
                stage(&layout, &staging, PartitionKey { year: 2023, week: 52 }, &[1]),
                stage(&layout, &staging, PartitionKey { year: 2024, week: 1 }, &[1]),
                stage(&layout, &staging, PartitionKey { year: 2024, week: 2 }, &[1, 2]),
            ];
            layout.commit_partitions(parts).unwrap();
        }
        fs::create_dir_all(dir.path().join("not-a-partition")).unwrap();

        let layout = open(dir.path());
        let keys: Vec<PartitionKey> = layout.prune_candidates(1).into_iter().map(|g| g.key).collect();
        assert_eq!(
            keys,
            vec![
                PartitionKey { year: 2024, week: 2 },
                PartitionKey { year: 2024, week: 1 },
                PartitionKey { year: 2023, week: 52 },
            ]
        );
        assert_eq!(layout.prune_candidates(2).len(), 1);
        assert_eq!(layout.file_count(), 3);
        assert_eq!(layout.max_item_id(), 2);
    }

    #[test]
    fn test_abandoned_staging_is_removed_on_open() {
        let dir = tempdir().unwrap();
        let leftover = dir.path().join(STAGING_DIR).join("batch-0-0");
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join("2024-01"), b"partial").unwrap();

        let _layout = open(dir.path());
        assert!(!leftover.exists());
    }
}
