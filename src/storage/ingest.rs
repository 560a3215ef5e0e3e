//! Batch ingestion: stage rows per partition, then commit partitions and mappings.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::core::encoding::encode_key;
use crate::core::Tuple;
use crate::error::Result;
use crate::storage::indexing::dictionary::{IdRegistry, Namespace};
use crate::storage::layout::{partition_of, ArchiveLayout, PartitionKey, StagedPartition};
use crate::storage::rows::TupleRow;

/// Outcome of one committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Tuples written
    pub tuples: u64,
    /// Week partitions that received a data file
    pub partitions: usize,
    /// Ids allocated per namespace, in item, property, context order
    pub new_ids: [usize; 3],
    /// Committed data files
    pub files: Vec<PathBuf>,
}

/// Writes one batch. The caller holds the exclusive archive permit.
///
/// Rows are appended to their partition in input order; a caller that wants
/// time-ordered output feeds each item's tuples in (time, seq_nr) order. Any
/// failure aborts the batch; partitions already renamed by the commit are left
/// as they are.
pub fn ingest<I>(layout: &ArchiveLayout, registry: &IdRegistry, tuples: I) -> Result<IngestSummary>
where
    I: IntoIterator<Item = Tuple>,
{
    let mut tuples = tuples.into_iter().peekable();
    if tuples.peek().is_none() {
        debug!("empty batch ignored");
        return Ok(IngestSummary::default());
    }

    let mut session = registry.begin_session();
    let staging = layout.begin_staging()?;
    let mut staged: Vec<StagedPartition> = Vec::new();
    let mut slots: HashMap<PartitionKey, usize> = HashMap::new();
    let mut written = 0u64;

    for tuple in tuples {
        let partition = partition_of(tuple.time)?;
        let item = session.intern(Namespace::Item, &tuple.item)?;
        let property = session.intern(Namespace::Property, &tuple.property)?;
        let context = session.intern(Namespace::Context, &tuple.context)?;
        let row = TupleRow::new(encode_key(item, property, context), tuple.time, tuple.seq_nr, &tuple.value)?;

        let slot = match slots.get(&partition) {
            Some(slot) => *slot,
            None => {
                staged.push(layout.stage_partition(&staging, partition)?);
                slots.insert(partition, staged.len() - 1);
                staged.len() - 1
            }
        };
        staged[slot].append(item, row)?;
        written += 1;
    }

    let mut finished = Vec::with_capacity(staged.len());
    for partition in staged {
        if let Some(done) = partition.finish()? {
            finished.push(done);
        }
    }
    let partition_count = finished.len();
    let files = layout.commit_partitions(finished)?;
    let new_ids = session.commit(staging.path())?;

    info!(
        tuples = written,
        partitions = partition_count,
        new_items = new_ids[0],
        new_properties = new_ids[1],
        new_contexts = new_ids[2],
        "batch committed"
    );
    Ok(IngestSummary { tuples: written, partitions: partition_count, new_ids, files })
}
