//! # Tempora
//!
//! Tempora is an append-only archive for time-stamped key-value tuples.
//!
//! Every tuple states that an *item* had a *value* for a *property* within a
//! *context* at a point in time. Tuples are written in batches into ISO-week
//! partitions whose directory names carry the range of item ids stored below
//! them, so a lookup for one item only opens the files that can hold it.
//!
//! ## Features
//!
//! - Dense integer ids for item, property and context URIs
//! - Week partitions pruned by item-id bounds encoded in directory names
//! - Time-ordered merged reads with per-property limits
//! - Bucketed aggregation (`avg`, `sum`, `min`, `max`, `count`, `first`, `last`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use tempora::{Archive, ArchiveConfig, Result, Tuple, DEFAULT_CONTEXT};
//!
//! fn example() -> Result<()> {
//!     let archive = Archive::open(ArchiveConfig::new("./data"))?;
//!     archive.put(vec![Tuple::new("ex:sensor1", "ex:temperature", DEFAULT_CONTEXT, 1_700_000_000, 0, 21.5)])?;
//!     for tuple in archive.fetch("ex:sensor1", None, None, 0)? {
//!         println!("{:?}", tuple?);
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::unnecessary_map_or)]
#![allow(clippy::new_without_default)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

/// Core data structures and types
pub mod core;

/// Error types and result definitions
pub mod error;

/// Row files, partition layout, identifier registry and the archive itself
pub mod storage;

/// Operators over tuple streams
pub mod stream;

// Re-export commonly used types
pub use crate::core::{Record, Tuple, Value, DEFAULT_CONTEXT};
pub use error::{Error, Result};
pub use storage::archive::{Archive, TupleIter};
pub use storage::ingest::IngestSummary;
pub use storage::util::ArchiveConfig;
pub use stream::operators::AggregateOp;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("test error".to_string());
        assert_eq!(format!("{}", err), "Configuration error: test error");
        assert_eq!(format!("{}", Error::LockTimeout("shared")), "Timed out acquiring the shared permit");
    }
}
