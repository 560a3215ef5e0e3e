//! Stream Operators Module
//!
//! Operators that wrap a tuple stream produced by the archive.
//!
//! - **AggregatingIterator** - Folds time buckets into one aggregate tuple
//!
//! # Example
//!
//! ```ignore
//! use tempora::stream::operators::{AggregateOp, AggregatingIterator};
//!
//! let hourly = AggregatingIterator::new(archive.fetch(item, None, None, 0)?, 3600, AggregateOp::Avg, 0);
//! for tuple in hourly {
//!     println!("{:?}", tuple?);
//! }
//! ```

pub mod aggregating;

pub use aggregating::{AggregateOp, AggregatingIterator};
