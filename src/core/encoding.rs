//! Composite key encoding and key filters
//!
//! A row key is the big-endian concatenation of the item, property and context
//! ids. Byte order therefore groups rows by item, then property, then context,
//! which makes every key prefix a contiguous range.

use crate::storage::table::{Filter, Literal};

/// Size of an encoded composite key in bytes
pub const KEY_SIZE: usize = 24;

/// Name of the key column in tuple rows
pub const KEY_COLUMN: &str = "key";

/// Name of the time column in tuple rows
pub const TIME_COLUMN: &str = "time";

/// Encode item, property and context ids into a composite key
pub fn encode_key(item: u64, property: u64, context: u64) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    key[0..8].copy_from_slice(&item.to_be_bytes());
    key[8..16].copy_from_slice(&property.to_be_bytes());
    key[16..24].copy_from_slice(&context.to_be_bytes());
    key
}

/// Decode a composite key into (item, property, context)
pub fn decode_key(key: &[u8; KEY_SIZE]) -> (u64, u64, u64) {
    let mut part = [0u8; 8];
    part.copy_from_slice(&key[0..8]);
    let item = u64::from_be_bytes(part);
    part.copy_from_slice(&key[8..16]);
    let property = u64::from_be_bytes(part);
    part.copy_from_slice(&key[16..24]);
    let context = u64::from_be_bytes(part);
    (item, property, context)
}

/// Resolved ids of a fetch request. `None` leaves the slot open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPattern {
    pub item: u64,
    pub property: Option<u64>,
    pub context: Option<u64>,
}

impl KeyPattern {
    pub fn new(item: u64, property: Option<u64>, context: Option<u64>) -> Self {
        Self { item, property, context }
    }

    /// Key predicate for this pattern.
    ///
    /// A fully specified pattern is an exact match. Otherwise the fixed prefix
    /// becomes a half-open key range; a context fixed below an open property
    /// slot cannot be expressed as a range and is checked on the key bytes.
    pub fn filter(&self) -> Filter {
        match (self.property, self.context) {
            (Some(property), Some(context)) => {
                Filter::Eq(KEY_COLUMN, Literal::Bytes(encode_key(self.item, property, context).to_vec()))
            }
            (Some(property), None) => {
                let lower = encode_key(self.item, property, 0);
                let upper = match property.checked_add(1) {
                    Some(next) => Some(encode_key(self.item, next, 0)),
                    None => self.item.checked_add(1).map(|next| encode_key(next, 0, 0)),
                };
                key_range(lower, upper)
            }
            (None, context) => {
                let lower = encode_key(self.item, 0, 0);
                let upper = self.item.checked_add(1).map(|next| encode_key(next, 0, 0));
                let range = key_range(lower, upper);
                match context {
                    Some(context) => range.and(Filter::Segment {
                        column: KEY_COLUMN,
                        start: 16,
                        value: context.to_be_bytes().to_vec(),
                    }),
                    None => range,
                }
            }
        }
    }

    /// Key range over all rows of the item whose property id is at least `property`.
    pub fn properties_from(item: u64, property: u64) -> Filter {
        let lower = encode_key(item, property, 0);
        let upper = item.checked_add(1).map(|next| encode_key(next, 0, 0));
        key_range(lower, upper)
    }
}

fn key_range(lower: [u8; KEY_SIZE], upper: Option<[u8; KEY_SIZE]>) -> Filter {
    let lower = Filter::GtEq(KEY_COLUMN, Literal::Bytes(lower.to_vec()));
    match upper {
        Some(upper) => lower.and(Filter::Lt(KEY_COLUMN, Literal::Bytes(upper.to_vec()))),
        None => lower,
    }
}

/// Time bounds of a fetch: `time >= begin` and `time < end`.
pub fn time_filter(begin: Option<i64>, end: Option<i64>) -> Filter {
    let mut filter = Filter::All;
    if let Some(begin) = begin {
        filter = filter.and(Filter::GtEq(TIME_COLUMN, Literal::Int(begin)));
    }
    if let Some(end) = end {
        filter = filter.and(Filter::Lt(TIME_COLUMN, Literal::Int(end)));
    }
    filter
}
