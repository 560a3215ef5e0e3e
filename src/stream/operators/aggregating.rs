use std::str::FromStr;

use crate::core::{Tuple, Value};
use crate::error::{Error, Result};

/// Fold applied to the tuples of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Avg,
    Sum,
    Min,
    Max,
    Count,
    First,
    Last,
}

impl FromStr for AggregateOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "avg" => Ok(AggregateOp::Avg),
            "sum" => Ok(AggregateOp::Sum),
            "min" => Ok(AggregateOp::Min),
            "max" => Ok(AggregateOp::Max),
            "count" => Ok(AggregateOp::Count),
            "first" => Ok(AggregateOp::First),
            "last" => Ok(AggregateOp::Last),
            other => Err(Error::InvalidArgument(format!("unknown aggregation operator '{}'", other))),
        }
    }
}

/// Start of the bucket holding `time`. Interval 0 puts everything into one bucket.
pub fn bucket_start(time: i64, interval: i64) -> i64 {
    if interval <= 0 {
        i64::MIN
    } else {
        time - time.rem_euclid(interval)
    }
}

struct Bucket {
    item: String,
    property: String,
    context: String,
    start: i64,
    /// time of the first tuple, reported when all tuples share one bucket
    first_time: i64,
    count: i64,
    numeric: u64,
    int_sum: i64,
    float_sum: f64,
    integral: bool,
    min: Option<(f64, Value)>,
    max: Option<(f64, Value)>,
    first: Value,
    last: Value,
}

impl Bucket {
    fn open(tuple: Tuple, start: i64) -> Self {
        let mut bucket = Bucket {
            item: tuple.item,
            property: tuple.property,
            context: tuple.context,
            start,
            first_time: tuple.time,
            count: 0,
            numeric: 0,
            int_sum: 0,
            float_sum: 0.0,
            integral: true,
            min: None,
            max: None,
            first: tuple.value.clone(),
            last: tuple.value.clone(),
        };
        bucket.add(tuple.value);
        bucket
    }

    fn accepts(&self, tuple: &Tuple, start: i64) -> bool {
        self.start == start && self.property == tuple.property && self.context == tuple.context && self.item == tuple.item
    }

    fn add(&mut self, value: Value) {
        self.count += 1;
        if let Some(number) = value.as_f64() {
            self.numeric += 1;
            self.float_sum += number;
            match value.as_i64() {
                Some(int) => self.int_sum = self.int_sum.wrapping_add(int),
                None => self.integral = false,
            }
            if self.min.as_ref().map_or(true, |(m, _)| number < *m) {
                self.min = Some((number, value.clone()));
            }
            if self.max.as_ref().map_or(true, |(m, _)| number > *m) {
                self.max = Some((number, value.clone()));
            }
        }
        self.last = value;
    }

    /// `None` when a numeric operator saw no numeric value.
    fn close(self, op: AggregateOp) -> Option<Tuple> {
        let value = match op {
            AggregateOp::Count => Value::Long(self.count),
            AggregateOp::First => self.first,
            AggregateOp::Last => self.last,
            AggregateOp::Min => self.min?.1,
            AggregateOp::Max => self.max?.1,
            AggregateOp::Avg if self.numeric > 0 => Value::Double(self.float_sum / self.numeric as f64),
            AggregateOp::Sum if self.numeric > 0 && self.integral => Value::Long(self.int_sum),
            AggregateOp::Sum if self.numeric > 0 => Value::Double(self.float_sum),
            AggregateOp::Avg | AggregateOp::Sum => return None,
        };
        let time = if self.start == i64::MIN { self.first_time } else { self.start };
        Some(Tuple { item: self.item, property: self.property, context: self.context, time, seq_nr: 0, value })
    }
}

/// Folds consecutive tuples of one (item, property, context) that fall into
/// the same time bucket into a single aggregate tuple.
///
/// At most `limit` aggregates are emitted per run of one property; 0 means
/// no limit. An error from the wrapped stream is passed on and ends iteration.
pub struct AggregatingIterator<I> {
    inner: I,
    op: AggregateOp,
    interval: i64,
    limit: usize,
    open: Option<Bucket>,
    last_property: Option<String>,
    emitted: usize,
    done: bool,
}

impl<I> AggregatingIterator<I>
where
    I: Iterator<Item = Result<Tuple>>,
{
    pub fn new(inner: I, interval: i64, op: AggregateOp, limit: usize) -> Self {
        Self { inner, op, interval, limit, open: None, last_property: None, emitted: 0, done: false }
    }

    /// Applies the per-property limit; `None` if the aggregate is dropped.
    fn admit(&mut self, aggregate: Tuple) -> Option<Tuple> {
        if self.last_property.as_deref() != Some(aggregate.property.as_str()) {
            self.last_property = Some(aggregate.property.clone());
            self.emitted = 0;
        }
        if self.limit > 0 && self.emitted >= self.limit {
            return None;
        }
        self.emitted += 1;
        Some(aggregate)
    }
}

impl<I> Iterator for AggregatingIterator<I>
where
    I: Iterator<Item = Result<Tuple>>,
{
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let closed = match self.inner.next() {
                Some(Ok(tuple)) => {
                    let start = bucket_start(tuple.time, self.interval);
                    match self.open.take() {
                        Some(mut bucket) if bucket.accepts(&tuple, start) => {
                            bucket.add(tuple.value);
                            self.open = Some(bucket);
                            None
                        }
                        previous => {
                            self.open = Some(Bucket::open(tuple, start));
                            previous
                        }
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    self.open = None;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    self.open.take()
                }
            };
            if let Some(aggregate) = closed.and_then(|bucket| bucket.close(self.op)) {
                if let Some(admitted) = self.admit(aggregate) {
                    return Some(Ok(admitted));
                }
            }
        }
        None
    }
}
