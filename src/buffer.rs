//! Time-ordered sample storage shared between one producer thread and any
//! number of consumers.
//!
//! A [`TimeSeriesBuffer`] never sorts. Producers append in delivery order and
//! the range queries rely on that order matching timestamp order.

use log::*;
use parking_lot::RwLock;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::stream::StreamKind;

/// Sentinel for "every sample in the buffer".
pub const ALL: usize = usize::MAX;

/// Widest possible time range, used when a caller leaves a bound out.
pub const TIME_MIN: i64 = 0;
pub const TIME_MAX: i64 = i64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferSide {
    /// Oldest samples first.
    Start,
    /// Newest samples.
    End,
}

impl BufferSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferSide::Start => "start",
            BufferSide::End => "end",
        }
    }
}

impl FromStr for BufferSide {
    type Err = Error;

    fn from_str(s: &str) -> Result<BufferSide> {
        match s {
            "start" => Ok(BufferSide::Start),
            "end" => Ok(BufferSide::End),
            other => Err(Error::UnknownBufferSide(other.to_string())),
        }
    }
}

impl fmt::Display for BufferSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which timestamp a range query looks at.
///
/// Buffers fed straight from a tracker only carry the device clock and
/// ignore this. Inlet buffers carry both the sender's clock (`Remote`) and
/// the sender's clock corrected into ours (`Local`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Clock {
    Local,
    Remote,
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::Local
    }
}

impl Clock {
    pub fn as_str(&self) -> &'static str {
        match self {
            Clock::Local => "local",
            Clock::Remote => "remote",
        }
    }
}

impl FromStr for Clock {
    type Err = Error;

    fn from_str(s: &str) -> Result<Clock> {
        match s {
            "local" => Ok(Clock::Local),
            "remote" => Ok(Clock::Remote),
            other => Err(Error::UnknownClock(other.to_string())),
        }
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sample shape that can live in a [`TimeSeriesBuffer`].
pub trait Timestamped: Clone + Send + Sync + 'static {
    /// Stream the shape belongs to, used in error reports.
    const KIND: StreamKind;

    /// Shapes without a meaningful clock opt out of range queries.
    const TIME_RANGE: bool = true;

    /// Timestamp in microseconds on the requested clock.
    fn timestamp(&self, clock: Clock) -> i64;
}

pub struct TimeSeriesBuffer<S> {
    samples: RwLock<Vec<S>>,
}

impl<S: Timestamped> Default for TimeSeriesBuffer<S> {
    fn default() -> Self {
        TimeSeriesBuffer::new()
    }
}

impl<S: Timestamped> TimeSeriesBuffer<S> {
    pub fn new() -> TimeSeriesBuffer<S> {
        TimeSeriesBuffer {
            samples: RwLock::new(Vec::new()),
        }
    }

    pub fn with_capacity(capacity: usize) -> TimeSeriesBuffer<S> {
        TimeSeriesBuffer {
            samples: RwLock::new(Vec::with_capacity(capacity)),
        }
    }

    /// Make sure the buffer can hold `capacity` samples in total without
    /// reallocating. Never shrinks.
    pub fn reserve(&self, capacity: usize) {
        let mut samples = self.samples.write();
        if capacity > samples.capacity() {
            let additional = capacity - samples.len();
            samples.reserve(additional);
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.read().capacity()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    pub fn append(&self, sample: S) {
        self.samples.write().push(sample);
    }

    /// Append a batch under a single lock acquisition, keeping its order.
    pub fn extend<I>(&self, samples: I)
    where
        I: IntoIterator<Item = S>,
    {
        let mut iter = samples.into_iter().peekable();
        if iter.peek().is_none() {
            return;
        }
        self.samples.write().extend(iter);
    }

    pub fn consume_n(&self, n: usize, side: BufferSide) -> Vec<S> {
        let mut samples = self.samples.write();
        let range = side_range(samples.len(), n, side);
        take_range(&mut samples, range)
    }

    pub fn peek_n(&self, n: usize, side: BufferSide) -> Vec<S> {
        let samples = self.samples.read();
        let range = side_range(samples.len(), n, side);
        samples[range].to_vec()
    }

    /// Remove and return every sample with `t0 <= timestamp <= t1`.
    pub fn consume_time_range(&self, t0: i64, t1: i64, clock: Clock) -> Result<Vec<S>> {
        check_time_range::<S>("consuming a time range")?;
        let mut samples = self.samples.write();
        let range = time_range(&samples, t0, t1, clock);
        trace!(
            "{}: consuming {} samples in [{}, {}]",
            S::KIND,
            range.len(),
            t0,
            t1
        );
        Ok(take_range(&mut samples, range))
    }

    pub fn peek_time_range(&self, t0: i64, t1: i64, clock: Clock) -> Result<Vec<S>> {
        check_time_range::<S>("peeking a time range")?;
        let samples = self.samples.read();
        let range = time_range(&samples, t0, t1, clock);
        Ok(samples[range].to_vec())
    }

    pub fn clear(&self) {
        self.samples.write().clear();
    }

    pub fn clear_time_range(&self, t0: i64, t1: i64, clock: Clock) -> Result<()> {
        check_time_range::<S>("clearing a time range")?;
        let mut samples = self.samples.write();
        let range = time_range(&samples, t0, t1, clock);
        samples.drain(range);
        Ok(())
    }
}

fn check_time_range<S: Timestamped>(operation: &'static str) -> Result<()> {
    match S::TIME_RANGE {
        true => Ok(()),
        false => Err(Error::unsupported(S::KIND, operation)),
    }
}

fn side_range(len: usize, n: usize, side: BufferSide) -> Range<usize> {
    let n = n.min(len);
    match side {
        BufferSide::Start => 0..n,
        BufferSide::End => len - n..len,
    }
}

/// Index range of the samples with `t0 <= timestamp <= t1`. Binary search
/// for the first sample at or after `t0`, then for the first one past `t1`.
fn time_range<S: Timestamped>(samples: &[S], t0: i64, t1: i64, clock: Clock) -> Range<usize> {
    let start = samples.partition_point(|s| s.timestamp(clock) < t0);
    let end = start + samples[start..].partition_point(|s| s.timestamp(clock) <= t1);
    start..end
}

fn take_range<S>(samples: &mut Vec<S>, range: Range<usize>) -> Vec<S> {
    if range.start == 0 && range.end == samples.len() {
        // whole buffer, hand the allocation over instead of copying
        let capacity = samples.capacity();
        return std::mem::replace(samples, Vec::with_capacity(capacity));
    }
    samples.drain(range).collect()
}
